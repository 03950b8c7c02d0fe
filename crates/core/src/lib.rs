// Core search types and functionality for findlib

pub mod locator;

pub use locator::{
    FileLocator, LocateError, MatchPolicy, NamePattern, SearchQuery, SearchResult,
    DEFAULT_MAX_DEPTH,
};

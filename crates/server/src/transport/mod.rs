// HTTP-side transport adapters. Each session owns exactly one.

pub mod sse;
pub mod streamable;

pub use sse::SseAdapter;
pub use streamable::{Handshake, ReplyMode, StreamableAdapter, MCP_SESSION_ID};

// MCP (Model Context Protocol) server implementation
// Exposes file search tools to agent clients over JSON-RPC 2.0

pub mod error;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;

pub use error::McpError;
pub use server::{McpServer, Notifier, RequestContext};

// Transport abstraction: how JSON-RPC frames reach the server and leave it

pub mod stdio;

use crate::error::McpError;
use crate::protocol::JsonRpcPayload;

pub use stdio::StdioTransport;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// IO error during read/write
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An inbound frame could not be decoded. Fatal for that frame only.
    #[error(transparent)]
    Protocol(#[from] McpError),

    /// The peer went away
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A message-oriented binding driven by [`McpServer::serve`](crate::McpServer::serve).
///
/// Implemented once per stream-shaped binding (stdio, SSE). Request/response
/// bindings such as streamable HTTP drive the server per call instead.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Next inbound frame; `Ok(None)` once the peer is done
    async fn receive(&mut self) -> TransportResult<Option<JsonRpcPayload>>;

    /// Deliver an outbound frame
    async fn send(&mut self, payload: &JsonRpcPayload) -> TransportResult<()>;

    /// Flush and release the binding
    async fn close(&mut self) -> TransportResult<()>;
}

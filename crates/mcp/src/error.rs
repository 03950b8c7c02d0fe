// Protocol error taxonomy

use crate::protocol::{codes, JsonRpcError};

/// Errors surfaced to clients as JSON-RPC error objects.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Malformed wire payload
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed JSON that is not a valid request
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// `tools/call` named a tool that is not registered
    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    /// Arguments failed schema validation
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Unknown or missing session id on a session-bound transport
    #[error("Bad Request: {0}")]
    InvalidSession(String),

    /// Handler or search fault; the message is passed through as-is
    #[error("{0}")]
    Internal(String),
}

impl McpError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => codes::PARSE_ERROR,
            Self::InvalidRequest(_) => codes::INVALID_REQUEST,
            Self::MethodNotFound(_) | Self::ToolNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::InvalidSession(_) => codes::INVALID_SESSION,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    pub fn invalid_session() -> Self {
        Self::InvalidSession("invalid session ID".to_string())
    }

    pub fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError::custom(self.code(), self.to_string())
    }

    /// Recover a typed error from a tool handler failure. Anything that is
    /// not already an `McpError` becomes an internal error carrying the
    /// handler's message.
    pub fn from_handler_error(err: anyhow::Error) -> Self {
        match err.downcast::<McpError>() {
            Ok(err) => err,
            Err(err) => Self::Internal(format!("{:#}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_codes() {
        assert_eq!(McpError::Parse("x".into()).code(), -32700);
        assert_eq!(McpError::ToolNotFound("x".into()).code(), -32601);
        assert_eq!(McpError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(McpError::Internal("x".into()).code(), -32603);
    }

    #[test]
    fn test_invalid_session_message() {
        let err = McpError::invalid_session().to_rpc_error();
        assert_eq!(err, JsonRpcError::invalid_session());
    }

    #[test]
    fn test_handler_error_keeps_own_code() {
        let err = anyhow::Error::new(McpError::InvalidParams("bad".into()));
        assert_eq!(McpError::from_handler_error(err).code(), -32602);

        let err: anyhow::Error = std::fs::read("/definitely/not/here")
            .context("Failed to read")
            .unwrap_err();
        let mapped = McpError::from_handler_error(err);
        assert_eq!(mapped.code(), -32603);
        assert!(mapped.to_string().starts_with("Failed to read"));
    }
}

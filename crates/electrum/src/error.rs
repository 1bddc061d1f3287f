//! Error codes of the JSON-RPC surface and internal server failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error as ThisError;

use crest_types::QueryError;

/// Standard JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Domain codes (positive).
pub const VERSION_ALREADY_SET: i32 = 101;
pub const UNSUPPORTED_PROTOCOL: i32 = 102;
pub const ALREADY_SUBSCRIBED: i32 = 103;

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ThisError)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", detail.into()))
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, format!("Internal error: {}", detail.into()))
    }

    pub fn version_already_set() -> Self {
        Self::new(
            VERSION_ALREADY_SET,
            "Protocol version already set for this connection",
        )
    }

    pub fn unsupported_protocol() -> Self {
        Self::new(UNSUPPORTED_PROTOCOL, "Unsupported protocol version")
    }

    pub fn already_subscribed() -> Self {
        Self::new(ALREADY_SUBSCRIBED, "Address is already subscribed")
    }
}

impl From<QueryError> for RpcError {
    fn from(err: QueryError) -> Self {
        Self::internal(err.to_string())
    }
}

/// Server-internal failure, never sent to clients directly.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("websocket failure: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Query(#[from] QueryError),
}

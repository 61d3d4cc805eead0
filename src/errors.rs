use serde_json::{json, Value};
use thiserror::Error;

pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
pub const UPSTREAM_API_ERROR: &str = "UPSTREAM_API_ERROR";
pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

/// Every failure that can reach the dispatcher boundary.
///
/// The dispatcher matches on this exhaustively to pick the JSON-RPC error code,
/// so adding a variant forces a decision about its wire representation.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("parse error: {message}")]
    Transport { message: String },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("{message}")]
    Domain {
        code: &'static str,
        message: String,
        context: Option<Value>,
    },
    #[error("{message}")]
    Internal { message: String },
}

impl AppError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
        }
    }

    pub fn domain(code: &'static str, message: impl Into<String>, context: Option<Value>) -> Self {
        Self::Domain {
            code,
            message: message.into(),
            context,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::domain(VALIDATION_ERROR, message, None)
    }

    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::domain(VALIDATION_ERROR, message, Some(json!({ "field": field })))
    }

    pub fn rate_limited(key: &str, retry_after_ms: u64) -> Self {
        Self::domain(
            RATE_LIMIT_EXCEEDED,
            format!("rate limit exceeded for {key}, retry after {retry_after_ms} ms"),
            Some(json!({ "key": key, "retryAfterMs": retry_after_ms })),
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::domain(CONFIGURATION_ERROR, message, None)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable domain code, if this is a structured domain failure.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Domain { code, .. } => Some(code),
            _ => None,
        }
    }
}

//! JSON-RPC envelopes and the mapping from [`AppError`] to wire errors.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::AppError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A response carries exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_error(id: Value, err: AppError) -> Self {
        Self::failure(id, app_error_to_error_object(err))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

pub fn error_object(code: i64, message: impl Into<String>, data: Option<Value>) -> ErrorObject {
    ErrorObject {
        code,
        message: message.into(),
        data,
    }
}

pub fn app_error_to_error_object(err: AppError) -> ErrorObject {
    match err {
        AppError::Transport { .. } => error_object(PARSE_ERROR, "Parse error", None),
        AppError::MethodNotFound { method } => error_object(
            METHOD_NOT_FOUND,
            "Method not found",
            Some(json!({ "method": method })),
        ),
        AppError::Domain {
            code,
            message,
            context,
        } => {
            let mut data = json!({ "code": code });
            if let Some(context) = context {
                data["context"] = context;
            }
            error_object(SERVER_ERROR, message, Some(data))
        }
        AppError::Internal { message } => {
            let message = if message.trim().is_empty() {
                "Internal error".to_string()
            } else {
                message
            };
            error_object(INTERNAL_ERROR, message, None)
        }
    }
}

//! Method routing for parsed JSON-RPC messages.
//!
//! The [`HandlerRegistry`] is filled once at startup and then frozen behind an
//! `Arc`; the [`Dispatcher`] only reads it. Classification happens before any
//! lookup: a message without `id` is a notification, everything else is a
//! request.

use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{errors::AppError, mcp::rpc::Response};

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<Value, AppError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> Result<Value, AppError> {
        (self)(params).await
    }
}

/// Notification handlers run synchronously and their outcome is discarded.
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, NotificationHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a method twice replaces the earlier handler.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> &mut Self {
        self.requests.insert(method.into(), handler);
        self
    }

    pub fn on_request<F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
    {
        self.register(method, Arc::new(handler))
    }

    pub fn on_notification<F>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.notifications.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn request_handler(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests.get(method).cloned()
    }

    pub fn notification_handler(&self, method: &str) -> Option<&NotificationHandler> {
        self.notifications.get(method)
    }

    pub fn request_methods(&self) -> Vec<&str> {
        let mut methods = self.requests.keys().map(String::as_str).collect::<Vec<_>>();
        methods.sort_unstable();
        methods
    }
}

/// A request whose handler was found and still has to run.
pub struct PendingRequest {
    id: Value,
    method: String,
    params: Option<Value>,
    handler: Arc<dyn RequestHandler>,
}

impl PendingRequest {
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Runs the handler and turns its outcome into a response. A panicking
    /// handler is reported as an internal error instead of losing the reply.
    /// The handler runs inside this future, so dropping it cancels the work.
    pub async fn respond(self) -> Response {
        let Self {
            id,
            method,
            params,
            handler,
        } = self;

        let audit_params = redact_audit_params(params.as_ref());
        let started_at = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(params))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(result)) => Response::success(id, result),
            Ok(Err(err)) => Response::from_error(id, err),
            Err(payload) => {
                let panic_message = panic_message(payload.as_ref());
                error!(method = %method, error = %panic_message, "request handler panicked");
                Response::from_error(id, AppError::internal("Internal error"))
            }
        };

        info!(
            method = %method,
            params = %audit_params,
            outcome = if response.is_error() { "failure" } else { "success" },
            duration_ms = started_at.elapsed().as_millis() as u64,
            "mcp action audited"
        );

        response
    }
}

pub enum DispatchOutcome {
    /// Notification consumed; nothing is written back.
    Notified,
    /// The response is already known (dispatch or classification failure).
    Respond(Response),
    Invoke(PendingRequest),
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Classifies `message` and resolves its handler without awaiting it.
    /// Notification handlers are invoked here, before this returns.
    pub fn dispatch(&self, message: Value) -> DispatchOutcome {
        let Value::Object(mut message) = message else {
            return DispatchOutcome::Respond(Response::from_error(
                Value::Null,
                AppError::internal("Internal error: message is not a JSON object"),
            ));
        };

        let id = message.remove("id");
        let params = message.remove("params");
        let method = message.get("method").and_then(Value::as_str);

        let Some(id) = id else {
            match method.and_then(|method| {
                self.registry
                    .notification_handler(method)
                    .map(|handler| (method, handler))
            }) {
                Some((method, handler)) => {
                    debug!(method = %method, "handling notification");
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(params)));
                    if let Err(payload) = outcome {
                        let panic_message = panic_message(payload.as_ref());
                        error!(
                            method = %method,
                            error = %panic_message,
                            "notification handler panicked"
                        );
                    }
                }
                None => debug!(method = ?method, "ignoring unhandled notification"),
            }
            return DispatchOutcome::Notified;
        };

        let Some(method) = method else {
            return DispatchOutcome::Respond(Response::from_error(
                id,
                AppError::internal("Internal error: request has no method"),
            ));
        };

        match self.registry.request_handler(method) {
            Some(handler) => DispatchOutcome::Invoke(PendingRequest {
                id,
                method: method.to_string(),
                params,
                handler,
            }),
            None => {
                info!(method = %method, outcome = "failure", "mcp action audited");
                DispatchOutcome::Respond(Response::from_error(
                    id,
                    AppError::method_not_found(method),
                ))
            }
        }
    }

    /// Dispatches and awaits in one step; `None` for notifications.
    pub async fn handle(&self, message: Value) -> Option<Response> {
        match self.dispatch(message) {
            DispatchOutcome::Notified => None,
            DispatchOutcome::Respond(response) => Some(response),
            DispatchOutcome::Invoke(pending) => Some(pending.respond().await),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "key" | "api_key" | "apikey" | "authorization" | "password" | "secret" | "signature"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("credential")
}

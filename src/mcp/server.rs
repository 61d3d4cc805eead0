//! The central Model Context Protocol engine
//!
//! Owns the handler registry and the request pipeline, registers the MCP
//! methods (`initialize`, `ping`, `tools/*` and the lifecycle notifications)
//! and binds them to the stdio transport.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ListToolsResult, ProtocolVersion, ServerCapabilities,
    ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    config::Config,
    domain::tools::{build_tools_list, handle_tools_call},
    errors::{AppError, INVALID_REQUEST},
    maps_client::{GoogleMapsClient, RequestPipeline},
    mcp::{
        dispatcher::{Dispatcher, HandlerRegistry},
        transport::serve,
    },
};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "2024-11-05";

pub struct Server {
    registry: HandlerRegistry,
    pipeline: Arc<RequestPipeline>,
    shutdown_grace: Duration,
    initialized: Arc<AtomicBool>,
}

impl Server {
    pub fn new(pipeline: RequestPipeline, shutdown_grace: Duration) -> Self {
        let mut server = Self {
            registry: HandlerRegistry::new(),
            pipeline: Arc::new(pipeline),
            shutdown_grace,
            initialized: Arc::new(AtomicBool::new(false)),
        };
        server.register_mcp_methods();
        server
    }

    /// Wires the Google Maps client into a pipeline configured from `config`.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let provider = Arc::new(GoogleMapsClient::new(config)?);
        Ok(Self::new(
            RequestPipeline::from_config(provider, config),
            config.shutdown_grace,
        ))
    }

    /// Extra handlers registered here replace built-in ones of the same name.
    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::new(self.registry.clone()))
    }

    fn register_mcp_methods(&mut self) {
        let pipeline = self.pipeline.clone();
        let initialized = self.initialized.clone();

        self.registry
            .on_request("initialize", |params| async move {
                negotiate_protocol_version(params.as_ref()).map(|version| {
                    serde_json::to_value(initialize_result(version))
                        .expect("initialize result serialization")
                })
            })
            .on_request("ping", |_| async { Ok(json!({})) })
            .on_request("tools/list", |_| async {
                Ok(serde_json::to_value(ListToolsResult {
                    meta: None,
                    next_cursor: None,
                    tools: build_tools_list(),
                })
                .expect("tools list result serialization"))
            })
            .on_request("tools/call", move |params| {
                let pipeline = pipeline.clone();
                async move { handle_tools_call(&pipeline, params).await }
            })
            .on_notification("notifications/initialized", move |_| {
                initialized.store(true, Ordering::SeqCst);
                info!("client initialized");
            })
            .on_notification("notifications/cancelled", |params| {
                let params = params.unwrap_or(Value::Null);
                let request_id = params.get("requestId").cloned().unwrap_or(Value::Null);
                let reason = params
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                // Handlers run to completion; the cancellation is only recorded.
                info!(
                    request_id = %request_id,
                    reason = %reason,
                    "client cancelled request"
                );
            });
    }

    /// Serves over any byte stream; see [`serve`].
    pub async fn serve<R, W, S>(self, reader: R, writer: W, shutdown: S) -> io::Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
        S: std::future::Future<Output = ()>,
    {
        let grace = self.shutdown_grace;
        serve(reader, writer, self.dispatcher(), shutdown, grace).await
    }

    /// Serves stdin/stdout until end-of-input or SIGINT/SIGTERM.
    pub async fn start(self) -> io::Result<()> {
        info!(
            tools = build_tools_list().len(),
            methods = ?self.registry.request_methods(),
            "server starting on stdio"
        );
        self.serve(tokio::io::stdin(), tokio::io::stdout(), shutdown_signal())
            .await
    }
}

fn initialize_result(protocol_version: ProtocolVersion) -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Maps MCP Server".to_string()),
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(false),
            }),
            ..Default::default()
        },
        protocol_version: protocol_version.into(),
        instructions: None,
        meta: None,
    }
}

/// Clients may offer any version; the server answers with the one it speaks.
pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<ProtocolVersion, AppError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            AppError::domain(
                INVALID_REQUEST,
                "initialize params.protocolVersion is required",
                Some(json!({ "field": "protocolVersion" })),
            )
        })?;

    if offered_version != SUPPORTED_PROTOCOL_VERSION {
        info!(
            offered = offered_version,
            supported = SUPPORTED_PROTOCOL_VERSION,
            "client offered a different protocol version"
        );
    }

    Ok(ProtocolVersion::V2024_11_05)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        maps_client::tests::{pipeline, ScriptedProvider},
        mcp::framing::FrameDecoder,
    };

    fn server(provider: Arc<ScriptedProvider>) -> Server {
        Server::new(pipeline(provider, 10.0), Duration::from_secs(1))
    }

    async fn request(server: &Server, message: Value) -> Value {
        let response = server
            .dispatcher()
            .handle(message)
            .await
            .expect("response");
        serde_json::to_value(response).expect("serialize response")
    }

    #[test]
    fn negotiate_protocol_version_accepts_supported_version() {
        let params = json!({ "protocolVersion": SUPPORTED_PROTOCOL_VERSION });

        let version = negotiate_protocol_version(Some(&params)).expect("supported version");
        assert_eq!(version, ProtocolVersion::V2024_11_05);
    }

    #[test]
    fn negotiate_protocol_version_requires_a_version() {
        let error = negotiate_protocol_version(Some(&json!({}))).expect_err("missing version");
        assert_eq!(error.code(), Some(INVALID_REQUEST));
        assert!(negotiate_protocol_version(None).is_err());
    }

    #[tokio::test]
    async fn initialize_reports_tool_capability() {
        let server = server(Arc::new(ScriptedProvider::default()));

        let response = request(
            &server,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "test", "version": "0" }
                }
            }),
        )
        .await;

        let result = &response["result"];
        assert_eq!(result["protocolVersion"], SUPPORTED_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
    }

    #[tokio::test]
    async fn initialize_without_version_is_a_server_error() {
        let server = server(Arc::new(ScriptedProvider::default()));

        let response = request(
            &server,
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
        )
        .await;

        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["error"]["data"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn initialized_notification_marks_the_session() {
        let server = server(Arc::new(ScriptedProvider::default()));
        assert!(!server.is_initialized());

        let outcome = server
            .dispatcher()
            .handle(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await;

        assert!(outcome.is_none());
        assert!(server.is_initialized());
    }

    #[tokio::test]
    async fn cancelled_notification_is_accepted_silently() {
        let server = server(Arc::new(ScriptedProvider::default()));
        let dispatcher = server.dispatcher();

        let outcome = dispatcher
            .handle(json!({
                "jsonrpc": "2.0",
                "method": "notifications/cancelled",
                "params": { "requestId": 7, "reason": "user aborted" }
            }))
            .await;
        assert!(outcome.is_none());

        let outcome = dispatcher
            .handle(json!({ "jsonrpc": "2.0", "method": "notifications/cancelled" }))
            .await;
        assert!(outcome.is_none());

        let response = request(&server, json!({ "jsonrpc": "2.0", "id": 8, "method": "ping" })).await;
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn tools_list_and_ping() {
        let server = server(Arc::new(ScriptedProvider::default()));

        let response = request(&server, json!({ "jsonrpc": "2.0", "id": "t", "method": "tools/list" })).await;
        let tools = response["result"]["tools"].as_array().expect("tools");
        assert_eq!(tools.len(), 12);
        assert!(tools.iter().all(|tool| tool["inputSchema"]["type"] == "object"));

        let response = request(&server, json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" })).await;
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn tools_call_failures_keep_domain_codes() {
        let server = server(Arc::new(ScriptedProvider::default()));

        let response = request(
            &server,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "maps_geocode", "arguments": { "address": "" } }
            }),
        )
        .await;

        assert_eq!(response["id"], 3);
        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["error"]["data"]["code"], "VALIDATION_ERROR");
        assert_eq!(response["error"]["data"]["context"]["field"], "address");
    }

    #[tokio::test]
    async fn registry_mut_overrides_builtin_handlers() {
        let mut server = server(Arc::new(ScriptedProvider::default()));
        server
            .registry_mut()
            .on_request("ping", |_| async { Ok(json!({ "pong": true })) });

        let response = request(&server, json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" })).await;
        assert_eq!(response["result"]["pong"], true);
    }

    #[tokio::test]
    async fn serves_a_tool_call_over_a_byte_stream() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(json!({
            "status": "OK",
            "results": [{ "elevation": 34.5, "location": { "lat": 1.0, "lng": 2.0 } }]
        }))]));
        let server = server(provider.clone());
        let (mut client_in, server_in) = duplex(16 * 1024);
        let (server_out, mut client_out) = duplex(16 * 1024);

        let running = tokio::spawn(server.serve(server_in, server_out, std::future::pending()));

        let payload = json!({
            "jsonrpc": "2.0",
            "id": 10,
            "method": "tools/call",
            "params": { "name": "maps_elevation", "arguments": { "locations": ["1,2"] } }
        })
        .to_string();
        client_in
            .write_all(format!("Content-Length: {}\r\n\r\n{payload}", payload.len()).as_bytes())
            .await
            .expect("write");
        drop(client_in);

        let mut output = Vec::new();
        client_out.read_to_end(&mut output).await.expect("read");
        running.await.expect("join").expect("serve");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&output);
        let response = decoder.next_frame().expect("frame").expect("json");
        assert_eq!(response["id"], 10);
        assert_eq!(
            response["result"]["structuredContent"]["results"][0]["elevation"],
            34.5
        );
        assert_eq!(provider.calls(), 1);
    }
}

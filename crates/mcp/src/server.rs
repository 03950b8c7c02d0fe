// MCP server: JSON-RPC method dispatch over the tool registry.
// Holds no session state; session affinity lives in the transports.

use crate::error::McpError;
use crate::protocol::{
    methods, negotiate_version, CallToolParams, CallToolResult, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcPayload, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, ProgressParams, ServerCapabilities, ServerInfo,
    ToolsCapability, JSONRPC_VERSION,
};
use crate::tools::ToolRegistry;
use crate::transport::{Transport, TransportError, TransportResult};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound path for server-initiated notifications tied to a request
#[derive(Clone)]
pub struct Notifier(Arc<dyn Fn(JsonRpcRequest) + Send + Sync>);

impl Notifier {
    pub fn new(deliver: impl Fn(JsonRpcRequest) + Send + Sync + 'static) -> Self {
        Self(Arc::new(deliver))
    }

    /// A notifier whose notifications are collected on a channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JsonRpcRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Self::new(move |notification| {
            // Receiver gone means the caller stopped listening
            let _ = tx.send(notification);
        });
        (notifier, rx)
    }

    pub fn notify(&self, notification: JsonRpcRequest) {
        (self.0)(notification)
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Notifier")
    }
}

/// Per-call context supplied by the transport
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    session_id: Option<String>,
    notifier: Option<Notifier>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn progress(&self, token: Option<Value>) -> Progress {
        Progress {
            token,
            notifier: self.notifier.clone(),
        }
    }
}

/// Emits `notifications/progress` when the caller asked for it
struct Progress {
    token: Option<Value>,
    notifier: Option<Notifier>,
}

impl Progress {
    fn report(&self, progress: f64, total: Option<f64>) {
        if let (Some(token), Some(notifier)) = (&self.token, &self.notifier) {
            notifier.notify(JsonRpcRequest::notification(
                methods::PROGRESS,
                ProgressParams {
                    progress_token: token.clone(),
                    progress,
                    total,
                },
            ));
        }
    }
}

/// Where a `tools/call` is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPhase {
    Received,
    Validated,
    Executing,
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Executing => "executing",
        };
        f.write_str(phase)
    }
}

/// Transport-agnostic MCP server. Cheap to clone.
#[derive(Clone)]
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    info: ServerInfo,
}

impl McpServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            info: ServerInfo {
                name: "findlib".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn with_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.info = ServerInfo {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Handle one frame. Batches answer with an array of the responses
    /// in request order; frames with only notifications get no answer.
    pub async fn handle_payload(
        &self,
        payload: JsonRpcPayload,
        ctx: &RequestContext,
    ) -> Option<JsonRpcPayload> {
        match payload {
            JsonRpcPayload::Single(message) => self
                .handle_message(message, ctx)
                .await
                .map(JsonRpcPayload::from),
            JsonRpcPayload::Batch(messages) => {
                let mut responses = Vec::new();
                for message in messages {
                    if let Some(response) = self.handle_message(message, ctx).await {
                        responses.push(JsonRpcMessage::Response(response));
                    }
                }
                (!responses.is_empty()).then_some(JsonRpcPayload::Batch(responses))
            }
        }
    }

    pub async fn handle_message(
        &self,
        message: JsonRpcMessage,
        ctx: &RequestContext,
    ) -> Option<JsonRpcResponse> {
        match message {
            JsonRpcMessage::Request(request) => self.handle_request(request, ctx).await,
            JsonRpcMessage::Response(response) => {
                tracing::debug!("Ignoring client response for id {}", response.id);
                None
            }
            JsonRpcMessage::Invalid(value) => {
                tracing::debug!("Rejecting malformed message {}", value);
                Some(JsonRpcResponse::error(
                    JsonRpcMessage::invalid_id(&value),
                    JsonRpcError::invalid_request("Invalid Request"),
                ))
            }
        }
    }

    /// Dispatch a request by method. The response id always equals the
    /// request id; notifications produce nothing.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Option<JsonRpcResponse> {
        let JsonRpcRequest {
            jsonrpc,
            id,
            method,
            params,
        } = request;

        let Some(id) = id else {
            self.handle_notification(&method);
            return None;
        };

        if jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("Invalid Request: jsonrpc must be \"2.0\""),
            ));
        }

        tracing::debug!(method = %method, session = ?ctx.session_id(), "Handling request");

        let outcome = match method.as_str() {
            methods::INITIALIZE => self.handle_initialize(params).and_then(to_result),
            methods::PING => Ok(Value::Object(Default::default())),
            methods::LIST_TOOLS => to_result(self.handle_list_tools()),
            methods::CALL_TOOL => self.handle_call_tool(params, ctx).await.and_then(to_result),
            other => Err(McpError::MethodNotFound(other.to_string())),
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => JsonRpcResponse::error(id, err.to_rpc_error()),
        })
    }

    fn handle_notification(&self, method: &str) {
        match method {
            methods::INITIALIZED => tracing::info!("Client finished initialization"),
            methods::CANCELLED => tracing::debug!("Client cancelled a request"),
            other => tracing::debug!("Ignoring notification {}", other),
        }
    }

    /// Handshake. The session itself is allocated by session-bound
    /// transports; here it only negotiates the protocol revision.
    pub fn handle_initialize(&self, params: Option<Value>) -> Result<InitializeResult, McpError> {
        let params: InitializeParams = match params {
            Some(params) => serde_json::from_value(params)
                .map_err(|e| McpError::InvalidParams(e.to_string()))?,
            None => InitializeParams::default(),
        };

        let protocol_version = negotiate_version(params.protocol_version.as_deref());
        match &params.client_info {
            Some(client) => tracing::info!(
                "Initializing for client {} {} (protocol {})",
                client.name,
                client.version,
                protocol_version
            ),
            None => tracing::info!("Initializing (protocol {})", protocol_version),
        }

        Ok(InitializeResult {
            protocol_version: protocol_version.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: self.info.clone(),
        })
    }

    pub fn handle_list_tools(&self) -> ListToolsResult {
        ListToolsResult {
            tools: self.registry.list_schemas(),
        }
    }

    /// Look up, validate and run a tool.
    ///
    /// The handler runs on its own task so a panic inside it surfaces as an
    /// internal error instead of unwinding into the transport.
    pub async fn handle_call_tool(
        &self,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, McpError> {
        let mut phase = CallPhase::Received;
        let fail = |phase: CallPhase, err: McpError| {
            tracing::warn!(phase = %phase, code = err.code(), "Tool call failed: {}", err);
            err
        };

        let params: CallToolParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| fail(phase, McpError::InvalidParams(e.to_string())))?;
        let name = params.name;

        let tool = self
            .registry
            .get(&name)
            .ok_or_else(|| fail(phase, McpError::ToolNotFound(name.clone())))?;
        self.registry
            .validate(&name, &params.arguments)
            .map_err(|e| fail(phase, e))?;
        phase = CallPhase::Validated;
        tracing::debug!(tool = %name, phase = %phase, "Tool arguments accepted");

        let progress = ctx.progress(params.meta.and_then(|m| m.progress_token));
        progress.report(0.0, None);

        phase = CallPhase::Executing;
        let arguments = params.arguments;
        let outcome = match tokio::spawn(async move { tool.execute(arguments).await }).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(McpError::from_handler_error(err)),
            Err(join) if join.is_panic() => {
                Err(McpError::Internal(format!("Tool '{}' panicked", name)))
            }
            Err(_) => Err(McpError::Internal(format!("Tool '{}' was cancelled", name))),
        };

        match outcome {
            Ok(result) => {
                progress.report(1.0, Some(1.0));
                tracing::debug!(tool = %name, "Tool call completed");
                Ok(result)
            }
            Err(err) => Err(fail(phase, err)),
        }
    }

    /// Drive a stream-shaped transport until the peer disconnects or
    /// `shutdown` fires. Frames are handled one at a time, so responses
    /// leave in the order requests arrived.
    pub async fn serve<T: Transport>(
        &self,
        mut transport: T,
        shutdown: CancellationToken,
    ) -> TransportResult<()> {
        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = transport.receive() => match received {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(TransportError::Protocol(err)) => {
                        tracing::warn!("Rejecting inbound frame: {}", err);
                        let reply = JsonRpcResponse::error(Value::Null, err.to_rpc_error());
                        transport.send(&reply.into()).await?;
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };

            let (notifier, mut notifications) = Notifier::channel();
            let ctx = RequestContext::new().with_notifier(notifier);

            let reply = {
                let handling = self.handle_payload(payload, &ctx);
                tokio::pin!(handling);

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            tracing::debug!("Dropping in-flight request on shutdown");
                            return transport.close().await;
                        }
                        Some(notification) = notifications.recv() => {
                            transport.send(&notification.into()).await?;
                        }
                        reply = &mut handling => break reply,
                    }
                }
            };

            while let Ok(notification) = notifications.try_recv() {
                transport.send(&notification.into()).await?;
            }
            if let Some(reply) = reply {
                transport.send(&reply).await?;
            }
        }

        transport.close().await
    }
}

fn to_result<T: Serialize>(value: T) -> Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{codes, ToolContent, ToolSchema};
    use crate::tools::{json_schema_object, json_schema_string, Tool};
    use crate::transport::StdioTransport;
    use serde_json::json;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, BufReader};

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo".to_string(),
                description: "Echo".to_string(),
                input_schema: json_schema_object(
                    json!({ "filename": json_schema_string("Anything") }),
                    vec!["filename"],
                ),
            }
        }

        async fn execute(&self, arguments: Value) -> anyhow::Result<CallToolResult> {
            match arguments["filename"].as_str() {
                Some("panic") => panic!("boom"),
                Some("fail") => Err(anyhow::anyhow!("disk on fire")),
                Some("bad") => Err(McpError::InvalidParams("bad name".into()).into()),
                other => Ok(CallToolResult::text(other.unwrap_or_default())),
            }
        }
    }

    fn server() -> McpServer {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        McpServer::new(registry)
    }

    async fn call(server: &McpServer, id: i64, method: &str, params: Value) -> JsonRpcResponse {
        server
            .handle_request(
                JsonRpcRequest::new(id, method, Some(params)),
                &RequestContext::new(),
            )
            .await
            .unwrap()
    }

    fn error_code(response: &JsonRpcResponse) -> i32 {
        response.error.as_ref().map(|e| e.code).unwrap()
    }

    #[tokio::test]
    async fn test_list_tools_is_stable() {
        let server = server();
        let first = call(&server, 1, "tools/list", json!({})).await;
        let second = call(&server, 2, "tools/list", json!({})).await;

        assert_eq!(first.result, second.result);
        assert_eq!(first.result.unwrap()["tools"][0]["name"], json!("echo"));
    }

    #[tokio::test]
    async fn test_call_tool_success_echoes_id() {
        let server = server();
        let response = call(
            &server,
            42,
            "tools/call",
            json!({"name": "echo", "arguments": {"filename": "a.txt"}}),
        )
        .await;

        assert_eq!(response.id, json!(42));
        let result: CallToolResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.content, vec![ToolContent::text("a.txt")]);
    }

    #[tokio::test]
    async fn test_call_tool_errors() {
        let server = server();

        let unknown = call(&server, 1, "tools/call", json!({"name": "nope", "arguments": {}})).await;
        assert_eq!(error_code(&unknown), codes::METHOD_NOT_FOUND);

        let missing = call(&server, 2, "tools/call", json!({"name": "echo", "arguments": {}})).await;
        assert_eq!(error_code(&missing), codes::INVALID_PARAMS);

        let failed = call(
            &server,
            3,
            "tools/call",
            json!({"name": "echo", "arguments": {"filename": "fail"}}),
        )
        .await;
        assert_eq!(error_code(&failed), codes::INTERNAL_ERROR);
        assert_eq!(failed.error.unwrap().message, "disk on fire");

        let own_code = call(
            &server,
            4,
            "tools/call",
            json!({"name": "echo", "arguments": {"filename": "bad"}}),
        )
        .await;
        assert_eq!(error_code(&own_code), codes::INVALID_PARAMS);

        let panicked = call(
            &server,
            5,
            "tools/call",
            json!({"name": "echo", "arguments": {"filename": "panic"}}),
        )
        .await;
        assert_eq!(error_code(&panicked), codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_version() {
        let server = server();
        let response = call(&server, 1, "resources/list", json!({})).await;
        assert_eq!(error_code(&response), codes::METHOD_NOT_FOUND);

        let mut request = JsonRpcRequest::new(2, "ping", None);
        request.jsonrpc = "1.0".to_string();
        let response = server
            .handle_request(request, &RequestContext::new())
            .await
            .unwrap();
        assert_eq!(error_code(&response), codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let server = server();
        let response = server
            .handle_request(
                JsonRpcRequest::notification("notifications/initialized", json!({})),
                &RequestContext::new(),
            )
            .await;
        assert!(response.is_none());

        let response = server
            .handle_request(
                JsonRpcRequest::notification("tools/call", json!({"name": "nope"})),
                &RequestContext::new(),
            )
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let server = server();
        let response = call(
            &server,
            1,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "1.0.0"}
            }),
        )
        .await;

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], json!("2024-11-05"));
        assert_eq!(result["serverInfo"]["name"], json!("findlib"));
        assert_eq!(result["capabilities"]["tools"]["listChanged"], json!(false));
    }

    #[tokio::test]
    async fn test_batch_skips_notifications() {
        let server = server();
        let payload = JsonRpcPayload::parse(
            br#"[{"jsonrpc":"2.0","id":1,"method":"ping"},
                 {"jsonrpc":"2.0","method":"notifications/initialized"},
                 {"jsonrpc":"2.0","id":2,"method":"tools/list"}]"#,
        )
        .unwrap();

        let reply = server
            .handle_payload(payload, &RequestContext::new())
            .await
            .unwrap();
        let ids: Vec<Value> = reply
            .messages()
            .iter()
            .map(|m| match m {
                JsonRpcMessage::Response(r) => r.id.clone(),
                _ => Value::Null,
            })
            .collect();
        assert_eq!(ids, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_batch_answers_malformed_element_alone() {
        let server = server();
        let payload =
            JsonRpcPayload::parse(br#"[{"jsonrpc":"2.0","id":1,"method":"ping"}, 42]"#).unwrap();

        let reply = server
            .handle_payload(payload, &RequestContext::new())
            .await
            .unwrap();
        let reply = serde_json::to_value(&reply).unwrap();

        assert_eq!(reply.as_array().unwrap().len(), 2);
        assert_eq!(reply[0]["id"], json!(1));
        assert_eq!(reply[0]["result"], json!({}));
        assert_eq!(reply[1]["id"], Value::Null);
        assert_eq!(reply[1]["error"]["code"], json!(codes::INVALID_REQUEST));
    }

    #[tokio::test]
    async fn test_progress_notifications() {
        let server = server();
        let (notifier, mut rx) = Notifier::channel();
        let ctx = RequestContext::new().with_notifier(notifier);

        let response = server
            .handle_request(
                JsonRpcRequest::new(
                    1,
                    "tools/call",
                    Some(json!({
                        "name": "echo",
                        "arguments": {"filename": "x"},
                        "_meta": {"progressToken": "tok"}
                    })),
                ),
                &ctx,
            )
            .await
            .unwrap();
        assert!(response.error.is_none());

        let start = rx.recv().await.unwrap();
        let done = rx.recv().await.unwrap();
        assert_eq!(start.method, "notifications/progress");
        assert_eq!(start.params.unwrap()["progressToken"], json!("tok"));
        assert_eq!(done.params.unwrap()["total"], json!(1.0));
    }

    #[tokio::test]
    async fn test_serve_over_stdio() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "not json\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",",
            "\"params\":{\"name\":\"echo\",\"arguments\":{\"filename\":\"f\"}}}\n",
        );
        let reader = BufReader::new(Cursor::new(input.as_bytes().to_vec()));
        let (writer, mut output) = tokio::io::duplex(64 * 1024);

        server()
            .serve(
                StdioTransport::from_handles(reader, writer),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut written = String::new();
        output.read_to_string(&mut written).await.unwrap();
        let lines: Vec<Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["id"], json!(1));
        assert_eq!(lines[1]["error"]["code"], json!(codes::PARSE_ERROR));
        assert_eq!(lines[1]["id"], Value::Null);
        assert_eq!(lines[2]["id"], json!(2));
        assert_eq!(lines[2]["result"]["content"][0]["text"], json!("f"));
    }

    #[tokio::test]
    async fn test_serve_survives_non_utf8_line() {
        let mut input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n");
        let reader = BufReader::new(Cursor::new(input));
        let (writer, mut output) = tokio::io::duplex(64 * 1024);

        server()
            .serve(
                StdioTransport::from_handles(reader, writer),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut written = String::new();
        output.read_to_string(&mut written).await.unwrap();
        let lines: Vec<Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["id"], json!(1));
        assert_eq!(lines[1]["error"]["code"], json!(codes::PARSE_ERROR));
        assert_eq!(lines[1]["id"], Value::Null);
        assert_eq!(lines[2]["id"], json!(2));
        assert_eq!(lines[2]["result"], json!({}));
    }
}

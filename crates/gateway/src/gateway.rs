//! MCP method dispatch over the registry and session manager.

use crate::error::SessionError;
use crate::protocol::{
    Incoming, JsonRpcResponse, RequestId, SUPPORTED_PROTOCOL_VERSIONS, classify, codes, negotiate_version,
};
use crate::registry::ToolRegistry;
use crate::session::{InitializeParams, SessionManager};
use axum::http::StatusCode;
use rmcp::model::{CallToolResult, Content};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use toolmount_http_tools::error::CallError;
use toolmount_http_tools::tool::ToolDefinition;

/// Identity reported in `initialize`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "toolmount".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A JSON-RPC response. `session_id` is set when `initialize` created a session.
    Response {
        message: JsonRpcResponse,
        session_id: Option<String>,
    },
    /// Notification or client response; nothing to send back.
    Accepted,
    /// Refused before dispatch (missing or unknown session).
    Rejected { status: StatusCode, message: String },
}

impl Reply {
    fn response(message: JsonRpcResponse) -> Self {
        Reply::Response {
            message,
            session_id: None,
        }
    }
}

pub struct ProtocolGateway {
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    info: ServerInfo,
}

impl ProtocolGateway {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, sessions: Arc<SessionManager>, info: ServerInfo) -> Self {
        Self {
            registry,
            sessions,
            info,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Handle a raw request body. Unparseable JSON yields `PARSE_ERROR` with a null id.
    pub async fn handle_bytes(&self, session_id: Option<&str>, body: &[u8]) -> Reply {
        match serde_json::from_slice::<Value>(body) {
            Ok(raw) => self.handle(session_id, raw).await,
            Err(e) => Reply::response(JsonRpcResponse::error(
                None,
                codes::PARSE_ERROR,
                format!("parse error: {e}"),
                None,
            )),
        }
    }

    /// Handle one JSON-RPC message received on `session_id`.
    pub async fn handle(&self, session_id: Option<&str>, raw: Value) -> Reply {
        let incoming = match classify(raw) {
            Ok(incoming) => incoming,
            Err(response) => return Reply::response(response),
        };

        let (id, method, params) = match incoming {
            Incoming::Request { id, method, params } => (id, method, params),
            Incoming::Notification { method, params } => {
                self.accept_notification(session_id, &method, &params);
                return Reply::Accepted;
            }
            Incoming::Response => return Reply::Accepted,
        };

        if method == "initialize" {
            return self.initialize(session_id, id, &params);
        }

        let Some(session_id) = session_id else {
            return Reply::Rejected {
                status: StatusCode::BAD_REQUEST,
                message: "missing Mcp-Session-Id header".to_string(),
            };
        };
        if self.sessions.get(session_id).is_none() {
            return Reply::Rejected {
                status: StatusCode::NOT_FOUND,
                message: "unknown session".to_string(),
            };
        }
        self.sessions.touch(session_id);

        let message = match method.as_str() {
            "ping" => JsonRpcResponse::result(id, json!({})),
            "tools/list" => self.tools_list(session_id, id),
            "tools/call" => self.tools_call(session_id, id, &params).await,
            other => {
                tracing::debug!(session_id = %session_id, method = %other, "method not found");
                JsonRpcResponse::error(
                    Some(id),
                    codes::METHOD_NOT_FOUND,
                    format!("method not found: {other}"),
                    None,
                )
            }
        };
        Reply::response(message)
    }

    /// Notifications never get an answer, whatever the session header says.
    fn accept_notification(&self, session_id: Option<&str>, method: &str, params: &Map<String, Value>) {
        let Some(session_id) = session_id else {
            tracing::debug!(method = %method, "notification without session id ignored");
            return;
        };
        if self.sessions.get(session_id).is_none() {
            tracing::debug!(session_id = %session_id, method = %method, "notification for unknown session ignored");
            return;
        }
        self.sessions.touch(session_id);
        self.notification(session_id, method, params);
    }

    fn initialize(&self, session_id: Option<&str>, id: RequestId, params: &Map<String, Value>) -> Reply {
        if session_id.is_some() {
            return Reply::response(JsonRpcResponse::error(
                Some(id),
                codes::INVALID_REQUEST,
                "session already initialized",
                None,
            ));
        }

        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let version = negotiate_version(requested);
        if requested.is_some_and(|r| r != version) {
            tracing::debug!(
                requested = ?requested,
                supported = ?SUPPORTED_PROTOCOL_VERSIONS,
                negotiated = %version,
                "client protocol version not supported"
            );
        }

        let session = self.sessions.create(InitializeParams::from_request(params, version));
        let mut result = json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": self.info.name, "version": self.info.version },
        });
        if let Some(instructions) = &self.info.instructions {
            result["instructions"] = json!(instructions);
        }

        Reply::Response {
            message: JsonRpcResponse::result(id, result),
            session_id: Some(session.id().to_string()),
        }
    }

    fn notification(&self, session_id: &str, method: &str, params: &Map<String, Value>) {
        match method {
            "notifications/initialized" => {
                self.sessions.mark_initialized(session_id);
            }
            "notifications/cancelled" => {
                let request_id = params
                    .get("requestId")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<RequestId>(v).ok());
                match request_id {
                    Some(request_id) => {
                        if !self.sessions.cancel_call(session_id, &request_id) {
                            tracing::debug!(
                                session_id = %session_id,
                                request_id = %request_id,
                                "cancel for unknown request"
                            );
                        }
                    }
                    None => tracing::debug!(session_id = %session_id, "cancel without requestId"),
                }
            }
            other => tracing::debug!(session_id = %session_id, method = %other, "ignoring notification"),
        }
    }

    fn tools_list(&self, session_id: &str, id: RequestId) -> JsonRpcResponse {
        if let Err(e) = self.sessions.require_ready(session_id) {
            return session_error(id, &e);
        }
        let tools: Vec<rmcp::model::Tool> = self
            .registry
            .list()
            .iter()
            .map(|t| t.to_mcp_tool())
            .collect();
        JsonRpcResponse::result(id, json!({ "tools": tools }))
    }

    async fn tools_call(&self, session_id: &str, id: RequestId, params: &Map<String, Value>) -> JsonRpcResponse {
        let session = match self.sessions.require_ready(session_id) {
            Ok(session) => session,
            Err(e) => return session_error(id, &e),
        };

        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(Some(id), codes::INVALID_PARAMS, "missing tool name", None);
        };
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let Some(tool) = self.registry.lookup(name) else {
            tracing::debug!(session_id = %session_id, tool = %name, "unknown tool");
            return JsonRpcResponse::error(
                Some(id),
                codes::TOOL_NOT_FOUND,
                format!("unknown tool: {name}"),
                Some(json!({ "kind": "tool_not_found", "name": name })),
            );
        };

        let guard = match self.sessions.begin_call(&session, id.clone(), name) {
            Ok(guard) => guard,
            Err(e) => return session_error(id, &e),
        };

        tracing::info!(session_id = %session_id, tool = %name, request_id = %id, "tools/call");

        let outcome = tokio::select! {
            biased;
            () = guard.token().cancelled() => None,
            result = tool.adapter.invoke(&tool.definition, &arguments) => Some(result),
        };
        drop(guard);

        let outcome = match outcome {
            Some(outcome) if !session.is_closed() => outcome,
            _ => {
                tracing::info!(session_id = %session_id, tool = %name, request_id = %id, "tools/call cancelled");
                return JsonRpcResponse::error(Some(id), codes::REQUEST_CANCELLED, "request cancelled", None);
            }
        };

        let result = match outcome {
            Ok(body) => success_result(&tool.definition, body),
            Err(e) => {
                tracing::info!(
                    session_id = %session_id,
                    tool = %name,
                    code = e.code(),
                    error = %e,
                    "tools/call failed"
                );
                error_result(&e)
            }
        };

        match serde_json::to_value(&result) {
            Ok(value) => JsonRpcResponse::result(id, value),
            Err(e) => JsonRpcResponse::error(Some(id), codes::INTERNAL_ERROR, e.to_string(), None),
        }
    }
}

fn session_error(id: RequestId, err: &SessionError) -> JsonRpcResponse {
    let code = match err {
        SessionError::NotFound(_) => codes::SESSION_NOT_FOUND,
        SessionError::NotReady(_) => codes::SESSION_NOT_READY,
    };
    JsonRpcResponse::error(Some(id), code, err.to_string(), None)
}

/// Structured content is only emitted for tools that advertise an output schema.
fn success_result(tool: &ToolDefinition, body: Value) -> CallToolResult {
    if tool.wrapped_output_schema().is_some() {
        let structured = json!({ "body": body });
        let text = serde_json::to_string(&structured).unwrap_or_else(|_| structured.to_string());
        CallToolResult {
            content: vec![Content::text(text)],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        }
    } else {
        let text = match &body {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
        };
        CallToolResult::success(vec![Content::text(text)])
    }
}

fn error_result(err: &CallError) -> CallToolResult {
    let mut error = json!({ "code": err.code(), "message": err.to_string() });
    if let CallError::Status { status, body } = err {
        error["status"] = json!(status);
        error["body"] = body.clone();
    }
    CallToolResult {
        content: vec![Content::text(err.to_string())],
        structured_content: Some(json!({ "error": error })),
        is_error: Some(true),
        meta: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MergePolicy;
    use crate::registry::tests::op;
    use crate::session::CloseReason;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use toolmount_http_tools::adapter::{AdapterSettings, BackendAdapter};
    use toolmount_http_tools::client::{BackendClient, OutboundRequest, RawResponse, TransportError};
    use toolmount_openapi_tools::compiler::ToolCompiler;

    /// Echoes method and path; `/slow/...` paths wait, `/missing` answers 404.
    #[derive(Default)]
    struct FakeBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendClient for FakeBackend {
        async fn send(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = request.url.path().to_string();
            if path.starts_with("/slow") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if path == "/missing" {
                return Ok(RawResponse {
                    status: 404,
                    content_type: Some("application/json".to_string()),
                    body: br#"{"error":"not found"}"#.to_vec(),
                });
            }
            if path == "/down" {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            Ok(RawResponse {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: serde_json::to_vec(&json!({ "method": request.method.as_str(), "path": path })).unwrap(),
            })
        }
    }

    fn gateway_with(backend: Arc<FakeBackend>) -> ProtocolGateway {
        let registry = Arc::new(ToolRegistry::default());
        let adapter = Arc::new(
            BackendAdapter::with_client("a", AdapterSettings::new("http://backend.test"), backend).unwrap(),
        );
        let ops = [
            op("getUser", "get", "/users/{id}"),
            op("slow", "get", "/slow/{id}"),
            op("missing", "get", "/missing"),
            op("down", "get", "/down"),
        ];
        let tools = ToolCompiler::default()
            .compile_all("a", &ops)
            .into_iter()
            .map(|t| (Arc::new(t), adapter.clone()))
            .collect();
        registry.mount("a", tools, MergePolicy::RejectOnCollision).unwrap();
        ProtocolGateway::new(registry, Arc::new(SessionManager::new(None)), ServerInfo::default())
    }

    fn request(id: i64, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    fn message(reply: Reply) -> Value {
        match reply {
            Reply::Response { message, .. } => message.to_value(),
            other => panic!("expected response, got {other:?}"),
        }
    }

    async fn open_session(gw: &ProtocolGateway, ready: bool) -> String {
        let reply = gw
            .handle(None, request(0, "initialize", json!({ "protocolVersion": "2025-03-26", "capabilities": {} })))
            .await;
        let Reply::Response { message, session_id } = reply else {
            panic!("initialize must respond");
        };
        assert_eq!(message.result.unwrap()["protocolVersion"], json!("2025-03-26"));
        let sid = session_id.unwrap();
        if ready {
            let reply = gw
                .handle(Some(sid.as_str()), json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
                .await;
            assert_eq!(reply, Reply::Accepted);
        }
        sid
    }

    #[tokio::test]
    async fn initialize_reports_capabilities_and_negotiates() {
        let gw = gateway_with(Arc::default());
        let reply = gw
            .handle(None, request(1, "initialize", json!({ "protocolVersion": "2099-01-01" })))
            .await;
        let Reply::Response { message, session_id } = reply else {
            panic!("initialize must respond");
        };
        let result = message.result.unwrap();
        assert_eq!(result["protocolVersion"], json!(crate::protocol::LATEST_PROTOCOL_VERSION));
        assert_eq!(result["capabilities"]["tools"]["listChanged"], json!(false));
        assert_eq!(result["serverInfo"]["name"], json!("toolmount"));
        assert!(result.get("instructions").is_none());
        assert!(session_id.is_some());
    }

    #[tokio::test]
    async fn initialize_on_existing_session_is_invalid() {
        let gw = gateway_with(Arc::default());
        let sid = open_session(&gw, true).await;
        let v = message(gw.handle(Some(sid.as_str()), request(5, "initialize", json!({}))).await);
        assert_eq!(v["error"]["code"], json!(-32600));
        assert_eq!(v["id"], json!(5));
    }

    #[tokio::test]
    async fn session_header_is_required_and_must_exist() {
        let gw = gateway_with(Arc::default());
        let missing = gw.handle(None, request(1, "tools/list", json!({}))).await;
        assert!(matches!(missing, Reply::Rejected { status, .. } if status == StatusCode::BAD_REQUEST));
        let unknown = gw.handle(Some("nope"), request(1, "tools/list", json!({}))).await;
        assert!(matches!(unknown, Reply::Rejected { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn notifications_are_accepted_for_any_session_header() {
        let gw = gateway_with(Arc::default());
        let initialized = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });

        let missing = gw.handle(None, initialized.clone()).await;
        assert!(matches!(missing, Reply::Accepted));
        let unknown = gw.handle(Some("nope"), initialized.clone()).await;
        assert!(matches!(unknown, Reply::Accepted));

        let sid = open_session(&gw, true).await;
        assert!(gw.sessions().close(&sid, CloseReason::Explicit));
        let closed = gw.handle(Some(sid.as_str()), initialized).await;
        assert!(matches!(closed, Reply::Accepted));
        let cancelled = gw
            .handle(
                Some(sid.as_str()),
                json!({ "jsonrpc": "2.0", "method": "notifications/cancelled", "params": { "requestId": 1 } }),
            )
            .await;
        assert!(matches!(cancelled, Reply::Accepted));
        assert!(gw.sessions().get(&sid).is_none());
    }

    #[tokio::test]
    async fn tools_require_initialized_but_ping_does_not() {
        let backend = Arc::new(FakeBackend::default());
        let gw = gateway_with(backend.clone());
        let sid = open_session(&gw, false).await;

        let v = message(gw.handle(Some(sid.as_str()), request(1, "tools/list", json!({}))).await);
        assert_eq!(v["error"]["code"], json!(-32002));
        let v = message(
            gw.handle(Some(sid.as_str()), request(2, "tools/call", json!({ "name": "a_getuser", "arguments": { "id": "1" } })))
                .await,
        );
        assert_eq!(v["error"]["code"], json!(-32002));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let v = message(gw.handle(Some(sid.as_str()), request(3, "ping", json!({}))).await);
        assert_eq!(v["result"], json!({}));
        assert_eq!(v["id"], json!(3));
    }

    #[tokio::test]
    async fn tools_list_projects_registry() {
        let gw = gateway_with(Arc::default());
        let sid = open_session(&gw, true).await;
        let v = message(gw.handle(Some(sid.as_str()), request(1, "tools/list", json!({}))).await);
        let tools = v["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a_getuser", "a_slow", "a_missing", "a_down"]);
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["id"]));
        assert_eq!(tools[0]["inputSchema"]["properties"]["id"]["type"], json!("string"));
        assert_eq!(tools[0]["annotations"]["readOnlyHint"], json!(true));
        assert!(tools[0]["outputSchema"].is_object());
    }

    #[tokio::test]
    async fn call_maps_success_to_structured_body() {
        let gw = gateway_with(Arc::default());
        let sid = open_session(&gw, true).await;
        let v = message(
            gw.handle(Some(sid.as_str()), request(9, "tools/call", json!({ "name": "a_getuser", "arguments": { "id": "7" } })))
                .await,
        );
        assert_eq!(v["id"], json!(9));
        assert_eq!(v["result"]["isError"], json!(false));
        assert_eq!(
            v["result"]["structuredContent"]["body"],
            json!({ "method": "GET", "path": "/users/7" })
        );
        assert_eq!(v["result"]["content"][0]["type"], json!("text"));
    }

    #[tokio::test]
    async fn unknown_tool_never_reaches_backend() {
        let backend = Arc::new(FakeBackend::default());
        let gw = gateway_with(backend.clone());
        let sid = open_session(&gw, true).await;
        let v = message(
            gw.handle(Some(sid.as_str()), request(4, "tools/call", json!({ "name": "b_getuser", "arguments": {} })))
                .await,
        );
        assert_eq!(v["error"]["code"], json!(-32602));
        assert_eq!(v["error"]["data"]["kind"], json!("tool_not_found"));
        assert_eq!(v["error"]["message"], json!("unknown tool: b_getuser"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn call_errors_become_error_results() {
        let backend = Arc::new(FakeBackend::default());
        let gw = gateway_with(backend.clone());
        let sid = open_session(&gw, true).await;

        let v = message(
            gw.handle(Some(sid.as_str()), request(1, "tools/call", json!({ "name": "a_getuser", "arguments": {} })))
                .await,
        );
        assert_eq!(v["result"]["isError"], json!(true));
        assert_eq!(v["result"]["structuredContent"]["error"]["code"], json!("validation_error"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let v = message(gw.handle(Some(sid.as_str()), request(2, "tools/call", json!({ "name": "a_missing" }))).await);
        let error = &v["result"]["structuredContent"]["error"];
        assert_eq!(error["code"], json!("backend_error"));
        assert_eq!(error["status"], json!(404));
        assert_eq!(error["body"], json!({ "error": "not found" }));

        let v = message(gw.handle(Some(sid.as_str()), request(3, "tools/call", json!({ "name": "a_down" }))).await);
        assert_eq!(v["result"]["structuredContent"]["error"]["code"], json!("backend_unavailable"));
        assert!(!v["result"]["content"][0]["text"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closing_session_cancels_inflight_call() {
        let gw = Arc::new(gateway_with(Arc::default()));
        let sid = open_session(&gw, true).await;

        let call = {
            let gw = gw.clone();
            let sid = sid.clone();
            tokio::spawn(async move {
                gw.handle(Some(sid.as_str()), request(11, "tools/call", json!({ "name": "a_slow", "arguments": { "id": "1" } })))
                    .await
            })
        };

        let session = gw.sessions().get(&sid).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.pending_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(gw.sessions().close(&sid, CloseReason::Explicit));
        let v = message(tokio::time::timeout(Duration::from_secs(5), call).await.unwrap().unwrap());
        assert_eq!(v["id"], json!(11));
        assert_eq!(v["error"]["code"], json!(-32800));
        assert!(v.get("result").is_none());
    }

    #[tokio::test]
    async fn cancelled_notification_cancels_one_call() {
        let gw = Arc::new(gateway_with(Arc::default()));
        let sid = open_session(&gw, true).await;

        let call = {
            let gw = gw.clone();
            let sid = sid.clone();
            tokio::spawn(async move {
                gw.handle(
                    Some(sid.as_str()),
                    json!({ "jsonrpc": "2.0", "id": "slow-1", "method": "tools/call",
                            "params": { "name": "a_slow", "arguments": { "id": "1" } } }),
                )
                .await
            })
        };

        let session = gw.sessions().get(&sid).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.pending_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let reply = gw
            .handle(
                Some(sid.as_str()),
                json!({ "jsonrpc": "2.0", "method": "notifications/cancelled", "params": { "requestId": "slow-1" } }),
            )
            .await;
        assert_eq!(reply, Reply::Accepted);

        let v = message(tokio::time::timeout(Duration::from_secs(5), call).await.unwrap().unwrap());
        assert_eq!(v["id"], json!("slow-1"));
        assert_eq!(v["error"]["code"], json!(-32800));

        // The session itself stays usable.
        let v = message(gw.handle(Some(sid.as_str()), request(12, "ping", json!({}))).await);
        assert_eq!(v["result"], json!({}));
    }

    #[tokio::test]
    async fn malformed_input_and_unknown_methods() {
        let gw = gateway_with(Arc::default());
        let sid = open_session(&gw, true).await;

        let v = message(gw.handle_bytes(Some(sid.as_str()), b"{not json").await);
        assert_eq!(v["error"]["code"], json!(-32700));
        assert_eq!(v["id"], Value::Null);

        let v = message(gw.handle(Some(sid.as_str()), json!([request(1, "ping", json!({}))])).await);
        assert_eq!(v["error"]["code"], json!(-32600));

        let v = message(gw.handle(Some(sid.as_str()), request(2, "resources/list", json!({}))).await);
        assert_eq!(v["error"]["code"], json!(-32601));
        assert_eq!(v["id"], json!(2));

        let reply = gw
            .handle(Some(sid.as_str()), json!({ "jsonrpc": "2.0", "method": "notifications/roots/list_changed" }))
            .await;
        assert_eq!(reply, Reply::Accepted);
    }
}

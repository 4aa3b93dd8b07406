#![allow(dead_code)]

use anyhow::Context as _;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use futures::StreamExt as _;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use toolmount_gateway::bootstrap::{self, BootstrapReport};
use toolmount_gateway::config::GatewayConfig;
use toolmount_gateway::gateway::ProtocolGateway;
use toolmount_gateway::transport::{self, TransportOptions};
use toolmount_openapi_tools::loader::OpenApiSpecLoader;

pub const USERS_SPEC: &str = r#"
openapi: 3.0.3
info: { title: Users, version: "1" }
servers:
  - url: http://127.0.0.1:1
paths:
  /users/{id}:
    get:
      operationId: getUser
      summary: Fetch one user
      parameters:
        - { name: id, in: path, required: true, schema: { type: string } }
      responses:
        "200":
          description: ok
          content:
            application/json:
              schema: { type: object }
  /users:
    post:
      operationId: createUser
      requestBody:
        required: true
        content:
          application/json:
            schema:
              type: object
              required: [name]
              properties:
                name: { type: string }
      responses:
        "201": { description: created }
  /slow/{id}:
    get:
      operationId: slowThing
      parameters:
        - { name: id, in: path, required: true, schema: { type: string } }
      responses:
        "200": { description: ok }
  /missing:
    get:
      operationId: missingThing
      responses:
        "200": { description: ok }
"#;

/// Write `contents` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// In-process HTTP backend echoing what it received as JSON.
///
/// `/slow/...` waits 30s, `/missing` answers 404.
pub struct EchoBackend {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl EchoBackend {
    pub async fn start() -> anyhow::Result<Self> {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/{*path}", any(echo))
            .with_state(hits.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.context("bind echo backend")?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = rx.await;
            });
            let _ = server.await;
        });

        Ok(Self {
            base_url: format!("http://{addr}"),
            hits,
            shutdown: Some(tx),
        })
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Resolves once the backend has received at least `n` requests.
    pub async fn wait_for_hits(&self, n: usize) -> anyhow::Result<()> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.hits() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .context("backend never received the request")
    }
}

impl Drop for EchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn echo(
    State(hits): State<Arc<AtomicUsize>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    let path = uri.path().to_string();
    if path.starts_with("/slow") {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    if path == "/missing" {
        return (StatusCode::NOT_FOUND, axum::Json(json!({ "error": "no such thing" }))).into_response();
    }
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    axum::Json(json!({
        "method": method.as_str(),
        "path": path,
        "query": uri.query(),
        "authorization": headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
        "body": body,
    }))
    .into_response()
}

/// Gateway served in-process on an ephemeral port.
pub struct TestGateway {
    pub base_url: String,
    pub gateway: Arc<ProtocolGateway>,
    pub report: BootstrapReport,
    shutdown: CancellationToken,
}

impl TestGateway {
    pub async fn start(config_yaml: &str) -> anyhow::Result<Self> {
        let cfg = GatewayConfig::from_yaml_str(config_yaml, |_| None).context("parse config")?;
        let started = bootstrap::start(&cfg, &OpenApiSpecLoader::default())
            .await
            .context("bootstrap")?;

        let listener = TcpListener::bind("127.0.0.1:0").await.context("bind gateway")?;
        let addr = listener.local_addr()?;
        let router = transport::router(
            started.gateway.clone(),
            TransportOptions {
                json_response: cfg.transport.json_response,
            },
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(transport::serve(listener, router, shutdown.clone()));

        Ok(Self {
            base_url: format!("http://{addr}"),
            gateway: started.gateway,
            report: started.report,
            shutdown,
        })
    }

    pub fn mcp_url(&self) -> String {
        format!("{}/mcp", self.base_url)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Minimal MCP client over `POST /mcp`.
pub struct McpClient {
    client: reqwest::Client,
    uri: String,
    session_id: String,
}

impl McpClient {
    /// `initialize` + `notifications/initialized`.
    pub async fn connect(uri: &str) -> anyhow::Result<Self> {
        let session = Self::initialize(uri, "2025-06-18").await?;
        let status = session
            .notify("notifications/initialized", json!({}))
            .await
            .context("notifications/initialized")?;
        anyhow::ensure!(status == StatusCode::ACCEPTED, "initialized answered {status}");
        Ok(session)
    }

    /// `initialize` only; the session stays in the initializing state.
    pub async fn initialize(uri: &str, protocol_version: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::new();
        let resp = post_mcp(
            &client,
            uri,
            None,
            &json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": protocol_version,
                    "capabilities": {},
                    "clientInfo": { "name": "toolmount-integration-tests", "version": "0" }
                }
            }),
        )
        .await?;
        anyhow::ensure!(resp.status().is_success(), "initialize answered {}", resp.status());
        let session_id = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .context("missing Mcp-Session-Id header")?;
        let msg = read_json_message(resp).await?;
        anyhow::ensure!(msg.get("result").is_some(), "initialize failed: {msg}");

        Ok(Self {
            client,
            uri: uri.to_string(),
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn request(&self, id: i64, method: &str, params: Value) -> anyhow::Result<Value> {
        let resp = post_mcp(
            &self.client,
            &self.uri,
            Some(&self.session_id),
            &json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }),
        )
        .await?;
        read_json_message(resp).await
    }

    pub async fn call_tool(&self, id: i64, name: &str, arguments: Value) -> anyhow::Result<Value> {
        self.request(id, "tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    pub async fn notify(&self, method: &str, params: Value) -> anyhow::Result<StatusCode> {
        let resp = post_mcp(
            &self.client,
            &self.uri,
            Some(&self.session_id),
            &json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        )
        .await?;
        Ok(resp.status())
    }

    /// `DELETE /mcp` for this session.
    pub async fn close(&self) -> anyhow::Result<StatusCode> {
        let resp = self
            .client
            .delete(&self.uri)
            .header("Mcp-Session-Id", &self.session_id)
            .send()
            .await
            .context("DELETE /mcp")?;
        Ok(resp.status())
    }
}

pub async fn post_mcp(
    client: &reqwest::Client,
    uri: &str,
    session_id: Option<&str>,
    body: &Value,
) -> anyhow::Result<reqwest::Response> {
    let mut req = client
        .post(uri)
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .json(body);
    if let Some(session_id) = session_id {
        req = req.header("Mcp-Session-Id", session_id);
    }
    req.send().await.context("POST /mcp")
}

/// Read a JSON-RPC message from either a JSON body or a single-event SSE stream.
pub async fn read_json_message(resp: reqwest::Response) -> anyhow::Result<Value> {
    let is_sse = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));
    if !is_sse {
        return resp.json().await.context("parse JSON response");
    }

    let mut stream = sse_stream::SseStream::from_byte_stream(resp.bytes_stream());
    while let Some(evt) = stream.next().await {
        let evt = evt.context("read SSE event")?;
        let payload = evt.data.unwrap_or_default();
        if payload.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&payload).context("parse SSE data as JSON");
    }
    anyhow::bail!("event-stream ended without a JSON message")
}

/// The backend body of a successful `tools/call`: `structuredContent.body`, else the parsed
/// text content.
pub fn tool_call_body_json(msg: &Value) -> anyhow::Result<Value> {
    let result = msg.get("result").context("tools/call missing result")?;
    if let Some(body) = result.get("structuredContent").and_then(|sc| sc.get("body")) {
        return Ok(body.clone());
    }
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .context("tools/call missing result.content[0].text")?;
    serde_json::from_str(text).context("tools/call text is not JSON")
}

/// Config for one API `a` served by `backend`, with `spec` already on disk.
pub fn single_api_config(spec: &Path, backend_url: &str, extra: &str) -> String {
    format!(
        "{extra}\napis:\n  - namespace: a\n    spec: '{}'\n    baseUrl: '{backend_url}'\n",
        spec.display()
    )
}

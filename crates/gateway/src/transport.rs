//! HTTP surface: `POST /mcp`, `DELETE /mcp`, `GET /health`, `GET /map`.

use crate::gateway::{ProtocolGateway, Reply};
use crate::protocol::{JsonRpcResponse, SESSION_HEADER, codes};
use crate::session::CloseReason;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Always answer `application/json`, even to clients that accept SSE.
    pub json_response: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self { json_response: true }
    }
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<ProtocolGateway>,
    options: TransportOptions,
}

pub fn router(gateway: Arc<ProtocolGateway>, options: TransportOptions) -> Router {
    Router::new()
        .route("/mcp", post(post_mcp).delete(delete_mcp))
        .route("/health", get(health))
        .route("/map", get(tool_map))
        .with_state(AppState { gateway, options })
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains(EVENT_STREAM_MIME_TYPE))
}

async fn post_mcp(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let reply = state.gateway.handle_bytes(session_id(&headers), &body).await;

    match reply {
        Reply::Accepted => StatusCode::ACCEPTED.into_response(),
        Reply::Rejected { status, message } => rejection(status, message),
        Reply::Response { message, session_id } => {
            let mut response = if !state.options.json_response && accepts_event_stream(&headers) {
                single_event_stream(message.to_value())
            } else {
                Json(message.to_value()).into_response()
            };
            if let Some(sid) = session_id
                && let Ok(value) = HeaderValue::from_str(&sid)
            {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("mcp-session-id"), value);
            }
            response
        }
    }
}

fn single_event_stream(message: Value) -> Response {
    let event = Event::default().event("message").data(message.to_string());
    Sse::new(futures::stream::once(async move { Ok::<_, Infallible>(event) })).into_response()
}

fn rejection(status: StatusCode, message: String) -> Response {
    tracing::debug!(status = %status, message = %message, "request rejected");
    let code = if status == StatusCode::NOT_FOUND {
        codes::SESSION_NOT_FOUND
    } else {
        codes::INVALID_REQUEST
    };
    let body = JsonRpcResponse::error(None, code, message, None).to_value();
    (status, Json(body)).into_response()
}

async fn delete_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(sid) = session_id(&headers) else {
        return rejection(StatusCode::BAD_REQUEST, "missing Mcp-Session-Id header".to_string());
    };
    if state.gateway.sessions().close(sid, CloseReason::Explicit) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        rejection(StatusCode::NOT_FOUND, "unknown session".to_string())
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let registry = state.gateway.registry();
    Json(json!({
        "status": "ok",
        "tools": registry.len(),
        "namespaces": registry.namespaces(),
        "sessions": state.gateway.sessions().stats(),
    }))
}

/// Which tool goes where. Adapter details and credentials stay out.
async fn tool_map(State(state): State<AppState>) -> Json<Value> {
    let tools: Vec<Value> = state
        .gateway
        .registry()
        .list()
        .iter()
        .map(|t| {
            json!({
                "name": t.qualified_name,
                "namespace": t.namespace,
                "localName": t.local_name,
                "method": t.invocation.method.as_str(),
                "path": t.invocation.path_template,
            })
        })
        .collect();
    Json(json!({ "tools": tools }))
}

//! JSON-RPC 2.0 envelope and MCP protocol constants.

use rmcp::model::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol versions this gateway speaks, oldest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// HTTP header carrying the session id.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

pub mod codes {
    use rmcp::model::ErrorCode;

    pub const PARSE_ERROR: ErrorCode = ErrorCode::PARSE_ERROR;
    pub const INVALID_REQUEST: ErrorCode = ErrorCode::INVALID_REQUEST;
    pub const METHOD_NOT_FOUND: ErrorCode = ErrorCode::METHOD_NOT_FOUND;
    pub const INVALID_PARAMS: ErrorCode = ErrorCode::INVALID_PARAMS;
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode::INTERNAL_ERROR;
    pub const SESSION_NOT_FOUND: ErrorCode = ErrorCode(-32001);
    pub const SESSION_NOT_READY: ErrorCode = ErrorCode(-32002);
    /// Unknown tool names are invalid params per MCP; `data.kind` tells them apart.
    pub const TOOL_NOT_FOUND: ErrorCode = ErrorCode::INVALID_PARAMS;
    pub const REQUEST_CANCELLED: ErrorCode = ErrorCode(-32800);
}

/// `negotiate("2024-11-05")` echoes a supported version; anything else gets the latest.
#[must_use]
pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|r| SUPPORTED_PROTOCOL_VERSIONS.iter().copied().find(|v| *v == r))
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl RequestId {
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outbound response. `id` is `null` only when the request id could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    #[must_use]
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn error(id: Option<RequestId>, code: ErrorCode, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"jsonrpc": JSONRPC_VERSION, "id": null}))
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request {
        id: RequestId,
        method: String,
        params: Map<String, Value>,
    },
    Notification {
        method: String,
        params: Map<String, Value>,
    },
    /// A client's reply to a server-initiated request. Nothing to do with it.
    Response,
}

/// Classify one raw JSON value as a JSON-RPC message.
///
/// # Errors
///
/// Returns an `INVALID_REQUEST` response for batches, non-objects, a wrong `jsonrpc` version,
/// a missing method, unusable ids or non-object params.
pub fn classify(raw: Value) -> Result<Incoming, JsonRpcResponse> {
    let invalid = |id: Option<RequestId>, message: &str| {
        JsonRpcResponse::error(id, codes::INVALID_REQUEST, message, None)
    };

    let mut obj = match raw {
        Value::Object(obj) => obj,
        Value::Array(_) => return Err(invalid(None, "batch requests are not supported")),
        _ => return Err(invalid(None, "request must be a JSON object")),
    };

    let raw_id = obj.remove("id");
    let id = match &raw_id {
        None | Some(Value::Null) => None,
        Some(v) => Some(RequestId::from_value(v).ok_or_else(|| invalid(None, "id must be a string or integer"))?),
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid(id, "jsonrpc must be \"2.0\""));
    }

    let Some(method) = obj.get("method") else {
        if obj.contains_key("result") || obj.contains_key("error") {
            return Ok(Incoming::Response);
        }
        return Err(invalid(id, "missing method"));
    };
    let Some(method) = method.as_str().map(str::to_string) else {
        return Err(invalid(id, "method must be a string"));
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(params)) => params,
        Some(_) => return Err(invalid(id, "params must be an object")),
    };

    match (raw_id, id) {
        (None, _) => Ok(Incoming::Notification { method, params }),
        (Some(_), Some(id)) => Ok(Incoming::Request { id, method, params }),
        (Some(_), None) => Err(invalid(None, "id must not be null")),
    }
}

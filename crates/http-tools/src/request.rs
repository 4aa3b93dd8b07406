//! Turning validated arguments into the parts of an HTTP request.

use crate::error::ValidationError;
use crate::tool::{ParamLocation, ToolDefinition};
use serde_json::{Map, Value};
use url::Url;

/// Request pieces derived from one tool call, before defaults/credentials are merged in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParts {
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Bind arguments to their locations.
///
/// Arguments not declared by the tool are ignored; `null` values are treated as absent.
#[must_use]
pub fn build_request_parts(tool: &ToolDefinition, arguments: &Map<String, Value>) -> RequestParts {
    let mut path = tool.invocation.path_template.clone();
    let mut query: Vec<(String, String)> = Vec::new();
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body_fields: Map<String, Value> = Map::new();
    let mut body_payload: Option<Value> = None;

    for field in tool.input_schema.fields() {
        let Some(value) = arguments.get(&field.name).filter(|v| !v.is_null()) else {
            continue;
        };

        match field.location {
            ParamLocation::Path => {
                let encoded = encode_component(&value_to_string(value));
                path = path.replace(&format!("{{{}}}", field.source_name), &encoded);
            }
            ParamLocation::Query => match value {
                Value::Array(items) => {
                    for item in items.iter().filter(|v| !v.is_null()) {
                        query.push((field.source_name.clone(), value_to_string(item)));
                    }
                }
                other => query.push((field.source_name.clone(), value_to_string(other))),
            },
            ParamLocation::Header => {
                headers.push((field.source_name.clone(), value_to_string(value)));
            }
            ParamLocation::Body if field.whole_body => body_payload = Some(value.clone()),
            ParamLocation::Body => {
                body_fields.insert(field.source_name.clone(), value.clone());
            }
        }
    }

    if !path.starts_with('/') {
        path = format!("/{path}");
    }

    let body = body_payload.or_else(|| (!body_fields.is_empty()).then_some(Value::Object(body_fields)));

    RequestParts {
        path,
        query,
        headers,
        body,
    }
}

/// Join the adapter base URL, the substituted path, and the query pairs.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidRequest`] if the result is not a valid URL.
pub fn build_url(base_url: &Url, path: &str, query: &[(String, String)]) -> Result<Url, ValidationError> {
    let raw = format!("{}{}", base_url.as_str().trim_end_matches('/'), path);
    let mut url =
        Url::parse(&raw).map_err(|e| ValidationError::InvalidRequest(format!("invalid URL: {e}")))?;

    if !query.is_empty() {
        let encoded = query
            .iter()
            .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&encoded));
    }

    Ok(url)
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
#[must_use]
pub fn encode_component(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

/// Render a JSON value for use in a path segment, query value, or header.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

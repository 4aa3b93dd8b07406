//! Per-API HTTP adapter: validates arguments, builds the request, calls the backend and maps
//! the outcome to a JSON value or a [`CallError`].

use crate::client::{BackendClient, OutboundRequest, RawResponse, ReqwestBackendClient, TransportError};
use crate::error::{AdapterBuildError, CallError, ValidationError};
use crate::request::{build_request_parts, build_url};
use crate::tool::ToolDefinition;
use crate::validate::validate_arguments;
use base64::Engine as _;
use mime::Mime;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default per-call timeout when an API does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS certificate verification policy for one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    #[default]
    Verify,
    Insecure,
}

/// Credential attached to every outbound request of an adapter.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credential {
    Bearer { token: String },
    Header { name: String, value: String },
    Basic { username: String, password: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer { .. } => f.debug_struct("Bearer").field("token", &"<redacted>").finish(),
            Credential::Header { name, .. } => f
                .debug_struct("Header")
                .field("name", name)
                .field("value", &"<redacted>")
                .finish(),
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

impl Credential {
    /// The header this credential contributes.
    #[must_use]
    pub fn header(&self) -> (String, String) {
        match self {
            Credential::Bearer { token } => ("Authorization".to_string(), format!("Bearer {token}")),
            Credential::Header { name, value } => (name.clone(), value.clone()),
            Credential::Basic { username, password } => {
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
                ("Authorization".to_string(), format!("Basic {encoded}"))
            }
        }
    }
}

/// Construction-time settings of a [`BackendAdapter`].
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub base_url: String,
    pub default_headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub tls: TlsPolicy,
    pub credential: Option<Credential>,
}

impl AdapterSettings {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            tls: TlsPolicy::Verify,
            credential: None,
        }
    }
}

/// Immutable, shareable binding of one API's tools to a concrete backend.
pub struct BackendAdapter {
    namespace: String,
    base_url: Url,
    default_headers: Vec<(String, String)>,
    timeout: Duration,
    tls: TlsPolicy,
    credential: Option<Credential>,
    client: Arc<dyn BackendClient>,
}

impl fmt::Debug for BackendAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendAdapter")
            .field("namespace", &self.namespace)
            .field("base_url", &self.base_url.as_str())
            .field("timeout", &self.timeout)
            .field("tls", &self.tls)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

impl BackendAdapter {
    /// Build an adapter with its own `reqwest` client configured for the TLS policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or a default header is invalid, or the HTTP client
    /// cannot be created.
    pub fn new(namespace: impl Into<String>, settings: AdapterSettings) -> Result<Self, AdapterBuildError> {
        let client = ReqwestBackendClient::new(settings.tls == TlsPolicy::Insecure)
            .map_err(|e| AdapterBuildError::Client(e.to_string()))?;
        Self::with_client(namespace, settings, Arc::new(client))
    }

    /// Build an adapter on top of an existing [`BackendClient`].
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or a default header is invalid.
    pub fn with_client(
        namespace: impl Into<String>,
        settings: AdapterSettings,
        client: Arc<dyn BackendClient>,
    ) -> Result<Self, AdapterBuildError> {
        let base_url = Url::parse(&settings.base_url).map_err(|e| AdapterBuildError::InvalidBaseUrl {
            url: settings.base_url.clone(),
            message: e.to_string(),
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(AdapterBuildError::InvalidBaseUrl {
                url: settings.base_url,
                message: format!("unsupported scheme '{}'", base_url.scheme()),
            });
        }

        for (name, value) in &settings.default_headers {
            check_header(name, value).map_err(|_| AdapterBuildError::InvalidHeader(name.clone()))?;
        }
        if let Some(credential) = &settings.credential {
            let (name, value) = credential.header();
            check_header(&name, &value).map_err(|_| AdapterBuildError::InvalidHeader(name))?;
        }

        Ok(Self {
            namespace: namespace.into(),
            base_url,
            default_headers: settings.default_headers.into_iter().collect(),
            timeout: settings.timeout,
            tls: settings.tls,
            credential: settings.credential,
            client,
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn tls(&self) -> TlsPolicy {
        self.tls
    }

    /// Invoke `tool` with client-supplied `arguments`.
    ///
    /// Validation happens before any I/O. No retries are attempted.
    ///
    /// # Errors
    ///
    /// - [`CallError::Validation`] for malformed arguments (no request is sent)
    /// - [`CallError::Unavailable`] when the backend could not be reached or timed out
    /// - [`CallError::Status`] for a non-2xx response
    pub async fn invoke(&self, tool: &ToolDefinition, arguments: &Value) -> Result<Value, CallError> {
        let args = validate_arguments(&tool.input_schema, arguments)?;
        let parts = build_request_parts(tool, &args);
        let url = build_url(&self.base_url, &parts.path, &parts.query)?;

        let mut headers = self.default_headers.clone();
        for (name, value) in parts.headers {
            upsert_header(&mut headers, name, value);
        }
        if let Some(credential) = &self.credential {
            let (name, value) = credential.header();
            upsert_header(&mut headers, name, value);
        }
        for (name, value) in &headers {
            check_header(name, value)?;
        }

        tracing::debug!(
            namespace = %self.namespace,
            tool = %tool.qualified_name,
            method = %tool.invocation.method,
            path = %parts.path,
            "invoking backend"
        );

        let request = OutboundRequest {
            method: tool.invocation.method.clone(),
            url,
            headers,
            body: parts.body,
            timeout: Some(self.timeout),
        };

        let response = self.client.send(request).await.map_err(|e| match e {
            TransportError::InvalidRequest(msg) => CallError::Validation(ValidationError::InvalidRequest(msg)),
            other => {
                tracing::warn!(
                    namespace = %self.namespace,
                    tool = %tool.qualified_name,
                    error = %other,
                    "backend unavailable"
                );
                CallError::Unavailable(other.to_string())
            }
        })?;

        if (200..300).contains(&response.status) {
            Ok(decode_body(&response))
        } else {
            tracing::debug!(
                namespace = %self.namespace,
                tool = %tool.qualified_name,
                status = response.status,
                "backend returned error status"
            );
            Err(CallError::Status {
                status: response.status,
                body: decode_body(&response),
            })
        }
    }
}

/// Replace a header by case-insensitive name, or append it.
fn upsert_header(headers: &mut Vec<(String, String)>, name: String, value: String) {
    headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
    headers.push((name, value));
}

fn check_header(name: &str, value: &str) -> Result<(), ValidationError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ValidationError::InvalidRequest(format!("invalid header name '{name}'")))?;
    HeaderValue::from_str(value)
        .map_err(|_| ValidationError::InvalidRequest(format!("invalid value for header '{name}'")))?;
    Ok(())
}

/// Empty → `null`; JSON → parsed; other UTF-8 → string; binary → base64 envelope.
fn decode_body(response: &RawResponse) -> Value {
    let bytes = response.body.as_slice();
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    if let Ok(v) = serde_json::from_slice::<Value>(bytes) {
        return v;
    }
    match std::str::from_utf8(bytes) {
        Ok(s) if !is_binary_content_type(response.content_type.as_deref()) => Value::String(s.to_string()),
        _ => json!({
            "encoding": "base64",
            "mimeType": response.content_type,
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
    }
}

fn is_binary_content_type(content_type: Option<&str>) -> bool {
    let Some(m) = content_type.and_then(|ct| ct.parse::<Mime>().ok()) else {
        return false;
    };
    m.type_() == mime::IMAGE
        || m.type_() == mime::AUDIO
        || m.type_() == mime::VIDEO
        || m.essence_str() == mime::APPLICATION_OCTET_STREAM.essence_str()
}

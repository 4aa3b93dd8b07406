//! The outbound HTTP capability used by [`crate::adapter::BackendAdapter`].
//!
//! The adapter only depends on [`BackendClient`], so tests can substitute a fake transport and
//! the real one stays a thin wrapper over `reqwest`.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// A fully-built request, ready to hit the network.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

/// Status, content type, and raw body bytes of a backend response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request could not be built: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Send one request and read the full response body.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when no complete HTTP response was obtained. Non-2xx
    /// statuses are not errors at this layer.
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, TransportError>;
}

/// `reqwest`-backed [`BackendClient`]. Follows redirects (reqwest default policy).
#[derive(Debug, Clone)]
pub struct ReqwestBackendClient {
    client: reqwest::Client,
}

impl ReqwestBackendClient {
    /// Build a client. With `accept_invalid_certs`, certificate verification is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(accept_invalid_certs: bool) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| TransportError::Other(sanitize_reqwest_error(&e)))?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackendClient for ReqwestBackendClient {
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(classify)?;

        Ok(RawResponse {
            status,
            content_type,
            body: body.to_vec(),
        })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    let msg = sanitize_reqwest_error(&e);
    if e.is_timeout() {
        TransportError::Timeout(msg)
    } else if e.is_connect() {
        TransportError::Connect(msg)
    } else if e.is_builder() {
        TransportError::InvalidRequest(msg)
    } else {
        TransportError::Other(msg)
    }
}

/// Drop credentials, query and fragment from a URL before it is logged or surfaced.
#[must_use]
pub fn redact_url(url: &Url) -> String {
    let mut u = url.clone();
    let _ = u.set_username("");
    let _ = u.set_password(None);
    u.set_query(None);
    u.set_fragment(None);
    u.to_string()
}

#[must_use]
pub fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    if let Some(u) = e.url() {
        msg = msg.replace(u.as_str(), &redact_url(u));
    }
    msg
}

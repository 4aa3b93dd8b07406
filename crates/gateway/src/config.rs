//! YAML configuration file.
//!
//! Keys are camelCase. String values may reference environment variables as `${VAR}` or
//! `${VAR:-default}`; they are expanded once, at load time.

use crate::error::ConfigError;
use crate::registry::MergePolicy;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use toolmount_http_tools::adapter::{AdapterSettings, Credential, DEFAULT_TIMEOUT, TlsPolicy};
use toolmount_openapi_tools::compiler::OperationFilter;

pub const ALLOWED_SEPARATORS: &[char] = &['_', '.', '-'];

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env reference regex")
});

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_separator")]
    pub separator: char,
    /// Default for APIs that do not set their own.
    #[serde(default)]
    pub merge_policy: MergePolicy,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// 0 disables idle reaping.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default = "default_true")]
    pub json_response: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { json_response: true }
    }
}

/// One backend API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub namespace: String,
    /// `OpenAPI` document location: file path or http(s) URL.
    pub spec: String,
    /// Overrides the document's first server URL.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default)]
    pub auth: Option<Credential>,
    #[serde(default)]
    pub merge_policy: Option<MergePolicy>,
    /// `"METHOD /path"` glob patterns; empty includes everything.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_separator() -> char {
    '_'
}

fn default_server_name() -> String {
    "toolmount".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_reap_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl GatewayConfig {
    /// Read, expand and validate a config file using the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, references an unset
    /// environment variable, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, |name| std::env::var(name).ok())
    }

    /// Parse config text, resolving `${VAR}` references through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`GatewayConfig::load`].
    pub fn from_yaml_str(text: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut raw: YamlValue = serde_yaml::from_str(text)?;
        expand_env(&mut raw, &lookup)?;
        let cfg: GatewayConfig = serde_yaml::from_value(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !ALLOWED_SEPARATORS.contains(&self.separator) {
            return Err(ConfigError::Invalid(format!(
                "separator must be one of {ALLOWED_SEPARATORS:?}, got '{}'",
                self.separator
            )));
        }
        self.bind
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("bind '{}': {e}", self.bind)))?;
        if self.apis.is_empty() {
            return Err(ConfigError::Invalid("no apis configured".to_string()));
        }

        let mut seen = HashSet::new();
        for api in &self.apis {
            if api.namespace.trim().is_empty() {
                return Err(ConfigError::Invalid("api namespace must not be empty".to_string()));
            }
            if !seen.insert(api.namespace.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate api namespace '{}'",
                    api.namespace
                )));
            }
            if api.spec.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "api '{}': spec location must not be empty",
                    api.namespace
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.session.idle_timeout_secs > 0).then(|| Duration::from_secs(self.session.idle_timeout_secs))
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.session.reap_interval_secs.max(1))
    }
}

impl ApiConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout_secs.map_or(DEFAULT_TIMEOUT, Duration::from_secs)
    }

    #[must_use]
    pub fn adapter_settings(&self, base_url: impl Into<String>) -> AdapterSettings {
        AdapterSettings {
            base_url: base_url.into(),
            default_headers: self.headers.clone(),
            timeout: self.timeout(),
            tls: self.tls,
            credential: self.auth.clone(),
        }
    }

    #[must_use]
    pub fn filter(&self) -> OperationFilter {
        OperationFilter::new(self.include.clone(), self.exclude.clone())
    }
}

/// Expand `${VAR}` / `${VAR:-default}` in every string of a YAML tree (keys included).
///
/// # Errors
///
/// [`ConfigError::MissingEnv`] for a reference without a default whose variable is unset.
pub fn expand_env(value: &mut YamlValue, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    match value {
        YamlValue::String(s) => {
            *s = expand_str(s, lookup)?;
        }
        YamlValue::Sequence(items) => {
            for item in items {
                expand_env(item, lookup)?;
            }
        }
        YamlValue::Mapping(map) => {
            let entries = std::mem::take(map);
            for (mut k, mut v) in entries {
                expand_env(&mut k, lookup)?;
                expand_env(&mut v, lookup)?;
                map.insert(k, v);
            }
        }
        YamlValue::Tagged(tagged) => expand_env(&mut tagged.value, lookup)?,
        YamlValue::Null | YamlValue::Bool(_) | YamlValue::Number(_) => {}
    }
    Ok(())
}

fn expand_str(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = ENV_REF.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(v), _) => v,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigError::MissingEnv { name }),
        None => Ok(expanded.into_owned()),
    }
}

//! Error types for `toolmount-gateway`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The mount was rejected as a whole; the registry is unchanged.
    #[error("namespace '{namespace}' collides on: {}", names.join(", "))]
    NamespaceCollision { namespace: String, names: Vec<String> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session not initialized: {0}")]
    NotReady(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("environment variable '{name}' is not set")]
    MissingEnv { name: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("no API namespace could be mounted (failed: {})", failed.join(", "))]
    NoNamespaces { failed: Vec<String> },
}

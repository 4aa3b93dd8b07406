//! Error types for `toolmount-openapi-tools`.

use thiserror::Error;

/// An `OpenAPI` document could not be loaded or understood.
#[derive(Error, Debug)]
pub enum SpecParseError {
    #[error("invalid spec location '{location}': {message}")]
    InvalidLocation { location: String, message: String },

    #[error("failed to fetch spec from '{url}': {message}")]
    Fetch { url: String, message: String },

    #[error("failed to fetch spec from '{url}': HTTP {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("failed to read spec body from '{url}': {message}")]
    ReadBody { url: String, message: String },

    #[error("failed to read spec file '{path}': {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse OpenAPI spec from '{location}': {source}")]
    Parse {
        location: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// `$ref` resolution failures (missing pointer, cycle, unreadable referenced document).
    #[error("{0}")]
    Reference(String),

    #[error("invalid server URL '{url}': {message}")]
    InvalidServerUrl { url: String, message: String },
}

/// One operation could not be turned into a tool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecCompileError {
    #[error("operation '{operation}' has no usable name")]
    EmptyName { operation: String },

    #[error("operation '{operation}': unsupported HTTP method '{method}'")]
    UnsupportedMethod { operation: String, method: String },

    #[error("operation '{operation}': parameter '{name}' uses unsupported location '{location}'")]
    UnsupportedLocation {
        operation: String,
        name: String,
        location: String,
    },

    #[error("operation '{operation}': path placeholder '{{{name}}}' has no path parameter")]
    MissingPathParameter { operation: String, name: String },

    #[error("operation '{operation}': argument '{name}' is declared more than once")]
    ParamCollision { operation: String, name: String },
}

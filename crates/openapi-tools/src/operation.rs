//! Structured operations extracted from an API description.
//!
//! These types are the hand-off between a [`crate::loader::SpecLoader`] and the
//! [`crate::compiler::ToolCompiler`]. All `$ref`s are already resolved and schemas are plain
//! JSON Schema values.

use serde_json::Value;

/// One parameter of an operation. `location` is kept verbatim (`path`, `query`, `header`,
/// `cookie`, ...) so the compiler decides what is supported.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationParam {
    pub name: String,
    pub location: String,
    pub required: bool,
    pub schema: Value,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestBodySpec {
    pub required: bool,
    pub schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiOperation {
    pub operation_id: String,
    /// Lower-case HTTP method as it appears in the document.
    pub method: String,
    pub path_template: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub parameters: Vec<OperationParam>,
    pub request_body: Option<RequestBodySpec>,
    /// JSON Schema of the first JSON 2xx response, if any.
    pub response_schema: Option<Value>,
}

impl ApiOperation {
    /// `"METHOD /path"`, the form include/exclude patterns match against.
    #[must_use]
    pub fn signature(&self) -> String {
        format!("{} {}", self.method.to_ascii_uppercase(), self.path_template)
    }
}

/// Result of loading one API description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedSpec {
    pub title: String,
    /// `servers[].url` in document order, unresolved.
    pub servers: Vec<String>,
    /// Operations in document order.
    pub operations: Vec<ApiOperation>,
}

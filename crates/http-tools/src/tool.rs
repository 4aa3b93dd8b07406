//! Compiled tool definitions.
//!
//! A [`ToolDefinition`] is the immutable result of compiling one API operation. It carries both
//! the client-facing surface (name, description, input schema) and the invocation template the
//! backend adapter needs to turn arguments into an HTTP request.

use reqwest::Method;
use rmcp::model::{JsonObject, Tool, ToolAnnotations};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Where a tool argument is placed in the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

impl ParamLocation {
    /// Parse a raw location name (`path`, `query`, `header`, `body`), case-insensitively.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "body" => Some(Self::Body),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Body => "body",
        }
    }
}

impl fmt::Display for ParamLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One argument accepted by a tool, tagged with its binding location.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputField {
    /// Argument name as exposed to clients.
    pub name: String,
    pub location: ParamLocation,
    /// Name used on the wire (path placeholder, query key, header name or body property).
    pub source_name: String,
    pub required: bool,
    /// JSON Schema fragment for the value.
    pub schema: Value,
    /// The argument is the entire request payload rather than one body property.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub whole_body: bool,
}

/// Structural schema of the arguments a tool accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSchema {
    fields: Vec<InputField>,
}

impl InputSchema {
    #[must_use]
    pub fn new(fields: Vec<InputField>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn fields(&self) -> &[InputField] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&InputField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Project to a JSON Schema object suitable for `tools/list`.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<String> = Vec::new();

        for field in &self.fields {
            properties.insert(field.name.clone(), field.schema.clone());
            if field.required {
                required.push(field.name.clone());
            }
        }

        let mut schema = json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        schema
    }
}

/// Where one schema field ends up in the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamBinding {
    pub location: ParamLocation,
    pub source_name: String,
}

/// HTTP invocation template of a tool.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub method: Method,
    /// Path template relative to the adapter base URL, e.g. `/users/{id}`.
    pub path_template: String,
    pub bindings: BTreeMap<String, ParamBinding>,
}

/// A compiled, invocable tool.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub qualified_name: String,
    pub namespace: String,
    pub local_name: String,
    pub description: String,
    pub input_schema: InputSchema,
    /// JSON Schema of the successful response body, if the operation declares one.
    pub output_schema: Option<Value>,
    pub invocation: Invocation,
}

impl ToolDefinition {
    /// Copy of this definition exposed under a different qualified name.
    #[must_use]
    pub fn renamed(&self, qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            ..self.clone()
        }
    }

    /// MCP hints derived from HTTP method semantics.
    ///
    /// `openWorldHint` is always set: every tool reaches an external system. PATCH idempotence
    /// depends on the API, so it stays unset.
    #[must_use]
    pub fn annotations(&self) -> ToolAnnotations {
        let method = &self.invocation.method;
        let (read_only, destructive, idempotent) =
            if *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS {
                (Some(true), Some(false), Some(true))
            } else if *method == Method::POST {
                (Some(false), Some(false), Some(false))
            } else if *method == Method::PUT || *method == Method::DELETE {
                (Some(false), Some(true), Some(true))
            } else if *method == Method::PATCH {
                (Some(false), Some(true), None)
            } else {
                (None, None, None)
            };

        ToolAnnotations {
            title: None,
            read_only_hint: read_only,
            destructive_hint: destructive,
            idempotent_hint: idempotent,
            open_world_hint: Some(true),
        }
    }

    /// Output schema advertised to clients: the response body wrapped as `{ body }`, since MCP
    /// requires an object at the root. `None` when the body schema is not an object schema.
    #[must_use]
    pub fn wrapped_output_schema(&self) -> Option<Arc<JsonObject>> {
        let body_schema = self.output_schema.as_ref().filter(|s| s.is_object())?;
        let wrapped = json!({
            "type": "object",
            "required": ["body"],
            "properties": { "body": body_schema },
        });
        wrapped.as_object().cloned().map(Arc::new)
    }

    /// Client-facing projection (`name`, `description`, `inputSchema`, ...). Backend details
    /// such as base URL or credentials never appear here.
    #[must_use]
    pub fn to_mcp_tool(&self) -> Tool {
        let schema_obj = self
            .input_schema
            .to_json_schema()
            .as_object()
            .cloned()
            .unwrap_or_else(JsonObject::new);
        let mut tool = Tool::new(
            self.qualified_name.clone(),
            self.description.clone(),
            Arc::new(schema_obj),
        );
        tool.output_schema = self.wrapped_output_schema();
        tool.annotations = Some(self.annotations());
        tool
    }
}

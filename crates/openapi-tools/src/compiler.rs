//! Compile [`ApiOperation`]s into namespaced [`ToolDefinition`]s.
//!
//! Compilation is pure and deterministic: the same operation, namespace and separator always
//! yield the same definition. No I/O happens here.

use crate::error::SpecCompileError;
use crate::operation::ApiOperation;
use regex::Regex;
use reqwest::Method;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;
use toolmount_http_tools::tool::{
    InputField, InputSchema, Invocation, ParamBinding, ParamLocation, ToolDefinition,
};

/// Maximum length of a sanitized name segment.
pub const MAX_NAME_LEN: usize = 64;

static PATH_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("valid placeholder regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolCompiler {
    separator: char,
}

impl Default for ToolCompiler {
    fn default() -> Self {
        Self { separator: '_' }
    }
}

impl ToolCompiler {
    #[must_use]
    pub fn new(separator: char) -> Self {
        Self { separator }
    }

    #[must_use]
    pub fn separator(&self) -> char {
        self.separator
    }

    /// Lower-case ASCII; every run of other characters becomes one separator; separators are
    /// trimmed from both ends; the result is capped at [`MAX_NAME_LEN`].
    #[must_use]
    pub fn sanitize(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut pending_sep = false;
        for c in raw.chars() {
            if c.is_ascii_alphanumeric() {
                if pending_sep && !out.is_empty() {
                    out.push(self.separator);
                }
                pending_sep = false;
                out.push(c.to_ascii_lowercase());
            } else {
                pending_sep = true;
            }
        }
        out.truncate(MAX_NAME_LEN);
        out.trim_end_matches(self.separator).to_string()
    }

    /// `sanitize(namespace) + separator + local_name`.
    #[must_use]
    pub fn qualify(&self, namespace: &str, local_name: &str) -> String {
        format!("{}{}{}", self.sanitize(namespace), self.separator, local_name)
    }

    /// Compile one operation.
    ///
    /// # Errors
    ///
    /// - [`SpecCompileError::EmptyName`] if the operation id sanitizes to nothing
    /// - [`SpecCompileError::UnsupportedMethod`] for methods outside GET/PUT/POST/DELETE/PATCH/HEAD/OPTIONS
    /// - [`SpecCompileError::UnsupportedLocation`] for parameters outside path/query/header/body
    /// - [`SpecCompileError::MissingPathParameter`] if a path placeholder is not declared
    /// - [`SpecCompileError::ParamCollision`] if two arguments end up with the same name
    pub fn compile(&self, namespace: &str, op: &ApiOperation) -> Result<ToolDefinition, SpecCompileError> {
        let local_name = self.sanitize(&op.operation_id);
        if local_name.is_empty() {
            return Err(SpecCompileError::EmptyName {
                operation: op.signature(),
            });
        }

        let method = parse_method(&op.method).ok_or_else(|| SpecCompileError::UnsupportedMethod {
            operation: op.operation_id.clone(),
            method: op.method.clone(),
        })?;

        let mut fields: Vec<InputField> = Vec::new();
        let mut names: HashSet<String> = HashSet::new();

        for param in &op.parameters {
            let location = ParamLocation::parse(&param.location)
                .filter(|l| *l != ParamLocation::Body)
                .ok_or_else(|| SpecCompileError::UnsupportedLocation {
                    operation: op.operation_id.clone(),
                    name: param.name.clone(),
                    location: param.location.clone(),
                })?;

            let mut schema = param.schema.clone();
            if let (Some(obj), Some(desc)) = (schema.as_object_mut(), &param.description)
                && !obj.contains_key("description")
            {
                obj.insert("description".to_string(), Value::String(desc.clone()));
            }

            push_field(
                &mut fields,
                &mut names,
                op,
                InputField {
                    name: param.name.clone(),
                    location,
                    source_name: param.name.clone(),
                    required: param.required || location == ParamLocation::Path,
                    schema,
                    whole_body: false,
                },
            )?;
        }

        for caps in PATH_PLACEHOLDER.captures_iter(&op.path_template) {
            let placeholder = &caps[1];
            let declared = fields
                .iter()
                .any(|f| f.location == ParamLocation::Path && f.source_name == placeholder);
            if !declared {
                return Err(SpecCompileError::MissingPathParameter {
                    operation: op.operation_id.clone(),
                    name: placeholder.to_string(),
                });
            }
        }

        if let Some(body) = &op.request_body {
            for field in body_fields(&body.schema, body.required) {
                push_field(&mut fields, &mut names, op, field)?;
            }
        }

        let bindings: BTreeMap<String, ParamBinding> = fields
            .iter()
            .map(|f| {
                (
                    f.name.clone(),
                    ParamBinding {
                        location: f.location,
                        source_name: f.source_name.clone(),
                    },
                )
            })
            .collect();

        let description = op
            .summary
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| op.description.clone().filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| format!("Calls {} {}", method, op.path_template));

        Ok(ToolDefinition {
            qualified_name: self.qualify(namespace, &local_name),
            namespace: namespace.to_string(),
            local_name,
            description,
            input_schema: InputSchema::new(fields),
            output_schema: op.response_schema.clone(),
            invocation: Invocation {
                method,
                path_template: op.path_template.clone(),
                bindings,
            },
        })
    }

    /// Compile every operation of one API, in order.
    ///
    /// Operations that fail to compile are logged and skipped. Duplicate local names get a
    /// numeric suffix (`_2`, `_3`, ...) in encounter order.
    #[must_use]
    pub fn compile_all(&self, namespace: &str, ops: &[ApiOperation]) -> Vec<ToolDefinition> {
        let mut tools = Vec::with_capacity(ops.len());
        let mut taken: HashSet<String> = HashSet::new();

        for op in ops {
            let tool = match self.compile(namespace, op) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(
                        namespace = %namespace,
                        operation = %op.signature(),
                        error = %e,
                        "skipping operation"
                    );
                    continue;
                }
            };

            let local = self.reserve_unique(&mut taken, &tool.local_name);
            if local == tool.local_name {
                tools.push(tool);
            } else {
                tracing::debug!(
                    namespace = %namespace,
                    original = %tool.local_name,
                    renamed = %local,
                    "duplicate tool name within API"
                );
                let qualified = self.qualify(namespace, &local);
                let mut renamed = tool.renamed(qualified);
                renamed.local_name = local;
                tools.push(renamed);
            }
        }

        tools
    }

    fn reserve_unique(&self, taken: &mut HashSet<String>, base: &str) -> String {
        if taken.insert(base.to_string()) {
            return base.to_string();
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{base}{}{counter}", self.separator);
            if taken.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }
}

fn push_field(
    fields: &mut Vec<InputField>,
    names: &mut HashSet<String>,
    op: &ApiOperation,
    field: InputField,
) -> Result<(), SpecCompileError> {
    if !names.insert(field.name.clone()) {
        return Err(SpecCompileError::ParamCollision {
            operation: op.operation_id.clone(),
            name: field.name,
        });
    }
    fields.push(field);
    Ok(())
}

/// Object bodies with properties are flattened; anything else is one `body` argument.
///
/// A property is required only if the body itself is required.
fn body_fields(schema: &Value, body_required: bool) -> Vec<InputField> {
    let is_object = schema.get("type").and_then(Value::as_str) == Some("object");
    let properties = schema.get("properties").and_then(Value::as_object);

    match properties {
        Some(props) if is_object && !props.is_empty() => {
            let required: HashSet<&str> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            props
                .iter()
                .map(|(name, prop_schema)| InputField {
                    name: name.clone(),
                    location: ParamLocation::Body,
                    source_name: name.clone(),
                    required: body_required && required.contains(name.as_str()),
                    schema: prop_schema.clone(),
                    whole_body: false,
                })
                .collect()
        }
        _ => vec![InputField {
            name: "body".to_string(),
            location: ParamLocation::Body,
            source_name: "body".to_string(),
            required: body_required,
            schema: if schema.is_object() { schema.clone() } else { json!({}) },
            whole_body: true,
        }],
    }
}

fn parse_method(raw: &str) -> Option<Method> {
    match raw.to_ascii_lowercase().as_str() {
        "get" => Some(Method::GET),
        "put" => Some(Method::PUT),
        "post" => Some(Method::POST),
        "delete" => Some(Method::DELETE),
        "patch" => Some(Method::PATCH),
        "head" => Some(Method::HEAD),
        "options" => Some(Method::OPTIONS),
        _ => None,
    }
}

/// Per-API include/exclude filter over `"METHOD /path"` signatures.
///
/// An empty include list admits everything; exclude always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl OperationFilter {
    #[must_use]
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    #[must_use]
    pub fn allows(&self, op: &ApiOperation) -> bool {
        let signature = op.signature();
        let included = self.include.is_empty() || self.include.iter().any(|p| glob_match(p, &signature));
        included && !self.exclude.iter().any(|p| glob_match(p, &signature))
    }

    /// Operations admitted by this filter, in order.
    #[must_use]
    pub fn apply<'a>(&self, ops: &'a [ApiOperation]) -> Vec<&'a ApiOperation> {
        ops.iter().filter(|op| self.allows(op)).collect()
    }
}

/// Byte-wise glob: `*` matches any sequence, `?` any single byte.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_bytes = pattern.as_bytes();
    let text_bytes = text.as_bytes();

    let mut pattern_index = 0usize;
    let mut text_index = 0usize;

    let mut star_index: Option<usize> = None;
    let mut star_text_index: usize = 0;

    while text_index < text_bytes.len() {
        match pattern_bytes.get(pattern_index) {
            Some(b'*') => {
                star_index = Some(pattern_index);
                pattern_index += 1;
                star_text_index = text_index;
            }
            Some(b'?') => {
                pattern_index += 1;
                text_index += 1;
            }
            Some(&b) if b == text_bytes[text_index] => {
                pattern_index += 1;
                text_index += 1;
            }
            _ => {
                let Some(si) = star_index else {
                    return false;
                };
                pattern_index = si + 1;
                star_text_index += 1;
                text_index = star_text_index;
            }
        }
    }

    while matches!(pattern_bytes.get(pattern_index), Some(b'*')) {
        pattern_index += 1;
    }

    pattern_index == pattern_bytes.len()
}

//! Loading `OpenAPI` documents into [`LoadedSpec`]s.

use crate::error::SpecParseError;
use crate::operation::{ApiOperation, LoadedSpec, OperationParam, RequestBodySpec};
use crate::resolver::{DocId, OpenApiResolver};
use async_trait::async_trait;
use openapiv3::{
    Content, MediaType, OpenAPI, Operation, Parameter, ParameterSchemaOrContent, ReferenceOr, Response,
    StatusCode,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use toolmount_http_tools::client::sanitize_reqwest_error;
use url::Url;

/// Turns a spec location (file path or `http(s)` URL) into structured operations.
#[async_trait]
pub trait SpecLoader: Send + Sync {
    /// # Errors
    ///
    /// Returns [`SpecParseError`] if the document cannot be read or is not valid `OpenAPI`.
    async fn load(&self, location: &str) -> Result<LoadedSpec, SpecParseError>;
}

/// [`SpecLoader`] for `OpenAPI` 3.0 documents in JSON or YAML.
#[derive(Debug, Clone, Default)]
pub struct OpenApiSpecLoader {
    client: reqwest::Client,
}

impl OpenApiSpecLoader {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn read_location(&self, location: &str) -> Result<String, SpecParseError> {
        if is_http_url(location) {
            tracing::info!(location = %location, "fetching OpenAPI spec");
            let url = Url::parse(location).map_err(|e| SpecParseError::InvalidLocation {
                location: location.to_string(),
                message: e.to_string(),
            })?;
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| SpecParseError::Fetch {
                    url: location.to_string(),
                    message: sanitize_reqwest_error(&e),
                })?;
            if !resp.status().is_success() {
                return Err(SpecParseError::FetchStatus {
                    url: location.to_string(),
                    status: resp.status().as_u16(),
                });
            }
            resp.text().await.map_err(|e| SpecParseError::ReadBody {
                url: location.to_string(),
                message: sanitize_reqwest_error(&e),
            })
        } else {
            tracing::info!(location = %location, "loading OpenAPI spec");
            std::fs::read_to_string(location).map_err(|e| SpecParseError::ReadFile {
                path: location.to_string(),
                source: e,
            })
        }
    }
}

#[async_trait]
impl SpecLoader for OpenApiSpecLoader {
    async fn load(&self, location: &str) -> Result<LoadedSpec, SpecParseError> {
        let content = self.read_location(location).await?;

        // JSON is a subset of YAML.
        let spec: OpenAPI = serde_yaml::from_str(&content).map_err(|e| SpecParseError::Parse {
            location: location.to_string(),
            source: e,
        })?;

        let root_doc = DocId::parse(location)?;
        let resolver = OpenApiResolver::new(root_doc, &spec, &self.client)?;
        let operations = collect_operations(&resolver, &spec).await;

        Ok(LoadedSpec {
            title: spec.info.title.clone(),
            servers: spec.servers.iter().map(expand_server_variables).collect(),
            operations,
        })
    }
}

async fn collect_operations(resolver: &OpenApiResolver<'_>, spec: &OpenAPI) -> Vec<ApiOperation> {
    let mut operations = Vec::new();

    for (path, path_item) in &spec.paths.paths {
        let (path_doc, path_item) = match resolver.resolve(resolver.root_doc(), path_item).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "skipping unresolvable path item");
                continue;
            }
        };

        let methods = [
            ("get", &path_item.get),
            ("put", &path_item.put),
            ("post", &path_item.post),
            ("delete", &path_item.delete),
            ("options", &path_item.options),
            ("head", &path_item.head),
            ("patch", &path_item.patch),
        ];

        for (method, op) in methods {
            let Some(op) = op else { continue };
            match build_operation(resolver, &path_doc, &path_item.parameters, path, method, op).await {
                Ok(operation) => operations.push(operation),
                Err(e) => {
                    tracing::warn!(
                        method = %method.to_ascii_uppercase(),
                        path = %path,
                        error = %e,
                        "skipping operation with unresolvable references"
                    );
                }
            }
        }
    }

    operations
}

async fn build_operation(
    resolver: &OpenApiResolver<'_>,
    current_doc: &DocId,
    path_item_params: &[ReferenceOr<Parameter>],
    path: &str,
    method: &str,
    op: &Operation,
) -> Result<ApiOperation, SpecParseError> {
    let merged = merge_parameters(resolver, current_doc, path_item_params, &op.parameters).await?;

    let mut parameters = Vec::with_capacity(merged.len());
    for (param_doc, param) in &merged {
        parameters.push(convert_parameter(resolver, param_doc, param).await);
    }

    let request_body = match &op.request_body {
        Some(body_ref) => {
            let (body_doc, body) = resolver.resolve(current_doc, body_ref).await?;
            match select_json_media(&body.content) {
                Some(media) => {
                    let schema = match &media.schema {
                        Some(s) => resolver.schema_json(&body_doc, s).await,
                        None => json!({}),
                    };
                    Some(RequestBodySpec {
                        required: body.required,
                        schema,
                    })
                }
                None => {
                    tracing::debug!(
                        method = %method.to_ascii_uppercase(),
                        path = %path,
                        "request body has no JSON media type; not exposed"
                    );
                    None
                }
            }
        }
        None => None,
    };

    let response_schema = derive_response_schema(resolver, current_doc, op).await?;

    Ok(ApiOperation {
        operation_id: op
            .operation_id
            .clone()
            .unwrap_or_else(|| fallback_operation_id(method, path)),
        method: method.to_string(),
        path_template: path.to_string(),
        summary: op.summary.clone(),
        description: op.description.clone(),
        parameters,
        request_body,
        response_schema,
    })
}

async fn convert_parameter(resolver: &OpenApiResolver<'_>, doc: &DocId, param: &Parameter) -> OperationParam {
    let (location, data) = match param {
        Parameter::Path { parameter_data, .. } => ("path", parameter_data),
        Parameter::Query { parameter_data, .. } => ("query", parameter_data),
        Parameter::Header { parameter_data, .. } => ("header", parameter_data),
        Parameter::Cookie { parameter_data, .. } => ("cookie", parameter_data),
    };

    let schema = match &data.format {
        ParameterSchemaOrContent::Schema(s) => resolver.schema_json(doc, s).await,
        ParameterSchemaOrContent::Content(content) => match content.values().find_map(|m| m.schema.as_ref()) {
            Some(s) => resolver.schema_json(doc, s).await,
            None => json!({"type": "string"}),
        },
    };

    OperationParam {
        name: data.name.clone(),
        location: location.to_string(),
        required: data.required || location == "path",
        schema,
        description: data.description.clone(),
    }
}

/// Path-item parameters overlaid by operation parameters with the same `(in, name)`.
async fn merge_parameters(
    resolver: &OpenApiResolver<'_>,
    current_doc: &DocId,
    path_item_params: &[ReferenceOr<Parameter>],
    operation_params: &[ReferenceOr<Parameter>],
) -> Result<Vec<(DocId, Parameter)>, SpecParseError> {
    fn key_for(p: &Parameter) -> (&'static str, String) {
        match p {
            Parameter::Path { parameter_data, .. } => ("path", parameter_data.name.clone()),
            Parameter::Query { parameter_data, .. } => ("query", parameter_data.name.clone()),
            Parameter::Header { parameter_data, .. } => ("header", parameter_data.name.clone()),
            Parameter::Cookie { parameter_data, .. } => ("cookie", parameter_data.name.clone()),
        }
    }

    let mut merged: Vec<(DocId, Parameter)> = Vec::new();
    let mut index: HashMap<(&'static str, String), usize> = HashMap::new();

    for p in path_item_params {
        let (doc, rp) = resolver.resolve(current_doc, p).await?;
        index.insert(key_for(&rp), merged.len());
        merged.push((doc, rp));
    }

    for p in operation_params {
        let (doc, rp) = resolver.resolve(current_doc, p).await?;
        let k = key_for(&rp);
        if let Some(i) = index.get(&k).copied() {
            merged[i] = (doc, rp);
        } else {
            index.insert(k, merged.len());
            merged.push((doc, rp));
        }
    }

    Ok(merged)
}

/// Schema of the lowest explicit 2xx response, falling back to `2XX`.
async fn derive_response_schema(
    resolver: &OpenApiResolver<'_>,
    current_doc: &DocId,
    op: &Operation,
) -> Result<Option<Value>, SpecParseError> {
    let mut explicit_2xx: Vec<(u16, &ReferenceOr<Response>)> = Vec::new();
    let mut range_2xx: Option<&ReferenceOr<Response>> = None;

    for (code, resp) in &op.responses.responses {
        match code {
            StatusCode::Code(n) if (200..300).contains(n) => explicit_2xx.push((*n, resp)),
            StatusCode::Range(2) => range_2xx = Some(resp),
            _ => {}
        }
    }
    explicit_2xx.sort_by_key(|(n, _)| *n);

    let Some(resp_ref) = explicit_2xx.first().map(|(_, r)| *r).or(range_2xx) else {
        return Ok(None);
    };

    let (resp_doc, resp) = resolver.resolve(current_doc, resp_ref).await?;
    let Some(schema_ref) = select_json_media(&resp.content).and_then(|m| m.schema.as_ref()) else {
        return Ok(None);
    };
    Ok(Some(resolver.schema_json(&resp_doc, schema_ref).await))
}

fn select_json_media(content: &Content) -> Option<&MediaType> {
    content.get("application/json").or_else(|| {
        content
            .iter()
            .find_map(|(k, v)| k.to_ascii_lowercase().contains("json").then_some(v))
    })
}

fn fallback_operation_id(method: &str, path: &str) -> String {
    format!("{method}_{}", path.trim_matches('/'))
}

fn expand_server_variables(server: &openapiv3::Server) -> String {
    let mut url = server.url.clone();
    if let Some(vars) = &server.variables {
        for (name, var) in vars {
            url = url.replace(&format!("{{{name}}}"), &var.default);
        }
    }
    url
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Resolve a `servers[].url` entry to an absolute base URL.
///
/// Relative server URLs (e.g. `/api/v3`) are resolved against the spec URL when the spec
/// itself was fetched over HTTP.
///
/// # Errors
///
/// Returns [`SpecParseError::InvalidServerUrl`] if the URL is relative and the spec was read
/// from a file, or if joining fails.
pub fn resolve_server_url(spec_location: &str, server_url: &str) -> Result<String, SpecParseError> {
    if is_http_url(server_url) {
        return Ok(server_url.to_string());
    }

    if is_http_url(spec_location) {
        let mut spec_url = Url::parse(spec_location).map_err(|e| SpecParseError::InvalidLocation {
            location: spec_location.to_string(),
            message: e.to_string(),
        })?;
        spec_url.set_fragment(None);

        let resolved = spec_url.join(server_url).map_err(|e| SpecParseError::InvalidServerUrl {
            url: server_url.to_string(),
            message: e.to_string(),
        })?;
        return Ok(resolved.to_string());
    }

    Err(SpecParseError::InvalidServerUrl {
        url: server_url.to_string(),
        message: "must be an absolute http(s) URL when the spec is read from a file (set baseUrl)".to_string(),
    })
}

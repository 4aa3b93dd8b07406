//! `$ref` resolution across one or more `OpenAPI` documents.
//!
//! `openapiv3` keeps `$ref`s as `ReferenceOr<T>`. Refs are followed relative to the document
//! that contains them, so every resolved item comes back paired with its [`DocId`]. Local
//! pointers, file paths (relative or absolute), `file://` URLs and http(s) URLs are supported.

use crate::error::SpecParseError;
use crate::schema::{ref_to_json, schema_to_json};
use openapiv3::{OpenAPI, ReferenceOr, Schema, SchemaKind, Type};
use parking_lot::RwLock;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use toolmount_http_tools::client::sanitize_reqwest_error;
use url::Url;

type Result<T> = std::result::Result<T, SpecParseError>;

/// Where a document lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocId {
    Url(Url),
    File(PathBuf),
}

impl DocId {
    /// Identify the root document of a spec location.
    ///
    /// # Errors
    ///
    /// [`SpecParseError::InvalidLocation`] for malformed URLs.
    pub fn parse(location: &str) -> Result<Self> {
        Self::locate(None, location).map_err(|message| SpecParseError::InvalidLocation {
            location: location.to_string(),
            message,
        })
    }

    /// `target` as seen from `base`. Absolute URLs and paths ignore `base`.
    fn locate(base: Option<&DocId>, target: &str) -> std::result::Result<Self, String> {
        if target.starts_with("http://") || target.starts_with("https://") {
            let url = Url::parse(target).map_err(|e| e.to_string())?;
            return Ok(DocId::Url(without_fragment(url)));
        }
        if target.starts_with("file://") {
            let path = Url::parse(target)
                .map_err(|e| e.to_string())?
                .to_file_path()
                .map_err(|()| "file URL has no local path".to_string())?;
            return Ok(Self::file(path));
        }
        match base {
            Some(DocId::Url(base)) => base
                .join(target)
                .map(|url| DocId::Url(without_fragment(url)))
                .map_err(|e| format!("cannot resolve against {base}: {e}")),
            Some(DocId::File(base)) if Path::new(target).is_relative() => {
                let dir = base.parent().unwrap_or_else(|| Path::new("."));
                Ok(Self::file(dir.join(target)))
            }
            _ => Ok(Self::file(PathBuf::from(target))),
        }
    }

    fn file(path: PathBuf) -> Self {
        DocId::File(std::fs::canonicalize(&path).unwrap_or(path))
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocId::Url(url) => write!(f, "{url}"),
            DocId::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn without_fragment(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// A `$ref` split into its document and JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RefTarget {
    doc: DocId,
    pointer: Option<String>,
}

impl RefTarget {
    fn parse(from: &DocId, reference: &str) -> Result<Self> {
        let (doc_part, fragment) = reference.split_once('#').unwrap_or((reference, ""));
        let doc = if doc_part.is_empty() {
            from.clone()
        } else {
            DocId::locate(Some(from), doc_part)
                .map_err(|e| SpecParseError::Reference(format!("bad $ref '{reference}': {e}")))?
        };
        let pointer = match fragment {
            "" => None,
            f if f.starts_with('/') => Some(f.to_string()),
            _ => {
                return Err(SpecParseError::Reference(format!(
                    "$ref fragment must be a JSON pointer: {reference}"
                )));
            }
        };
        Ok(Self { doc, pointer })
    }
}

/// Resolves refs for one loaded spec; referenced documents are fetched once and cached.
#[derive(Debug)]
pub struct OpenApiResolver<'a> {
    root: DocId,
    client: &'a Client,
    documents: RwLock<HashMap<DocId, Arc<Value>>>,
}

impl<'a> OpenApiResolver<'a> {
    /// # Errors
    ///
    /// [`SpecParseError::Reference`] if `spec` cannot be re-encoded as JSON.
    pub fn new(root: DocId, spec: &OpenAPI, client: &'a Client) -> Result<Self> {
        let value = serde_json::to_value(spec).map_err(|e| SpecParseError::Reference(e.to_string()))?;
        let documents = HashMap::from([(root.clone(), Arc::new(value))]);
        Ok(Self {
            root,
            client,
            documents: RwLock::new(documents),
        })
    }

    #[must_use]
    pub fn root_doc(&self) -> &DocId {
        &self.root
    }

    /// Follow `item` from document `from` until it is no longer a `$ref`.
    ///
    /// # Errors
    ///
    /// [`SpecParseError::Reference`] for cycles, missing targets, unreadable documents, or a
    /// target that does not deserialize as `T`.
    pub async fn resolve<T>(&self, from: &DocId, item: &ReferenceOr<T>) -> Result<(DocId, T)>
    where
        T: Clone + DeserializeOwned,
    {
        let mut visited: HashSet<RefTarget> = HashSet::new();
        let mut doc = from.clone();
        let mut current = item.clone();

        loop {
            let reference = match current {
                ReferenceOr::Item(item) => return Ok((doc, item)),
                ReferenceOr::Reference { reference } => reference,
            };
            let target = RefTarget::parse(&doc, &reference)?;
            if !visited.insert(target.clone()) {
                return Err(SpecParseError::Reference(format!("cyclic $ref: {reference}")));
            }
            let value = self.lookup(&target, &reference).await?;
            current = serde_json::from_value(value).map_err(|e| {
                SpecParseError::Reference(format!("$ref '{reference}' in {} has the wrong shape: {e}", target.doc))
            })?;
            doc = target.doc;
        }
    }

    /// JSON Schema for a possibly-referenced schema. A top-level `$ref` is resolved, and so are
    /// `$ref`ed properties of a resolved object schema; unresolvable refs stay as `{"$ref"}`.
    pub async fn schema_json(&self, current_doc: &DocId, schema: &ReferenceOr<Schema>) -> Value {
        let (doc, schema) = match self.resolve(current_doc, schema).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "leaving schema reference unresolved");
                return ref_to_json(schema);
            }
        };

        let mut out = schema_to_json(&schema);
        if let SchemaKind::Type(Type::Object(obj)) = &schema.schema_kind {
            for (name, prop) in &obj.properties {
                if let ReferenceOr::Reference { reference } = prop {
                    let unboxed = ReferenceOr::<Schema>::Reference {
                        reference: reference.clone(),
                    };
                    if let Ok((_, s)) = self.resolve(&doc, &unboxed).await {
                        out["properties"][name] = schema_to_json(&s);
                    }
                }
            }
        }
        out
    }

    async fn lookup(&self, target: &RefTarget, reference: &str) -> Result<Value> {
        let document = self.document(&target.doc).await?;
        match &target.pointer {
            None => Ok((*document).clone()),
            Some(pointer) => document.pointer(pointer).cloned().ok_or_else(|| {
                SpecParseError::Reference(format!(
                    "unresolved $ref '{reference}': {} has nothing at '{pointer}'",
                    target.doc
                ))
            }),
        }
    }

    async fn document(&self, doc: &DocId) -> Result<Arc<Value>> {
        if let Some(cached) = self.documents.read().get(doc) {
            return Ok(cached.clone());
        }

        let text = self.read(doc).await?;
        // JSON is a subset of YAML.
        let value: Value = serde_yaml::from_str(&text)
            .map_err(|e| SpecParseError::Reference(format!("cannot parse referenced document {doc}: {e}")))?;
        let value = Arc::new(value);
        self.documents.write().insert(doc.clone(), value.clone());
        Ok(value)
    }

    async fn read(&self, doc: &DocId) -> Result<String> {
        match doc {
            DocId::File(path) => std::fs::read_to_string(path)
                .map_err(|e| SpecParseError::Reference(format!("cannot read referenced file {doc}: {e}"))),
            DocId::Url(url) => {
                let fetch_error =
                    |e: reqwest::Error| SpecParseError::Reference(format!("cannot fetch {}: {}", doc, sanitize_reqwest_error(&e)));
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(fetch_error)?;
                response.text().await.map_err(fetch_error)
            }
        }
    }
}

//! Namespaced tool registry.
//!
//! Readers take an `Arc` of the current snapshot and never wait on a mount in progress.
//! Mounts are serialized, build a new snapshot off to the side and publish it with a single
//! pointer swap, so a failed mount leaves nothing behind.

use crate::error::RegistryError;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use toolmount_http_tools::adapter::BackendAdapter;
use toolmount_http_tools::tool::ToolDefinition;
use toolmount_openapi_tools::compiler::ToolCompiler;

/// What to do when a mounted tool's qualified name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Fail the whole mount.
    #[default]
    RejectOnCollision,
    /// Overwrite the existing entry, keeping its list position.
    Replace,
    /// Expose the newcomer as `namespace + separator + taken name`.
    MergePrefixed,
}

/// A resolvable tool: its definition and the adapter that executes it.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub definition: Arc<ToolDefinition>,
    pub adapter: Arc<BackendAdapter>,
}

/// Narrow view of a backend-derived tool set, all the registry needs to mount it.
pub trait ToolSet: Send + Sync {
    fn namespace(&self) -> &str;
    fn tools(&self) -> Vec<Arc<ToolDefinition>>;
    fn adapter(&self) -> Arc<BackendAdapter>;
}

/// Tools compiled from one API, bound to that API's adapter.
#[derive(Debug, Clone)]
pub struct CompiledApi {
    namespace: String,
    tools: Vec<Arc<ToolDefinition>>,
    adapter: Arc<BackendAdapter>,
}

impl CompiledApi {
    #[must_use]
    pub fn new(namespace: impl Into<String>, tools: Vec<ToolDefinition>, adapter: Arc<BackendAdapter>) -> Self {
        Self {
            namespace: namespace.into(),
            tools: tools.into_iter().map(Arc::new).collect(),
            adapter,
        }
    }
}

impl ToolSet for CompiledApi {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn tools(&self) -> Vec<Arc<ToolDefinition>> {
        self.tools.clone()
    }

    fn adapter(&self) -> Arc<BackendAdapter> {
        self.adapter.clone()
    }
}

/// Outcome of a successful mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountReport {
    pub namespace: String,
    /// Newly added names, in mount order.
    pub added: Vec<String>,
    /// Names whose previous entry was overwritten (`Replace`).
    pub replaced: Vec<String>,
    /// `(taken name, exposed name)` pairs (`MergePrefixed`).
    pub renamed: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    entries: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
    namespaces: Vec<String>,
}

impl Snapshot {
    fn push(&mut self, tool: RegisteredTool) {
        self.index
            .insert(tool.definition.qualified_name.clone(), self.entries.len());
        self.entries.push(tool);
    }
}

pub struct ToolRegistry {
    separator: char,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new('_')
    }
}

impl ToolRegistry {
    /// `separator` joins namespace and local name, and precedes `MergePrefixed` suffixes.
    #[must_use]
    pub fn new(separator: char) -> Self {
        Self {
            separator,
            current: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Mount a tool set through its capability interface.
    ///
    /// # Errors
    ///
    /// See [`ToolRegistry::mount`].
    pub fn mount_tool_set(&self, set: &dyn ToolSet, policy: MergePolicy) -> Result<MountReport, RegistryError> {
        let adapter = set.adapter();
        let tools = set
            .tools()
            .into_iter()
            .map(|t| (t, adapter.clone()))
            .collect();
        self.mount(set.namespace(), tools, policy)
    }

    /// Mount `tools` under `namespace`. Keys are `sanitize(namespace) + separator + local name`;
    /// a definition compiled under another name is re-keyed to match.
    ///
    /// The mount is atomic: either every tool becomes resolvable or the registry is unchanged.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NamespaceCollision`] under [`MergePolicy::RejectOnCollision`] when any
    /// key is already registered or appears twice in `tools`.
    pub fn mount(
        &self,
        namespace: &str,
        tools: Vec<(Arc<ToolDefinition>, Arc<BackendAdapter>)>,
        policy: MergePolicy,
    ) -> Result<MountReport, RegistryError> {
        let tools: Vec<_> = tools
            .into_iter()
            .map(|(definition, adapter)| (self.keyed(namespace, definition), adapter))
            .collect();

        let _writer = self.writer.lock();
        let current = self.snapshot();

        let mut next = (*current).clone();
        let mut report = MountReport {
            namespace: namespace.to_string(),
            ..MountReport::default()
        };

        match policy {
            MergePolicy::RejectOnCollision => {
                let mut seen = HashSet::new();
                let collisions: Vec<String> = tools
                    .iter()
                    .map(|(def, _)| def.qualified_name.clone())
                    .filter(|name| current.index.contains_key(name) || !seen.insert(name.clone()))
                    .collect();
                if !collisions.is_empty() {
                    tracing::warn!(
                        namespace = %namespace,
                        collisions = ?collisions,
                        "mount rejected"
                    );
                    return Err(RegistryError::NamespaceCollision {
                        namespace: namespace.to_string(),
                        names: collisions,
                    });
                }
                for (definition, adapter) in tools {
                    report.added.push(definition.qualified_name.clone());
                    next.push(RegisteredTool { definition, adapter });
                }
            }
            MergePolicy::Replace => {
                for (definition, adapter) in tools {
                    let name = definition.qualified_name.clone();
                    if let Some(&pos) = next.index.get(&name) {
                        next.entries[pos] = RegisteredTool { definition, adapter };
                        report.replaced.push(name);
                    } else {
                        next.push(RegisteredTool { definition, adapter });
                        report.added.push(name);
                    }
                }
            }
            MergePolicy::MergePrefixed => {
                for (definition, adapter) in tools {
                    let name = definition.qualified_name.clone();
                    if next.index.contains_key(&name) {
                        let exposed = self.prefixed_name(&next, &definition);
                        let renamed = Arc::new(definition.renamed(exposed.clone()));
                        next.push(RegisteredTool {
                            definition: renamed,
                            adapter,
                        });
                        report.renamed.push((name, exposed));
                    } else {
                        next.push(RegisteredTool { definition, adapter });
                        report.added.push(name);
                    }
                }
            }
        }

        if !next.namespaces.iter().any(|ns| ns == namespace) {
            next.namespaces.push(namespace.to_string());
        }

        *self.current.write() = Arc::new(next);

        tracing::info!(
            namespace = %namespace,
            added = report.added.len(),
            replaced = report.replaced.len(),
            renamed = report.renamed.len(),
            "namespace mounted"
        );
        Ok(report)
    }

    fn keyed(&self, namespace: &str, definition: Arc<ToolDefinition>) -> Arc<ToolDefinition> {
        let key = ToolCompiler::new(self.separator).qualify(namespace, &definition.local_name);
        if key == definition.qualified_name && definition.namespace == namespace {
            return definition;
        }
        let mut rekeyed = definition.renamed(key);
        rekeyed.namespace = namespace.to_string();
        Arc::new(rekeyed)
    }

    fn prefixed_name(&self, snapshot: &Snapshot, definition: &ToolDefinition) -> String {
        let taken = &definition.qualified_name;
        // The qualified name already starts with the sanitized namespace and separator.
        let base = match taken.strip_suffix(definition.local_name.as_str()) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}{taken}"),
            _ => format!("{}{}{taken}", definition.namespace, self.separator),
        };
        if !snapshot.index.contains_key(&base) {
            return base;
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{base}{}{counter}", self.separator);
            if !snapshot.index.contains_key(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<RegisteredTool> {
        let snapshot = self.snapshot();
        snapshot
            .index
            .get(name)
            .and_then(|&pos| snapshot.entries.get(pos))
            .cloned()
    }

    /// All tools in mount order, then compilation order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ToolDefinition>> {
        self.snapshot()
            .entries
            .iter()
            .map(|e| e.definition.clone())
            .collect()
    }

    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.snapshot().namespaces.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().entries.is_empty()
    }
}

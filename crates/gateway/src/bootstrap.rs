//! Startup: load every configured API, compile it and mount it.
//!
//! One bad API only costs its own namespace; the gateway refuses to start only when nothing
//! could be mounted.

use crate::config::{ApiConfig, GatewayConfig};
use crate::error::StartupError;
use crate::gateway::{ProtocolGateway, ServerInfo};
use crate::registry::{CompiledApi, MountReport, ToolRegistry};
use crate::session::SessionManager;
use std::sync::Arc;
use toolmount_http_tools::adapter::BackendAdapter;
use toolmount_openapi_tools::compiler::ToolCompiler;
use toolmount_openapi_tools::loader::{SpecLoader, resolve_server_url};
use toolmount_openapi_tools::operation::{ApiOperation, LoadedSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedApi {
    pub namespace: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub mounted: Vec<MountReport>,
    pub failed: Vec<FailedApi>,
}

impl BootstrapReport {
    fn fail(&mut self, namespace: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(namespace = %namespace, reason = %reason, "skipping api");
        self.failed.push(FailedApi {
            namespace: namespace.to_string(),
            reason,
        });
    }
}

/// Everything the transport needs, built from config.
pub struct Bootstrapped {
    pub gateway: Arc<ProtocolGateway>,
    pub sessions: Arc<SessionManager>,
    pub report: BootstrapReport,
}

/// Build the registry, session manager and gateway for `cfg`.
///
/// # Errors
///
/// [`StartupError::NoNamespaces`] when not a single API could be mounted.
pub async fn start(cfg: &GatewayConfig, loader: &dyn SpecLoader) -> Result<Bootstrapped, StartupError> {
    let registry = Arc::new(ToolRegistry::new(cfg.separator));
    let report = mount_apis(cfg, loader, &registry).await?;

    let sessions = Arc::new(SessionManager::new(cfg.idle_timeout()));
    let info = ServerInfo {
        name: cfg.server_name.clone(),
        instructions: cfg.instructions.clone(),
        ..ServerInfo::default()
    };
    let gateway = Arc::new(ProtocolGateway::new(registry, sessions.clone(), info));
    Ok(Bootstrapped {
        gateway,
        sessions,
        report,
    })
}

/// Mount every API of `cfg` into `registry`, in config order.
///
/// # Errors
///
/// [`StartupError::NoNamespaces`] when not a single API could be mounted.
pub async fn mount_apis(
    cfg: &GatewayConfig,
    loader: &dyn SpecLoader,
    registry: &ToolRegistry,
) -> Result<BootstrapReport, StartupError> {
    let compiler = ToolCompiler::new(cfg.separator);
    let mut report = BootstrapReport::default();

    for api in &cfg.apis {
        let spec = match loader.load(&api.spec).await {
            Ok(spec) => spec,
            Err(e) => {
                report.fail(&api.namespace, e.to_string());
                continue;
            }
        };

        let base_url = match base_url(api, &spec) {
            Ok(url) => url,
            Err(reason) => {
                report.fail(&api.namespace, reason);
                continue;
            }
        };

        let adapter = match BackendAdapter::new(api.namespace.clone(), api.adapter_settings(base_url)) {
            Ok(adapter) => Arc::new(adapter),
            Err(e) => {
                report.fail(&api.namespace, e.to_string());
                continue;
            }
        };

        let operations: Vec<ApiOperation> = api.filter().apply(&spec.operations).into_iter().cloned().collect();
        let tools = compiler.compile_all(&api.namespace, &operations);
        if tools.is_empty() {
            tracing::warn!(namespace = %api.namespace, spec = %api.spec, "api produced no tools");
        }

        let policy = api.merge_policy.unwrap_or(cfg.merge_policy);
        match registry.mount_tool_set(&CompiledApi::new(api.namespace.clone(), tools, adapter), policy) {
            Ok(mounted) => {
                tracing::info!(
                    namespace = %api.namespace,
                    title = %spec.title,
                    base_url = %api.base_url.as_deref().unwrap_or("<from spec>"),
                    tools = mounted.added.len() + mounted.replaced.len() + mounted.renamed.len(),
                    "api mounted"
                );
                report.mounted.push(mounted);
            }
            Err(e) => report.fail(&api.namespace, e.to_string()),
        }
    }

    if report.mounted.is_empty() {
        return Err(StartupError::NoNamespaces {
            failed: report.failed.iter().map(|f| f.namespace.clone()).collect(),
        });
    }
    Ok(report)
}

fn base_url(api: &ApiConfig, spec: &LoadedSpec) -> Result<String, String> {
    if let Some(url) = &api.base_url {
        return Ok(url.clone());
    }
    let server = spec
        .servers
        .first()
        .ok_or_else(|| "no baseUrl configured and the spec declares no servers".to_string())?;
    resolve_server_url(&api.spec, server).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::op;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use toolmount_openapi_tools::error::SpecParseError;

    #[derive(Default)]
    struct MapLoader {
        specs: HashMap<String, LoadedSpec>,
    }

    impl MapLoader {
        fn with(mut self, location: &str, servers: &[&str], ops: Vec<ApiOperation>) -> Self {
            self.specs.insert(
                location.to_string(),
                LoadedSpec {
                    title: location.to_string(),
                    servers: servers.iter().map(|s| (*s).to_string()).collect(),
                    operations: ops,
                },
            );
            self
        }
    }

    #[async_trait]
    impl SpecLoader for MapLoader {
        async fn load(&self, location: &str) -> Result<LoadedSpec, SpecParseError> {
            self.specs
                .get(location)
                .cloned()
                .ok_or_else(|| SpecParseError::InvalidLocation {
                    location: location.to_string(),
                    message: "not found".to_string(),
                })
        }
    }

    fn config(yaml: &str) -> GatewayConfig {
        GatewayConfig::from_yaml_str(yaml, |_| None).unwrap()
    }

    #[tokio::test]
    async fn one_bad_api_does_not_stop_the_others() {
        let loader = MapLoader::default()
            .with("a.yaml", &["http://a.test/v1"], vec![op("getUser", "get", "/users/{id}")])
            .with("c.yaml", &[], vec![op("x", "get", "/x")]);
        let cfg = config(
            r"
apis:
  - { namespace: a, spec: a.yaml }
  - { namespace: b, spec: missing.yaml }
  - { namespace: c, spec: c.yaml }
  - { namespace: d, spec: a.yaml, baseUrl: 'ftp://nope' }
",
        );
        let started = start(&cfg, &loader).await.unwrap();
        let registry = started.gateway.registry();

        assert_eq!(registry.namespaces(), vec!["a"]);
        let tool = registry.lookup("a_getuser").unwrap();
        assert_eq!(tool.adapter.base_url().as_str(), "http://a.test/v1");

        let failed: Vec<&str> = started.report.failed.iter().map(|f| f.namespace.as_str()).collect();
        assert_eq!(failed, vec!["b", "c", "d"]);
        assert!(started.report.failed[1].reason.contains("no servers"));
    }

    #[tokio::test]
    async fn nothing_mounted_is_fatal() {
        let cfg = config("apis: [{ namespace: a, spec: nowhere.yaml }]");
        let err = start(&cfg, &MapLoader::default()).await.err().unwrap();
        assert_eq!(
            err,
            StartupError::NoNamespaces {
                failed: vec!["a".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn collision_skips_second_namespace_under_reject() {
        // Both sanitize to the same qualified names.
        let loader = MapLoader::default()
            .with("a.yaml", &["http://a.test"], vec![op("getUser", "get", "/users/{id}")])
            .with("b.yaml", &["http://b.test"], vec![op("getUser", "get", "/people/{id}")]);
        let cfg = config(
            r"
apis:
  - { namespace: a, spec: a.yaml }
  - { namespace: A, spec: b.yaml }
",
        );
        let started = start(&cfg, &loader).await.unwrap();
        assert_eq!(started.report.failed[0].namespace, "A");
        let tool = started.gateway.registry().lookup("a_getuser").unwrap();
        assert_eq!(tool.definition.invocation.path_template, "/users/{id}");
    }

    #[tokio::test]
    async fn per_api_policy_overrides_global() {
        let loader = MapLoader::default()
            .with("a.yaml", &["http://a.test"], vec![op("getUser", "get", "/users/{id}")])
            .with("b.yaml", &["http://b.test"], vec![op("getUser", "get", "/people/{id}")]);
        let cfg = config(
            r"
apis:
  - { namespace: a, spec: a.yaml }
  - { namespace: A, spec: b.yaml, mergePolicy: merge-prefixed }
",
        );
        let started = start(&cfg, &loader).await.unwrap();
        assert!(started.report.failed.is_empty());
        let registry = started.gateway.registry();
        assert_eq!(
            registry.lookup("a_getuser").unwrap().definition.invocation.path_template,
            "/users/{id}"
        );
        let prefixed = registry.lookup("a_a_getuser").unwrap();
        assert_eq!(prefixed.definition.invocation.path_template, "/people/{id}");
        assert_eq!(prefixed.adapter.base_url().as_str(), "http://b.test/");
    }

    #[tokio::test]
    async fn filters_and_separator_shape_tool_names() {
        let loader = MapLoader::default().with(
            "a.yaml",
            &["http://a.test"],
            vec![op("getUser", "get", "/users/{id}"), op("deleteUser", "delete", "/users/{id}")],
        );
        let cfg = config(
            r#"
separator: "."
mergePolicy: replace
apis:
  - { namespace: pets, spec: a.yaml, exclude: ["DELETE *"] }
"#,
        );
        let started = start(&cfg, &loader).await.unwrap();
        let names: Vec<String> = started
            .gateway
            .registry()
            .list()
            .iter()
            .map(|t| t.qualified_name.clone())
            .collect();
        assert_eq!(names, vec!["pets.getuser"]);
    }
}

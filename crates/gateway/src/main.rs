use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use toolmount_gateway::bootstrap;
use toolmount_gateway::config::GatewayConfig;
use toolmount_gateway::session::{CloseReason, SessionManager};
use toolmount_gateway::transport::{self, TransportOptions};
use toolmount_openapi_tools::loader::OpenApiSpecLoader;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Serve many OpenAPI-described HTTP APIs as one namespaced MCP tool catalog.
#[derive(Debug, Parser)]
#[command(name = "toolmount-gateway", version, about)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, env = "TOOLMOUNT_CONFIG")]
    config: PathBuf,

    /// Listen address; overrides `bind` from the config file.
    #[arg(long, env = "TOOLMOUNT_BIND")]
    bind: Option<String>,

    /// Default log filter when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let mut cfg = GatewayConfig::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
        cfg.validate().context("--bind")?;
    }

    let loader = OpenApiSpecLoader::default();
    let started = bootstrap::start(&cfg, &loader).await.context("bootstrap")?;

    let shutdown = CancellationToken::new();
    let reaper = cfg
        .idle_timeout()
        .map(|_| started.sessions.spawn_reaper(cfg.reap_interval(), shutdown.clone()));

    let listener = TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    tracing::info!(
        bind = %listener.local_addr().context("local addr")?,
        tools = started.gateway.registry().len(),
        namespaces = ?started.gateway.registry().namespaces(),
        failed = started.report.failed.len(),
        "toolmount gateway listening"
    );

    tokio::spawn(wait_for_shutdown(started.sessions.clone(), shutdown.clone()));

    let router = transport::router(
        started.gateway.clone(),
        TransportOptions {
            json_response: cfg.transport.json_response,
        },
    );
    transport::serve(listener, router, shutdown.clone())
        .await
        .context("serve")?;

    shutdown.cancel();
    if let Some(reaper) = reaper {
        reaper.await.context("join session reaper")?;
    }
    tracing::info!("toolmount gateway stopped");
    Ok(())
}

/// On Ctrl-C or SIGTERM: close every session (cancelling in-flight calls) and stop serving.
async fn wait_for_shutdown(sessions: Arc<SessionManager>, shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
        () = shutdown.cancelled() => return,
    }

    tracing::info!("shutdown requested");
    sessions.close_all(CloseReason::Shutdown);
    shutdown.cancel();
}

//! Helpers for tests that run the gateway binary as a child process.

use anyhow::Context as _;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Kills the wrapped process when dropped, so a failing test never leaks a server.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// An ephemeral localhost port that was free a moment ago (not reserved).
///
/// # Errors
///
/// Returns an error if no ephemeral port can be bound.
pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Poll `url` until it answers with a 2xx status.
///
/// # Errors
///
/// Returns an error if `timeout` elapses first.
pub async fn wait_http_ok(url: &str, timeout: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(resp) = client.get(url).send().await
            && resp.status().is_success()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("timed out waiting for {url}")
}

/// A running `toolmount-gateway` process bound to a free localhost port.
pub struct GatewayProcess {
    pub base_url: String,
    _child: KillOnDrop,
}

impl GatewayProcess {
    /// Start `bin --config <config> --bind 127.0.0.1:<port>` and wait for `/health`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started or never becomes healthy.
    pub async fn spawn(bin: &Path, config: &Path) -> anyhow::Result<Self> {
        let port = pick_unused_port()?;
        let child = Command::new(bin)
            .arg("--config")
            .arg(config)
            .arg("--bind")
            .arg(format!("127.0.0.1:{port}"))
            .arg("--log-level")
            .arg("warn")
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn {}", bin.display()))?;
        let child = KillOnDrop(child);

        let base_url = format!("http://127.0.0.1:{port}");
        wait_http_ok(&format!("{base_url}/health"), Duration::from_secs(15)).await?;
        Ok(Self {
            base_url,
            _child: child,
        })
    }

    #[must_use]
    pub fn mcp_url(&self) -> String {
        format!("{}/mcp", self.base_url)
    }
}

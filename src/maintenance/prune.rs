//! Docker cache pruning between conversions.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::farm::MaintenanceHook;

/// Runs `docker system prune -f` to reclaim space left by task builds.
#[derive(Debug, Clone)]
pub struct DockerPrune {
    docker_bin: String,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl Default for DockerPrune {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            extra_args: Vec::new(),
            timeout: Duration::from_secs(600),
        }
    }
}

impl DockerPrune {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_docker_bin(mut self, bin: impl Into<String>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    /// Extra arguments, e.g. `--volumes` or `--filter until=24h`.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["system".to_string(), "prune".to_string(), "-f".to_string()];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl MaintenanceHook for DockerPrune {
    fn name(&self) -> &str {
        "docker-prune"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("docker prune timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", self.docker_bin, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "docker prune exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().find(|l| l.starts_with("Total reclaimed space")) {
            Some(line) => info!(summary = %line.trim(), "Docker prune complete"),
            None => debug!("Docker prune complete"),
        }
        Ok(())
    }
}

//! Runner seam: execute one task under one reference agent.
//!
//! Per-run timeouts belong to the runner. [`HarborRunner`] shells out to the
//! `harbor` CLI with a dedicated jobs directory per run and reads the reward
//! back from the `result.json` the run leaves behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::ReferenceAgent;
use crate::error::ValidateError;

/// Result of one agent run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentRun {
    pub exit_code: i32,
    /// `None` when the run produced no readable reward.
    pub reward: Option<f64>,
}

/// Executes a task under a reference agent.
#[async_trait]
pub trait ValidationRunner: Send + Sync {
    /// Run the task at `task_dir` (inside `dataset`) under `agent`.
    ///
    /// `keep_image` asks the runner to leave the built environment in place
    /// because another agent will run the same task next.
    async fn run_agent(
        &self,
        dataset: &Path,
        task_dir: &Path,
        agent: ReferenceAgent,
        keep_image: bool,
    ) -> Result<AgentRun, ValidateError>;
}

/// Configuration for [`HarborRunner`].
#[derive(Debug, Clone)]
pub struct HarborRunnerConfig {
    pub harbor_bin: String,
    pub jobs_dir: PathBuf,
    pub timeout_multiplier: Option<f64>,
    /// Execution environment (`docker`, `daytona`, `modal`, ...).
    pub environment: String,
}

impl Default for HarborRunnerConfig {
    fn default() -> Self {
        Self {
            harbor_bin: "harbor".to_string(),
            jobs_dir: PathBuf::from(".state/harbor-jobs"),
            timeout_multiplier: None,
            environment: "docker".to_string(),
        }
    }
}

impl HarborRunnerConfig {
    pub fn with_harbor_bin(mut self, bin: impl Into<String>) -> Self {
        self.harbor_bin = bin.into();
        self
    }

    pub fn with_jobs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.jobs_dir = dir.into();
        self
    }

    pub fn with_timeout_multiplier(mut self, multiplier: Option<f64>) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

/// Runs validations through the `harbor` CLI.
pub struct HarborRunner {
    config: HarborRunnerConfig,
}

impl HarborRunner {
    pub fn new(config: HarborRunnerConfig) -> Self {
        Self { config }
    }

    fn job_dir(&self, task_id: &str, agent: ReferenceAgent) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        self.config
            .jobs_dir
            .join(format!("{}-{}-{}", task_id, agent.name(), stamp))
    }
}

#[async_trait]
impl ValidationRunner for HarborRunner {
    async fn run_agent(
        &self,
        dataset: &Path,
        task_dir: &Path,
        agent: ReferenceAgent,
        keep_image: bool,
    ) -> Result<AgentRun, ValidateError> {
        let task_id = super::task_id_of(task_dir);
        let job_dir = self.job_dir(&task_id, agent);
        tokio::fs::create_dir_all(&job_dir).await?;

        let mut cmd = Command::new(&self.config.harbor_bin);
        cmd.arg("run")
            .arg("--path")
            .arg(dataset)
            .arg("--task-name")
            .arg(&task_id)
            .arg("--agent")
            .arg(agent.name())
            .arg("--jobs-dir")
            .arg(&job_dir)
            .arg("--env")
            .arg(&self.config.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(multiplier) = self.config.timeout_multiplier {
            cmd.arg("--timeout-multiplier").arg(multiplier.to_string());
        }
        if !keep_image {
            cmd.arg("--delete");
        }

        debug!(task_id = %task_id, agent = %agent, job_dir = %job_dir.display(), "Starting harbor run");
        let output = cmd
            .spawn()
            .map_err(|e| ValidateError::Runner {
                agent: agent.name().to_string(),
                message: format!("Failed to spawn {}: {}", self.config.harbor_bin, e),
            })?
            .wait_with_output()
            .await?;

        let exit_code = output.status.code().unwrap_or(-1);
        let reward = find_reward(&job_dir);
        info!(task_id = %task_id, agent = %agent, exit_code = exit_code, reward = ?reward, "Harbor run finished");

        if reward.is_none() && !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output")
                .trim()
                .to_string();
            return Err(ValidateError::Runner {
                agent: agent.name().to_string(),
                message: format!("exit code {}: {}", exit_code, message),
            });
        }

        Ok(AgentRun { exit_code, reward })
    }
}

/// Reward from the first `result.json` under `job_dir` that carries one.
pub fn find_reward(job_dir: &Path) -> Option<f64> {
    let mut results: Vec<PathBuf> = WalkDir::new(job_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == "result.json")
        .map(|e| e.into_path())
        .collect();
    // Deepest first: trial results sit below the job summary.
    results.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    results.iter().find_map(|path| {
        let content = std::fs::read_to_string(path).ok()?;
        let value: Value = serde_json::from_str(&content).ok()?;
        reward_in(&value)
    })
}

/// Depth-first search for a numeric `reward` field.
fn reward_in(value: &Value) -> Option<f64> {
    match value {
        Value::Object(map) => {
            if let Some(reward) = map.get("reward").and_then(Value::as_f64) {
                return Some(reward);
            }
            map.values().find_map(reward_in)
        }
        Value::Array(items) => items.iter().find_map(reward_in),
        _ => None,
    }
}

//! Artifact validation against the reference agents.
//!
//! A task passes when the no-op agent scores 0 (the tests really fail
//! without a fix) and the oracle agent scores 1 (the reference solution
//! makes them pass). This module holds the shared result types and the
//! single/batch path resolution; `engine` runs validations concurrently and
//! `runner` talks to the execution harness.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::ValidateError;
use crate::farm::{classify_failure, FailureCategory};

pub mod engine;
pub mod network;
pub mod runner;

pub use engine::{
    validate_single, BatchConfig, BatchReport, BatchValidationEngine, SingleReport,
};
pub use network::NetworkIsolation;
pub use runner::{AgentRun, HarborRunner, HarborRunnerConfig, ValidationRunner};

/// Which reference agents to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Both,
    Nop,
    Oracle,
}

impl AgentMode {
    pub fn runs_nop(&self) -> bool {
        matches!(self, Self::Both | Self::Nop)
    }

    pub fn runs_oracle(&self) -> bool {
        matches!(self, Self::Both | Self::Oracle)
    }

    /// Agents to run, in order.
    pub fn agents(&self) -> Vec<ReferenceAgent> {
        let mut agents = Vec::with_capacity(2);
        if self.runs_nop() {
            agents.push(ReferenceAgent::Nop);
        }
        if self.runs_oracle() {
            agents.push(ReferenceAgent::Oracle);
        }
        agents
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Both => write!(f, "both"),
            Self::Nop => write!(f, "nop"),
            Self::Oracle => write!(f, "oracle"),
        }
    }
}

impl FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "both" => Ok(Self::Both),
            "nop" | "nop-only" => Ok(Self::Nop),
            "oracle" | "oracle-only" => Ok(Self::Oracle),
            other => Err(format!(
                "Unknown agent mode '{}': expected both, nop or oracle",
                other
            )),
        }
    }
}

/// A fixed strategy used to check an artifact's pass/fail wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceAgent {
    /// Does nothing. Expected reward 0.
    Nop,
    /// Applies the reference solution. Expected reward 1.
    Oracle,
}

impl ReferenceAgent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Oracle => "oracle",
        }
    }

    pub fn expected_reward(&self) -> f64 {
        match self {
            Self::Nop => 0.0,
            Self::Oracle => 1.0,
        }
    }
}

impl fmt::Display for ReferenceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of validating one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub task_id: String,
    pub nop_reward: Option<f64>,
    pub oracle_reward: Option<f64>,
    pub nop_exit_code: i32,
    pub oracle_exit_code: i32,
    pub passed: bool,
    /// Set when the validation itself broke, as opposed to failing.
    pub error: Option<String>,
    pub error_category: Option<FailureCategory>,
}

impl ValidationResult {
    /// Result from completed agent runs.
    pub fn completed(
        task_id: impl Into<String>,
        mode: AgentMode,
        nop: Option<&runner::AgentRun>,
        oracle: Option<&runner::AgentRun>,
    ) -> Self {
        let nop_reward = nop.and_then(|r| r.reward);
        let oracle_reward = oracle.and_then(|r| r.reward);
        Self {
            task_id: task_id.into(),
            nop_reward,
            oracle_reward,
            nop_exit_code: nop.map(|r| r.exit_code).unwrap_or(0),
            oracle_exit_code: oracle.map(|r| r.exit_code).unwrap_or(0),
            passed: check_passed(mode, nop_reward, oracle_reward),
            error: None,
            error_category: None,
        }
    }

    /// Result for a validation that could not run to completion.
    pub fn errored(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        let category = classify_failure(&error).category;
        Self {
            task_id: task_id.into(),
            nop_reward: None,
            oracle_reward: None,
            nop_exit_code: -1,
            oracle_exit_code: -1,
            passed: false,
            error: Some(error.replace(['\r', '\n'], " ")),
            error_category: Some(category),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Why a completed result failed, e.g. `NOP expected 0, got 1.0`.
    pub fn failure_notes(&self, mode: AgentMode) -> Vec<String> {
        let mut notes = Vec::new();
        if mode.runs_nop() {
            if let Some(reward) = self.nop_reward {
                if reward != 0.0 {
                    notes.push(format!("NOP expected 0, got {:?}", reward));
                }
            }
        }
        if mode.runs_oracle() {
            if let Some(reward) = self.oracle_reward {
                if reward != 1.0 {
                    notes.push(format!("Oracle expected 1, got {:?}", reward));
                }
            }
        }
        notes
    }
}

/// Whether rewards meet the expectations for `mode`.
///
/// A missing reward never passes.
pub fn check_passed(mode: AgentMode, nop_reward: Option<f64>, oracle_reward: Option<f64>) -> bool {
    let nop_ok = nop_reward == Some(ReferenceAgent::Nop.expected_reward());
    let oracle_ok = oracle_reward == Some(ReferenceAgent::Oracle.expected_reward());
    match mode {
        AgentMode::Both => nop_ok && oracle_ok,
        AgentMode::Nop => nop_ok,
        AgentMode::Oracle => oracle_ok,
    }
}

/// Format one result as an output-file line:
/// `<task_id>: NOP=<reward|ERROR> ORACLE=<reward|ERROR> <PASS|FAIL|ERROR: msg>`.
pub fn format_result_line(result: &ValidationResult, mode: AgentMode) -> String {
    let mut parts = vec![format!("{}:", result.task_id)];
    if mode.runs_nop() {
        parts.push(match result.nop_reward {
            Some(reward) => format!("NOP={:?}", reward),
            None => "NOP=ERROR".to_string(),
        });
    }
    if mode.runs_oracle() {
        parts.push(match result.oracle_reward {
            Some(reward) => format!("ORACLE={:?}", reward),
            None => "ORACLE=ERROR".to_string(),
        });
    }
    parts.push(match (&result.error, result.passed) {
        (Some(error), _) => format!("ERROR: {}", error),
        (None, true) => "PASS".to_string(),
        (None, false) => "FAIL".to_string(),
    });
    parts.join(" ")
}

/// Whether `dir` looks like a task: it has `tests/test.sh`.
pub fn is_task_dir(dir: &Path) -> bool {
    dir.join("tests").join("test.sh").is_file()
}

/// Task directories directly under `dataset`, sorted by name.
pub fn discover_tasks(dataset: &Path) -> Vec<PathBuf> {
    let mut tasks: Vec<PathBuf> = WalkDir::new(dataset)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir() && is_task_dir(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    tasks.sort();
    tasks
}

/// How a `validate` invocation was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateTarget {
    /// One task inside `dataset`.
    Single {
        dataset: PathBuf,
        task_id: String,
        task_dir: PathBuf,
    },
    /// Every task under `dataset`.
    Batch { dataset: PathBuf, tasks: Vec<PathBuf> },
}

/// Decide between single and batch mode.
///
/// An explicit `task` or a path containing `tests/test.sh` selects single
/// mode; a directory containing task directories selects batch mode.
pub fn resolve_target(path: &Path, task: Option<&str>) -> Result<ValidateTarget, ValidateError> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    if let Some(task_id) = task {
        return Ok(ValidateTarget::Single {
            task_dir: path.join(task_id),
            dataset: path,
            task_id: task_id.to_string(),
        });
    }

    if path.is_dir() && is_task_dir(&path) {
        let task_id = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ValidateError::InvalidPath(path.clone()))?;
        let dataset = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ValidateError::InvalidPath(path.clone()))?;
        return Ok(ValidateTarget::Single {
            dataset,
            task_id,
            task_dir: path,
        });
    }

    if path.is_dir() {
        let tasks = discover_tasks(&path);
        if tasks.is_empty() {
            return Err(ValidateError::NoTasks(path));
        }
        return Ok(ValidateTarget::Batch {
            dataset: path,
            tasks,
        });
    }

    Err(ValidateError::InvalidPath(path))
}

/// Task id of a task directory: its final path component.
pub fn task_id_of(task_dir: &Path) -> String {
    task_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| task_dir.display().to_string())
}

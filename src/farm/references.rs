//! Append-only ledger of produced tasks.
//!
//! Each successful conversion appends one JSON line mapping
//! `(repo, pr_number)` to the task id it produced. Every record is written as
//! a single complete line, so a reader opening the file while the farm is
//! running sees whole records and at worst one truncated trailing line,
//! which it skips.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StateError;

/// File name of the ledger inside the state directory.
pub const REFERENCE_LEDGER_FILE: &str = "task_references.jsonl";

/// One produced task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReference {
    pub repo: String,
    pub pr_number: u64,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
}

/// JSONL-backed task reference store.
#[derive(Debug, Clone)]
pub struct TaskReferenceStore {
    path: PathBuf,
}

impl TaskReferenceStore {
    /// Open the ledger at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger inside a state directory.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(REFERENCE_LEDGER_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a reference for a produced task.
    pub fn save(&self, repo: &str, pr_number: u64, task_id: &str) -> Result<TaskReference, StateError> {
        let reference = TaskReference {
            repo: repo.to_string(),
            pr_number,
            task_id: task_id.to_string(),
            created_at: Utc::now(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_string(&reference)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })?;
        // One write per record keeps lines whole for concurrent readers.
        file.write_all(line.as_bytes())?;
        file.flush()?;

        debug!(repo = repo, pr = pr_number, task_id = task_id, "Saved task reference");
        Ok(reference)
    }

    /// Task id produced for `(repo, pr_number)`, if any. Latest record wins.
    pub fn lookup(&self, repo: &str, pr_number: u64) -> Result<Option<String>, StateError> {
        Ok(self
            .read_all()?
            .into_iter()
            .rev()
            .find(|r| r.repo == repo && r.pr_number == pr_number)
            .map(|r| r.task_id))
    }

    /// Most recently recorded task for `repo`, excluding `pr_number` itself.
    ///
    /// Handed to the converter so a new task can build on an earlier one.
    pub fn latest_for_repo(
        &self,
        repo: &str,
        excluding_pr: u64,
    ) -> Result<Option<TaskReference>, StateError> {
        Ok(self
            .read_all()?
            .into_iter()
            .rev()
            .find(|r| r.repo == repo && r.pr_number != excluding_pr))
    }

    /// All well-formed records in file order.
    pub fn read_all(&self) -> Result<Vec<TaskReference>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut references = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskReference>(line) {
                Ok(reference) => references.push(reference),
                Err(e) => {
                    warn!(path = %self.path.display(), line = idx + 1, error = %e, "Skipping malformed task reference")
                }
            }
        }
        Ok(references)
    }
}

//! Continuous PR farming.
//!
//! Streams merged pull requests page by page from an upstream source,
//! converts each one into a task directory, and keeps a resumable cursor so
//! a campaign can be stopped and restarted without re-attempting work:
//! - `state` persists which PRs were attempted and the run counters
//! - `classify` maps converter error text to a failure category
//! - `references` records which task each PR produced
//! - `orchestrator` drives the fetch → filter → convert → record loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod classify;
pub mod converter;
pub mod github;
pub mod orchestrator;
pub mod references;
pub mod state;
pub mod workspace;

pub use classify::{classify_failure, ClassifiedFailure, FailureCategory};
pub use converter::{CommandConverter, CommandConverterConfig, ConversionRequest, TaskConverter};
pub use github::{CandidateSource, GitHubPullSource, GitHubSourceConfig};
pub use orchestrator::{
    FarmConfig, FarmOrchestrator, FarmSummary, MaintenanceHook, StopReason,
};
pub use references::{TaskReference, TaskReferenceStore};
pub use state::{load_skip_list, StreamState};
pub use workspace::ArtifactGuard;

/// Convert a repository name to its slug: `owner/repo` → `owner__repo`.
pub fn repo_slug(repo: &str) -> String {
    repo.replace('/', "__")
}

/// Task id for a PR: `owner__repo-<number>`.
pub fn task_id(repo: &str, pr_number: u64) -> String {
    format!("{}-{}", repo_slug(repo), pr_number)
}

/// Parse a `--resume-from` value: either `YYYY-MM-DD` or an RFC 3339 timestamp.
pub fn parse_resume_from(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
        anyhow::anyhow!(
            "Invalid resume date '{}': expected YYYY-MM-DD or RFC 3339 ({})",
            raw,
            e
        )
    })?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid resume date '{}'", raw))?;
    Ok(midnight.and_utc())
}

/// A merged pull request fetched from the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrCandidate {
    pub number: u64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub author: String,
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
    pub url: String,
    /// Issue numbers referenced with `fixes #N` style keywords in the body.
    #[serde(default)]
    pub linked_issues: Vec<u64>,
}

/// Final status of one candidate attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Success,
    Failed,
    DryRun,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Result of processing a single PR into a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub repo: String,
    pub pr_number: u64,
    pub task_id: String,
    pub status: TaskStatus,
    /// Failure category, present when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    pub message: String,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

/// Tagged outcome of one conversion attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The task directory was produced.
    Success { task_id: String },
    /// An expected, non-actionable skip (trivial PR, missing issue, ...).
    Skipped { category: FailureCategory, reason: String },
    /// An operational failure the operator should look at.
    Failed { category: FailureCategory, reason: String },
    /// Dry run: nothing was executed.
    DryRun,
}

impl Outcome {
    /// Build the outcome for a failed attempt from the raw error text.
    pub fn from_error_text(text: &str) -> Self {
        let ClassifiedFailure { category, reason } = classify_failure(text);
        if category.is_expected_skip() {
            Outcome::Skipped { category, reason }
        } else {
            Outcome::Failed { category, reason }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn category(&self) -> Option<&FailureCategory> {
        match self {
            Outcome::Skipped { category, .. } | Outcome::Failed { category, .. } => Some(category),
            _ => None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Success { .. } => TaskStatus::Success,
            Outcome::DryRun => TaskStatus::DryRun,
            Outcome::Skipped { .. } | Outcome::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_slug_and_task_id() {
        assert_eq!(repo_slug("fastapi/fastapi"), "fastapi__fastapi");
        assert_eq!(task_id("owner/repo", 42), "owner__repo-42");
    }

    #[test]
    fn test_parse_resume_from_date() {
        let ts = parse_resume_from("2024-01-15").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-15T00:00:00+00:00");
    }

    #[test]
    fn test_parse_resume_from_rfc3339() {
        let ts = parse_resume_from("2024-01-15T10:30:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }

    #[test]
    fn test_parse_resume_from_rejects_garbage() {
        assert!(parse_resume_from("last tuesday").is_err());
    }

    #[test]
    fn test_outcome_from_error_text_splits_skips_and_failures() {
        let skipped = Outcome::from_error_text("No linked issue found");
        assert!(matches!(
            skipped,
            Outcome::Skipped {
                category: FailureCategory::MissingIssueSkip,
                ..
            }
        ));
        assert_eq!(skipped.status(), TaskStatus::Failed);

        let failed = Outcome::from_error_text("connection timed out");
        assert!(matches!(
            failed,
            Outcome::Failed {
                category: FailureCategory::TimedOut,
                ..
            }
        ));
    }

    #[test]
    fn test_task_status_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskStatus::DryRun).unwrap();
        assert_eq!(json, "\"dry-run\"");
        assert_eq!(TaskStatus::DryRun.to_string(), "dry-run");
    }
}

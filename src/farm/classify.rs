//! Failure taxonomy for converter and runner error text.
//!
//! Rules are checked in a fixed priority order and the first match wins, so a
//! message that mentions both an existing task and a timeout is reported as
//! an existing task. Matching is case-insensitive except for the `trivial`
//! marker, which is matched against the original text.

use serde::{Deserialize, Serialize};

/// Category assigned to a failed conversion or validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    TrivialSkip,
    MissingIssueSkip,
    ValidationFailed,
    AlreadyExists,
    NoTestsDetected,
    UpstreamRateLimited,
    EvaluatorQuotaExceeded,
    TimedOut,
    CommitUnavailable,
    WorkspaceCorrupted,
    Unknown,
}

impl FailureCategory {
    /// Expected skips are not actionable: the candidate was simply not a fit.
    pub fn is_expected_skip(&self) -> bool {
        matches!(
            self,
            Self::TrivialSkip | Self::MissingIssueSkip | Self::AlreadyExists | Self::NoTestsDetected
        )
    }

    /// Human-readable reason shown to the operator.
    pub fn description(&self) -> &'static str {
        match self {
            Self::TrivialSkip => "Trivial PR (skipped)",
            Self::MissingIssueSkip => "No linked issue (skipped)",
            Self::ValidationFailed => "Validation failed (NOP or Oracle)",
            Self::AlreadyExists => "Task already exists (skipped)",
            Self::NoTestsDetected => "No tests detected",
            Self::UpstreamRateLimited => "GitHub API rate limit exceeded (set GITHUB_TOKEN)",
            Self::EvaluatorQuotaExceeded => "OpenAI API quota exceeded (check billing)",
            Self::TimedOut => "Command timed out",
            Self::CommitUnavailable => "Git commit not found (may be force-pushed or deleted)",
            Self::WorkspaceCorrupted => "Git checkout failed (repo cache may be corrupted)",
            Self::Unknown => "Unknown error",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TrivialSkip => "trivial_skip",
            Self::MissingIssueSkip => "missing_issue_skip",
            Self::ValidationFailed => "validation_failed",
            Self::AlreadyExists => "already_exists",
            Self::NoTestsDetected => "no_tests_detected",
            Self::UpstreamRateLimited => "upstream_rate_limited",
            Self::EvaluatorQuotaExceeded => "evaluator_quota_exceeded",
            Self::TimedOut => "timed_out",
            Self::CommitUnavailable => "commit_unavailable",
            Self::WorkspaceCorrupted => "workspace_corrupted",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified failure: the category plus the text reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFailure {
    pub category: FailureCategory,
    /// Category description, or the flattened original text for `Unknown`.
    pub reason: String,
}

/// Classify free-form error output. Total: every input yields one category.
pub fn classify_failure(text: &str) -> ClassifiedFailure {
    let category = categorize(text);
    let reason = match category {
        FailureCategory::Unknown => flatten(text),
        known => known.description().to_string(),
    };
    ClassifiedFailure { category, reason }
}

fn categorize(text: &str) -> FailureCategory {
    let lowered = text.to_lowercase();
    let has = |needle: &str| lowered.contains(needle);

    // Case-sensitive, unlike every other marker.
    if text.contains("trivial") {
        return FailureCategory::TrivialSkip;
    }
    if has("no linked issue") || has("missingissueerror") {
        return FailureCategory::MissingIssueSkip;
    }
    if has("validation failed") || has("harbor validation") {
        return FailureCategory::ValidationFailed;
    }
    if has("already exists") || has("file exists") {
        return FailureCategory::AlreadyExists;
    }
    if has("no test") {
        return FailureCategory::NoTestsDetected;
    }
    if has("rate limit exceeded") && has("github") {
        return FailureCategory::UpstreamRateLimited;
    }
    if has("insufficient_quota") || has("exceeded your current quota") {
        return FailureCategory::EvaluatorQuotaExceeded;
    }
    if has("timed out") || has("timeout") {
        return FailureCategory::TimedOut;
    }
    if has("cannot checkout commit") || has("commit not found") || has("force-pushed or deleted")
    {
        return FailureCategory::CommitUnavailable;
    }
    if has("git checkout") {
        return FailureCategory::WorkspaceCorrupted;
    }
    FailureCategory::Unknown
}

fn flatten(text: &str) -> String {
    if text.is_empty() {
        return FailureCategory::Unknown.description().to_string();
    }
    text.replace(['\r', '\n'], " ")
}

//! Error types for swe-farm operations.
//!
//! Defines error types for the major subsystems:
//! - Stream state and ledger persistence
//! - The upstream pull-request source
//! - Task conversion
//! - The farm run loop
//! - Artifact validation

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while persisting farm state or ledgers.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to write state file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by a candidate source while fetching a page.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("GitHub API rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("GitHub API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Failed to parse GitHub API response: {0}")]
    ParseError(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::RequestFailed(err.to_string())
    }
}

/// Errors returned by a task converter for a single candidate.
///
/// The display text of these errors is what the failure classifier sees.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{0}")]
    Failed(String),

    #[error("Command timed out after {seconds}s")]
    TimedOut { seconds: u64 },

    #[error("Failed to launch converter: {0}")]
    Launch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal errors that stop a farm run.
#[derive(Debug, Error)]
pub enum FarmError {
    #[error("Failed to fetch page {page}: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: SourceError,
    },

    #[error("Rate limited on page {page} after {attempts} retries")]
    RateLimitExhausted { page: u32, attempts: u32 },

    #[error("Failed to persist stream state: {0}")]
    State(#[from] StateError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors that can occur during artifact validation.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("No tasks found in directory: {0}\nExpected directories with tests/test.sh")]
    NoTasks(PathBuf),

    #[error("Path must be a task directory (containing tests/test.sh) or a dataset directory with multiple tasks: {0}")]
    InvalidPath(PathBuf),

    #[error("Runner failed for agent '{agent}': {message}")]
    Runner { agent: String, message: String },

    #[error("Failed to write results file '{path}': {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

//! Resumable stream state for PR farming.
//!
//! One state file per repository records which PRs were attempted, the
//! success/failure counters and the cursor of the last attempted PR. Loading
//! never fails: a missing, unreadable or foreign state file means "start
//! over for this repository".

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StateError;

/// State for resumable streaming PR processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    /// Repository in `owner/repo` format.
    pub repo: String,
    /// PR numbers that have been attempted.
    #[serde(default)]
    pub processed_prs: BTreeSet<u64>,
    #[serde(default)]
    pub total_fetched: u64,
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub successful: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub last_pr_number: Option<u64>,
    #[serde(default)]
    pub last_created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// PR numbers from an external skip list. Never persisted.
    #[serde(skip)]
    pub skip_list_prs: BTreeSet<u64>,
}

impl StreamState {
    /// Fresh state for a repository.
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            processed_prs: BTreeSet::new(),
            total_fetched: 0,
            total_processed: 0,
            successful: 0,
            failed: 0,
            last_pr_number: None,
            last_created_at: None,
            last_updated: None,
            skip_list_prs: BTreeSet::new(),
        }
    }

    /// Load state from `path`, or start fresh if it is missing, corrupt, or
    /// belongs to another repository.
    pub fn load(path: &Path, repo: &str) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to read stream state, starting fresh");
                }
                return Self::new(repo);
            }
        };

        match serde_json::from_str::<StreamState>(&content) {
            Ok(state) if state.repo == repo => {
                info!(
                    repo = repo,
                    processed = state.processed_prs.len(),
                    last_pr = ?state.last_pr_number,
                    "Resuming from saved stream state"
                );
                state
            }
            Ok(state) => {
                warn!(
                    path = %path.display(),
                    expected = repo,
                    found = %state.repo,
                    "Stream state belongs to another repository, starting fresh"
                );
                Self::new(repo)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt stream state, starting fresh");
                Self::new(repo)
            }
        }
    }

    /// Record one attempted PR.
    ///
    /// Does not de-duplicate: callers check [`StreamState::should_skip`] first.
    pub fn mark_processed(&mut self, pr_number: u64, created_at: DateTime<Utc>, success: bool) {
        self.processed_prs.insert(pr_number);
        self.total_processed += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.last_pr_number = Some(pr_number);
        self.last_created_at = Some(match self.last_created_at {
            Some(previous) if previous > created_at => previous,
            _ => created_at,
        });
        self.last_updated = Some(Utc::now());
    }

    /// Whether a PR was already attempted or is on the skip list.
    pub fn should_skip(&self, pr_number: u64) -> bool {
        self.processed_prs.contains(&pr_number) || self.skip_list_prs.contains(&pr_number)
    }

    /// Whether a PR is on the external skip list.
    pub fn is_skip_listed(&self, pr_number: u64) -> bool {
        self.skip_list_prs.contains(&pr_number)
    }

    /// Count PRs returned by the source.
    pub fn record_fetched(&mut self, count: usize) {
        self.total_fetched += count as u64;
        self.last_updated = Some(Utc::now());
    }

    /// Forget every attempted PR and counter. The skip list is kept.
    pub fn reset(&mut self) {
        let skip_list = std::mem::take(&mut self.skip_list_prs);
        *self = Self::new(self.repo.clone());
        self.skip_list_prs = skip_list;
        self.last_updated = Some(Utc::now());
    }

    /// Write the state as pretty JSON, creating parent directories.
    ///
    /// The file is replaced atomically so a crash mid-write leaves the
    /// previous state intact.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|source| StateError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        let json = serde_json::to_string_pretty(self)?;
        let write_err = |source| StateError::Write {
            path: path.to_path_buf(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;

        debug!(path = %path.display(), processed = self.total_processed, "Saved stream state");
        Ok(())
    }
}

/// Load PR numbers to skip for `repo` from a skip-list file.
///
/// One entry per line, either a task id (`owner__repo-123`) or a bare PR
/// number. Blank lines, `#` comments and task ids of other repositories are
/// ignored. A missing file is an error: the operator asked for it.
pub fn load_skip_list(path: &Path, repo: &str) -> Result<BTreeSet<u64>, StateError> {
    let content = fs::read_to_string(path).map_err(|source| StateError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let task_id_re = Regex::new(r"^(?P<slug>.+)-(?P<pr>\d+)$").map_err(|e| {
        StateError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })?;
    let slug = super::repo_slug(repo);

    let mut skip = BTreeSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Ok(pr) = line.parse::<u64>() {
            skip.insert(pr);
            continue;
        }
        match task_id_re.captures(line) {
            Some(caps) if &caps["slug"] == slug => {
                if let Ok(pr) = caps["pr"].parse::<u64>() {
                    skip.insert(pr);
                }
            }
            Some(_) => {}
            None => debug!(line = line, "Ignoring unrecognised skip-list entry"),
        }
    }

    info!(
        skip_count = skip.len(),
        path = %path.display(),
        "Loaded PRs to skip from file"
    );
    Ok(skip)
}

//! The farm run loop.
//!
//! A run walks the candidate stream page by page and, for each PR, goes
//! through filtering, conversion and recording before moving on:
//!
//! 1. **Fetching**: pull the next page. Rate limits back off and retry the
//!    same page; any other fetch error ends the run.
//! 2. **Filtering**: drop PRs that are skip-listed, already attempted,
//!    already recorded in the reference ledger, older than `resume_from`, or
//!    too small to ever pass the converter's size check.
//! 3. **Converting**: run the converter under a per-item timeout, holding an
//!    [`ArtifactGuard`] so a failed attempt leaves no partial task behind.
//! 4. **Recording**: mark the PR processed, persist state, append the
//!    outcome, then wait `task_delay` and run maintenance every N attempts.
//!
//! Items are handled strictly one at a time in fetch order. A stop request
//! is honored between items, never in the middle of a conversion.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::converter::{ConversionRequest, TaskConverter};
use super::github::CandidateSource;
use super::references::TaskReferenceStore;
use super::state::StreamState;
use super::workspace::ArtifactGuard;
use super::{repo_slug, task_id, FailureCategory, Outcome, PrCandidate, TaskResult};
use crate::error::{ConvertError, FarmError, SourceError, StateError};
use crate::shutdown::ShutdownSignal;

/// Longest single wait while backing off a rate limit.
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Message recorded when the converter reports success without output.
const MISSING_TASK_DIR: &str = "Pipeline reported success but task directory was not created.";

/// Periodic housekeeping run between conversions.
#[async_trait]
pub trait MaintenanceHook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// Configuration for a farm run.
#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// Repository in `owner/repo` format.
    pub repo: String,
    /// Root directory tasks are written under.
    pub output_root: PathBuf,
    /// Directory for stream state, ledgers and outcome logs.
    pub state_dir: PathBuf,
    /// Re-attempt PRs that were already processed or recorded.
    pub force: bool,
    /// Hard limit for one conversion.
    pub item_timeout: Duration,
    /// Forwarded to the converter for its agent session.
    pub cc_timeout: Duration,
    /// Pause after each attempted PR.
    pub task_delay: Duration,
    /// Clear the stream state before starting.
    pub reset: bool,
    /// Ignore PRs created before this instant.
    pub resume_from: Option<DateTime<Utc>>,
    pub dry_run: bool,
    /// Run the maintenance hook every this many attempts. 0 disables it.
    pub maintenance_batch: usize,
    /// PR numbers never to attempt.
    pub skip_list: BTreeSet<u64>,
    pub min_files: usize,
    pub max_files: usize,
    /// Only accept PRs with a linked issue.
    pub issue_only: bool,
    pub max_rate_limit_retries: u32,
    /// First backoff when a rate limit carries no retry hint. Doubles per retry.
    pub rate_limit_backoff: Duration,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            repo: String::new(),
            output_root: PathBuf::from("tasks"),
            state_dir: PathBuf::from(".state"),
            force: false,
            item_timeout: Duration::from_secs(3600),
            cc_timeout: Duration::from_secs(3200),
            task_delay: Duration::from_secs(60),
            reset: false,
            resume_from: None,
            dry_run: false,
            maintenance_batch: 5,
            skip_list: BTreeSet::new(),
            min_files: 3,
            max_files: 10,
            issue_only: true,
            max_rate_limit_retries: 5,
            rate_limit_backoff: Duration::from_secs(60),
        }
    }
}

impl FarmConfig {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            ..Default::default()
        }
    }

    pub fn with_output_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_root = dir.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_cc_timeout(mut self, timeout: Duration) -> Self {
        self.cc_timeout = timeout;
        self
    }

    pub fn with_task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = delay;
        self
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    pub fn with_resume_from(mut self, resume_from: Option<DateTime<Utc>>) -> Self {
        self.resume_from = resume_from;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_maintenance_batch(mut self, batch: usize) -> Self {
        self.maintenance_batch = batch;
        self
    }

    pub fn with_skip_list(mut self, skip_list: BTreeSet<u64>) -> Self {
        self.skip_list = skip_list;
        self
    }

    pub fn with_file_bounds(mut self, min_files: usize, max_files: usize) -> Self {
        self.min_files = min_files;
        self.max_files = max_files;
        self
    }

    pub fn with_issue_only(mut self, issue_only: bool) -> Self {
        self.issue_only = issue_only;
        self
    }

    pub fn with_rate_limit_policy(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_rate_limit_retries = max_retries;
        self.rate_limit_backoff = backoff;
        self
    }

    /// `<state_dir>/farm/<slug>.state.json`
    pub fn state_path(&self) -> PathBuf {
        self.farm_dir()
            .join(format!("{}.state.json", repo_slug(&self.repo)))
    }

    /// `<state_dir>/farm/<slug>.results.jsonl`
    pub fn results_path(&self) -> PathBuf {
        self.farm_dir()
            .join(format!("{}.results.jsonl", repo_slug(&self.repo)))
    }

    fn farm_dir(&self) -> PathBuf {
        self.state_dir.join("farm")
    }

    fn validate(&self) -> Result<(), FarmError> {
        if self.repo.trim().is_empty() {
            return Err(FarmError::InvalidConfig("repository is required".to_string()));
        }
        if self.item_timeout.is_zero() {
            return Err(FarmError::InvalidConfig(
                "per-item timeout must be positive".to_string(),
            ));
        }
        if self.max_files < self.min_files {
            return Err(FarmError::InvalidConfig(format!(
                "max files ({}) is below min files ({})",
                self.max_files, self.min_files
            )));
        }
        Ok(())
    }
}

/// Why a run ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The source has no more pages.
    Drained,
    /// A stop was requested.
    Stopped,
}

/// Counters and outcomes of one run.
#[derive(Debug, Clone)]
pub struct FarmSummary {
    pub repo: String,
    /// Conversions attempted in this run (dry runs excluded).
    pub attempted: u64,
    pub succeeded: u64,
    /// Expected skips. Counted in the state's `failed` counter.
    pub skipped: u64,
    /// Operational failures.
    pub failed: u64,
    pub dry_run: u64,
    /// Candidates dropped before conversion.
    pub filtered: u64,
    pub skipped_by_category: BTreeMap<FailureCategory, u64>,
    pub failures_by_category: BTreeMap<FailureCategory, u64>,
    pub results: Vec<TaskResult>,
    pub stop_reason: StopReason,
    /// Stream state as of the end of the run.
    pub final_state: StreamState,
}

impl FarmSummary {
    fn new(state: &StreamState) -> Self {
        Self {
            repo: state.repo.clone(),
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            dry_run: 0,
            filtered: 0,
            skipped_by_category: BTreeMap::new(),
            failures_by_category: BTreeMap::new(),
            results: Vec::new(),
            stop_reason: StopReason::Drained,
            final_state: state.clone(),
        }
    }

    fn record(&mut self, outcome: &Outcome, result: TaskResult) {
        match outcome {
            Outcome::Success { .. } => {
                self.attempted += 1;
                self.succeeded += 1;
            }
            Outcome::Skipped { category, .. } => {
                self.attempted += 1;
                self.skipped += 1;
                *self.skipped_by_category.entry(*category).or_insert(0) += 1;
            }
            Outcome::Failed { category, .. } => {
                self.attempted += 1;
                self.failed += 1;
                *self.failures_by_category.entry(*category).or_insert(0) += 1;
            }
            Outcome::DryRun => self.dry_run += 1,
        }
        self.results.push(result);
    }

    /// `1` if any attempt ended in an operational failure.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

enum Fetched<T> {
    Ready(T),
    Stopped,
}

/// Drives a farm run over one repository.
pub struct FarmOrchestrator {
    source: Arc<dyn CandidateSource>,
    converter: Arc<dyn TaskConverter>,
    maintenance: Option<Arc<dyn MaintenanceHook>>,
    config: FarmConfig,
}

impl FarmOrchestrator {
    pub fn new(
        source: Arc<dyn CandidateSource>,
        converter: Arc<dyn TaskConverter>,
        maintenance: Option<Arc<dyn MaintenanceHook>>,
        config: FarmConfig,
    ) -> Self {
        Self {
            source,
            converter,
            maintenance,
            config,
        }
    }

    pub fn config(&self) -> &FarmConfig {
        &self.config
    }

    /// Run until the source is drained or `stop` fires.
    ///
    /// Per-candidate failures are recorded and never returned. Errors are
    /// reserved for fetch failures and state that cannot be persisted.
    pub async fn run(&self, stop: &ShutdownSignal) -> Result<FarmSummary, FarmError> {
        self.config.validate()?;
        let config = &self.config;
        let state_path = config.state_path();

        let mut state = StreamState::load(&state_path, &config.repo);
        state.skip_list_prs = config.skip_list.clone();
        if config.reset {
            info!(repo = %config.repo, "Resetting stream state");
            state.reset();
            if !config.dry_run {
                state.save(&state_path)?;
            }
        }

        let references = TaskReferenceStore::in_state_dir(&config.state_dir);
        let mut recorded = self.recorded_prs(&references);
        let mut summary = FarmSummary::new(&state);

        info!(
            repo = %config.repo,
            processed = state.processed_prs.len(),
            skip_list = state.skip_list_prs.len(),
            dry_run = config.dry_run,
            force = config.force,
            "Starting farm run"
        );

        let mut page = 1u32;
        'pages: loop {
            if stop.is_triggered() {
                summary.stop_reason = StopReason::Stopped;
                break;
            }

            let fetched = self
                .with_rate_limit_retry(page, stop, || self.source.fetch_page(page))
                .await?;
            let candidates = match fetched {
                Fetched::Ready(Some(candidates)) => candidates,
                Fetched::Ready(None) => {
                    info!(repo = %config.repo, page = page, "No more pull requests");
                    break;
                }
                Fetched::Stopped => {
                    summary.stop_reason = StopReason::Stopped;
                    break;
                }
            };
            debug!(page = page, count = candidates.len(), "Fetched page");
            state.record_fetched(candidates.len());

            for candidate in candidates {
                if stop.is_triggered() {
                    summary.stop_reason = StopReason::Stopped;
                    break 'pages;
                }

                if let Some(reason) = self.filter_reason(&state, &recorded, &candidate) {
                    debug!(pr = candidate.number, reason = reason, "Skipping candidate");
                    summary.filtered += 1;
                    continue;
                }

                let fetched = self
                    .with_rate_limit_retry(page, stop, || self.source.enrich(candidate.clone()))
                    .await?;
                let candidate = match fetched {
                    Fetched::Ready(candidate) => candidate,
                    Fetched::Stopped => {
                        summary.stop_reason = StopReason::Stopped;
                        break 'pages;
                    }
                };
                // files_changed counts tests too, so only the lower bound is
                // decidable here; the converter applies the real bounds.
                if candidate.files_changed < config.min_files {
                    debug!(
                        pr = candidate.number,
                        files = candidate.files_changed,
                        min = config.min_files,
                        "Skipping candidate: too few files changed"
                    );
                    summary.filtered += 1;
                    continue;
                }

                let id = task_id(&config.repo, candidate.number);
                if config.dry_run {
                    info!(pr = candidate.number, task_id = %id, "Would generate task for PR #{} -> {}", candidate.number, id);
                    let result = TaskResult {
                        repo: config.repo.clone(),
                        pr_number: candidate.number,
                        task_id: id,
                        status: Outcome::DryRun.status(),
                        category: None,
                        message: "Dry run".to_string(),
                        duration_seconds: 0.0,
                        timestamp: Utc::now(),
                    };
                    summary.record(&Outcome::DryRun, result);
                    continue;
                }

                info!(
                    pr = candidate.number,
                    title = %candidate.title,
                    n = summary.attempted + 1,
                    "Processing PR"
                );
                let (outcome, message, elapsed) =
                    self.attempt(&candidate, &id, &references).await;

                if let Outcome::Success { task_id } = &outcome {
                    match references.save(&config.repo, candidate.number, task_id) {
                        Ok(_) => {
                            recorded.insert(candidate.number);
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Failed to save task reference")
                        }
                    }
                }
                state.mark_processed(candidate.number, candidate.created_at, outcome.is_success());
                state.save(&state_path)?;

                let result = TaskResult {
                    repo: config.repo.clone(),
                    pr_number: candidate.number,
                    task_id: id,
                    status: outcome.status(),
                    category: outcome.category().copied(),
                    message,
                    duration_seconds: elapsed.as_secs_f64(),
                    timestamp: Utc::now(),
                };
                if let Err(e) = append_result(&config.results_path(), &result) {
                    warn!(error = %e, "Failed to append task result");
                }
                log_outcome(&outcome, &result);
                summary.record(&outcome, result);

                self.maybe_run_maintenance(summary.attempted).await;

                if !config.task_delay.is_zero() {
                    debug!(delay_secs = config.task_delay.as_secs(), "Waiting before next PR");
                    if !stop.sleep(config.task_delay).await {
                        summary.stop_reason = StopReason::Stopped;
                        break 'pages;
                    }
                }
            }

            page += 1;
        }

        if !config.dry_run {
            state.save(&state_path)?;
        }
        summary.final_state = state;

        info!(
            repo = %config.repo,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            filtered = summary.filtered,
            stop_reason = ?summary.stop_reason,
            "Farm run finished"
        );
        Ok(summary)
    }

    /// PRs of this repository already present in the reference ledger.
    fn recorded_prs(&self, references: &TaskReferenceStore) -> BTreeSet<u64> {
        match references.read_all() {
            Ok(all) => all
                .into_iter()
                .filter(|r| r.repo == self.config.repo)
                .map(|r| r.pr_number)
                .collect(),
            Err(e) => {
                warn!(path = %references.path().display(), error = %e, "Failed to read task references");
                BTreeSet::new()
            }
        }
    }

    fn filter_reason(
        &self,
        state: &StreamState,
        recorded: &BTreeSet<u64>,
        candidate: &PrCandidate,
    ) -> Option<&'static str> {
        let config = &self.config;
        if state.is_skip_listed(candidate.number) {
            return Some("on skip list");
        }
        if !config.force && state.should_skip(candidate.number) {
            return Some("already processed");
        }
        if !config.force && recorded.contains(&candidate.number) {
            return Some("task already recorded");
        }
        if let Some(resume_from) = config.resume_from {
            if candidate.created_at < resume_from {
                return Some("created before resume date");
            }
        }
        None
    }

    /// Run the converter for one candidate.
    ///
    /// Returns the outcome, the raw message recorded with it and the elapsed
    /// time. The artifact guard removes partial output on every path that
    /// does not commit, including a panic inside the converter.
    async fn attempt(
        &self,
        candidate: &PrCandidate,
        id: &str,
        references: &TaskReferenceStore,
    ) -> (Outcome, String, Duration) {
        let config = &self.config;
        let start = Instant::now();
        let guard = ArtifactGuard::acquire(&config.output_root, id, config.force);

        let reference = references
            .latest_for_repo(&config.repo, candidate.number)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to look up earlier task reference");
                None
            });
        let request = ConversionRequest {
            repo: config.repo.clone(),
            candidate: candidate.clone(),
            task_id: id.to_string(),
            output_root: config.output_root.clone(),
            state_dir: config.state_dir.clone(),
            force: config.force,
            cc_timeout: config.cc_timeout,
            require_issue: config.issue_only,
            min_files: config.min_files,
            max_files: config.max_files,
            reference,
        };

        // The conversion runs on its own task so a panic in the converter
        // becomes this item's failure instead of unwinding out of the run.
        let converter = Arc::clone(&self.converter);
        let mut handle = tokio::spawn(async move { converter.convert(&request).await });
        let converted = match tokio::time::timeout(config.item_timeout, &mut handle).await {
            Ok(joined) => Ok(joined.unwrap_or_else(|e| Err(ConvertError::Failed(panic_text(e))))),
            Err(elapsed) => {
                handle.abort();
                // Wait for the aborted task to drop its future (and any child
                // process) before the guard removes the task directory.
                let _ = handle.await;
                Err(elapsed)
            }
        };
        let error_text = match converted {
            Ok(Ok(())) if guard.task_dir().is_dir() => {
                guard.commit();
                return (
                    Outcome::Success {
                        task_id: id.to_string(),
                    },
                    format!("Task created: {}", id),
                    start.elapsed(),
                );
            }
            Ok(Ok(())) => MISSING_TASK_DIR.to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => ConvertError::TimedOut {
                seconds: config.item_timeout.as_secs(),
            }
            .to_string(),
        };
        drop(guard);

        let message = error_text.replace(['\r', '\n'], " ");
        (Outcome::from_error_text(&error_text), message, start.elapsed())
    }

    /// Call a source operation, backing off and retrying on rate limits.
    async fn with_rate_limit_retry<T, F, Fut>(
        &self,
        page: u32,
        stop: &ShutdownSignal,
        mut op: F,
    ) -> Result<Fetched<T>, FarmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempts = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(Fetched::Ready(value)),
                Err(SourceError::RateLimited { retry_after }) => {
                    if attempts >= self.config.max_rate_limit_retries {
                        error!(page = page, attempts = attempts, "Rate limit retries exhausted");
                        return Err(FarmError::RateLimitExhausted { page, attempts });
                    }
                    attempts += 1;
                    let wait = retry_after
                        .unwrap_or_else(|| {
                            self.config
                                .rate_limit_backoff
                                .saturating_mul(1u32 << (attempts - 1).min(16))
                        })
                        .min(MAX_BACKOFF);
                    warn!(
                        page = page,
                        attempt = attempts,
                        wait_secs = wait.as_secs(),
                        "GitHub rate limit hit, backing off"
                    );
                    if !stop.sleep(wait).await {
                        return Ok(Fetched::Stopped);
                    }
                }
                Err(source) => {
                    error!(page = page, error = %source, "Failed to fetch pull requests");
                    return Err(FarmError::Fetch { page, source });
                }
            }
        }
    }

    async fn maybe_run_maintenance(&self, attempted: u64) {
        let batch = self.config.maintenance_batch as u64;
        if batch == 0 || attempted == 0 || attempted % batch != 0 {
            return;
        }
        let Some(hook) = &self.maintenance else {
            return;
        };
        info!(hook = hook.name(), attempted = attempted, "Running maintenance");
        if let Err(e) = hook.run().await {
            warn!(hook = hook.name(), error = %e, "Maintenance failed");
        }
    }
}

/// Error text for a converter task that did not return normally.
fn panic_text(err: JoinError) -> String {
    if !err.is_panic() {
        return "Unexpected error: converter task was cancelled".to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Unexpected error: {}", message)
}

fn log_outcome(outcome: &Outcome, result: &TaskResult) {
    match outcome {
        Outcome::Success { task_id } => {
            info!(pr = result.pr_number, task_id = %task_id, duration_secs = result.duration_seconds, "Task created")
        }
        Outcome::Skipped { category, reason } => {
            info!(
                pr = result.pr_number,
                category = %category,
                reason = %reason,
                message = %result.message,
                "PR skipped"
            )
        }
        Outcome::Failed { category, reason } => warn!(
            pr = result.pr_number,
            category = %category,
            reason = %reason,
            message = %result.message,
            "PR failed"
        ),
        Outcome::DryRun => {}
    }
}

/// Append one result as a JSON line.
fn append_result(path: &Path, result: &TaskResult) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(result)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StateError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct OnePage(Vec<PrCandidate>);

    #[async_trait]
    impl CandidateSource for OnePage {
        async fn fetch_page(&self, page: u32) -> Result<Option<Vec<PrCandidate>>, SourceError> {
            Ok((page == 1).then(|| self.0.clone()))
        }
    }

    /// Creates the task directory unless the PR number is listed as failing.
    struct DirConverter {
        fail: Vec<(u64, &'static str)>,
        calls: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl TaskConverter for DirConverter {
        async fn convert(&self, request: &ConversionRequest) -> Result<(), ConvertError> {
            self.calls.lock().unwrap().push(request.candidate.number);
            std::fs::create_dir_all(request.task_dir().join("tests"))?;
            if let Some((_, msg)) = self.fail.iter().find(|(n, _)| *n == request.candidate.number) {
                return Err(ConvertError::Failed(msg.to_string()));
            }
            Ok(())
        }
    }

    fn candidate(number: u64) -> PrCandidate {
        PrCandidate {
            number,
            title: format!("PR {}", number),
            created_at: Utc.with_ymd_and_hms(2024, 1, number as u32, 0, 0, 0).unwrap(),
            merged_at: None,
            author: "dev".to_string(),
            files_changed: 5,
            additions: 1,
            deletions: 1,
            url: String::new(),
            linked_issues: vec![],
        }
    }

    fn config(dir: &Path) -> FarmConfig {
        FarmConfig::new("owner/repo")
            .with_output_root(dir.join("tasks"))
            .with_state_dir(dir.join(".state"))
            .with_task_delay(Duration::ZERO)
            .with_maintenance_batch(0)
    }

    #[test]
    fn test_paths_use_repo_slug() {
        let config = FarmConfig::new("owner/repo").with_state_dir("/s");
        assert!(config.issue_only);
        assert_eq!(config.state_path(), PathBuf::from("/s/farm/owner__repo.state.json"));
        assert_eq!(
            config.results_path(),
            PathBuf::from("/s/farm/owner__repo.results.jsonl")
        );
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(FarmConfig::new("").validate().is_err());
        assert!(FarmConfig::new("a/b").with_file_bounds(5, 2).validate().is_err());
        assert!(FarmConfig::new("a/b")
            .with_item_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(FarmConfig::new("a/b").validate().is_ok());
    }

    #[tokio::test]
    async fn test_failed_attempt_removes_partial_task_dir() {
        let dir = tempfile::tempdir().unwrap();
        let converter = Arc::new(DirConverter {
            fail: vec![(2, "connection reset by peer")],
            calls: Mutex::new(Vec::new()),
        });
        let orchestrator = FarmOrchestrator::new(
            Arc::new(OnePage(vec![candidate(1), candidate(2)])),
            converter,
            None,
            config(dir.path()),
        );

        let summary = orchestrator.run(&ShutdownSignal::new()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(dir.path().join("tasks/owner__repo-1").is_dir());
        assert!(!dir.path().join("tasks/owner__repo-2").exists());
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_results_log_has_one_line_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let results_path = cfg.results_path();
        let orchestrator = FarmOrchestrator::new(
            Arc::new(OnePage(vec![candidate(1), candidate(2), candidate(3)])),
            Arc::new(DirConverter {
                fail: vec![(3, "PR is trivial")],
                calls: Mutex::new(Vec::new()),
            }),
            None,
            cfg,
        );
        orchestrator.run(&ShutdownSignal::new()).await.unwrap();

        let content = std::fs::read_to_string(results_path).unwrap();
        let results: Vec<TaskResult> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[2].category, Some(FailureCategory::TrivialSkip));
    }

    #[tokio::test]
    async fn test_skip_list_applies_even_with_force() {
        let dir = tempfile::tempdir().unwrap();
        let converter = Arc::new(DirConverter {
            fail: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let orchestrator = FarmOrchestrator::new(
            Arc::new(OnePage(vec![candidate(1), candidate(2)])),
            converter.clone(),
            None,
            config(dir.path())
                .with_force(true)
                .with_skip_list(BTreeSet::from([2])),
        );
        let summary = orchestrator.run(&ShutdownSignal::new()).await.unwrap();
        assert_eq!(*converter.calls.lock().unwrap(), vec![1]);
        assert_eq!(summary.filtered, 1);
    }

    #[tokio::test]
    async fn test_resume_from_filters_older_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let converter = Arc::new(DirConverter {
            fail: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let orchestrator = FarmOrchestrator::new(
            Arc::new(OnePage(vec![candidate(1), candidate(2), candidate(3)])),
            converter.clone(),
            None,
            config(dir.path())
                .with_resume_from(Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())),
        );
        orchestrator.run(&ShutdownSignal::new()).await.unwrap();
        assert_eq!(*converter.calls.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_small_candidates_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let mut tiny = candidate(1);
        tiny.files_changed = 1;
        let converter = Arc::new(DirConverter {
            fail: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let orchestrator = FarmOrchestrator::new(
            Arc::new(OnePage(vec![tiny, candidate(2)])),
            converter.clone(),
            None,
            config(dir.path()),
        );
        let summary = orchestrator.run(&ShutdownSignal::new()).await.unwrap();
        assert_eq!(*converter.calls.lock().unwrap(), vec![2]);
        assert!(!summary.final_state.should_skip(1));
    }

    #[tokio::test]
    async fn test_success_without_task_dir_is_failure() {
        struct NoOutput;

        #[async_trait]
        impl TaskConverter for NoOutput {
            async fn convert(&self, _request: &ConversionRequest) -> Result<(), ConvertError> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = FarmOrchestrator::new(
            Arc::new(OnePage(vec![candidate(1)])),
            Arc::new(NoOutput),
            None,
            config(dir.path()),
        );
        let summary = orchestrator.run(&ShutdownSignal::new()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.results[0].message, MISSING_TASK_DIR);
        assert_eq!(summary.final_state.failed, 1);
    }
}

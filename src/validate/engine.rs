//! Bounded-concurrency batch validation.
//!
//! At most `max_parallel` artifacts are validated at once. A permit is taken
//! before a worker is spawned and lives inside the worker, so it is released
//! however the worker ends. Each result goes to a single [`ResultWriter`] as
//! soon as it is known: a killed process loses only in-flight work.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::network::NetworkIsolation;
use super::runner::ValidationRunner;
use super::{format_result_line, task_id_of, AgentMode, ReferenceAgent, ValidationResult};
use crate::error::ValidateError;
use crate::shutdown::ShutdownSignal;

/// Configuration for [`BatchValidationEngine`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum validations in flight.
    pub max_parallel: usize,
    pub mode: AgentMode,
    /// Results file written incrementally, if any.
    pub output_file: Option<PathBuf>,
    /// Validate every artifact with its network cut off.
    pub network_isolated: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            mode: AgentMode::Both,
            output_file: None,
            network_isolated: false,
        }
    }
}

impl BatchConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_output_file(mut self, path: Option<PathBuf>) -> Self {
        self.output_file = path;
        self
    }

    pub fn with_network_isolated(mut self, isolated: bool) -> Self {
        self.network_isolated = isolated;
        self
    }
}

/// Aggregated outcome of a batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Results in completion order.
    pub results: Vec<ValidationResult>,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    /// Artifacts submitted to the batch.
    pub total: usize,
    /// A stop request prevented some artifacts from starting.
    pub cancelled: bool,
}

impl BatchReport {
    fn from_results(results: Vec<ValidationResult>, total: usize, cancelled: bool) -> Self {
        let (passed, failed, errors) = tally(&results);
        Self {
            results,
            passed,
            failed,
            errors,
            total,
            cancelled,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }
}

/// Count (passed, failed, errored) results.
fn tally(results: &[ValidationResult]) -> (usize, usize, usize) {
    results.iter().fold((0, 0, 0), |(p, f, e), r| match (&r.error, r.passed) {
        (Some(_), _) => (p, f, e + 1),
        (None, true) => (p + 1, f, e),
        (None, false) => (p, f + 1, e),
    })
}

/// Serializes result lines into the output file.
///
/// Format, write and flush happen under one lock, so concurrent workers
/// never interleave partial lines.
pub struct ResultWriter {
    mode: AgentMode,
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl ResultWriter {
    /// Open `path` (truncating it) and write the header.
    pub fn create(path: Option<&Path>, total: usize, mode: AgentMode) -> Result<Self, ValidateError> {
        let Some(path) = path else {
            return Ok(Self {
                mode,
                file: None,
                path: None,
            });
        };
        let output_err = |source| ValidateError::Output {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(output_err)?;
            }
        }
        let mut file = File::create(path).map_err(output_err)?;
        write!(
            file,
            "# Validation results - {} tasks\n# Format: TASK_ID: NOP=<reward> ORACLE=<reward> <STATUS>\n\n",
            total
        )
        .and_then(|_| file.flush())
        .map_err(output_err)?;

        Ok(Self {
            mode,
            file: Some(Mutex::new(file)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Append one result line and flush it.
    pub async fn write(&self, result: &ValidationResult) -> Result<(), ValidateError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut file = file.lock().await;
        let line = format_result_line(result, self.mode);
        writeln!(file, "{}", line)
            .and_then(|_| file.flush())
            .map_err(|source| self.output_error(source))
    }

    /// Append the summary line.
    pub async fn finish(&self, passed: usize, failed: usize, errors: usize) -> Result<(), ValidateError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut file = file.lock().await;
        write!(
            file,
            "\n# Summary: {} passed, {} failed, {} errors\n",
            passed, failed, errors
        )
        .and_then(|_| file.flush())
        .map_err(|source| self.output_error(source))
    }

    fn output_error(&self, source: std::io::Error) -> ValidateError {
        ValidateError::Output {
            path: self.path.clone().unwrap_or_default(),
            source,
        }
    }
}

/// Runs validations for many artifacts with a concurrency cap.
pub struct BatchValidationEngine {
    runner: Arc<dyn ValidationRunner>,
    config: BatchConfig,
}

impl BatchValidationEngine {
    pub fn new(runner: Arc<dyn ValidationRunner>, config: BatchConfig) -> Self {
        Self { runner, config }
    }

    /// Validate `tasks` (directories inside `dataset`).
    ///
    /// A stop request lets in-flight workers finish but starts no new ones;
    /// the summary line is still written.
    pub async fn run(
        &self,
        dataset: &Path,
        tasks: Vec<PathBuf>,
        stop: &ShutdownSignal,
    ) -> Result<BatchReport, ValidateError> {
        let total = tasks.len();
        let mode = self.config.mode;
        let writer = Arc::new(ResultWriter::create(
            self.config.output_file.as_deref(),
            total,
            mode,
        )?);
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let dataset = Arc::new(dataset.to_path_buf());

        info!(
            total = total,
            max_parallel = self.config.max_parallel,
            mode = %mode,
            "Starting batch validation"
        );

        let mut join_set: JoinSet<ValidationResult> = JoinSet::new();
        let mut results = Vec::with_capacity(total);
        let mut cancelled = false;

        for task_dir in tasks {
            while let Some(joined) = join_set.try_join_next() {
                collect(joined, &mut results);
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = stop.triggered() => {
                    cancelled = true;
                    break;
                }
            };
            if stop.is_triggered() {
                cancelled = true;
                break;
            }

            let runner = Arc::clone(&self.runner);
            let writer = Arc::clone(&writer);
            let dataset = Arc::clone(&dataset);
            let network_isolated = self.config.network_isolated;
            join_set.spawn(async move {
                let _permit = permit;
                let task_id = task_id_of(&task_dir);
                debug!(task_id = %task_id, "Validating task");

                // A panic inside the inner task surfaces as a JoinError here
                // instead of tearing down the worker.
                let inner = tokio::spawn(validate_task(
                    runner,
                    dataset,
                    task_dir,
                    mode,
                    network_isolated,
                ));
                let result = match inner.await {
                    Ok(result) => result,
                    Err(e) => ValidationResult::errored(&task_id, worker_fault(e)),
                };

                if let Err(e) = writer.write(&result).await {
                    warn!(task_id = %task_id, error = %e, "Failed to write validation result");
                }
                result
            });
        }

        if cancelled {
            info!(in_flight = join_set.len(), "Stop requested, waiting for in-flight validations");
        }
        while let Some(joined) = join_set.join_next().await {
            collect(joined, &mut results);
        }

        let report = BatchReport::from_results(results, total, cancelled);
        writer
            .finish(report.passed, report.failed, report.errors)
            .await?;

        info!(
            passed = report.passed,
            failed = report.failed,
            errors = report.errors,
            completed = report.results.len(),
            total = total,
            cancelled = cancelled,
            "Batch validation finished"
        );
        Ok(report)
    }
}

fn collect(joined: Result<ValidationResult, JoinError>, results: &mut Vec<ValidationResult>) {
    match joined {
        Ok(result) => results.push(result),
        Err(e) => warn!(error = %e, "Validation worker did not complete"),
    }
}

fn worker_fault(err: JoinError) -> String {
    if !err.is_panic() {
        return "Validation worker was cancelled".to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Validation worker panicked: {}", message)
}

/// Validate one artifact under the agents selected by `mode`.
async fn validate_task(
    runner: Arc<dyn ValidationRunner>,
    dataset: Arc<PathBuf>,
    task_dir: PathBuf,
    mode: AgentMode,
    network_isolated: bool,
) -> ValidationResult {
    let task_id = task_id_of(&task_dir);
    let _isolation = if network_isolated {
        match NetworkIsolation::enable(&task_dir) {
            Ok(guard) => Some(guard),
            Err(e) => {
                return ValidationResult::errored(
                    task_id,
                    format!("Failed to enable network isolation: {}", e),
                )
            }
        }
    } else {
        None
    };

    let mut nop = None;
    let mut oracle = None;
    for agent in mode.agents() {
        // Keep the nop image around for the oracle run that follows.
        let keep_image = agent == ReferenceAgent::Nop && mode == AgentMode::Both;
        match runner.run_agent(&dataset, &task_dir, agent, keep_image).await {
            Ok(run) => match agent {
                ReferenceAgent::Nop => nop = Some(run),
                ReferenceAgent::Oracle => oracle = Some(run),
            },
            Err(e) => return ValidationResult::errored(task_id, e.to_string()),
        }
    }
    ValidationResult::completed(task_id, mode, nop.as_ref(), oracle.as_ref())
}

/// Outcome of validating one task, optionally twice.
#[derive(Debug, Clone)]
pub struct SingleReport {
    pub regular: ValidationResult,
    /// Network-isolated pass, run only when requested and the regular pass
    /// succeeded.
    pub isolated: Option<ValidationResult>,
}

impl SingleReport {
    pub fn passed(&self) -> bool {
        self.regular.passed && self.isolated.as_ref().map_or(true, |r| r.passed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

/// Validate a single task: a regular pass, then an isolated one if asked.
pub async fn validate_single(
    runner: Arc<dyn ValidationRunner>,
    dataset: &Path,
    task_dir: &Path,
    mode: AgentMode,
    network_isolated: bool,
) -> SingleReport {
    let dataset = Arc::new(dataset.to_path_buf());
    info!(task_id = %task_id_of(task_dir), "Running regular validation");
    let regular = validate_task(
        Arc::clone(&runner),
        Arc::clone(&dataset),
        task_dir.to_path_buf(),
        mode,
        false,
    )
    .await;

    let isolated = if network_isolated && regular.passed {
        info!(task_id = %regular.task_id, "Running network-isolated validation");
        Some(validate_task(runner, dataset, task_dir.to_path_buf(), mode, true).await)
    } else {
        None
    };

    SingleReport { regular, isolated }
}

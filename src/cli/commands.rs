//! CLI command definitions for swe-farm.
//!
//! Three commands: `farm` streams a repository's merged PRs into tasks,
//! `validate` checks tasks against the reference agents, and `clean` removes
//! local artifacts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::farm::github::validate_repo_name;
use crate::farm::{
    load_skip_list, parse_resume_from, CommandConverter, CommandConverterConfig, FarmConfig,
    FarmOrchestrator, FarmSummary, GitHubPullSource, GitHubSourceConfig, MaintenanceHook,
    StopReason,
};
use crate::maintenance::{CleanOptions, CleanPlan, DockerPrune};
use crate::shutdown::ShutdownSignal;
use crate::validate::{
    resolve_target, validate_single, AgentMode, BatchConfig, BatchReport,
    BatchValidationEngine, HarborRunner, HarborRunnerConfig, SingleReport, ValidateTarget,
    ValidationResult,
};

/// Default output directory for generated tasks.
const DEFAULT_OUTPUT_DIR: &str = "tasks";

/// Default directory for state, ledgers and job outputs.
const DEFAULT_STATE_DIR: &str = ".state";

/// Continuous PR-to-task farming and batch validation.
#[derive(Parser)]
#[command(name = "swe-farm")]
#[command(about = "Farm benchmark tasks from merged PRs and validate them")]
#[command(version)]
#[command(
    long_about = "swe-farm streams a repository's merged pull requests through a task converter, \
keeping a resumable cursor so long campaigns survive restarts, and validates the resulting \
tasks concurrently against no-op and oracle reference agents.\n\nExample usage:\n  \
swe-farm farm owner/repo --output tasks\n  swe-farm validate tasks --max-parallel 8 -o results.txt"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Stream through a repository's PR history and convert each merged PR.
    Farm(FarmArgs),

    /// Validate tasks by running the NOP and ORACLE reference agents.
    Validate(ValidateArgs),

    /// Remove local artifacts: job outputs and logs, optionally ledgers, cache and tasks.
    Clean(CleanArgs),
}

/// Arguments for `swe-farm farm`.
#[derive(Parser, Debug)]
pub struct FarmArgs {
    /// GitHub repository (owner/repo or URL).
    pub repo: String,

    /// Output root for generated tasks.
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// State directory for the resumable cursor and ledgers.
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Re-attempt PRs that were already processed and regenerate existing tasks.
    #[arg(long)]
    pub force: bool,

    /// Hard timeout per PR in seconds.
    #[arg(long, default_value = "3600")]
    pub timeout: u64,

    /// Timeout for the converter's agent session in seconds.
    #[arg(long, default_value = "3200")]
    pub cc_timeout: u64,

    /// Delay between GitHub API calls in seconds.
    #[arg(long, default_value = "0.5")]
    pub api_delay: f64,

    /// Delay between PRs in seconds.
    #[arg(long, default_value = "60")]
    pub task_delay: u64,

    /// Forget processed PRs and start from the beginning.
    #[arg(long)]
    pub reset: bool,

    /// Skip PRs created before this date (YYYY-MM-DD or RFC 3339).
    #[arg(long)]
    pub resume_from: Option<String>,

    /// Show what would be processed without converting anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Run `docker system prune` every N attempted PRs (0 disables).
    #[arg(long, default_value = "5")]
    pub docker_prune_batch: usize,

    /// File of task ids (owner__repo-123) to skip.
    #[arg(long)]
    pub skip_list: Option<PathBuf>,

    /// Minimum number of source files changed.
    #[arg(long, default_value = "3")]
    pub min_files: usize,

    /// Maximum number of source files changed.
    #[arg(long, default_value = "10")]
    pub max_files: usize,

    /// Only process PRs that have a linked issue (default).
    #[arg(long, overrides_with = "no_issue_only")]
    pub issue_only: bool,

    /// Also process PRs without a linked issue.
    #[arg(long, overrides_with = "issue_only")]
    pub no_issue_only: bool,

    /// Converter command template. Placeholders: {repo} {pr} {output} {task_id}
    /// {state_dir} {cc_timeout} {min_files} {max_files} {reference}.
    #[arg(long)]
    pub converter_cmd: Option<String>,

    /// GitHub token (can also be set via GITHUB_TOKEN env var).
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Retries of one page when GitHub rate-limits before giving up.
    #[arg(long, default_value = "5")]
    pub max_rate_limit_retries: u32,
}

impl FarmArgs {
    /// Linked issues are required unless `--no-issue-only` was given last.
    fn require_issue(&self) -> bool {
        !self.no_issue_only
    }
}

/// Arguments for `swe-farm validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Dataset root, a single task directory, or dataset root with --task.
    pub path: PathBuf,

    /// Task id inside the dataset root.
    #[arg(short = 't', long)]
    pub task: Option<String>,

    /// Agents to run: both, nop or oracle.
    #[arg(long, default_value = "both")]
    pub agent: String,

    /// Directory for harbor job outputs.
    #[arg(long, default_value = ".state/harbor-jobs")]
    pub jobs_dir: PathBuf,

    /// Multiply the task's own timeouts.
    #[arg(long)]
    pub timeout_multiplier: Option<f64>,

    /// Validate with the task's network cut off.
    #[arg(long)]
    pub network_isolated: bool,

    /// Environment type for harbor runs (docker, daytona, e2b, modal, runloop, gke).
    #[arg(short = 'e', long = "env", default_value = "docker")]
    pub environment: String,

    /// Maximum validations in flight (batch mode).
    #[arg(long, default_value = "8")]
    pub max_parallel: usize,

    /// Include passed tasks in the results table.
    #[arg(long)]
    pub show_passed: bool,

    /// Write results to this file as they complete (batch mode).
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// harbor executable.
    #[arg(long, default_value = "harbor")]
    pub harbor_bin: String,
}

/// Arguments for `swe-farm clean`.
#[derive(Parser, Debug)]
pub struct CleanArgs {
    /// State directory to clean.
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Tasks output root.
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Also remove ledgers, cache and task outputs.
    #[arg(long)]
    pub all: bool,

    /// Also remove the task reference ledger and farm state.
    #[arg(long)]
    pub ledgers: bool,

    /// Also remove the converter cache.
    #[arg(long)]
    pub cache: bool,

    /// Also remove task outputs.
    #[arg(long)]
    pub tasks: bool,

    /// Print what would be removed without deleting.
    #[arg(long)]
    pub dry_run: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<i32> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments and return the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Farm(args) => run_farm_command(args).await,
        Commands::Validate(args) => run_validate_command(args).await,
        Commands::Clean(args) => run_clean_command(args),
    }
}

// ============================================================================
// Farm
// ============================================================================

async fn run_farm_command(args: FarmArgs) -> anyhow::Result<i32> {
    let repo = normalize_repo(&args.repo);
    validate_repo_name(&repo)?;

    let api_delay = Duration::try_from_secs_f64(args.api_delay)
        .map_err(|_| anyhow::anyhow!("--api-delay must be a non-negative number of seconds"))?;
    if args.max_files < args.min_files {
        anyhow::bail!(
            "--max-files ({}) must not be below --min-files ({})",
            args.max_files,
            args.min_files
        );
    }

    let skip_list = match &args.skip_list {
        Some(path) => load_skip_list(path, &repo)?,
        None => BTreeSet::new(),
    };
    let resume_from = args
        .resume_from
        .as_deref()
        .map(parse_resume_from)
        .transpose()?;

    let source = GitHubPullSource::new(
        GitHubSourceConfig::new(&repo)
            .with_token(args.github_token.clone())
            .with_api_delay(api_delay),
    )?;

    let mut converter_config = CommandConverterConfig::default();
    if let Some(template) = &args.converter_cmd {
        converter_config = converter_config.with_template(template);
    }
    let converter = CommandConverter::new(converter_config)?;

    let maintenance: Option<Arc<dyn MaintenanceHook>> =
        if args.docker_prune_batch > 0 && !args.dry_run {
            Some(Arc::new(DockerPrune::new()))
        } else {
            None
        };

    let config = FarmConfig::new(&repo)
        .with_output_root(&args.output)
        .with_state_dir(&args.state_dir)
        .with_force(args.force)
        .with_item_timeout(Duration::from_secs(args.timeout))
        .with_cc_timeout(Duration::from_secs(args.cc_timeout))
        .with_task_delay(Duration::from_secs(args.task_delay))
        .with_reset(args.reset)
        .with_resume_from(resume_from)
        .with_dry_run(args.dry_run)
        .with_maintenance_batch(args.docker_prune_batch)
        .with_skip_list(skip_list)
        .with_file_bounds(args.min_files, args.max_files)
        .with_issue_only(args.require_issue())
        .with_rate_limit_policy(args.max_rate_limit_retries, Duration::from_secs(60));
    let state_path = config.state_path();

    println!("Farming {}", repo);
    println!("  Output: {}", args.output.display());
    println!("  State: {}", state_path.display());
    if let Some(ts) = resume_from {
        println!("  Resume from: {}", ts.to_rfc3339());
    }
    if !config.skip_list.is_empty() {
        println!("  Skip list: {} PRs", config.skip_list.len());
    }
    if args.dry_run {
        println!("  Dry run: nothing will be converted");
    }
    println!();

    let stop = ShutdownSignal::new();
    stop.install_ctrl_c_handler();

    let orchestrator =
        FarmOrchestrator::new(Arc::new(source), Arc::new(converter), maintenance, config);
    let summary = orchestrator.run(&stop).await?;
    info!(repo = %repo, exit_code = summary.exit_code(), "Farm command finished");

    print_farm_summary(&summary, &state_path);
    Ok(summary.exit_code())
}

/// Accept `owner/repo`, `https://github.com/owner/repo` or a `.git` clone URL.
fn normalize_repo(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let without_host = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .or_else(|| trimmed.strip_prefix("git@github.com:"))
        .or_else(|| trimmed.strip_prefix("github.com/"))
        .unwrap_or(trimmed);
    without_host
        .strip_suffix(".git")
        .unwrap_or(without_host)
        .to_string()
}

fn print_farm_summary(summary: &FarmSummary, state_path: &Path) {
    let state = &summary.final_state;
    println!();
    match summary.stop_reason {
        StopReason::Drained => println!("✓ Farm finished: no more PRs"),
        StopReason::Stopped => println!("■ Farm stopped; progress saved"),
    }
    println!(
        "  This run: {} attempted, {} succeeded, {} skipped, {} failed",
        summary.attempted, summary.succeeded, summary.skipped, summary.failed
    );
    if summary.dry_run > 0 {
        println!("  Dry run: {} PRs would be converted", summary.dry_run);
    }
    if summary.filtered > 0 {
        println!("  Filtered before conversion: {}", summary.filtered);
    }
    if !summary.skipped_by_category.is_empty() {
        println!("  Skips:");
        for (category, count) in &summary.skipped_by_category {
            println!("    {:<28} {}", category.description(), count);
        }
        for line in outcome_lines(summary, true) {
            println!("    {}", line);
        }
    }
    if !summary.failures_by_category.is_empty() {
        println!("  Failures:");
        for (category, count) in &summary.failures_by_category {
            println!("    {:<28} {}", category.description(), count);
        }
        for line in outcome_lines(summary, false) {
            println!("    {}", line);
        }
    }
    println!(
        "  Totals: {} fetched, {} processed ({} successful, {} failed)",
        state.total_fetched, state.total_processed, state.successful, state.failed
    );
    println!("  State: {}", state_path.display());
}

/// `PR #n [category]: raw message` for each expected skip (`skips`) or
/// operational failure.
fn outcome_lines(summary: &FarmSummary, skips: bool) -> Vec<String> {
    summary
        .results
        .iter()
        .filter_map(|r| {
            let category = r.category?;
            (category.is_expected_skip() == skips)
                .then(|| format!("PR #{} [{}]: {}", r.pr_number, category, r.message))
        })
        .collect()
}

// ============================================================================
// Validate
// ============================================================================

async fn run_validate_command(args: ValidateArgs) -> anyhow::Result<i32> {
    let mode: AgentMode = args.agent.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let target = resolve_target(&args.path, args.task.as_deref())?;

    std::fs::create_dir_all(&args.jobs_dir)?;
    let jobs_dir = args
        .jobs_dir
        .canonicalize()
        .unwrap_or_else(|_| args.jobs_dir.clone());
    let runner = Arc::new(HarborRunner::new(
        HarborRunnerConfig::default()
            .with_harbor_bin(&args.harbor_bin)
            .with_jobs_dir(jobs_dir)
            .with_timeout_multiplier(args.timeout_multiplier)
            .with_environment(&args.environment),
    ));

    match target {
        ValidateTarget::Single {
            dataset,
            task_id,
            task_dir,
        } => {
            if !task_dir.is_dir() {
                anyhow::bail!("Task directory does not exist: {}", task_dir.display());
            }
            println!("[validate] Validating {} (agent: {})", task_id, mode);
            let report =
                validate_single(runner, &dataset, &task_dir, mode, args.network_isolated).await;
            print_single_report(&report, mode);
            Ok(report.exit_code())
        }
        ValidateTarget::Batch { dataset, tasks } => {
            println!("Found {} task(s) to validate", tasks.len());
            println!("Parallel: {} | Agent: {}", args.max_parallel, mode);
            if let Some(output) = &args.output {
                println!("Output: {}", output.display());
            }
            println!();

            let stop = ShutdownSignal::new();
            stop.install_ctrl_c_handler();

            let engine = BatchValidationEngine::new(
                runner,
                BatchConfig::default()
                    .with_max_parallel(args.max_parallel)
                    .with_mode(mode)
                    .with_output_file(args.output.clone())
                    .with_network_isolated(args.network_isolated),
            );
            let report = engine.run(&dataset, tasks, &stop).await?;
            print_batch_report(&report, mode, args.show_passed);
            Ok(report.exit_code())
        }
    }
}

fn reward_text(reward: Option<f64>) -> String {
    reward
        .map(|r| format!("{:?}", r))
        .unwrap_or_else(|| "None".to_string())
}

fn print_single_report(report: &SingleReport, mode: AgentMode) {
    print_single_pass(&report.regular, mode, "Harbor validation", "");
    if let Some(isolated) = &report.isolated {
        print_single_pass(isolated, mode, "Network-isolated validation", "-NO-NETWORK");
    }
}

fn print_single_pass(result: &ValidationResult, mode: AgentMode, label: &str, suffix: &str) {
    if let Some(error) = &result.error {
        println!("\n[validate] ERROR: {} could not run", label);
        println!("  {}", error);
        return;
    }
    if result.passed {
        println!("\n[validate] PASSED: {} met expectations", label);
    } else {
        println!("\n[validate] FAILED: {} did not meet expectations", label);
    }
    if mode.runs_nop() {
        println!(
            "  NOP{}: expected reward=0, got reward={}",
            suffix,
            reward_text(result.nop_reward)
        );
    }
    if mode.runs_oracle() {
        println!(
            "  ORACLE{}: expected reward=1, got reward={}",
            suffix,
            reward_text(result.oracle_reward)
        );
    }
}

fn print_batch_report(report: &BatchReport, mode: AgentMode, show_passed: bool) {
    let mut rows: Vec<&ValidationResult> = report
        .results
        .iter()
        .filter(|r| show_passed || r.is_error() || !r.passed)
        .collect();
    rows.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    if !rows.is_empty() {
        println!();
        println!(
            "{}",
            if show_passed {
                "Validation Results"
            } else {
                "Validation Failures"
            }
        );
        let mut header = format!("{:<40}", "Task ID");
        if mode.runs_nop() {
            header.push_str(&format!(" {:<10}", "NOP"));
        }
        if mode.runs_oracle() {
            header.push_str(&format!(" {:<10}", "Oracle"));
        }
        header.push_str(&format!(" {:<8} Notes", "Status"));
        println!("{}", header);
        println!("{}", "-".repeat(header.chars().count()));

        for result in rows {
            println!("{}", format_table_row(result, mode));
        }
    }

    println!();
    println!("Summary:");
    println!("  Passed: {}", report.passed);
    println!("  Failed: {}", report.failed);
    println!("  Errors: {}", report.errors);
    println!("  Total: {}", report.results.len());
    if report.cancelled {
        println!(
            "  Stopped early: {} of {} tasks not started",
            report.total - report.results.len(),
            report.total
        );
    }
    if report.all_passed() && !report.cancelled {
        println!("\nAll {} task(s) passed validation!", report.passed);
    }
}

fn format_table_row(result: &ValidationResult, mode: AgentMode) -> String {
    let cell = |reward: Option<f64>, expected: f64| -> String {
        match (&result.error, reward) {
            (Some(_), _) => "?".to_string(),
            (None, None) => "-".to_string(),
            (None, Some(r)) if r == expected => format!("ok ({:?})", r),
            (None, Some(r)) => format!("x ({:?})", r),
        }
    };

    let mut row = format!("{:<40}", result.task_id);
    if mode.runs_nop() {
        row.push_str(&format!(" {:<10}", cell(result.nop_reward, 0.0)));
    }
    if mode.runs_oracle() {
        row.push_str(&format!(" {:<10}", cell(result.oracle_reward, 1.0)));
    }
    let (status, notes) = match &result.error {
        Some(error) => ("ERROR", error.clone()),
        None if result.passed => ("PASS", String::new()),
        None => ("FAIL", result.failure_notes(mode).join("; ")),
    };
    row.push_str(&format!(" {:<8} {}", status, notes));
    row.trim_end().to_string()
}

// ============================================================================
// Clean
// ============================================================================

fn run_clean_command(args: CleanArgs) -> anyhow::Result<i32> {
    let options = if args.all {
        CleanOptions::all()
    } else {
        CleanOptions {
            ledgers: args.ledgers,
            cache: args.cache,
            tasks: args.tasks,
            leftovers: true,
        }
    };
    let plan = CleanPlan::build(&args.state_dir, &args.output, &options);

    println!("Cleanup Plan");
    if plan.is_empty() {
        println!("  (nothing to remove)");
    }
    for dir in &plan.dirs {
        println!("  dir   {}", dir.display());
    }
    for file in &plan.files {
        println!("  file  {}", file.display());
    }

    if args.dry_run {
        println!("\nDry run: nothing removed");
        return Ok(0);
    }

    let report = plan.execute();
    println!("\nCleanup Complete");
    println!("  State dir: {}", args.state_dir.display());
    println!("  Output root: {}", args.output.display());
    println!("  Removed dirs: {}", report.removed_dirs);
    println!("  Removed files: {}", report.removed_files);
    Ok(0)
}

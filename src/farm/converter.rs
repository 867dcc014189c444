//! Task converter seam.
//!
//! The farm treats conversion as one bounded call: hand over a candidate,
//! get back `Ok(())` once the task directory exists or an error whose text is
//! fed to the failure classifier. [`CommandConverter`] runs an external
//! command built from a template.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::references::TaskReference;
use super::PrCandidate;
use crate::error::ConvertError;

/// Bytes of converter output kept in a failure message.
const OUTPUT_TAIL_BYTES: usize = 2000;

/// Everything a converter needs to turn one PR into a task.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub repo: String,
    pub candidate: PrCandidate,
    pub task_id: String,
    /// Root directory tasks are written under.
    pub output_root: PathBuf,
    pub state_dir: PathBuf,
    /// Regenerate even if the task already exists.
    pub force: bool,
    /// Budget for the converter's own agent session, forwarded as-is.
    pub cc_timeout: Duration,
    pub require_issue: bool,
    pub min_files: usize,
    pub max_files: usize,
    /// Most recent earlier task produced for the same repository.
    pub reference: Option<TaskReference>,
}

impl ConversionRequest {
    /// Directory the converter is expected to produce.
    pub fn task_dir(&self) -> PathBuf {
        self.output_root.join(&self.task_id)
    }
}

/// Converts a candidate PR into a task directory.
#[async_trait]
pub trait TaskConverter: Send + Sync {
    async fn convert(&self, request: &ConversionRequest) -> Result<(), ConvertError>;
}

/// Configuration for [`CommandConverter`].
#[derive(Debug, Clone)]
pub struct CommandConverterConfig {
    /// Program followed by its arguments. Each element may contain the
    /// placeholders `{repo}`, `{pr}`, `{output}`, `{task_id}`, `{state_dir}`,
    /// `{cc_timeout}`, `{min_files}`, `{max_files}` and `{reference}`.
    pub template: Vec<String>,
    /// Appended when the request is forced.
    pub force_args: Vec<String>,
    /// Appended when the request does not require a linked issue.
    pub no_issue_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandConverterConfig {
    fn default() -> Self {
        Self {
            template: split_template(
                "taskgen create --repo {repo} --pr {pr} --output {output} \
                 --state-dir {state_dir} --cc-timeout {cc_timeout} \
                 --min-source-files {min_files} --max-source-files {max_files}",
            ),
            force_args: vec!["--force".to_string()],
            no_issue_args: vec!["--no-require-issue".to_string()],
            working_dir: None,
        }
    }
}

impl CommandConverterConfig {
    /// Replace the command template with a whitespace-separated string.
    pub fn with_template(mut self, template: &str) -> Self {
        self.template = split_template(template);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

fn split_template(template: &str) -> Vec<String> {
    template.split_whitespace().map(str::to_string).collect()
}

/// Runs an external command per candidate.
pub struct CommandConverter {
    config: CommandConverterConfig,
}

impl CommandConverter {
    pub fn new(config: CommandConverterConfig) -> Result<Self, ConvertError> {
        if config.template.is_empty() {
            return Err(ConvertError::Launch("converter command is empty".to_string()));
        }
        Ok(Self { config })
    }

    /// Expand the template for one request into program arguments.
    pub fn render(&self, request: &ConversionRequest) -> Vec<String> {
        let reference = request
            .reference
            .as_ref()
            .map(|r| r.task_id.clone())
            .unwrap_or_default();
        let mut args: Vec<String> = self
            .config
            .template
            .iter()
            .map(|part| {
                part.replace("{repo}", &request.repo)
                    .replace("{pr}", &request.candidate.number.to_string())
                    .replace("{output}", &request.output_root.display().to_string())
                    .replace("{task_id}", &request.task_id)
                    .replace("{state_dir}", &request.state_dir.display().to_string())
                    .replace("{cc_timeout}", &request.cc_timeout.as_secs().to_string())
                    .replace("{min_files}", &request.min_files.to_string())
                    .replace("{max_files}", &request.max_files.to_string())
                    .replace("{reference}", &reference)
            })
            .collect();
        if request.force {
            args.extend(self.config.force_args.iter().cloned());
        }
        if !request.require_issue {
            args.extend(self.config.no_issue_args.iter().cloned());
        }
        args
    }
}

#[async_trait]
impl TaskConverter for CommandConverter {
    async fn convert(&self, request: &ConversionRequest) -> Result<(), ConvertError> {
        let start = Instant::now();
        let args = self.render(request);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| ConvertError::Launch("converter command is empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The farm cancels a conversion by dropping this future on timeout.
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        info!(task_id = %request.task_id, pr = request.candidate.number, command = %program, "Starting converter");

        let output = cmd
            .spawn()
            .map_err(|e| ConvertError::Launch(format!("Failed to spawn {}: {}", program, e)))?
            .wait_with_output()
            .await?;

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(
            task_id = %request.task_id,
            exit_code = exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Converter finished"
        );

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let combined = format!("{}\n{}", stderr.trim(), stdout.trim());
        let combined = combined.trim();
        if combined.is_empty() {
            return Err(ConvertError::Failed(format!(
                "Converter exited with code {}",
                exit_code
            )));
        }
        Err(ConvertError::Failed(tail(combined, OUTPUT_TAIL_BYTES).to_string()))
    }
}

/// Last `max` bytes of `text`, moved forward to a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(force: bool) -> ConversionRequest {
        ConversionRequest {
            repo: "owner/repo".to_string(),
            candidate: PrCandidate {
                number: 42,
                title: "Fix parser".to_string(),
                created_at: Utc::now(),
                merged_at: Some(Utc::now()),
                author: "dev".to_string(),
                files_changed: 4,
                additions: 10,
                deletions: 2,
                url: "https://github.com/owner/repo/pull/42".to_string(),
                linked_issues: vec![7],
            },
            task_id: "owner__repo-42".to_string(),
            output_root: PathBuf::from("tasks"),
            state_dir: PathBuf::from(".state"),
            force,
            cc_timeout: Duration::from_secs(3200),
            require_issue: true,
            min_files: 3,
            max_files: 10,
            reference: None,
        }
    }

    #[test]
    fn test_render_default_template() {
        let converter = CommandConverter::new(CommandConverterConfig::default()).unwrap();
        let args = converter.render(&request(false));
        assert_eq!(args[0], "taskgen");
        assert!(args.windows(2).any(|w| w == ["--repo", "owner/repo"]));
        assert!(args.windows(2).any(|w| w == ["--pr", "42"]));
        assert!(args.windows(2).any(|w| w == ["--cc-timeout", "3200"]));
        assert!(!args.contains(&"--force".to_string()));
    }

    #[test]
    fn test_render_force_and_no_issue() {
        let converter = CommandConverter::new(CommandConverterConfig::default()).unwrap();
        let mut req = request(true);
        req.require_issue = false;
        let args = converter.render(&req);
        assert!(args.contains(&"--force".to_string()));
        assert!(args.contains(&"--no-require-issue".to_string()));
    }

    #[test]
    fn test_render_task_id_placeholder() {
        let config = CommandConverterConfig::default().with_template("gen {task_id} {output}/{task_id}");
        let converter = CommandConverter::new(config).unwrap();
        let args = converter.render(&request(false));
        assert_eq!(args, vec!["gen", "owner__repo-42", "tasks/owner__repo-42"]);
    }

    #[test]
    fn test_empty_template_rejected() {
        let config = CommandConverterConfig::default().with_template("   ");
        assert!(CommandConverter::new(config).is_err());
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let text = "ééééé";
        let t = tail(text, 3);
        assert!(t.len() <= 3);
        assert!(text.ends_with(t));
        assert_eq!(tail("short", 100), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_command_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("convert.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'No linked issue found' >&2\nexit 1\n").unwrap();

        let config =
            CommandConverterConfig::default().with_template(&format!("sh {}", script.display()));
        let converter = CommandConverter::new(config).unwrap();
        let err = converter.convert(&request(false)).await.unwrap_err();
        assert!(err.to_string().contains("No linked issue found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_command() {
        let converter =
            CommandConverter::new(CommandConverterConfig::default().with_template("true")).unwrap();
        converter.convert(&request(false)).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let config = CommandConverterConfig::default().with_template("definitely-not-a-real-binary-xyz");
        let converter = CommandConverter::new(config).unwrap();
        let err = converter.convert(&request(false)).await.unwrap_err();
        assert!(matches!(err, ConvertError::Launch(_)));
    }
}

//! Batch validation tests against a scripted runner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use swe_farm::error::ValidateError;
use swe_farm::validate::{
    discover_tasks, AgentMode, AgentRun, BatchConfig, BatchValidationEngine, ReferenceAgent,
    ValidationRunner,
};
use swe_farm::ShutdownSignal;

fn make_dataset(root: &Path, count: usize) -> Vec<PathBuf> {
    for i in 0..count {
        let tests = root.join(format!("owner__repo-{:02}", i)).join("tests");
        std::fs::create_dir_all(&tests).unwrap();
        std::fs::write(tests.join("test.sh"), "#!/bin/sh\nexit 0\n").unwrap();
    }
    discover_tasks(root)
}

/// Behaviour of the scripted runner for one task.
#[derive(Clone, Copy)]
enum Script {
    /// NOP scores 0, ORACLE scores 1.
    Good,
    /// NOP already passes: the tests do not exercise the fix.
    NopPasses,
    /// The runner itself fails.
    Broken,
    Panic,
}

#[derive(Default)]
struct ScriptedRunner {
    scripts: HashMap<String, Script>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
    stop_after: Option<(usize, ShutdownSignal)>,
}

#[async_trait]
impl ValidationRunner for ScriptedRunner {
    async fn run_agent(
        &self,
        _dataset: &Path,
        task_dir: &Path,
        agent: ReferenceAgent,
        _keep_image: bool,
    ) -> Result<AgentRun, ValidateError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, stop)) = &self.stop_after {
            if done >= *limit {
                stop.trigger();
            }
        }

        let name = task_dir.file_name().unwrap().to_string_lossy().to_string();
        let script = self.scripts.get(&name).copied().unwrap_or(Script::Good);
        let reward = match (script, agent) {
            (Script::Good, ReferenceAgent::Nop) => 0.0,
            (Script::Good, ReferenceAgent::Oracle) => 1.0,
            (Script::NopPasses, _) => 1.0,
            (Script::Broken, _) => {
                return Err(ValidateError::Runner {
                    agent: agent.name().to_string(),
                    message: "docker daemon not reachable".to_string(),
                })
            }
            (Script::Panic, _) => panic!("runner exploded"),
        };
        Ok(AgentRun {
            exit_code: 0,
            reward: Some(reward),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_cap() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = make_dataset(dir.path(), 10);
    let runner = Arc::new(ScriptedRunner {
        delay: Duration::from_millis(30),
        ..Default::default()
    });

    let engine = BatchValidationEngine::new(
        runner.clone(),
        BatchConfig::default().with_max_parallel(3),
    );
    let report = engine
        .run(dir.path(), tasks, &ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!(report.results.len(), 10);
    assert_eq!(report.passed, 10);
    assert!(report.all_passed());
    assert_eq!(report.exit_code(), 0);
    let peak = runner.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight was {}", peak);
    assert!(peak >= 2, "expected some overlap, peak was {}", peak);
    // both agents per task
    assert_eq!(runner.completed.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_stop_starts_no_new_work() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = make_dataset(dir.path(), 10);
    let output = dir.path().join("results.txt");
    let stop = ShutdownSignal::new();
    let runner = Arc::new(ScriptedRunner {
        stop_after: Some((4, stop.clone())),
        ..Default::default()
    });

    let engine = BatchValidationEngine::new(
        runner.clone(),
        BatchConfig::default()
            .with_max_parallel(1)
            .with_mode(AgentMode::Oracle)
            .with_output_file(Some(output.clone())),
    );
    let report = engine.run(dir.path(), tasks, &stop).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.total, 10);
    assert_eq!(runner.completed.load(Ordering::SeqCst), 4);

    let content = std::fs::read_to_string(&output).unwrap();
    let result_lines: Vec<&str> = content
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    assert_eq!(result_lines.len(), 4);
    assert!(result_lines.iter().all(|l| l.ends_with("ORACLE=1.0 PASS")));
    assert!(content.ends_with("# Summary: 4 passed, 0 failed, 0 errors\n"));
}

#[tokio::test]
async fn test_mixed_outcomes_and_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = make_dataset(dir.path(), 4);
    let output = dir.path().join("out/results.txt");
    let scripts = HashMap::from([
        ("owner__repo-01".to_string(), Script::NopPasses),
        ("owner__repo-02".to_string(), Script::Broken),
    ]);
    let runner = Arc::new(ScriptedRunner {
        scripts,
        ..Default::default()
    });

    let engine = BatchValidationEngine::new(
        runner,
        BatchConfig::default()
            .with_max_parallel(2)
            .with_output_file(Some(output.clone())),
    );
    let mut report = engine
        .run(dir.path(), tasks, &ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!((report.passed, report.failed, report.errors), (2, 1, 1));
    assert!(!report.all_passed());
    assert_eq!(report.exit_code(), 1);

    report.results.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    let failed = &report.results[1];
    assert!(!failed.passed);
    assert_eq!(failed.nop_reward, Some(1.0));
    assert_eq!(
        failed.failure_notes(AgentMode::Both),
        vec!["NOP expected 0, got 1.0".to_string()]
    );
    let errored = &report.results[2];
    assert!(errored.is_error());
    assert!(errored
        .error
        .as_deref()
        .unwrap()
        .contains("docker daemon not reachable"));

    let content = std::fs::read_to_string(&output).unwrap();
    assert!(content.starts_with(
        "# Validation results - 4 tasks\n# Format: TASK_ID: NOP=<reward> ORACLE=<reward> <STATUS>\n\n"
    ));
    assert!(content.contains("owner__repo-00: NOP=0.0 ORACLE=1.0 PASS\n"));
    assert!(content.contains("owner__repo-01: NOP=1.0 ORACLE=1.0 FAIL\n"));
    assert!(content.contains("owner__repo-02: NOP=ERROR ORACLE=ERROR ERROR: "));
    assert!(content.ends_with("\n# Summary: 2 passed, 1 failed, 1 errors\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_runner_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = make_dataset(dir.path(), 3);
    let runner = Arc::new(ScriptedRunner {
        scripts: HashMap::from([("owner__repo-01".to_string(), Script::Panic)]),
        ..Default::default()
    });

    let engine = BatchValidationEngine::new(runner, BatchConfig::default().with_max_parallel(2));
    let report = engine
        .run(dir.path(), tasks, &ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.passed, 2);
    assert_eq!(report.errors, 1);
    let panicked = report
        .results
        .iter()
        .find(|r| r.task_id == "owner__repo-01")
        .unwrap();
    assert!(panicked
        .error
        .as_deref()
        .unwrap()
        .contains("runner exploded"));
}

#[tokio::test]
async fn test_network_isolated_batch_cleans_up_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = make_dataset(dir.path(), 2);
    let engine = BatchValidationEngine::new(
        Arc::new(ScriptedRunner::default()),
        BatchConfig::default().with_network_isolated(true),
    );
    let report = engine
        .run(dir.path(), tasks.clone(), &ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!(report.passed, 2);
    for task in tasks {
        assert!(!task.join("docker-compose.override.yaml").exists());
    }
}

//! Batched assault stage execution with append-only recovery.
//!
//! Every `(cycle, stage, attempt, target)` tuple runs at most once per batch:
//! keys already present in the batch's JSONL are skipped, so re-running a
//! batch task after a crash resumes where it stopped.

use crate::assault::discover::load_batch;
use crate::assault::results::{append_record, load_keys};
use crate::checkpoint::review_failed;
use crate::collaborators::{WorkerRegistry, worker_names};
use crate::config::ToolchainConfig;
use crate::errors::AssaultError;
use crate::exec::{CommandExecutor, CommandOutcome, CommandSpec};
use crate::model::{AssaultConfig, AssaultRecord, AssaultStage, StageKind, stage_key};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Aggregate counts returned as the batch task's result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: String,
    pub wrote: usize,
    pub skipped: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Executes one batch's stage grid.
pub struct BatchRunner {
    pub executor: Arc<dyn CommandExecutor>,
    pub workers: WorkerRegistry,
    pub toolchain: ToolchainConfig,
    pub workspace: PathBuf,
    pub assault_dir: PathBuf,
    pub config: AssaultConfig,
    pub campaign_id: String,
}

impl BatchRunner {
    /// Run every missing `(cycle, stage, attempt, target)` combination for
    /// the batch, appending one JSONL record and one log file per attempt.
    pub async fn run(
        &self,
        batch_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, AssaultError> {
        let batch = load_batch(&self.assault_dir, batch_id)?;
        let results_path = self
            .assault_dir
            .join("results")
            .join(format!("{batch_id}.jsonl"));
        let log_dir = self.assault_dir.join("logs").join(batch_id);
        let existing = load_keys(&results_path);

        let mut summary = BatchSummary {
            batch_id: batch_id.to_string(),
            ..Default::default()
        };

        for cycle in 1..=self.config.cycles {
            for target in &batch.targets {
                for stage in &self.config.stages {
                    for attempt in 1..=stage.repeat.max(1) {
                        if cancel.is_cancelled() {
                            info!(batch = batch_id, "batch cancelled mid-grid");
                            return Ok(summary);
                        }
                        let key = stage_key(cycle, stage.kind, attempt, target);
                        if existing.contains(&key) {
                            summary.skipped += 1;
                            continue;
                        }

                        let record = self
                            .run_attempt(batch_id, &log_dir, cycle, stage, attempt, target, &key, cancel)
                            .await;
                        if record.passed() {
                            summary.passed += 1;
                        } else {
                            summary.failed += 1;
                        }
                        append_record(&results_path, &record)?;
                        summary.wrote += 1;
                    }
                }
            }
        }

        info!(
            batch = batch_id,
            wrote = summary.wrote,
            skipped = summary.skipped,
            failed = summary.failed,
            "batch complete"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        batch_id: &str,
        log_dir: &Path,
        cycle: u32,
        stage: &AssaultStage,
        attempt: u32,
        target: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> AssaultRecord {
        let started_at = Utc::now();
        let log_name = format!("{}_{}.log", stage.kind.short(), crate::util::short_hash(key, 10));
        let log_path = log_dir.join(&log_name);
        debug!(%key, "running assault stage attempt");

        let outcome = match stage.kind {
            StageKind::Test => self.run_toolchain(self.toolchain.test_args.clone(), target, stage).await,
            StageKind::RaceTest => self.run_toolchain(self.toolchain.race_args.clone(), target, stage).await,
            StageKind::StaticCheck => {
                self.run_toolchain(self.toolchain.static_check_args.clone(), target, stage).await
            }
            StageKind::AdversarialReview => self.run_review(target, cancel).await,
            StageKind::CustomCommand => self.run_custom(stage, target).await,
        };

        // Log writes are best-effort; a failed write never fails the stage.
        if let Err(e) = std::fs::create_dir_all(log_dir)
            .and_then(|()| std::fs::write(&log_path, outcome.output()))
        {
            warn!(error = %e, path = %log_path.display(), "failed to write stage log");
        }

        AssaultRecord {
            campaign_id: self.campaign_id.clone(),
            batch_id: batch_id.to_string(),
            target: target.to_string(),
            cycle,
            stage: stage.kind,
            attempt,
            started_at,
            duration_ms: outcome.duration.as_millis() as u64,
            exit_code: outcome.exit_code,
            killed: outcome.killed,
            kill_reason: outcome.kill_reason.clone(),
            truncated: outcome.truncated,
            log_path: crate::util::normalise_slashes(&log_path.to_string_lossy()),
            error: outcome.error.clone(),
        }
    }

    async fn run_toolchain(
        &self,
        mut args: Vec<String>,
        target: &str,
        stage: &AssaultStage,
    ) -> CommandOutcome {
        args.push(target.to_string());
        let spec = CommandSpec::new(&self.toolchain.binary, args)
            .with_cwd(self.workspace.clone())
            .with_timeout(Duration::from_secs(stage.timeout_secs))
            .with_max_output_bytes(self.config.max_log_bytes);
        self.executor.execute(spec).await
    }

    async fn run_custom(&self, stage: &AssaultStage, target: &str) -> CommandOutcome {
        let Some(template) = &stage.command else {
            return CommandOutcome::synthetic(-1, "custom stage has no command template");
        };
        let command = template.replace("{{target}}", target);
        let spec = CommandSpec::new("sh", vec!["-c".to_string(), command])
            .with_cwd(self.workspace.clone())
            .with_timeout(Duration::from_secs(stage.timeout_secs))
            .with_max_output_bytes(self.config.max_log_bytes);
        self.executor.execute(spec).await
    }

    /// Adversarial review: delegate to the review worker with the absolute
    /// directory for the target; the verdict text decides pass/fail.
    async fn run_review(&self, target: &str, cancel: &CancellationToken) -> CommandOutcome {
        let Some(worker) = self.workers.get(worker_names::REVIEW) else {
            return CommandOutcome::synthetic(-1, "review worker not registered");
        };
        let dir = target_dir(&self.workspace, target);
        let input = format!("review:{}", dir.display());
        match worker.run(&input, cancel).await {
            Ok(response) => {
                let code = if review_failed(&response) { 1 } else { 0 };
                CommandOutcome::synthetic(code, &response)
            }
            Err(e) => CommandOutcome::synthetic(-1, &format!("review worker error: {e}")),
        }
    }
}

/// Absolute directory for a target pattern: strip the leading `./` and any
/// trailing `/...` wildcard.
fn target_dir(workspace: &Path, target: &str) -> PathBuf {
    let trimmed = target
        .trim_start_matches("./")
        .trim_end_matches("/...")
        .trim_end_matches("...");
    if trimmed.is_empty() {
        workspace.to_path_buf()
    } else {
        workspace.join(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assault::discover::write_batches;
    use crate::assault::results::load_records;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CountingExecutor {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl CommandExecutor for CountingExecutor {
        async fn execute(&self, spec: CommandSpec) -> CommandOutcome {
            let line = spec.display_line();
            self.calls.lock().unwrap().push(line.clone());
            let code = match self.fail_on {
                Some(marker) if line.contains(marker) => 1,
                _ => 0,
            };
            CommandOutcome::synthetic(code, "stage output")
        }
    }

    fn runner(dir: &Path, executor: Arc<dyn CommandExecutor>, config: AssaultConfig) -> BatchRunner {
        BatchRunner {
            executor,
            workers: WorkerRegistry::new(),
            toolchain: ToolchainConfig::default(),
            workspace: dir.to_path_buf(),
            assault_dir: dir.join("assault"),
            config,
            campaign_id: "campaign_assault1".to_string(),
        }
    }

    fn seeded_config() -> AssaultConfig {
        let mut config = AssaultConfig {
            stages: vec![AssaultStage::new(StageKind::Test)],
            batch_size: 10,
            cycles: 1,
            ..Default::default()
        };
        config.normalise();
        config
    }

    #[tokio::test]
    async fn test_run_writes_records_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let config = seeded_config();
        write_batches(
            &dir.path().join("assault"),
            "campaign_assault1",
            &config,
            &["./a/...".to_string(), "./b/...".to_string()],
        )
        .unwrap();

        let executor = Arc::new(CountingExecutor {
            calls: Mutex::new(Vec::new()),
            fail_on: Some("./b/..."),
        });
        let runner = runner(dir.path(), executor.clone(), config);
        let summary = runner.run("batch_0000", &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.wrote, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);

        let records = load_records(
            &dir.path()
                .join("assault/results/batch_0000.jsonl"),
        );
        assert_eq!(records.len(), 2);
        for record in &records {
            let log = Path::new(&record.log_path);
            assert!(log.is_file(), "log file missing: {}", record.log_path);
            assert!(record.log_path.contains("test_"));
        }
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = seeded_config();
        write_batches(
            &dir.path().join("assault"),
            "campaign_assault1",
            &config,
            &["./a/...".to_string()],
        )
        .unwrap();
        let executor = Arc::new(CountingExecutor {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let runner = runner(dir.path(), executor.clone(), config);

        let first = runner.run("batch_0000", &CancellationToken::new()).await.unwrap();
        assert_eq!(first.wrote, 1);
        let second = runner.run("batch_0000", &CancellationToken::new()).await.unwrap();
        assert_eq!(second.wrote, 0);
        assert_eq!(second.skipped, 1);

        // Same set of keys on disk after the replay.
        let records = load_records(&dir.path().join("assault/results/batch_0000.jsonl"));
        assert_eq!(records.len(), 1);
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cycles_and_repeats_expand_the_grid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = seeded_config();
        config.cycles = 2;
        config.stages = vec![AssaultStage::new(StageKind::Test).with_repeat(2)];
        config.normalise();
        write_batches(
            &dir.path().join("assault"),
            "campaign_assault1",
            &config,
            &["./a/...".to_string()],
        )
        .unwrap();
        let executor = Arc::new(CountingExecutor {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let runner = runner(dir.path(), executor, config);
        let summary = runner.run("batch_0000", &CancellationToken::new()).await.unwrap();
        // 2 cycles x 1 target x 1 stage x 2 attempts.
        assert_eq!(summary.wrote, 4);
    }

    #[tokio::test]
    async fn test_custom_command_substitutes_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = seeded_config();
        config.stages =
            vec![AssaultStage::new(StageKind::CustomCommand).with_command("fuzz {{target}}")];
        config.normalise();
        write_batches(
            &dir.path().join("assault"),
            "campaign_assault1",
            &config,
            &["./a/...".to_string()],
        )
        .unwrap();
        let executor = Arc::new(CountingExecutor {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let runner = runner(dir.path(), executor.clone(), config);
        runner.run("batch_0000", &CancellationToken::new()).await.unwrap();
        let calls = executor.calls.lock().unwrap();
        assert!(calls[0].contains("fuzz ./a/..."));
    }

    #[test]
    fn test_target_dir() {
        assert_eq!(
            target_dir(Path::new("/w"), "./internal/a/..."),
            PathBuf::from("/w/internal/a")
        );
        assert_eq!(target_dir(Path::new("/w"), "./..."), PathBuf::from("/w"));
        assert_eq!(target_dir(Path::new("/w"), "./pkg/x"), PathBuf::from("/w/pkg/x"));
    }
}

//! Per-task-type execution handlers and the completion/failure paths.

use crate::assault::{BatchRunner, REMEDIATION_PHASE, phase_id_by_name, run_discovery, run_triage};
use crate::cache::compute_needed_ids;
use crate::collaborators::worker_names;
use crate::errors::CampaignError;
use crate::events::{Event, EventType};
use crate::exec::CommandSpec;
use crate::kernel::KernelExt;
use crate::model::{AttemptOutcome, Task, TaskStatus, TaskType};
use crate::orchestrator::OrchestratorCore;
use crate::orchestrator::phase_loop::TaskOutcome;
use crate::retry::{RetryDecision, decide};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll interval while waiting for a requested tool to materialise.
const TOOL_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long tool-create waits before returning a pending result.
const TOOL_WAIT_LIMIT: Duration = Duration::from_secs(30 * 60);

impl OrchestratorCore {
    /// Build the worker input: explicit input or description, plus a
    /// delimited section per cached `context_from` output.
    pub(crate) fn build_task_input(&self, task: &Task) -> String {
        let mut input = task
            .worker_input
            .clone()
            .unwrap_or_else(|| task.description.clone());
        let cache = self.cache.lock().expect("result cache poisoned");
        for source in &task.context_from {
            if let Some(output) = cache.get(source) {
                input.push_str(&format!("\n\n--- context from {source} ---\n{output}"));
            }
        }
        input
    }

    /// Execute one task to a textual result. Explicit worker routing takes
    /// precedence over type dispatch; errors are strings for the retry
    /// taxonomy.
    pub(crate) async fn execute_task(
        self: &Arc<Self>,
        task: &Task,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        if let Some(name) = &task.worker {
            let Some(worker) = self.workers.get(name) else {
                return Err(format!("worker {name} not registered"));
            };
            return worker.run(input, cancel).await;
        }

        match task.task_type {
            TaskType::FileCreate
            | TaskType::FileModify
            | TaskType::TestWrite
            | TaskType::Refactor
            | TaskType::Integrate
            | TaskType::Document => self.run_mutation(task, input, cancel).await,
            TaskType::Research => self.run_named_worker(worker_names::RESEARCH, input, cancel).await,
            TaskType::Verify => self.run_build_all().await,
            TaskType::TestRun => self.run_scoped_tests(task).await,
            TaskType::ToolCreate => self.run_tool_create(task, cancel).await,
            TaskType::CampaignRef => match &task.sub_campaign {
                Some(id) if !id.is_empty() => Ok(r#"{"status": "linked"}"#.to_string()),
                _ => Err("campaign-ref task has no sub-campaign id".to_string()),
            },
            TaskType::ShardSpawn | TaskType::Generic => {
                self.run_named_worker(worker_names::SHARD, input, cancel).await
            }
            TaskType::AssaultDiscover => self.run_assault_discover().await,
            TaskType::AssaultBatch => self.run_assault_batch(task, cancel).await,
            TaskType::AssaultTriage => self.run_assault_triage().await,
        }
    }

    async fn run_named_worker(
        &self,
        name: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let Some(worker) = self.workers.get(name) else {
            return Err(format!("worker {name} not registered"));
        };
        worker.run(input, cancel).await
    }

    /// Code mutation: instruction to the shard worker, with a direct-LLM
    /// fallback that writes the completion verbatim to the target path.
    async fn run_mutation(
        &self,
        task: &Task,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let verb = match task.task_type {
            TaskType::FileCreate => "create",
            TaskType::FileModify => "modify",
            TaskType::TestWrite => "write tests for",
            TaskType::Refactor => "refactor",
            TaskType::Integrate => "integrate",
            _ => "document",
        };
        let target = task
            .artifacts
            .first()
            .map(|a| a.path.clone())
            .unwrap_or_default();
        let instruction = if target.is_empty() {
            format!("{verb}: {input}")
        } else {
            format!("{verb} {target}: {input}")
        };

        match self.run_named_worker(worker_names::SHARD, &instruction, cancel).await {
            Ok(result) => Ok(result),
            Err(worker_error) => {
                debug!(task = %task.id, error = %worker_error, "shard failed; trying direct LLM");
                let Some(llm) = &self.llm else {
                    return Err(worker_error);
                };
                if target.is_empty() {
                    return Err(format!("{worker_error}; no target path for direct write"));
                }
                let completion = llm
                    .complete(&instruction)
                    .await
                    .map_err(|e| format!("{worker_error}; direct LLM failed: {e}"))?;
                let path = self.config.workspace_dir.join(&target);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("creating {}: {e}", parent.display()))?;
                }
                std::fs::write(&path, &completion)
                    .map_err(|e| format!("writing {}: {e}", path.display()))?;
                Ok(format!("wrote {} via direct completion", target))
            }
        }
    }

    async fn run_build_all(&self) -> Result<String, String> {
        let toolchain = &self.config.toolchain;
        let mut args = toolchain.build_args.clone();
        args.push("./...".to_string());
        let spec = CommandSpec::new(&toolchain.binary, args)
            .with_cwd(self.config.workspace_dir.clone())
            .with_timeout(self.config.task_timeout);
        let outcome = self.executor.execute(spec).await;
        if outcome.success {
            Ok("build passed".to_string())
        } else {
            Err(crate::util::truncate_output(
                &format!(
                    "build failed: {} {}",
                    outcome.error.as_deref().unwrap_or(""),
                    outcome.output()
                ),
                2048,
            ))
        }
    }

    async fn run_scoped_tests(&self, task: &Task) -> Result<String, String> {
        let target = task
            .artifacts
            .first()
            .map(|a| a.path.clone())
            .unwrap_or_else(|| "./...".to_string());
        let toolchain = &self.config.toolchain;
        let mut args = toolchain.test_args.clone();
        args.push(target.clone());
        let spec = CommandSpec::new(&toolchain.binary, args)
            .with_cwd(self.config.workspace_dir.clone())
            .with_timeout(self.config.task_timeout);
        let outcome = self.executor.execute(spec).await;
        if outcome.success {
            Ok(format!("tests passed for {target}"))
        } else {
            Err(crate::util::truncate_output(
                &format!(
                    "tests failed for {target}: {} {}",
                    outcome.error.as_deref().unwrap_or(""),
                    outcome.output()
                ),
                2048,
            ))
        }
    }

    /// Request a missing capability and wait for the kernel to see a tool
    /// that provides it. `tool_registered` and `has_capability` are treated
    /// as equivalent success signals.
    async fn run_tool_create(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let capability = task
            .worker_input
            .clone()
            .unwrap_or_else(|| task.description.clone());
        let goal = self.campaign.read().await.goal.clone();
        self.bridge()
            .assert_missing_tool(&task.id, &goal, &capability)
            .map_err(|e| format!("asserting tool request: {e}"))?;
        self.emit(
            Event::new(
                EventType::ToolGenerationRequested,
                format!("capability requested: {capability}"),
            )
            .with_task(&task.id),
        );

        let deadline = tokio::time::Instant::now() + TOOL_WAIT_LIMIT;
        let pattern = [crate::kernel::Pattern::from(capability.as_str())];
        loop {
            if cancel.is_cancelled() {
                return Err("cancelled while waiting for tool".to_string());
            }
            let registered = self
                .kernel
                .holds("tool_registered", &pattern)
                .unwrap_or(false)
                || self.kernel.holds("has_capability", &pattern).unwrap_or(false);
            if registered {
                return Ok(r#"{"status": "ready"}"#.to_string());
            }
            if tokio::time::Instant::now() >= deadline {
                info!(%capability, "tool generation still pending; giving up the wait");
                return Ok(r#"{"status": "pending"}"#.to_string());
            }
            tokio::time::sleep(TOOL_POLL_INTERVAL).await;
        }
    }

    async fn run_assault_discover(self: &Arc<Self>) -> Result<String, String> {
        let mut campaign = self.campaign.write().await;
        let assault_dir = self.assault_dir(&campaign);
        let outcome = run_discovery(
            &mut campaign,
            self.lister.as_ref(),
            &self.config.workspace_dir,
            &assault_dir,
        )
        .map_err(|e| e.to_string())?;
        self.bridge()
            .load_campaign(&campaign, &self.config)
            .map_err(|e| format!("reloading facts after discovery: {e}"))?;
        self.save(&campaign).map_err(|e| e.to_string())?;
        serde_json::to_string(&outcome).map_err(|e| e.to_string())
    }

    async fn run_assault_batch(
        self: &Arc<Self>,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let (campaign_id, assault_dir, config) = {
            let campaign = self.campaign.read().await;
            (
                campaign.id.clone(),
                self.assault_dir(&campaign),
                campaign.assault.clone().unwrap_or_default(),
            )
        };
        let Some(batch_id) = task.worker_input.clone() else {
            return Err("assault batch task carries no batch id".to_string());
        };
        let runner = BatchRunner {
            executor: self.executor.clone(),
            workers: self.workers.clone(),
            toolchain: self.config.toolchain.clone(),
            workspace: self.config.workspace_dir.clone(),
            assault_dir,
            config,
            campaign_id,
        };
        let summary = runner.run(&batch_id, cancel).await.map_err(|e| e.to_string())?;
        serde_json::to_string(&summary).map_err(|e| e.to_string())
    }

    async fn run_assault_triage(self: &Arc<Self>) -> Result<String, String> {
        let mut campaign = self.campaign.write().await;
        let assault_dir = self.assault_dir(&campaign);
        let config = campaign.assault.clone().unwrap_or_default();
        let Some(remediation_id) = phase_id_by_name(&campaign, REMEDIATION_PHASE) else {
            return Err("campaign has no remediation phase".to_string());
        };
        let summary = run_triage(
            &mut campaign,
            &remediation_id,
            &assault_dir,
            &config,
            self.llm.as_ref(),
        )
        .await
        .map_err(|e| e.to_string())?;
        self.bridge()
            .load_campaign(&campaign, &self.config)
            .map_err(|e| format!("reloading facts after triage: {e}"))?;
        self.save(&campaign).map_err(|e| e.to_string())?;
        serde_json::to_string(&summary).map_err(|e| e.to_string())
    }

    /// Apply a worker coroutine's outcome to the plan under the write lock,
    /// then emit events and (on terminal failure) consult the replanner.
    pub(crate) async fn handle_outcome(
        self: &Arc<Self>,
        phase_id: &str,
        outcome: TaskOutcome,
    ) -> Result<(), CampaignError> {
        match outcome.result {
            Ok(output) => self.complete_task(phase_id, &outcome.task_id, &output).await,
            Err(error) => self.fail_attempt(phase_id, &outcome.task_id, &error).await,
        }
    }

    async fn complete_task(
        self: &Arc<Self>,
        phase_id: &str,
        task_id: &str,
        output: &str,
    ) -> Result<(), CampaignError> {
        let bridge = self.bridge();
        {
            let mut campaign = self.campaign.write().await;
            let campaign_id = campaign.id.clone();
            if let Some(task) = campaign.task_mut(task_id) {
                task.status = TaskStatus::Completed;
                task.record_attempt(AttemptOutcome::Success, None);
                task.next_retry_at = None;
                task.last_error = None;
            }
            campaign.recount();
            let compacted =
                crate::util::truncate_output(output, self.config.task_result_entry_bytes);
            bridge.assert_task_result(task_id, "/success", &compacted)?;
            if let (Some(phase), Some(task)) = (
                campaign.phase(phase_id).cloned(),
                campaign.task(task_id).cloned(),
            ) {
                bridge.sync_task(&campaign_id, &phase, &task)?;
            }

            let needed = compute_needed_ids(&campaign);
            self.cache
                .lock()
                .expect("result cache poisoned")
                .store(task_id, output, &needed);
            self.save(&campaign)?;
        }
        self.emit(
            Event::new(EventType::TaskCompleted, format!("task {task_id} completed"))
                .with_phase(phase_id)
                .with_task(task_id),
        );
        info!(task = task_id, "task completed");
        Ok(())
    }

    async fn fail_attempt(
        self: &Arc<Self>,
        phase_id: &str,
        task_id: &str,
        error: &str,
    ) -> Result<(), CampaignError> {
        let bridge = self.bridge();
        let mut terminal = false;
        {
            let mut campaign = self.campaign.write().await;
            let campaign_id = campaign.id.clone();
            let attempts = {
                let Some(task) = campaign.task_mut(task_id) else {
                    return Ok(());
                };
                task.record_attempt(AttemptOutcome::Failure, Some(error.to_string()));
                task.last_error = Some(error.to_string());
                task.attempt_count()
            };

            let decision = decide(&self.config, attempts, error);
            match decision {
                RetryDecision::RetryAt { at, class, backoff } => {
                    if let Some(task) = campaign.task_mut(task_id) {
                        task.status = TaskStatus::Pending;
                        task.next_retry_at = Some(at);
                    }
                    bridge.assert_task_error(task_id, class.tag(), error)?;
                    warn!(
                        task = task_id,
                        attempts,
                        backoff_s = backoff.as_secs(),
                        %error,
                        "task attempt failed; backing off"
                    );
                }
                RetryDecision::GiveUp { class } => {
                    terminal = true;
                    if let Some(task) = campaign.task_mut(task_id) {
                        task.status = TaskStatus::Failed;
                        task.next_retry_at = None;
                    }
                    bridge.assert_task_error(task_id, class.tag(), error)?;
                    bridge.sync_failed_count(&campaign)?;
                    warn!(task = task_id, attempts, %error, "task exceeded max retries");
                }
            }

            campaign.recount();
            if let (Some(phase), Some(task)) = (
                campaign.phase(phase_id).cloned(),
                campaign.task(task_id).cloned(),
            ) {
                bridge.sync_task(&campaign_id, &phase, &task)?;
            }
            self.save(&campaign)?;
        }

        self.emit(
            Event::new(
                EventType::TaskFailed,
                format!("task {task_id} failed: {error}"),
            )
            .with_phase(phase_id)
            .with_task(task_id),
        );

        if terminal {
            let campaign_id = self.campaign.read().await.id.clone();
            let replan_needed = self.kernel.holds(
                "replan_needed",
                &[crate::kernel::Pattern::from(campaign_id.as_str())],
            )?;
            if replan_needed {
                self.try_replan(Some(task_id)).await;
            }
        }
        Ok(())
    }
}

//! The per-phase scheduling loop: drain results, schedule eligible tasks
//! under the adaptive concurrency cap, and gate completion on checkpoints.

use crate::errors::CampaignError;
use crate::events::{Event, EventType};
use crate::kernel::KernelExt;
use crate::model::{PhaseStatus, Task, TaskStatus, TaskType};
use crate::orchestrator::OrchestratorCore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Idle wait when no result is ready and nothing can be scheduled.
const IDLE_WAIT: Duration = Duration::from_millis(200);

/// How a phase run returned control to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseRun {
    /// All tasks done and every checkpoint passed.
    Completed,
    /// Checkpoints failed; the phase stays open for the revised plan.
    Reopened,
    /// No runnable work remains and the kernel derives a block.
    Blocked(String),
}

/// Message from a worker coroutine back to the coordinator.
pub(crate) struct TaskOutcome {
    pub task_id: String,
    pub label: String,
    pub result: Result<String, String>,
}

impl OrchestratorCore {
    /// Run one phase until it completes, reopens after a failed checkpoint,
    /// or blocks.
    pub(crate) async fn run_phase(self: &Arc<Self>, phase_id: &str) -> Result<PhaseRun, CampaignError> {
        let (result_tx, mut result_rx) = mpsc::channel::<TaskOutcome>(64);
        let mut active: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut active_types: HashMap<String, TaskType> = HashMap::new();

        loop {
            if self.cancel.is_cancelled() {
                for handle in active.values() {
                    handle.abort();
                }
                return Err(CampaignError::Cancelled);
            }

            // Drain completed results without blocking.
            while let Ok(outcome) = result_rx.try_recv() {
                active.remove(&outcome.task_id);
                active_types.remove(&outcome.task_id);
                self.remove_label(&outcome.label);
                self.handle_outcome(phase_id, outcome).await?;
            }

            // Completion gate: all tasks done and nothing in flight.
            if active.is_empty() {
                let complete = {
                    let campaign = self.campaign.read().await;
                    campaign.phase(phase_id).is_some_and(|p| p.is_complete())
                };
                if complete {
                    return self.close_phase(phase_id).await;
                }
            }

            // Schedule eligible tasks up to the adaptive limit.
            let mut spawned = 0;
            if !self.paused.load(std::sync::atomic::Ordering::SeqCst) {
                let limit = self.adaptive_limit(active_types.values().copied());
                while active.len() < limit {
                    let already = active.keys().cloned().collect::<HashSet<String>>();
                    let Some(task) = self.next_eligible(phase_id, &already).await? else {
                        break;
                    };
                    let (handle, label) =
                        self.spawn_task(phase_id, &task, result_tx.clone()).await?;
                    active_types.insert(task.id.clone(), task.task_type);
                    active.insert(task.id.clone(), handle);
                    self.push_label(&label);
                    spawned += 1;
                }
            }

            if active.is_empty() && spawned == 0 {
                // Neither active nor eligible work: blocked, or waiting on a
                // retry backoff to elapse.
                let campaign_id = self.campaign.read().await.id.clone();
                if let Some(fact) = self.kernel.query_one(
                    "campaign_blocked",
                    &[crate::kernel::Pattern::from(campaign_id.as_str())],
                )? {
                    let reason = fact
                        .args
                        .get(1)
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "blocked".to_string());
                    return Ok(PhaseRun::Blocked(reason));
                }
                tokio::time::sleep(IDLE_WAIT).await;
                continue;
            }

            // Wait briefly for the next result or new eligibility.
            match tokio::time::timeout(IDLE_WAIT, result_rx.recv()).await {
                Ok(Some(outcome)) => {
                    active.remove(&outcome.task_id);
                    active_types.remove(&outcome.task_id);
                    self.remove_label(&outcome.label);
                    self.handle_outcome(phase_id, outcome).await?;
                }
                Ok(None) | Err(_) => {}
            }
        }
    }

    /// Checkpoint the completed phase; pass closes it, failure reopens it
    /// through the replanner.
    async fn close_phase(self: &Arc<Self>, phase_id: &str) -> Result<PhaseRun, CampaignError> {
        let bridge = self.bridge();
        let runner = self.checkpoint_runner();

        // Verify against a snapshot so command execution does not hold the
        // campaign lock; the checkpoint history is merged back after.
        let mut snapshot = {
            let campaign = self.campaign.read().await;
            campaign
                .phase(phase_id)
                .cloned()
                .ok_or_else(|| CampaignError::InvalidState(format!("phase {phase_id} missing")))?
        };

        // A phase closed only through skips carries no verifiable work;
        // the checkpoint-on-fail knob decides whether to verify it anyway.
        let has_skips = snapshot
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Skipped);
        if has_skips && !self.config.checkpoint_on_fail {
            debug!(phase = phase_id, "skipping checkpoints for skip-closed phase");
            return self.finish_phase(phase_id, &bridge).await;
        }

        let report = runner.run(&mut snapshot, &bridge, &self.cancel).await?;
        {
            let mut campaign = self.campaign.write().await;
            if let Some(phase) = campaign.phase_mut(phase_id) {
                phase.checkpoints = snapshot.checkpoints.clone();
            }
        }

        if !report.all_passed() {
            let summary = report.failure_summary();
            warn!(phase = phase_id, %summary, "checkpoint failures; reopening phase");
            let campaign_id = self.campaign.read().await.id.clone();
            bridge.assert_replan_trigger(&campaign_id, "/checkpoint_failed")?;
            self.emit(
                Event::new(
                    EventType::CheckpointFailed,
                    format!("phase {phase_id} checkpoint failures: {summary}"),
                )
                .with_phase(phase_id),
            );

            let replanned = self.try_replan(None).await;
            {
                let campaign = self.campaign.read().await;
                self.save(&campaign)?;
            }
            if replanned {
                return Ok(PhaseRun::Reopened);
            }
            return Ok(PhaseRun::Blocked(format!(
                "phase {phase_id} checkpoint failures: {summary}"
            )));
        }

        // All checkpoints green: compress, close, and refine the next wave.
        self.finish_phase(phase_id, &bridge).await
    }

    /// Compress, mark completed in state and kernel, and trigger the
    /// rolling wave.
    async fn finish_phase(
        self: &Arc<Self>,
        phase_id: &str,
        bridge: &crate::facts::FactBridge,
    ) -> Result<PhaseRun, CampaignError> {
        self.compress_phase(phase_id).await;
        {
            let mut campaign = self.campaign.write().await;
            let campaign_id = campaign.id.clone();
            if let Some(phase) = campaign.phase_mut(phase_id) {
                phase.status = PhaseStatus::Completed;
                let snapshot = phase.clone();
                bridge.sync_phase(&campaign_id, &snapshot)?;
            }
            campaign.recount();
            self.save(&campaign)?;
        }
        self.emit(
            Event::new(EventType::PhaseCompleted, format!("phase {phase_id} completed"))
                .with_phase(phase_id),
        );
        info!(phase = phase_id, "phase completed");

        self.rolling_wave(phase_id).await;
        Ok(PhaseRun::Completed)
    }

    /// Invoke the correction replanner; returns whether a revision was
    /// applied. Replanner failures are soft.
    pub(crate) async fn try_replan(self: &Arc<Self>, scope: Option<&str>) -> bool {
        if !self.config.auto_replan {
            return false;
        }
        let Some(replanner) = self.replanner() else {
            warn!("replan requested but no LLM client is configured");
            return false;
        };
        let bridge = self.bridge();
        let mut campaign = self.campaign.write().await;
        match replanner
            .correct(&mut campaign, &bridge, &self.config, scope)
            .await
        {
            Ok(outcome) => {
                self.emit(Event::new(
                    EventType::ReplanTriggered,
                    format!("replan applied: {}", outcome.summary),
                ));
                true
            }
            Err(e) => {
                warn!(error = %e, "replan failed; continuing with prior plan");
                self.emit(Event::new(
                    EventType::ReplanFailed,
                    format!("replan failed: {e}"),
                ));
                false
            }
        }
    }

    /// Rolling-wave refinement after a completed phase; soft failure.
    async fn rolling_wave(self: &Arc<Self>, completed_phase_id: &str) {
        let Some(replanner) = self.replanner() else {
            return;
        };
        let bridge = self.bridge();
        let mut campaign = self.campaign.write().await;
        match replanner
            .rolling_wave(&mut campaign, &bridge, &self.config, completed_phase_id)
            .await
        {
            Ok(outcome) => {
                if outcome.added + outcome.removed + outcome.updated > 0 {
                    info!(
                        added = outcome.added,
                        removed = outcome.removed,
                        updated = outcome.updated,
                        "rolling wave refined the next phase"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "rolling-wave refinement failed");
                self.emit(Event::new(
                    EventType::ReplanFailed,
                    format!("rolling-wave refinement failed: {e}"),
                ));
            }
        }
    }

    /// Write a compacted context summary for a finished phase. Soft: errors
    /// emit `compression_error` and never block completion.
    async fn compress_phase(self: &Arc<Self>, phase_id: &str) {
        let digest = {
            let campaign = self.campaign.read().await;
            let Some(phase) = campaign.phase(phase_id) else {
                return;
            };
            phase
                .tasks
                .iter()
                .map(|t| format!("{} [{}]", t.description, t.status.as_str()))
                .collect::<Vec<_>>()
                .join("; ")
        };

        let summary = match &self.llm {
            Some(llm) => {
                let prompt = format!(
                    "Compress this phase outcome into two sentences for future context:\n{digest}"
                );
                match llm.complete(&prompt).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        self.emit(Event::new(
                            EventType::CompressionError,
                            format!("phase compression failed: {e}"),
                        ));
                        crate::util::truncate_output(&digest, 1024)
                    }
                }
            }
            None => crate::util::truncate_output(&digest, 1024),
        };

        // Anything the kernel marks for promotion becomes a durable
        // learning on the campaign.
        let promoted = self
            .kernel
            .query("promote_to_long_term", &[])
            .unwrap_or_default();

        let mut campaign = self.campaign.write().await;
        if let Some(phase) = campaign.phase_mut(phase_id) {
            phase.summary = Some(summary);
        }
        if !promoted.is_empty() {
            for fact in &promoted {
                if let Some(text) = fact.args.first() {
                    campaign
                        .learnings
                        .push(crate::model::Learning::now(text.to_string()));
                }
            }
            let _ = self.kernel.retract("promote_to_long_term", &[]);
        }
    }

    /// Adaptive concurrency limit from the currently active task mix and
    /// the optional backpressure signal.
    pub(crate) fn adaptive_limit(&self, active: impl Iterator<Item = TaskType>) -> usize {
        let base = self.config.max_parallel_tasks;
        let types: Vec<TaskType> = active.collect();

        // Serial while any high-blast-radius mutation is in flight.
        if types.iter().any(TaskType::is_high_blast_radius) {
            return 1;
        }
        let mut limit = if types.iter().any(TaskType::is_io_bound) {
            (2 * base).min(10)
        } else {
            base
        };
        if let Some(provider) = &self.backpressure {
            let utilisation = provider.utilisation();
            if utilisation > 0.8 {
                limit = 1;
            } else if utilisation > 0.5 {
                limit = (limit / 2).max(1);
            }
        }
        limit.max(1)
    }

    /// The highest-priority kernel-eligible pending task of this phase that
    /// is not already executing.
    async fn next_eligible(
        &self,
        phase_id: &str,
        exclude: &HashSet<String>,
    ) -> Result<Option<Task>, CampaignError> {
        let rows = self.kernel.query("eligible_task", &[])?;
        let campaign = self.campaign.read().await;
        let Some(phase) = campaign.phase(phase_id) else {
            return Ok(None);
        };
        let now = Utc::now();
        for row in rows {
            let task_id = row.args[0].to_string();
            if exclude.contains(&task_id) {
                continue;
            }
            if let Some(task) = phase.task(&task_id)
                && task.status == TaskStatus::Pending
                && task.retry_elapsed(now)
            {
                return Ok(Some(task.clone()));
            }
        }
        Ok(None)
    }

    /// Mark a task in-progress and spawn its worker coroutine.
    async fn spawn_task(
        self: &Arc<Self>,
        phase_id: &str,
        task: &Task,
        result_tx: mpsc::Sender<TaskOutcome>,
    ) -> Result<(JoinHandle<()>, String), CampaignError> {
        let input = self.build_task_input(task);
        let label = task
            .worker
            .clone()
            .unwrap_or_else(|| format!("{:?}", task.task_type).to_lowercase());

        {
            let mut campaign = self.campaign.write().await;
            let campaign_id = campaign.id.clone();
            let phase_snapshot = campaign
                .phase(phase_id)
                .cloned()
                .ok_or_else(|| CampaignError::InvalidState(format!("phase {phase_id} missing")))?;
            if let Some(live) = campaign.task_mut(&task.id) {
                live.status = TaskStatus::InProgress;
                let task_snapshot = live.clone();
                self.bridge()
                    .sync_task(&campaign_id, &phase_snapshot, &task_snapshot)?;
            }
        }
        self.emit(
            Event::new(EventType::TaskStarted, format!("task {} started", task.id))
                .with_phase(phase_id)
                .with_task(&task.id),
        );
        debug!(task = %task.id, %label, "task spawned");

        let core = self.clone();
        let task_clone = task.clone();
        let label_clone = label.clone();
        let cancel = self.cancel.child_token();
        let timeout = self.config.task_timeout;
        let disable_timeouts = self.config.disable_timeouts;

        let handle = tokio::spawn(async move {
            let work = core.execute_task(&task_clone, &input, &cancel);
            let result = if disable_timeouts {
                work.await
            } else {
                match tokio::time::timeout(timeout, work).await {
                    Ok(result) => result,
                    Err(_) => Err(format!(
                        "task timeout after {}s",
                        timeout.as_secs()
                    )),
                }
            };
            let _ = result_tx
                .send(TaskOutcome {
                    task_id: task_clone.id.clone(),
                    label: label_clone,
                    result,
                })
                .await;
        });
        Ok((handle, label))
    }

    fn push_label(&self, label: &str) {
        self.active_labels
            .lock()
            .expect("active label set poisoned")
            .push(label.to_string());
    }

    fn remove_label(&self, label: &str) {
        let mut labels = self.active_labels.lock().expect("active label set poisoned");
        if let Some(pos) = labels.iter().position(|l| l == label) {
            labels.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::model::{Campaign, CampaignKind};
    use crate::orchestrator::Orchestrator;

    struct FixedBackpressure(f64);

    impl crate::collaborators::Backpressure for FixedBackpressure {
        fn utilisation(&self) -> f64 {
            self.0
        }
    }

    fn core_with_backpressure(utilisation: Option<f64>) -> Arc<OrchestratorCore> {
        let campaign = Campaign::new("c1", "t", "g", CampaignKind::Feature);
        let config = OrchestratorConfig::default().with_max_parallel_tasks(3);
        let mut orchestrator = Orchestrator::new(campaign, config);
        if let Some(u) = utilisation {
            orchestrator = orchestrator.with_backpressure(Arc::new(FixedBackpressure(u)));
        }
        orchestrator.core
    }

    #[test]
    fn test_adaptive_limit_base() {
        let core = core_with_backpressure(None);
        assert_eq!(core.adaptive_limit(std::iter::empty::<TaskType>()), 3);
    }

    #[test]
    fn test_adaptive_limit_high_blast_radius_is_serial() {
        let core = core_with_backpressure(None);
        assert_eq!(
            core.adaptive_limit([TaskType::Refactor, TaskType::Research].into_iter()),
            1
        );
        assert_eq!(core.adaptive_limit([TaskType::Integrate].into_iter()), 1);
    }

    #[test]
    fn test_adaptive_limit_io_bound_raises() {
        let core = core_with_backpressure(None);
        assert_eq!(core.adaptive_limit([TaskType::Research].into_iter()), 6);
        assert_eq!(core.adaptive_limit([TaskType::TestRun].into_iter()), 6);
    }

    #[test]
    fn test_adaptive_limit_backpressure() {
        let core = core_with_backpressure(Some(0.9));
        assert_eq!(core.adaptive_limit(std::iter::empty::<TaskType>()), 1);

        // Utilisation above 0.5 halves the limit.
        let core = core_with_backpressure(Some(0.6));
        assert_eq!(core.adaptive_limit(std::iter::empty::<TaskType>()), 1);

        // Absent provider skips the adjustment entirely.
        let core = core_with_backpressure(None);
        assert_eq!(core.adaptive_limit([TaskType::Research].into_iter()), 6);
    }
}

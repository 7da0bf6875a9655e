//! Fact bridge: translate plan entities into kernel facts and keep the
//! kernel's derived view consistent as the plan mutates.
//!
//! Every mutation is bracketed by a retract of the prior tuple(s) for the
//! same primary key. Errors are fatal for the mutation; the core refuses to
//! proceed with a stale fact view.

use crate::config::OrchestratorConfig;
use crate::errors::KernelError;
use crate::fact;
use crate::kernel::{Fact, Kernel, Term};
use crate::model::{AttemptOutcome, Campaign, Phase, Task};
use chrono::Utc;
use std::sync::Arc;

/// Predicates owned by the bridge for a loaded campaign. Used to clear the
/// prior view before a full reload.
const CAMPAIGN_PREDICATES: &[&str] = &[
    "campaign",
    "campaign_goal",
    "campaign_progress",
    "campaign_phase",
    "phase_category",
    "phase_dependency",
    "phase_objective",
    "phase_estimate",
    "campaign_task",
    "task_priority",
    "task_order",
    "task_dependency",
    "task_soft_dependency",
    "requires_resource",
    "task_artifact",
    "task_retry_at",
    "task_error",
    "task_attempt",
    "context_profile",
    "context_compression",
    "campaign_config",
    "failed_campaign_task_count_computed",
];

/// Translates plan entities to facts and back under retract-then-assert
/// discipline.
pub struct FactBridge {
    kernel: Arc<dyn Kernel>,
}

impl FactBridge {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    /// Produce the flat multiset of typed tuples for a campaign.
    pub fn to_facts(campaign: &Campaign, config: &OrchestratorConfig) -> Vec<Fact> {
        let c = campaign.id.as_str();
        let mut facts = vec![
            fact!(
                "campaign",
                c,
                campaign.title.as_str(),
                campaign.kind.as_str(),
                campaign.status.as_str()
            ),
            fact!("campaign_goal", c, campaign.goal.as_str()),
            fact!(
                "campaign_progress",
                c,
                campaign.completed_tasks,
                campaign.total_tasks
            ),
            fact!(
                "campaign_config",
                c,
                "replan_threshold",
                config.replan_threshold
            ),
            fact!("campaign_config", c, "max_retries", config.max_retries),
            fact!(
                "failed_campaign_task_count_computed",
                c,
                campaign.failed_task_count()
            ),
        ];

        for phase in &campaign.phases {
            facts.extend(Self::phase_facts(c, phase));
            for task in &phase.tasks {
                facts.extend(Self::task_facts(c, phase, task));
            }
        }
        facts
    }

    fn phase_facts(campaign_id: &str, phase: &Phase) -> Vec<Fact> {
        let p = phase.id.as_str();
        let mut facts = vec![
            fact!(
                "campaign_phase",
                campaign_id,
                p,
                phase.order,
                phase.status.as_str()
            ),
            fact!("phase_category", p, phase.category.as_str()),
            fact!(
                "phase_estimate",
                p,
                phase.estimated_tasks,
                phase.complexity.as_str()
            ),
        ];
        for dep in &phase.depends_on {
            facts.push(fact!("phase_dependency", p, dep.as_str(), "hard"));
        }
        for dep in &phase.soft_depends_on {
            facts.push(fact!("phase_dependency", p, dep.as_str(), "soft"));
        }
        for (idx, objective) in phase.objectives.iter().enumerate() {
            facts.push(fact!(
                "phase_objective",
                p,
                idx,
                objective.description.as_str(),
                objective.verification.as_str()
            ));
        }
        if !phase.context_profile.is_empty() {
            facts.push(fact!("context_profile", p, phase.context_profile.as_str()));
        }
        if let Some(summary) = &phase.summary {
            facts.push(fact!("context_compression", p, summary.as_str()));
        }
        facts
    }

    fn task_facts(campaign_id: &str, phase: &Phase, task: &Task) -> Vec<Fact> {
        let t = task.id.as_str();
        let mut facts = vec![
            fact!(
                "campaign_task",
                campaign_id,
                phase.id.as_str(),
                t,
                task.status.as_str()
            ),
            fact!("task_priority", t, task.priority.as_str()),
            fact!("task_order", t, task.order),
        ];
        for dep in &task.depends_on {
            facts.push(fact!("task_dependency", t, dep.as_str()));
        }
        for dep in &task.soft_depends_on {
            facts.push(fact!("task_soft_dependency", t, dep.as_str()));
        }
        for label in &task.resources {
            facts.push(fact!("requires_resource", t, label.as_str()));
        }
        for artifact in &task.artifacts {
            facts.push(fact!(
                "task_artifact",
                t,
                format!("{:?}", artifact.kind).to_lowercase(),
                artifact.path.as_str()
            ));
        }
        if let Some(at) = task.next_retry_at {
            facts.push(fact!("task_retry_at", t, at.timestamp_millis()));
        }
        for attempt in &task.attempts {
            let outcome = match attempt.outcome {
                AttemptOutcome::Success => "success",
                AttemptOutcome::Failure => "failure",
            };
            facts.push(fact!(
                "task_attempt",
                t,
                attempt.number,
                outcome,
                attempt.timestamp.timestamp_millis()
            ));
        }
        facts
    }

    /// Replace the kernel's entire view of a campaign.
    ///
    /// Retracts every bridge-owned predicate for the campaign's entities and
    /// asserts the fresh tuples as one batch.
    pub fn load_campaign(
        &self,
        campaign: &Campaign,
        config: &OrchestratorConfig,
    ) -> Result<(), KernelError> {
        for predicate in CAMPAIGN_PREDICATES {
            // Per-entity predicates are keyed by phase/task ids that embed
            // the campaign short id, so a full clear per predicate is safe
            // here: one orchestrator owns one campaign.
            self.kernel.retract(predicate, &[])?;
        }
        self.kernel.assert_facts(&Self::to_facts(campaign, config))
    }

    /// Re-sync a single task tuple after a status or retry mutation.
    pub fn sync_task(&self, campaign_id: &str, phase: &Phase, task: &Task) -> Result<(), KernelError> {
        let key = [Term::from(task.id.as_str())];
        self.kernel.retract(
            "campaign_task",
            &[
                Term::from(campaign_id),
                Term::from(phase.id.as_str()),
                Term::from(task.id.as_str()),
            ],
        )?;
        for predicate in [
            "task_priority",
            "task_order",
            "task_dependency",
            "task_soft_dependency",
            "requires_resource",
            "task_artifact",
            "task_retry_at",
            "task_attempt",
        ] {
            self.kernel.retract(predicate, &key)?;
        }
        self.kernel.assert_facts(&Self::task_facts(campaign_id, phase, task))
    }

    /// Re-sync a single phase tuple after a status mutation.
    pub fn sync_phase(&self, campaign_id: &str, phase: &Phase) -> Result<(), KernelError> {
        self.kernel.retract(
            "campaign_phase",
            &[Term::from(campaign_id), Term::from(phase.id.as_str())],
        )?;
        let key = [Term::from(phase.id.as_str())];
        self.kernel.retract("phase_category", &key)?;
        self.kernel.retract("phase_estimate", &key)?;
        self.kernel.retract("phase_objective", &key)?;
        self.kernel.retract("phase_dependency", &key)?;
        self.kernel.retract("context_profile", &key)?;
        self.kernel.retract("context_compression", &key)?;
        self.kernel.assert_facts(&Self::phase_facts(campaign_id, phase))
    }

    /// Update the derived failed-task counter fact.
    pub fn sync_failed_count(&self, campaign: &Campaign) -> Result<(), KernelError> {
        self.kernel.retract(
            "failed_campaign_task_count_computed",
            &[Term::from(campaign.id.as_str())],
        )?;
        self.kernel.assert_facts(&[fact!(
            "failed_campaign_task_count_computed",
            campaign.id.as_str(),
            campaign.failed_task_count()
        )])
    }

    /// Record a task error classification.
    pub fn assert_task_error(
        &self,
        task_id: &str,
        class: &str,
        message: &str,
    ) -> Result<(), KernelError> {
        self.kernel.retract("task_error", &[Term::from(task_id)])?;
        self.kernel
            .assert_facts(&[fact!("task_error", task_id, class, message)])
    }

    /// Record a task result.
    pub fn assert_task_result(
        &self,
        task_id: &str,
        status: &str,
        output: &str,
    ) -> Result<(), KernelError> {
        self.kernel.retract("task_result", &[Term::from(task_id)])?;
        self.kernel
            .assert_facts(&[fact!("task_result", task_id, status, output)])
    }

    /// Assert a replan trigger.
    pub fn assert_replan_trigger(&self, campaign_id: &str, reason: &str) -> Result<(), KernelError> {
        self.kernel.assert_facts(&[fact!(
            "replan_trigger",
            campaign_id,
            reason,
            Utc::now().timestamp_millis()
        )])
    }

    /// Clear all replan triggers for a campaign once a replan has run.
    pub fn clear_replan_triggers(&self, campaign_id: &str) -> Result<(), KernelError> {
        self.kernel
            .retract("replan_trigger", &[Term::from(campaign_id)])?;
        Ok(())
    }

    /// Record a plan revision.
    pub fn assert_plan_revision(
        &self,
        campaign_id: &str,
        revision: u32,
        summary: &str,
    ) -> Result<(), KernelError> {
        self.kernel.assert_facts(&[fact!(
            "plan_revision",
            campaign_id,
            revision,
            summary,
            Utc::now().timestamp_millis()
        )])
    }

    /// Record a checkpoint outcome.
    pub fn assert_phase_checkpoint(
        &self,
        phase_id: &str,
        objective: &str,
        passed: bool,
    ) -> Result<(), KernelError> {
        self.kernel.assert_facts(&[fact!(
            "phase_checkpoint",
            phase_id,
            objective,
            i64::from(passed),
            Utc::now().timestamp_millis()
        )])
    }

    /// Refresh the heartbeat fact.
    pub fn beat(&self, campaign_id: &str) -> Result<(), KernelError> {
        self.kernel
            .retract("campaign_heartbeat", &[Term::from(campaign_id)])?;
        self.kernel.assert_facts(&[fact!(
            "campaign_heartbeat",
            campaign_id,
            Utc::now().timestamp_millis()
        )])
    }

    /// Record that a task needs a capability no registered tool provides.
    pub fn assert_missing_tool(
        &self,
        intent_id: &str,
        goal: &str,
        capability: &str,
    ) -> Result<(), KernelError> {
        self.kernel.assert_facts(&[
            fact!("missing_tool_for", intent_id, capability),
            fact!("goal_requires", goal, capability),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelExt, MemoryKernel, Pattern};
    use crate::model::{CampaignKind, Objective, TaskStatus, TaskType, VerificationMethod};

    fn sample() -> (Campaign, OrchestratorConfig) {
        let mut campaign = Campaign::new("campaign_ab12", "Auth", "ship auth", CampaignKind::Feature);
        let mut p0 = Phase::new("phase_ab12_0", &campaign.id, "Types", 0);
        p0.objectives
            .push(Objective::new("compiles", VerificationMethod::BuildPass));
        let mut t0 = Task::new("task_ab12_0_0", &p0.id, "create types", TaskType::FileCreate, 0);
        t0.resources.push("fs".to_string());
        p0.tasks.push(t0);
        let mut p1 = Phase::new("phase_ab12_1", &campaign.id, "Tests", 1);
        p1.depends_on.push(p0.id.clone());
        p1.tasks.push(
            Task::new("task_ab12_1_0", &p1.id, "write tests", TaskType::TestWrite, 0)
                .with_depends_on(vec!["task_ab12_0_0".to_string()]),
        );
        campaign.phases = vec![p0, p1];
        campaign.recount();
        (campaign, OrchestratorConfig::default())
    }

    #[test]
    fn test_to_facts_covers_indexed_predicates() {
        let (campaign, config) = sample();
        let facts = FactBridge::to_facts(&campaign, &config);
        let has = |p: &str| facts.iter().any(|f| f.predicate == p);
        for predicate in [
            "campaign",
            "campaign_goal",
            "campaign_progress",
            "campaign_phase",
            "phase_category",
            "phase_dependency",
            "phase_objective",
            "phase_estimate",
            "campaign_task",
            "task_priority",
            "task_order",
            "task_dependency",
            "requires_resource",
            "campaign_config",
            "failed_campaign_task_count_computed",
        ] {
            assert!(has(predicate), "missing predicate {predicate}");
        }
    }

    #[test]
    fn test_round_trip_identity_on_indexed_fields() {
        let (campaign, config) = sample();
        let kernel = Arc::new(MemoryKernel::new());
        let bridge = FactBridge::new(kernel.clone());
        bridge.load_campaign(&campaign, &config).unwrap();

        // Every phase and task id is queryable with its status and order.
        for phase in &campaign.phases {
            let row = kernel
                .query_one(
                    "campaign_phase",
                    &[
                        Pattern::from(campaign.id.as_str()),
                        Pattern::from(phase.id.as_str()),
                    ],
                )
                .unwrap()
                .expect("phase fact present");
            assert_eq!(row.args[2].as_int(), Some(phase.order as i64));
            assert_eq!(row.args[3].as_str(), Some(phase.status.as_str()));
            for task in &phase.tasks {
                let row = kernel
                    .query_one(
                        "campaign_task",
                        &[
                            Pattern::from(campaign.id.as_str()),
                            Pattern::from(phase.id.as_str()),
                            Pattern::from(task.id.as_str()),
                        ],
                    )
                    .unwrap()
                    .expect("task fact present");
                assert_eq!(row.args[3].as_str(), Some(task.status.as_str()));
            }
        }
    }

    #[test]
    fn test_sync_task_retracts_before_assert() {
        let (mut campaign, config) = sample();
        let kernel = Arc::new(MemoryKernel::new());
        let bridge = FactBridge::new(kernel.clone());
        bridge.load_campaign(&campaign, &config).unwrap();

        campaign.task_mut("task_ab12_0_0").unwrap().status = TaskStatus::Completed;
        let phase = campaign.phase("phase_ab12_0").unwrap().clone();
        let task = phase.task("task_ab12_0_0").unwrap();
        bridge.sync_task(&campaign.id, &phase, task).unwrap();

        let rows = kernel
            .query("campaign_task", &[Pattern::Any, Pattern::Any, Pattern::from("task_ab12_0_0")])
            .unwrap();
        // Exactly one tuple for the primary key, with the new status.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].args[3].as_str(), Some("completed"));
    }

    #[test]
    fn test_load_campaign_is_idempotent() {
        let (campaign, config) = sample();
        let kernel = Arc::new(MemoryKernel::new());
        let bridge = FactBridge::new(kernel.clone());
        bridge.load_campaign(&campaign, &config).unwrap();
        let first = kernel.query("campaign_task", &[]).unwrap().len();
        bridge.load_campaign(&campaign, &config).unwrap();
        let second = kernel.query("campaign_task", &[]).unwrap().len();
        assert_eq!(first, second);
    }

    #[test]
    fn test_heartbeat_replaces_prior_tuple() {
        let (campaign, config) = sample();
        let kernel = Arc::new(MemoryKernel::new());
        let bridge = FactBridge::new(kernel.clone());
        bridge.load_campaign(&campaign, &config).unwrap();
        bridge.beat(&campaign.id).unwrap();
        bridge.beat(&campaign.id).unwrap();
        let beats = kernel.query("campaign_heartbeat", &[]).unwrap();
        assert_eq!(beats.len(), 1);
    }
}

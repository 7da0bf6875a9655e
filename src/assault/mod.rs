//! Assault sweep: a deterministic, LLM-free campaign mode that fans out
//! per-target adversarial stages and triages failures into remediation
//! tasks.
//!
//! The sweep is an ordinary campaign with four hard-chained phases, so the
//! normal scheduler machinery drives it: Discovery populates Execution with
//! one task per batch, Execution appends JSONL results, Triage turns
//! failures into Remediation tasks, and Remediation runs under a
//! tests-pass checkpoint.

pub mod discover;
pub mod execute;
pub mod results;
pub mod triage;

use crate::collaborators::PackageLister;
use crate::errors::AssaultError;
use crate::model::{
    AssaultConfig, Campaign, CampaignKind, Objective, Phase, Task, TaskType, VerificationMethod,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

pub use discover::{BatchFile, TargetsFile, WalkingLister, discover_targets, write_batches};
pub use execute::{BatchRunner, BatchSummary};
pub use triage::{TriageReport, TriageSummary, run_triage};

/// Phase names of the sweep template, in order.
pub const DISCOVERY_PHASE: &str = "Discovery";
pub const EXECUTION_PHASE: &str = "Assault Execution";
pub const TRIAGE_PHASE: &str = "Triage";
pub const REMEDIATION_PHASE: &str = "Remediation";

/// Category tag for all sweep phases.
const ASSAULT_CATEGORY: &str = "assault";

/// Per-campaign assault state directory.
pub fn assault_dir(campaigns_dir: &Path, campaign: &Campaign) -> PathBuf {
    campaigns_dir.join(campaign.slug()).join("assault")
}

/// Build the deterministic four-phase sweep campaign.
pub fn assault_campaign(goal: &str, mut config: AssaultConfig) -> Campaign {
    config.normalise();
    let id = format!("campaign_{}", &Uuid::new_v4().simple().to_string()[..8]);
    let mut campaign = Campaign::new(&id, "Adversarial assault sweep", goal, CampaignKind::AdversarialAssault);
    let short = campaign.short_id();

    let phase_id = |i: usize| format!("phase_{short}_{i}");

    let mut discovery = Phase::new(&phase_id(0), &id, DISCOVERY_PHASE, 0).with_category(ASSAULT_CATEGORY);
    discovery.tasks.push(Task::new(
        &format!("task_{short}_0_0"),
        &phase_id(0),
        "Discover assault targets and persist batches",
        TaskType::AssaultDiscover,
        0,
    ));

    let execution = Phase::new(&phase_id(1), &id, EXECUTION_PHASE, 1)
        .with_category(ASSAULT_CATEGORY)
        .with_depends_on(vec![phase_id(0)]);

    let mut triage = Phase::new(&phase_id(2), &id, TRIAGE_PHASE, 2)
        .with_category(ASSAULT_CATEGORY)
        .with_depends_on(vec![phase_id(1)]);
    triage.tasks.push(Task::new(
        &format!("task_{short}_2_0"),
        &phase_id(2),
        "Triage assault failures into remediation tasks",
        TaskType::AssaultTriage,
        0,
    ));

    let remediation = Phase::new(&phase_id(3), &id, REMEDIATION_PHASE, 3)
        .with_category(ASSAULT_CATEGORY)
        .with_depends_on(vec![phase_id(2)])
        .with_objectives(vec![Objective::new(
            "remediated failures pass the test suite",
            VerificationMethod::TestsPass,
        )]);

    campaign.phases = vec![discovery, execution, triage, remediation];
    campaign.assault = Some(config);
    campaign.recount();
    campaign
}

/// Result of the discovery task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryOutcome {
    pub status: String,
    pub targets: usize,
    pub batches: usize,
    pub tasks_added: usize,
}

/// Find a sweep phase id by its template name.
pub fn phase_id_by_name(campaign: &Campaign, name: &str) -> Option<String> {
    campaign
        .phases
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.id.clone())
}

/// Run discovery: persist targets and batches, then inject one batch task
/// per batch into the execution phase. Idempotent.
pub fn run_discovery(
    campaign: &mut Campaign,
    lister: &dyn PackageLister,
    workspace: &Path,
    assault_dir: &Path,
) -> Result<DiscoveryOutcome, AssaultError> {
    let execution_id = phase_id_by_name(campaign, EXECUTION_PHASE)
        .ok_or_else(|| AssaultError::Discovery("campaign has no execution phase".to_string()))?;
    if !campaign
        .phase(&execution_id)
        .is_some_and(|p| p.tasks.is_empty())
    {
        return Ok(DiscoveryOutcome {
            status: "already_discovered".to_string(),
            targets: 0,
            batches: 0,
            tasks_added: 0,
        });
    }

    let config = campaign.assault.clone().unwrap_or_default();
    let targets = discover_targets(lister, workspace, &config)?;
    if targets.is_empty() {
        return Err(AssaultError::Discovery(
            "no targets survived discovery filters".to_string(),
        ));
    }
    let batches = write_batches(assault_dir, &campaign.id, &config, &targets)?;

    let short = campaign.short_id();
    let execution = campaign
        .phase_mut(&execution_id)
        .expect("execution phase present");
    for batch in &batches {
        let id = format!("task_{}_{}_{}", short, execution.order, batch.index);
        execution.tasks.push(
            Task::new(
                &id,
                &execution_id,
                &format!("Run assault batch {}", batch.batch_id),
                TaskType::AssaultBatch,
                batch.index as u32,
            )
            .with_worker_input(batch.batch_id.clone()),
        );
    }
    let tasks_added = batches.len();
    campaign.recount();
    info!(targets = targets.len(), batches = batches.len(), "discovery injected batch tasks");
    Ok(DiscoveryOutcome {
        status: "discovered".to_string(),
        targets: targets.len(),
        batches: batches.len(),
        tasks_added,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssaultScope, PhaseStatus};

    struct FixedLister(Vec<&'static str>);

    impl PackageLister for FixedLister {
        fn manifest_exists(&self, _root: &Path) -> bool {
            true
        }

        fn list_packages(&self, _root: &Path) -> anyhow::Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    #[test]
    fn test_template_shape() {
        let campaign = assault_campaign("sweep the repo", AssaultConfig::default());
        assert_eq!(campaign.kind, CampaignKind::AdversarialAssault);
        assert_eq!(campaign.phases.len(), 4);
        // Hard dependency chain.
        for window in campaign.phases.windows(2) {
            assert_eq!(window[1].depends_on, vec![window[0].id.clone()]);
        }
        assert_eq!(campaign.phases[0].tasks.len(), 1);
        assert_eq!(campaign.phases[0].tasks[0].task_type, TaskType::AssaultDiscover);
        assert!(campaign.phases[1].tasks.is_empty());
        assert_eq!(campaign.phases[2].tasks[0].task_type, TaskType::AssaultTriage);
        assert_eq!(
            campaign.phases[3].objectives[0].verification,
            VerificationMethod::TestsPass
        );
        assert_eq!(campaign.total_tasks, 2);
        assert!(campaign.phases.iter().all(|p| p.status == PhaseStatus::Pending));
    }

    #[test]
    fn test_discovery_injects_batch_tasks_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AssaultConfig {
            scope: AssaultScope::Subsystem,
            include: vec!["internal".to_string()],
            batch_size: 1,
            ..Default::default()
        };
        config.normalise();
        let mut campaign = assault_campaign("sweep", config);
        let lister = FixedLister(vec!["internal/a", "internal/a/sub", "internal/b", "cmd/x"]);

        let assault = dir.path().join("assault");
        let outcome = run_discovery(&mut campaign, &lister, dir.path(), &assault).unwrap();
        assert_eq!(outcome.status, "discovered");
        assert_eq!(outcome.targets, 2);
        assert_eq!(outcome.batches, 2);

        let execution_id = phase_id_by_name(&campaign, EXECUTION_PHASE).unwrap();
        let execution = campaign.phase(&execution_id).unwrap();
        assert_eq!(execution.tasks.len(), 2);
        assert_eq!(execution.tasks[0].task_type, TaskType::AssaultBatch);
        assert_eq!(execution.tasks[0].worker_input.as_deref(), Some("batch_0000"));

        let again = run_discovery(&mut campaign, &lister, dir.path(), &assault).unwrap();
        assert_eq!(again.status, "already_discovered");
        assert_eq!(again.tasks_added, 0);
        assert_eq!(campaign.phase(&execution_id).unwrap().tasks.len(), 2);
    }
}

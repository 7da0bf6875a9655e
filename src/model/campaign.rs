//! Campaign model: the root aggregate owned by one orchestrator instance.

use crate::errors::CampaignError;
use crate::model::assault::AssaultConfig;
use crate::model::phase::{Phase, PhaseStatus};
use crate::model::profile::ContextProfile;
use crate::model::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The kind of campaign being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CampaignKind {
    Greenfield,
    #[default]
    Feature,
    Audit,
    Migration,
    Remediation,
    AdversarialAssault,
    Custom,
}

/// Lifecycle status of a campaign.
///
/// Transitions form a directed graph; there is no way back out of
/// `Completed` or `Failed` except an explicit [`Campaign::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Planning,
    Decomposing,
    Validating,
    Active,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    /// Check whether a transition to `next` is allowed.
    pub fn can_transition(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Planning, Decomposing)
                | (Decomposing, Validating)
                | (Decomposing, Failed)
                | (Validating, Active)
                | (Validating, Failed)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Failed)
                | (Paused, Active)
                | (Paused, Failed)
        )
    }

    /// Check if the campaign is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Decomposing => "decomposing",
            Self::Validating => "validating",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl CampaignKind {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greenfield => "greenfield",
            Self::Feature => "feature",
            Self::Audit => "audit",
            Self::Migration => "migration",
            Self::Remediation => "remediation",
            Self::AdversarialAssault => "adversarial-assault",
            Self::Custom => "custom",
        }
    }
}

/// A free-text lesson recorded during the campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Learning {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The root aggregate: a goal decomposed into ordered phases of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub title: String,
    pub goal: String,
    #[serde(default)]
    pub kind: CampaignKind,
    #[serde(default)]
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    /// Context budget in tokens.
    #[serde(default)]
    pub context_budget: u64,
    /// Plan revision counter, incremented by every replan.
    #[serde(default)]
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_revision_summary: Option<String>,
    #[serde(default)]
    pub learnings: Vec<Learning>,
    #[serde(default)]
    pub context_profiles: Vec<ContextProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assault: Option<AssaultConfig>,
    /// Maintained counters; recomputed by [`Campaign::recount`].
    #[serde(default)]
    pub total_tasks: u32,
    #[serde(default)]
    pub completed_tasks: u32,
}

impl Campaign {
    /// Create an empty campaign in the planning state.
    pub fn new(id: &str, title: &str, goal: &str, kind: CampaignKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            goal: goal.to_string(),
            kind,
            status: CampaignStatus::Planning,
            created_at: now,
            updated_at: now,
            phases: Vec::new(),
            context_budget: 0,
            revision: 0,
            last_revision_summary: None,
            learnings: Vec::new(),
            context_profiles: Vec::new(),
            assault: None,
            total_tasks: 0,
            completed_tasks: 0,
        }
    }

    /// Filesystem-safe slug for per-campaign directories.
    pub fn slug(&self) -> String {
        crate::util::slugify(&self.id)
    }

    /// Short id fragment used when deriving phase and task ids.
    pub fn short_id(&self) -> String {
        let slug = self.slug();
        slug.chars().rev().take(8).collect::<Vec<_>>().into_iter().rev().collect()
    }

    /// Transition to `next`, enforcing the status graph.
    pub fn transition(&mut self, next: CampaignStatus) -> Result<(), CampaignError> {
        if !self.status.can_transition(next) {
            return Err(CampaignError::InvalidState(format!(
                "illegal status transition {:?} -> {:?} for campaign {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Explicit reset out of a terminal state, back to paused.
    pub fn reset(&mut self) {
        self.status = CampaignStatus::Paused;
        self.touch();
    }

    /// Bump the updated-at timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Look up a phase by id.
    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Look up a phase by id, mutably.
    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == phase_id)
    }

    /// The phase currently in progress, if any.
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::InProgress)
    }

    /// Find a task anywhere in the campaign.
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.phases.iter().find_map(|p| p.task(task_id))
    }

    /// Find a task anywhere in the campaign, mutably.
    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.phases.iter_mut().find_map(|p| p.task_mut(task_id))
    }

    /// Count of phases that are completed or skipped.
    pub fn completed_phases(&self) -> usize {
        self.phases.iter().filter(|p| p.status.is_done()).count()
    }

    pub fn total_phases(&self) -> usize {
        self.phases.len()
    }

    /// Count of tasks that failed terminally across all phases.
    pub fn failed_task_count(&self) -> usize {
        self.phases.iter().map(|p| p.failed_task_count()).sum()
    }

    /// Check whether every phase is completed or skipped.
    pub fn all_phases_done(&self) -> bool {
        self.phases.iter().all(|p| p.status.is_done())
    }

    /// Recompute the maintained task counters from phase contents.
    pub fn recount(&mut self) {
        self.total_tasks = self.phases.iter().map(|p| p.tasks.len() as u32).sum();
        self.completed_tasks = self
            .phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .filter(|t| t.status == TaskStatus::Completed)
            .count() as u32;
    }

    /// Record a plan revision, bumping the counter.
    pub fn record_revision(&mut self, summary: &str) -> u32 {
        self.revision += 1;
        self.last_revision_summary = Some(summary.to_string());
        self.learnings.push(Learning::now(format!(
            "revision {}: {}",
            self.revision, summary
        )));
        self.touch();
        self.revision
    }

    /// Reset every in-progress phase and task back to pending.
    ///
    /// Called on orchestrator start after a crash or stop, so that mid-flight
    /// work is rescheduled instead of stranded. Attempt history and
    /// completion state are preserved.
    pub fn reset_in_progress(&mut self) -> Vec<String> {
        let mut reset_ids = Vec::new();
        for phase in &mut self.phases {
            if phase.status == PhaseStatus::InProgress {
                phase.status = PhaseStatus::Pending;
                reset_ids.push(phase.id.clone());
            }
            for task in &mut phase.tasks {
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Pending;
                    reset_ids.push(task.id.clone());
                }
            }
        }
        if !reset_ids.is_empty() {
            self.touch();
        }
        reset_ids
    }

    /// Serialise to humanly indented JSON at `path`.
    pub fn save(&self, path: &Path) -> Result<(), CampaignError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CampaignError::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CampaignError::InvalidState(format!("serialise failed: {e}")))?;
        std::fs::write(path, json).map_err(|source| CampaignError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a campaign from `path`, re-normalising the assault config.
    pub fn load(path: &Path) -> Result<Self, CampaignError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| CampaignError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let mut campaign: Campaign =
            serde_json::from_str(&content).map_err(|source| CampaignError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(assault) = campaign.assault.as_mut() {
            assault.normalise();
        }
        Ok(campaign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::TaskType;

    fn sample_campaign() -> Campaign {
        let mut campaign = Campaign::new("campaign_ab12cd34", "Auth", "build auth", CampaignKind::Feature);
        let mut p0 = Phase::new("phase_ab12cd34_0", &campaign.id, "Types", 0);
        p0.tasks.push(Task::new(
            "task_ab12cd34_0_0",
            &p0.id,
            "create auth types",
            TaskType::FileCreate,
            0,
        ));
        let mut p1 = Phase::new("phase_ab12cd34_1", &campaign.id, "Tests", 1);
        p1.depends_on.push(p0.id.clone());
        p1.tasks.push(Task::new(
            "task_ab12cd34_1_0",
            &p1.id,
            "write auth tests",
            TaskType::TestWrite,
            0,
        ));
        campaign.phases = vec![p0, p1];
        campaign.recount();
        campaign
    }

    #[test]
    fn test_status_transition_graph() {
        use CampaignStatus::*;
        assert!(Planning.can_transition(Decomposing));
        assert!(Active.can_transition(Paused));
        assert!(Paused.can_transition(Active));
        assert!(!Completed.can_transition(Active));
        assert!(!Failed.can_transition(Active));
        assert!(!Active.can_transition(Planning));
    }

    #[test]
    fn test_transition_rejects_illegal_move() {
        let mut campaign = sample_campaign();
        campaign.status = CampaignStatus::Completed;
        assert!(campaign.transition(CampaignStatus::Active).is_err());
        campaign.reset();
        assert_eq!(campaign.status, CampaignStatus::Paused);
        assert!(campaign.transition(CampaignStatus::Active).is_ok());
    }

    #[test]
    fn test_recount() {
        let mut campaign = sample_campaign();
        assert_eq!(campaign.total_tasks, 2);
        assert_eq!(campaign.completed_tasks, 0);
        campaign.task_mut("task_ab12cd34_0_0").unwrap().status = TaskStatus::Completed;
        campaign.recount();
        assert_eq!(campaign.completed_tasks, 1);
        assert!(campaign.completed_tasks <= campaign.total_tasks);
    }

    #[test]
    fn test_completed_phases_counts_done_only() {
        let mut campaign = sample_campaign();
        assert_eq!(campaign.completed_phases(), 0);
        campaign.phases[0].status = PhaseStatus::Completed;
        campaign.phases[1].status = PhaseStatus::Skipped;
        assert_eq!(campaign.completed_phases(), 2);
        assert!(campaign.completed_phases() <= campaign.total_phases());
    }

    #[test]
    fn test_reset_in_progress() {
        let mut campaign = sample_campaign();
        campaign.phases[0].status = PhaseStatus::InProgress;
        campaign.phases[0].tasks[0].status = TaskStatus::InProgress;
        campaign.phases[0].tasks[0].record_attempt(
            crate::model::task::AttemptOutcome::Failure,
            Some("interrupted".to_string()),
        );

        let reset = campaign.reset_in_progress();
        assert_eq!(reset.len(), 2);
        assert_eq!(campaign.phases[0].status, PhaseStatus::Pending);
        assert_eq!(campaign.phases[0].tasks[0].status, TaskStatus::Pending);
        // Attempt history survives the reset.
        assert_eq!(campaign.phases[0].tasks[0].attempts.len(), 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = sample_campaign();
        campaign.record_revision("initial plan");
        let path = dir.path().join("campaigns").join("c.json");
        campaign.save(&path).unwrap();

        let loaded = Campaign::load(&path).unwrap();
        assert_eq!(loaded.id, campaign.id);
        assert_eq!(loaded.phases.len(), 2);
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.total_tasks, 2);
        assert_eq!(loaded.learnings.len(), 1);
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Campaign::load(&path),
            Err(CampaignError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_slug_and_short_id() {
        let campaign = Campaign::new("/campaign/ab-12", "t", "g", CampaignKind::Audit);
        assert_eq!(campaign.slug(), "campaign_ab_12");
        assert_eq!(campaign.short_id(), "gn_ab_12");
    }
}

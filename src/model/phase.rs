//! Phase model: an ordered grouping of tasks with objectives, verification,
//! and checkpoint history.

use crate::model::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default category bucket for phases whose planner-emitted category is
/// empty or unrecognised.
pub const DEFAULT_CATEGORY: &str = "service";

/// Status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Check if the phase counts as done for dependency purposes.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Check if the phase is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// How an objective is verified at checkpoint time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMethod {
    /// No verification; the objective is informational.
    #[default]
    None,
    /// Run the test suite; pass iff exit code 0.
    #[serde(alias = "verify-tests-pass")]
    TestsPass,
    /// Run the build; pass iff exit code 0.
    #[serde(alias = "verify-build-pass")]
    BuildPass,
    /// Delegate to a review worker and inspect the verdict text.
    Review,
    /// Always passes with an "awaiting human" detail.
    ManualReview,
}

impl VerificationMethod {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::TestsPass => "tests-pass",
            Self::BuildPass => "build-pass",
            Self::Review => "review",
            Self::ManualReview => "manual-review",
        }
    }

    /// Parse a planner-emitted method string, defaulting unknown values to
    /// `None`.
    pub fn parse_lenient(s: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .unwrap_or_default()
    }
}

/// A phase objective with its verification method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub description: String,
    #[serde(default)]
    pub verification: VerificationMethod,
}

impl Objective {
    pub fn new(description: &str, verification: VerificationMethod) -> Self {
        Self {
            description: description.to_string(),
            verification,
        }
    }
}

/// One verification outcome appended to a phase's checkpoint history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub objective: String,
    pub verification: VerificationMethod,
    pub passed: bool,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

/// An ordered grouping of tasks; the unit of checkpointing and
/// rolling-wave replanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    /// Stable id derived from the campaign id and order.
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    /// Unique order within the campaign.
    pub order: u32,
    /// Normalised category tag.
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub status: PhaseStatus,
    /// Context profile consumed by the decomposer and paging layers.
    #[serde(default)]
    pub context_profile: String,
    #[serde(default)]
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Hard dependencies on other phases by id.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Soft dependencies: ordering hints only.
    #[serde(default)]
    pub soft_depends_on: Vec<String>,
    #[serde(default)]
    pub estimated_tasks: u32,
    #[serde(default)]
    pub complexity: String,
    /// Append-only verification history.
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Compressed context summary written after completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

impl Phase {
    /// Create a pending phase.
    pub fn new(id: &str, campaign_id: &str, name: &str, order: u32) -> Self {
        Self {
            id: id.to_string(),
            campaign_id: campaign_id.to_string(),
            name: name.to_string(),
            order,
            category: DEFAULT_CATEGORY.to_string(),
            status: PhaseStatus::Pending,
            context_profile: String::new(),
            objectives: Vec::new(),
            tasks: Vec::new(),
            depends_on: Vec::new(),
            soft_depends_on: Vec::new(),
            estimated_tasks: 0,
            complexity: String::new(),
            checkpoints: Vec::new(),
            summary: None,
        }
    }

    /// Set the category, falling back to the default bucket when empty.
    pub fn with_category(mut self, category: &str) -> Self {
        self.category = normalise_category(category);
        self
    }

    /// Set the objectives.
    pub fn with_objectives(mut self, objectives: Vec<Objective>) -> Self {
        self.objectives = objectives;
        self
    }

    /// Set hard phase dependencies.
    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Look up a task by id.
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Look up a task by id, mutably.
    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// A phase is complete once every task is completed or skipped.
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_done())
    }

    /// Check whether any task remains pending or in progress.
    pub fn has_open_tasks(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
    }

    /// Pending task ids in stable order.
    pub fn pending_task_ids(&self) -> Vec<String> {
        let mut pending: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by_key(|t| (t.priority, t.order));
        pending.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Count of tasks that failed terminally.
    pub fn failed_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count()
    }

    /// Objectives that require active verification.
    pub fn verifiable_objectives(&self) -> impl Iterator<Item = &Objective> {
        self.objectives
            .iter()
            .filter(|o| o.verification != VerificationMethod::None)
    }

    /// Append a checkpoint record.
    pub fn record_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
    }

    /// The latest checkpoint for each objective, if any passed all.
    pub fn last_checkpoints_passed(&self) -> bool {
        let mut latest: std::collections::HashMap<&str, bool> = std::collections::HashMap::new();
        for cp in &self.checkpoints {
            latest.insert(cp.objective.as_str(), cp.passed);
        }
        self.verifiable_objectives()
            .all(|o| latest.get(o.description.as_str()).copied().unwrap_or(false))
    }
}

/// Normalise a planner-emitted category tag into a lowercase bucket.
pub fn normalise_category(raw: &str) -> String {
    let cleaned = raw.trim().to_lowercase().replace([' ', '/'], "-");
    if cleaned.is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        cleaned
    }
}

//! Task model: the atomic unit of work routed to one worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to run
    #[default]
    Pending,
    /// Task is currently executing
    InProgress,
    /// Task completed successfully
    Completed,
    /// Task failed terminally
    Failed,
    /// Task was skipped
    Skipped,
    /// Task is withheld by the kernel (resource or dependency conflict)
    Blocked,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Check if the task counts as done for dependency purposes.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }
}

/// The kind of work a task performs; drives handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    FileCreate,
    FileModify,
    TestWrite,
    TestRun,
    Research,
    Verify,
    ShardSpawn,
    ToolCreate,
    Refactor,
    Integrate,
    Document,
    CampaignRef,
    AssaultDiscover,
    AssaultBatch,
    AssaultTriage,
    #[default]
    Generic,
}

impl TaskType {
    /// Parse a planner-emitted type string, defaulting unknown values to
    /// `Generic`.
    pub fn parse_lenient(s: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .unwrap_or_default()
    }

    /// Tasks that mutate code serially and clamp concurrency to 1.
    pub fn is_high_blast_radius(&self) -> bool {
        matches!(self, Self::Refactor | Self::Integrate)
    }

    /// Tasks that are mostly I/O-bound and allow a wider concurrency cap.
    pub fn is_io_bound(&self) -> bool {
        matches!(self, Self::Research | Self::TestRun)
    }
}

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Parse a planner-emitted priority string, defaulting unknown values to
    /// `Normal`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One entry in a task's attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The kind of artifact a task produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    #[default]
    File,
    Directory,
    Log,
    Report,
}

/// A typed path reference produced by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Forward-slash normalised path, relative to the workspace root.
    pub path: String,
}

impl Artifact {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::File,
            path: crate::util::normalise_slashes(&path.into()),
        }
    }

    pub fn log(path: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Log,
            path: crate::util::normalise_slashes(&path.into()),
        }
    }
}

/// The atomic unit of work routed to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable id derived from (campaign short id, phase index, task index).
    pub id: String,
    /// Owning phase id.
    pub phase_id: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Stable order within the phase.
    pub order: u32,
    /// Hard dependencies: task ids that must be completed or skipped first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Soft dependencies: scheduling hints, never blocking.
    #[serde(default)]
    pub soft_depends_on: Vec<String>,
    /// Advisory semaphore-style resource labels.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Explicit worker routing; takes precedence over type dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Explicit worker input; defaults to the description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_input: Option<String>,
    /// Task ids whose cached outputs are injected into this task's input.
    #[serde(default)]
    pub context_from: Vec<String>,
    /// Sub-campaign reference for campaign-ref tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_campaign: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the task becomes eligible again; `None` means now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task.
    pub fn new(id: &str, phase_id: &str, description: &str, task_type: TaskType, order: u32) -> Self {
        Self {
            id: id.to_string(),
            phase_id: phase_id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            task_type,
            priority: TaskPriority::Normal,
            order,
            depends_on: Vec::new(),
            soft_depends_on: Vec::new(),
            resources: Vec::new(),
            worker: None,
            worker_input: None,
            context_from: Vec::new(),
            sub_campaign: None,
            artifacts: Vec::new(),
            attempts: Vec::new(),
            last_error: None,
            next_retry_at: None,
        }
    }

    /// Set hard dependencies.
    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Route to an explicit worker with an optional prepared input.
    pub fn with_worker(mut self, worker: &str, input: Option<String>) -> Self {
        self.worker = Some(worker.to_string());
        self.worker_input = input;
        self
    }

    /// Set a prepared input without routing to an explicit worker.
    pub fn with_worker_input(mut self, input: String) -> Self {
        self.worker_input = Some(input);
        self
    }

    /// Set the context injection sources.
    pub fn with_context_from(mut self, ids: Vec<String>) -> Self {
        self.context_from = ids;
        self
    }

    /// Number of attempts recorded so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Append an attempt record.
    pub fn record_attempt(&mut self, outcome: AttemptOutcome, error: Option<String>) {
        let number = self.attempt_count() + 1;
        self.attempts.push(Attempt {
            number,
            outcome,
            timestamp: Utc::now(),
            error,
        });
    }

    /// Check if all hard dependencies are satisfied given a set of done ids.
    pub fn deps_satisfied(&self, done: &std::collections::HashSet<String>) -> bool {
        self.depends_on.iter().all(|d| done.contains(d))
    }

    /// Check the backoff gate: eligible once `now` has reached
    /// `next_retry_at`, or immediately when no backoff is set.
    pub fn retry_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_none_or(|at| now >= at)
    }
}

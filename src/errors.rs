//! Typed error hierarchy for the vanguard orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `KernelError` — fact store and derivation failures
//! - `CampaignError` — orchestration, planning, and persistence failures
//! - `AssaultError` — assault sweep discovery/execution/triage failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the logic kernel seam.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Failed to assert {count} fact(s) for predicate {predicate}: {message}")]
    AssertFailed {
        predicate: String,
        count: usize,
        message: String,
    },

    #[error("Failed to retract facts for predicate {predicate}: {message}")]
    RetractFailed { predicate: String, message: String },

    #[error("Query {predicate}/{arity} failed: {message}")]
    QueryFailed {
        predicate: String,
        arity: usize,
        message: String,
    },

    #[error("Kernel backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors from campaign orchestration and persistence.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("Campaign {id} not found")]
    NotFound { id: String },

    #[error("Campaign {id} is blocked: {reason}")]
    Blocked { id: String, reason: String },

    #[error("Phase {phase_id} checkpoint failures: {summary}")]
    CheckpointFailed { phase_id: String, summary: String },

    #[error("Task {task_id} exceeded max retries ({max_retries})")]
    RetriesExhausted { task_id: String, max_retries: u32 },

    #[error("Invalid campaign state: {0}")]
    InvalidState(String),

    #[error("Failed to read campaign file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write campaign file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt campaign file at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Planner output could not be decoded: {0}")]
    PlanDecode(String),

    #[error("Campaign cancelled")]
    Cancelled,

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the assault sweep subsystem.
#[derive(Debug, Error)]
pub enum AssaultError {
    #[error("Target discovery failed: {0}")]
    Discovery(String),

    #[error("Batch {batch_id} not found under {dir}")]
    BatchNotFound { batch_id: String, dir: PathBuf },

    #[error("Failed to append result record to {path}: {source}")]
    ResultAppendFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Triage found no result files under {dir}")]
    NoResults { dir: PathBuf },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_error_blocked_carries_reason() {
        let err = CampaignError::Blocked {
            id: "campaign_1".to_string(),
            reason: "all tasks failed".to_string(),
        };
        assert!(err.to_string().contains("blocked"));
        assert!(err.to_string().contains("all tasks failed"));
    }

    #[test]
    fn campaign_error_converts_from_kernel_error() {
        let inner = KernelError::Unavailable("down".to_string());
        let err: CampaignError = inner.into();
        assert!(matches!(err, CampaignError::Kernel(_)));
    }

    #[test]
    fn retries_exhausted_message_names_task() {
        let err = CampaignError::RetriesExhausted {
            task_id: "task_ab_0_1".to_string(),
            max_retries: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("task_ab_0_1"));
        assert!(msg.contains("3"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&KernelError::Unavailable("x".into()));
        assert_std_error(&CampaignError::Cancelled);
        assert_std_error(&AssaultError::Discovery("x".into()));
    }
}

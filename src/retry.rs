//! Error taxonomy and retry backoff policy.
//!
//! A failed attempt is classified as transient (infrastructure weather) or
//! logic (the approach itself is wrong). Both retry with exponential
//! backoff, but logic errors cap at a short window so a replan can happen
//! sooner.

use crate::config::OrchestratorConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Cap applied to logic-error backoff so replans are not delayed.
const LOGIC_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Infrastructure trouble likely to clear on its own.
    Transient,
    /// The approach failed; retrying the same way is unlikely to help.
    Logic,
}

impl ErrorClass {
    /// Kernel-facing tag for `task_error` facts.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Transient => "/transient",
            Self::Logic => "/logic",
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "context deadline",
    "rate limit",
    "too many requests",
    "temporar",
    "connection",
    "unavailable",
    "network",
    "i/o",
];

/// Classify an error string as transient or logic.
pub fn classify_error(error: &str) -> ErrorClass {
    let lowered = error.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Logic
    }
}

/// Compute the backoff before attempt `attempt + 1`, given that `attempt`
/// attempts (1-based) have already failed.
///
/// `base * 2^(attempt-1)`, capped by the configured maximum; logic errors
/// are additionally capped at 30 seconds to accelerate replans.
pub fn backoff_for(config: &OrchestratorConfig, attempt: u32, class: ErrorClass) -> Duration {
    let attempt = attempt.max(1);
    let factor = 2_u32.saturating_pow(attempt - 1);
    let raw = config.retry_base_backoff.saturating_mul(factor);
    let capped = raw.min(config.retry_max_backoff);
    match class {
        ErrorClass::Logic => capped.min(LOGIC_BACKOFF_CAP),
        ErrorClass::Transient => capped,
    }
}

/// What the scheduler should do with a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Return to pending and retry no earlier than the given time.
    RetryAt {
        at: DateTime<Utc>,
        class: ErrorClass,
        backoff: Duration,
    },
    /// Attempts are exhausted; fail the task.
    GiveUp { class: ErrorClass },
}

/// Decide the fate of a task that just failed its `attempts`-th attempt.
pub fn decide(config: &OrchestratorConfig, attempts: u32, error: &str) -> RetryDecision {
    let class = classify_error(error);
    if attempts >= config.max_retries {
        return RetryDecision::GiveUp { class };
    }
    let backoff = backoff_for(config, attempts, class);
    let at = Utc::now()
        + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::seconds(30));
    RetryDecision::RetryAt { at, class, backoff }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient_markers() {
        for error in [
            "dial tcp: connection refused",
            "Request timeout after 30s",
            "rate limit exceeded",
            "429 Too Many Requests",
            "temporarily unavailable",
            "network is unreachable",
            "i/o error on socket",
            "context deadline exceeded",
        ] {
            assert_eq!(classify_error(error), ErrorClass::Transient, "{error}");
        }
    }

    #[test]
    fn test_classify_logic_by_default() {
        assert_eq!(classify_error("invalid input"), ErrorClass::Logic);
        assert_eq!(classify_error("assertion failed"), ErrorClass::Logic);
        assert_eq!(classify_error(""), ErrorClass::Logic);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = OrchestratorConfig::default();
        let b1 = backoff_for(&config, 1, ErrorClass::Transient);
        let b2 = backoff_for(&config, 2, ErrorClass::Transient);
        let b3 = backoff_for(&config, 3, ErrorClass::Transient);
        assert_eq!(b1, Duration::from_secs(5));
        assert_eq!(b2, Duration::from_secs(10));
        assert_eq!(b3, Duration::from_secs(20));

        // Monotone non-decreasing up to the cap.
        let mut prev = Duration::ZERO;
        for attempt in 1..=12 {
            let b = backoff_for(&config, attempt, ErrorClass::Transient);
            assert!(b >= prev);
            assert!(b <= config.retry_max_backoff);
            prev = b;
        }
    }

    #[test]
    fn test_logic_backoff_capped_short() {
        let config = OrchestratorConfig::default();
        let b = backoff_for(&config, 10, ErrorClass::Logic);
        assert_eq!(b, Duration::from_secs(30));
        let transient = backoff_for(&config, 10, ErrorClass::Transient);
        assert_eq!(transient, config.retry_max_backoff);
    }

    #[test]
    fn test_decide_retries_then_gives_up() {
        let config = OrchestratorConfig::default().with_max_retries(2);
        match decide(&config, 1, "connection refused") {
            RetryDecision::RetryAt { class, backoff, .. } => {
                assert_eq!(class, ErrorClass::Transient);
                assert_eq!(backoff, Duration::from_secs(5));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert!(matches!(
            decide(&config, 2, "connection refused"),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_zero_max_retries_fails_immediately() {
        let config = OrchestratorConfig::default().with_max_retries(0);
        assert!(matches!(
            decide(&config, 1, "anything"),
            RetryDecision::GiveUp { .. }
        ));
    }
}

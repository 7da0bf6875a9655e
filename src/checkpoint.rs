//! Checkpoint runner: verify phase objectives through external actions.
//!
//! Each objective with an active verification method dispatches to the
//! toolchain (tests, build), to a review worker, or to a manual-review
//! placeholder. Outcomes are appended to the phase's checkpoint history and
//! asserted as `phase_checkpoint` facts.

use crate::collaborators::{WorkerRegistry, worker_names};
use crate::config::ToolchainConfig;
use crate::errors::CampaignError;
use crate::exec::{CommandExecutor, CommandSpec};
use crate::facts::FactBridge;
use crate::model::{Checkpoint, Objective, Phase, VerificationMethod};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Result of verifying one objective.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub details: String,
}

/// Aggregate of a full checkpoint pass over a phase.
#[derive(Debug, Clone, Default)]
pub struct CheckpointReport {
    pub outcomes: Vec<Checkpoint>,
}

impl CheckpointReport {
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|c| c.passed)
    }

    /// One-line summary of the failures, for events and replan triggers.
    pub fn failure_summary(&self) -> String {
        self.outcomes
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.objective, c.details))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Textual review verdict inspection. A review fails on any of the failure
/// markers, matched case-insensitively.
pub fn review_failed(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("defeated")
        || lowered.contains("attack succeeded")
        || (lowered.contains("verdict") && lowered.contains("fail"))
}

/// Verifies phase objectives via external actions.
pub struct CheckpointRunner {
    executor: Arc<dyn CommandExecutor>,
    workers: WorkerRegistry,
    toolchain: ToolchainConfig,
    workspace: PathBuf,
    timeout: Duration,
}

impl CheckpointRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        workers: WorkerRegistry,
        toolchain: ToolchainConfig,
        workspace: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            workers,
            toolchain,
            workspace,
            timeout,
        }
    }

    /// Verify every objective of the phase with an active method, appending
    /// each outcome to the phase and asserting `phase_checkpoint` facts.
    pub async fn run(
        &self,
        phase: &mut Phase,
        bridge: &FactBridge,
        cancel: &CancellationToken,
    ) -> Result<CheckpointReport, CampaignError> {
        let mut report = CheckpointReport::default();
        let objectives: Vec<Objective> = phase.verifiable_objectives().cloned().collect();
        for objective in objectives {
            if cancel.is_cancelled() {
                return Err(CampaignError::Cancelled);
            }
            let outcome = self.verify(&objective, cancel).await;
            info!(
                phase = %phase.id,
                objective = %objective.description,
                passed = outcome.passed,
                "checkpoint verified"
            );
            let checkpoint = Checkpoint {
                objective: objective.description.clone(),
                verification: objective.verification,
                passed: outcome.passed,
                details: outcome.details,
                timestamp: Utc::now(),
            };
            bridge.assert_phase_checkpoint(
                &phase.id,
                &checkpoint.objective,
                checkpoint.passed,
            )?;
            phase.record_checkpoint(checkpoint.clone());
            report.outcomes.push(checkpoint);
        }
        Ok(report)
    }

    /// Verify one objective.
    pub async fn verify(
        &self,
        objective: &Objective,
        cancel: &CancellationToken,
    ) -> VerificationOutcome {
        match objective.verification {
            VerificationMethod::None => VerificationOutcome {
                passed: true,
                details: "no verification required".to_string(),
            },
            VerificationMethod::TestsPass => {
                self.run_toolchain(self.toolchain.test_args.clone()).await
            }
            VerificationMethod::BuildPass => {
                self.run_toolchain(self.toolchain.build_args.clone()).await
            }
            VerificationMethod::Review => self.run_review(objective, cancel).await,
            VerificationMethod::ManualReview => VerificationOutcome {
                passed: true,
                details: "awaiting human review".to_string(),
            },
        }
    }

    async fn run_toolchain(&self, mut args: Vec<String>) -> VerificationOutcome {
        args.push("./...".to_string());
        let spec = CommandSpec::new(&self.toolchain.binary, args)
            .with_cwd(self.workspace.clone())
            .with_timeout(self.timeout);
        debug!(command = %spec.display_line(), "running checkpoint command");
        let outcome = self.executor.execute(spec).await;
        VerificationOutcome {
            passed: outcome.success,
            details: if outcome.success {
                format!("exit code 0 in {}ms", outcome.duration.as_millis())
            } else {
                crate::util::truncate_output(
                    &format!(
                        "{}: {}",
                        outcome.error.as_deref().unwrap_or("failed"),
                        outcome.output()
                    ),
                    2048,
                )
            },
        }
    }

    async fn run_review(
        &self,
        objective: &Objective,
        cancel: &CancellationToken,
    ) -> VerificationOutcome {
        let Some(worker) = self.workers.get(worker_names::REVIEW) else {
            return VerificationOutcome {
                passed: false,
                details: "review worker not registered".to_string(),
            };
        };
        let input = format!(
            "Review whether the following objective has been met and give a verdict: {}",
            objective.description
        );
        match worker.run(&input, cancel).await {
            Ok(response) => {
                let passed = !review_failed(&response);
                VerificationOutcome {
                    passed,
                    details: crate::util::truncate_output(&response, 2048),
                }
            }
            Err(e) => VerificationOutcome {
                passed: false,
                details: format!("review worker error: {e}"),
            },
        }
    }
}

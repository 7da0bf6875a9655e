//! vanguard: a campaign orchestration engine.
//!
//! Decomposes a high-level goal into a directed acyclic graph of phases and
//! tasks, executes them with bounded parallelism and retries, and
//! reconciles the plan against observed reality through checkpoints,
//! replanning, and rolling-wave refinement. A deterministic assault-sweep
//! mode reuses the same scheduler to fan out per-target adversarial stages.

pub mod assault;
pub mod cache;
pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod decompose;
pub mod errors;
pub mod events;
pub mod exec;
pub mod facts;
pub mod kernel;
pub mod model;
pub mod orchestrator;
pub mod replan;
pub mod retry;
pub mod util;

pub use config::OrchestratorConfig;
pub use errors::{AssaultError, CampaignError, KernelError};
pub use model::{Campaign, CampaignKind, CampaignStatus};
pub use orchestrator::Orchestrator;

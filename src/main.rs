//! CLI entry point for the vanguard campaign orchestrator.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vanguard::collaborators::{CliLlm, LlmClient, LlmWorker, WorkerRegistry, worker_names};
use vanguard::config::OrchestratorConfig;
use vanguard::decompose::{DecomposeRequest, Decomposer, WordOverlapStore};
use vanguard::events::ProgressSnapshot;
use vanguard::kernel::MemoryKernel;
use vanguard::model::{AssaultConfig, AssaultScope, CampaignKind};
use vanguard::orchestrator::{Orchestrator, load_campaign};

#[derive(Parser)]
#[command(name = "vanguard", about = "Campaign orchestration engine", version)]
struct Cli {
    /// Workspace root the campaign operates on.
    #[arg(long, default_value = ".", global = true)]
    workspace: String,

    /// LLM CLI binary used for planning and replanning.
    #[arg(long, default_value = "claude", global = true)]
    llm_cmd: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decompose a goal into a campaign and execute it.
    Run {
        /// The goal to decompose.
        #[arg(long)]
        goal: String,
        /// Source documents (files, directories, or globs).
        #[arg(long)]
        source: Vec<String>,
        /// Campaign kind.
        #[arg(long, default_value = "feature")]
        kind: String,
        /// Maximum phases in the plan.
        #[arg(long, default_value_t = 6)]
        max_phases: usize,
    },
    /// Resume a persisted campaign by id.
    Resume {
        id: String,
    },
    /// Run a deterministic adversarial assault sweep.
    Assault {
        /// Discovery scope: repo, module, subsystem, or package.
        #[arg(long, default_value = "package")]
        scope: String,
        /// Include path prefixes.
        #[arg(long)]
        include: Vec<String>,
        /// Exclude path prefixes.
        #[arg(long)]
        exclude: Vec<String>,
        /// Targets per batch.
        #[arg(long, default_value_t = 5)]
        batch_size: usize,
        /// Sweep cycles over every target.
        #[arg(long, default_value_t = 1)]
        cycles: u32,
    },
    /// Print the persisted progress of a campaign.
    Status {
        id: String,
    },
}

fn parse_kind(kind: &str) -> CampaignKind {
    match kind {
        "greenfield" => CampaignKind::Greenfield,
        "audit" => CampaignKind::Audit,
        "migration" => CampaignKind::Migration,
        "remediation" => CampaignKind::Remediation,
        "custom" => CampaignKind::Custom,
        _ => CampaignKind::Feature,
    }
}

fn parse_scope(scope: &str) -> AssaultScope {
    match scope {
        "repo" => AssaultScope::Repo,
        "module" => AssaultScope::Module,
        "subsystem" => AssaultScope::Subsystem,
        _ => AssaultScope::Package,
    }
}

fn default_registry(llm: &Arc<dyn LlmClient>) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register(Arc::new(LlmWorker::new(
        worker_names::SHARD,
        "You are a code-mutation worker. Apply the requested change and report what you did.",
        llm.clone(),
    )));
    registry.register(Arc::new(LlmWorker::new(
        worker_names::RESEARCH,
        "You are a research worker. Investigate and report findings concisely.",
        llm.clone(),
    )));
    registry.register(Arc::new(LlmWorker::new(
        worker_names::REVIEW,
        "You are an adversarial reviewer. Probe for weaknesses and give a verdict.",
        llm.clone(),
    )));
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::new(&cli.workspace);
    let llm: Arc<dyn LlmClient> = Arc::new(CliLlm::new(&cli.llm_cmd, vec!["-p".to_string()]));

    match cli.command {
        Command::Run {
            goal,
            source,
            kind,
            max_phases,
        } => {
            let kernel = Arc::new(MemoryKernel::new());
            let registry = default_registry(&llm);
            let store = Arc::new(WordOverlapStore::default());
            let decomposer = Decomposer::new(llm.clone(), store, kernel.clone(), config.clone())
                .with_workers(registry.names());
            let mut request = DecomposeRequest::new(&goal, parse_kind(&kind)).with_sources(source);
            request.max_phases = max_phases;
            let campaign = decomposer.decompose(request).await?;
            info!(campaign = %campaign.id, phases = campaign.phases.len(), "plan ready; executing");

            let orchestrator = Orchestrator::new(campaign, config)
                .with_kernel(kernel)
                .with_workers(registry)
                .with_llm(llm);
            let status = orchestrator.run().await?;
            info!(?status, "campaign finished");
        }
        Command::Resume { id } => {
            let campaign = load_campaign(&config, &id)?;
            info!(campaign = %campaign.id, "resuming campaign");
            let registry = default_registry(&llm);
            let orchestrator = Orchestrator::new(campaign, config)
                .with_workers(registry)
                .with_llm(llm);
            let status = orchestrator.run().await?;
            info!(?status, "campaign finished");
        }
        Command::Assault {
            scope,
            include,
            exclude,
            batch_size,
            cycles,
        } => {
            let mut assault = AssaultConfig {
                scope: parse_scope(&scope),
                include,
                exclude,
                batch_size,
                cycles,
                ..Default::default()
            };
            assault.normalise();
            let campaign =
                vanguard::assault::assault_campaign("adversarial assault sweep", assault);
            info!(campaign = %campaign.id, "assault campaign created");

            let orchestrator = Orchestrator::new(campaign, config)
                .with_workers(default_registry(&llm))
                .with_llm(llm);
            let status = orchestrator.run().await?;
            info!(?status, "assault sweep finished");
        }
        Command::Status { id } => {
            let campaign = load_campaign(&config, &id)
                .with_context(|| format!("loading campaign {id}"))?;
            let snapshot = ProgressSnapshot::of(&campaign, Vec::new(), 0.0);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            if campaign.phases.is_empty() {
                bail!("campaign {id} has no phases");
            }
        }
    }
    Ok(())
}

//! Execution orchestrator: one coordinator loop per campaign, worker
//! coroutines per active task, and durability tickers, all sharing one
//! cancellation tree.
//!
//! The orchestrator exclusively owns the in-memory campaign behind a
//! read-write lock; the kernel holds the derived view. All plan mutation
//! happens under the write lock and is mirrored into the kernel through the
//! fact bridge, retract-then-assert.

mod durability;
mod handlers;
mod phase_loop;

use crate::cache::TaskResultCache;
use crate::checkpoint::CheckpointRunner;
use crate::collaborators::{
    Backpressure, ContextPager, LlmClient, PackageLister, WorkerRegistry,
};
use crate::config::OrchestratorConfig;
use crate::errors::CampaignError;
use crate::events::{Event, EventBus, EventType, ProgressSnapshot};
use crate::exec::{CommandExecutor, TokioExecutor};
use crate::facts::FactBridge;
use crate::kernel::{Kernel, KernelExt, MemoryKernel, Pattern};
use crate::model::{Campaign, CampaignStatus, PhaseStatus};
use crate::replan::Replanner;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use durability::{list_campaigns, load_campaign};
pub use phase_loop::PhaseRun;

/// Shared state cloned into every coroutine the orchestrator spawns.
pub(crate) struct OrchestratorCore {
    pub config: OrchestratorConfig,
    pub campaign: RwLock<Campaign>,
    pub kernel: Arc<dyn Kernel>,
    pub workers: WorkerRegistry,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub executor: Arc<dyn CommandExecutor>,
    pub bus: Arc<EventBus>,
    pub cache: Mutex<TaskResultCache>,
    pub backpressure: Option<Arc<dyn Backpressure>>,
    pub pager: Option<Arc<dyn ContextPager>>,
    pub lister: Arc<dyn PackageLister>,
    pub cancel: CancellationToken,
    pub paused: AtomicBool,
    /// Worker labels of currently executing tasks, for progress snapshots.
    pub active_labels: Mutex<Vec<String>>,
}

impl OrchestratorCore {
    pub fn bridge(&self) -> FactBridge {
        FactBridge::new(self.kernel.clone())
    }

    pub fn checkpoint_runner(&self) -> CheckpointRunner {
        CheckpointRunner::new(
            self.executor.clone(),
            self.workers.clone(),
            self.config.toolchain.clone(),
            self.config.workspace_dir.clone(),
            self.config.task_timeout,
        )
    }

    pub fn replanner(&self) -> Option<Replanner> {
        self.llm.clone().map(Replanner::new)
    }

    /// Path of the serialised campaign file.
    pub fn campaign_path(&self, campaign: &Campaign) -> PathBuf {
        self.config
            .campaigns_dir()
            .join(format!("{}.json", campaign.slug()))
    }

    /// Per-campaign assault state directory.
    pub fn assault_dir(&self, campaign: &Campaign) -> PathBuf {
        crate::assault::assault_dir(&self.config.campaigns_dir(), campaign)
    }

    /// Persist a campaign snapshot. Callers hold the write lock, so the
    /// snapshot cannot move under us.
    pub fn save(&self, campaign: &Campaign) -> Result<(), CampaignError> {
        campaign.save(&self.campaign_path(campaign))
    }

    pub fn emit(&self, event: Event) {
        self.bus.emit(event);
    }

    /// Emit a progress snapshot from the current campaign state.
    pub async fn emit_progress(&self) {
        let campaign = self.campaign.read().await;
        let labels = self
            .active_labels
            .lock()
            .expect("active label set poisoned")
            .clone();
        let utilisation = if campaign.context_budget == 0 {
            0.0
        } else {
            // Rough proxy: cached entries against the token budget.
            let cached = self.cache.lock().expect("result cache poisoned").len() as f64;
            (cached / campaign.context_budget as f64).min(1.0)
        };
        self.bus
            .emit_progress(ProgressSnapshot::of(&campaign, labels, utilisation));
    }
}

/// Builder-style entry point for running campaigns.
pub struct Orchestrator {
    core: Arc<OrchestratorCore>,
}

impl Orchestrator {
    /// Create an orchestrator owning `campaign`, with in-memory kernel and
    /// tokio executor defaults.
    pub fn new(campaign: Campaign, config: OrchestratorConfig) -> Self {
        let cache = TaskResultCache::new(
            config.task_result_cache_limit,
            config.task_result_entry_bytes,
        );
        Self {
            core: Arc::new(OrchestratorCore {
                campaign: RwLock::new(campaign),
                kernel: Arc::new(MemoryKernel::new()),
                workers: WorkerRegistry::new(),
                llm: None,
                executor: Arc::new(TokioExecutor),
                bus: Arc::new(EventBus::disconnected()),
                cache: Mutex::new(cache),
                backpressure: None,
                pager: None,
                lister: Arc::new(crate::assault::WalkingLister::default()),
                cancel: CancellationToken::new(),
                paused: AtomicBool::new(false),
                active_labels: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    fn core_mut(&mut self) -> &mut OrchestratorCore {
        Arc::get_mut(&mut self.core).expect("configure the orchestrator before running it")
    }

    pub fn with_kernel(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.core_mut().kernel = kernel;
        self
    }

    pub fn with_workers(mut self, workers: WorkerRegistry) -> Self {
        self.core_mut().workers = workers;
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.core_mut().llm = Some(llm);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.core_mut().executor = executor;
        self
    }

    pub fn with_backpressure(mut self, provider: Arc<dyn Backpressure>) -> Self {
        self.core_mut().backpressure = Some(provider);
        self
    }

    pub fn with_pager(mut self, pager: Arc<dyn ContextPager>) -> Self {
        self.core_mut().pager = Some(pager);
        self
    }

    pub fn with_lister(mut self, lister: Arc<dyn PackageLister>) -> Self {
        self.core_mut().lister = lister;
        self
    }

    /// The notification bus; attach receivers before calling [`Self::run`].
    pub fn bus(&self) -> Arc<EventBus> {
        self.core.bus.clone()
    }

    /// Cancellation token for the whole campaign.
    pub fn cancel_token(&self) -> CancellationToken {
        self.core.cancel.clone()
    }

    /// Pause scheduling cooperatively; in-flight tasks finish.
    pub fn pause(&self) {
        self.core.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.core.paused.store(false, Ordering::SeqCst);
    }

    /// Cancel, persist, and close the notification channels.
    pub async fn stop(&self) -> Result<(), CampaignError> {
        self.core.cancel.cancel();
        let mut campaign = self.core.campaign.write().await;
        if campaign.status == CampaignStatus::Active {
            campaign.transition(CampaignStatus::Paused)?;
        }
        self.core.save(&campaign)?;
        self.core.bus.close();
        Ok(())
    }

    /// Drive the campaign to a terminal state (or cancellation).
    pub async fn run(&self) -> Result<CampaignStatus, CampaignError> {
        let core = self.core.clone();

        // Cold-start recovery and activation under the write lock.
        {
            let mut campaign = core.campaign.write().await;
            let reset = campaign.reset_in_progress();
            if !reset.is_empty() {
                info!(count = reset.len(), "reset in-progress entities to pending");
            }
            activate(&mut campaign)?;
            core.bridge().load_campaign(&campaign, &core.config)?;
            core.save(&campaign)?;
        }

        // Campaign-level deadline cancels the shared root token.
        let deadline_guard = if core.config.disable_timeouts {
            None
        } else {
            let cancel = core.cancel.clone();
            let timeout = core.config.campaign_timeout;
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!("campaign deadline reached; cancelling");
                cancel.cancel();
            }))
        };

        let durability = tokio::spawn(durability::run_tickers(core.clone()));

        let result = self.coordinate().await;

        durability.abort();
        if let Some(guard) = deadline_guard {
            guard.abort();
        }

        match result {
            Ok(status) => Ok(status),
            Err(CampaignError::Cancelled) => {
                let mut campaign = self.core.campaign.write().await;
                if campaign.status == CampaignStatus::Active {
                    campaign.transition(CampaignStatus::Paused)?;
                }
                self.core.save(&campaign)?;
                self.core.bus.close();
                Err(CampaignError::Cancelled)
            }
            Err(e) => {
                let mut campaign = self.core.campaign.write().await;
                if !campaign.status.is_terminal() {
                    campaign.status = CampaignStatus::Failed;
                    campaign.touch();
                }
                self.core.save(&campaign)?;
                Err(e)
            }
        }
    }

    /// The coordinator loop: derive the current phase, open the next
    /// eligible one, and run it to a pause point.
    async fn coordinate(&self) -> Result<CampaignStatus, CampaignError> {
        let core = &self.core;
        let mut last_phase: Option<String> = None;

        loop {
            if core.cancel.is_cancelled() {
                return Err(CampaignError::Cancelled);
            }
            if core.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }

            let current = core.kernel.query_one("current_phase", &[])?;
            let phase_id = match current {
                Some(fact) => fact.args[0].to_string(),
                None => {
                    let campaign_done = {
                        let campaign = core.campaign.read().await;
                        campaign.all_phases_done()
                    };
                    if campaign_done {
                        let mut campaign = core.campaign.write().await;
                        campaign.transition(CampaignStatus::Completed)?;
                        campaign.recount();
                        core.save(&campaign)?;
                        core.emit(Event::new(
                            EventType::CampaignCompleted,
                            format!("campaign {} completed", campaign.id),
                        ));
                        info!(campaign = %campaign.id, "campaign completed");
                        return Ok(CampaignStatus::Completed);
                    }
                    if let Some(blocked) = self.blocked_reason().await? {
                        return self.fail_blocked(&blocked).await;
                    }
                    match core.kernel.query_one("phase_eligible", &[])? {
                        Some(fact) => {
                            let id = fact.args[0].to_string();
                            self.open_phase(&id).await?;
                            id
                        }
                        None => {
                            // Nothing runnable yet; re-derive shortly.
                            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                            continue;
                        }
                    }
                }
            };

            if last_phase.as_deref() != Some(phase_id.as_str()) {
                self.page_context(&phase_id).await;
                last_phase = Some(phase_id.clone());
            }

            match core.run_phase(&phase_id).await? {
                PhaseRun::Completed | PhaseRun::Reopened => continue,
                PhaseRun::Blocked(reason) => return self.fail_blocked(&reason).await,
            }
        }
    }

    async fn blocked_reason(&self) -> Result<Option<String>, CampaignError> {
        let campaign_id = self.core.campaign.read().await.id.clone();
        Ok(self
            .core
            .kernel
            .query_one("campaign_blocked", &[Pattern::from(campaign_id.as_str())])?
            .and_then(|f| f.args.get(1).map(|t| t.to_string())))
    }

    async fn fail_blocked(&self, reason: &str) -> Result<CampaignStatus, CampaignError> {
        let mut campaign = self.core.campaign.write().await;
        let id = campaign.id.clone();
        campaign.status = CampaignStatus::Failed;
        campaign.touch();
        self.core.save(&campaign)?;
        self.core.emit(Event::new(
            EventType::CampaignBlocked,
            format!("campaign blocked: {reason}"),
        ));
        warn!(campaign = %id, %reason, "campaign blocked");
        Err(CampaignError::Blocked {
            id,
            reason: reason.to_string(),
        })
    }

    /// Transition an eligible phase to in-progress, in state and kernel.
    async fn open_phase(&self, phase_id: &str) -> Result<(), CampaignError> {
        let core = &self.core;
        let mut campaign = core.campaign.write().await;
        let campaign_id = campaign.id.clone();
        let Some(phase) = campaign.phase_mut(phase_id) else {
            return Err(CampaignError::InvalidState(format!(
                "eligible phase {phase_id} not in campaign"
            )));
        };
        phase.status = PhaseStatus::InProgress;
        let snapshot = phase.clone();
        core.bridge().sync_phase(&campaign_id, &snapshot)?;
        campaign.touch();
        core.emit(
            Event::new(
                EventType::PhaseStarted,
                format!("phase {} started", snapshot.name),
            )
            .with_phase(phase_id),
        );
        info!(phase = phase_id, name = %snapshot.name, "phase opened");
        Ok(())
    }

    /// Integrate a newly arrived requirement into the phase with the given
    /// order. Safe to call while the campaign runs; the plan mutation
    /// happens under the write lock and the fact view is reloaded.
    pub async fn integrate_requirement(
        &self,
        phase_order: u32,
        requirement: &str,
    ) -> Result<(), CampaignError> {
        let core = &self.core;
        core.emit(Event::new(
            EventType::NewRequirementReceived,
            format!("new requirement: {requirement}"),
        ));
        let Some(replanner) = core.replanner() else {
            core.emit(Event::new(
                EventType::NewRequirementFailed,
                "no LLM client configured for requirement integration".to_string(),
            ));
            return Err(CampaignError::InvalidState(
                "requirement integration needs an LLM client".to_string(),
            ));
        };

        let bridge = core.bridge();
        let mut campaign = core.campaign.write().await;
        match replanner
            .integrate_requirement(&mut campaign, &bridge, &core.config, phase_order, requirement)
            .await
        {
            Ok(outcome) => {
                core.save(&campaign)?;
                core.emit(Event::new(
                    EventType::NewRequirementIntegrated,
                    format!("requirement integrated: {}", outcome.summary),
                ));
                Ok(())
            }
            Err(e) => {
                core.emit(Event::new(
                    EventType::NewRequirementFailed,
                    format!("requirement integration failed: {e}"),
                ));
                Err(CampaignError::Other(e))
            }
        }
    }

    /// Advisory context paging on phase entry; failures never block.
    async fn page_context(&self, phase_id: &str) {
        let Some(pager) = &self.core.pager else { return };
        let (phase, upcoming) = {
            let campaign = self.core.campaign.read().await;
            let Some(phase) = campaign.phase(phase_id) else {
                return;
            };
            let upcoming: Vec<crate::model::Task> = phase
                .tasks
                .iter()
                .filter(|t| t.status == crate::model::TaskStatus::Pending)
                .cloned()
                .collect();
            (phase.clone(), upcoming)
        };
        if let Err(e) = pager.activate(&phase).await {
            warn!(error = %e, phase = phase_id, "context pager activate failed");
        }
        if let Err(e) = pager.prefetch(&upcoming).await {
            warn!(error = %e, phase = phase_id, "context pager prefetch failed");
        }
    }
}

/// Step a campaign's status forward to active through the allowed chain.
fn activate(campaign: &mut Campaign) -> Result<(), CampaignError> {
    loop {
        match campaign.status {
            CampaignStatus::Active => return Ok(()),
            CampaignStatus::Planning => campaign.transition(CampaignStatus::Decomposing)?,
            CampaignStatus::Decomposing => campaign.transition(CampaignStatus::Validating)?,
            CampaignStatus::Validating | CampaignStatus::Paused => {
                campaign.transition(CampaignStatus::Active)?
            }
            CampaignStatus::Completed | CampaignStatus::Failed => {
                return Err(CampaignError::InvalidState(format!(
                    "campaign {} is already terminal ({})",
                    campaign.id,
                    campaign.status.as_str()
                )));
            }
        }
    }
}

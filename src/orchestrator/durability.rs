//! Durability: heartbeat and autosave tickers, plus campaign-file helpers
//! for cold starts.

use crate::config::OrchestratorConfig;
use crate::errors::CampaignError;
use crate::model::Campaign;
use crate::orchestrator::OrchestratorCore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Background coroutine: every heartbeat interval emit a progress snapshot
/// and refresh the `campaign_heartbeat` fact; every autosave interval
/// serialise the campaign under the write lock. Runs until the root token
/// cancels.
pub(crate) async fn run_tickers(core: Arc<OrchestratorCore>) {
    let mut heartbeat = tokio::time::interval(core.config.heartbeat_interval);
    let mut autosave = tokio::time::interval(core.config.autosave_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    autosave.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => {
                debug!("durability tickers stopping");
                break;
            }
            _ = heartbeat.tick() => {
                core.emit_progress().await;
                let campaign_id = core.campaign.read().await.id.clone();
                if let Err(e) = core.bridge().beat(&campaign_id) {
                    warn!(error = %e, "heartbeat fact refresh failed");
                }
            }
            _ = autosave.tick() => {
                let campaign = core.campaign.write().await;
                if let Err(e) = core.save(&campaign) {
                    warn!(error = %e, "autosave failed");
                }
            }
        }
    }
}

/// Paths of every persisted campaign file under the configured state
/// directory.
pub fn list_campaigns(config: &OrchestratorConfig) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(config.campaigns_dir()) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();
    paths
}

/// Load a persisted campaign by id, re-normalising and resetting in-flight
/// state so a resumed run behaves like a cold start.
pub fn load_campaign(config: &OrchestratorConfig, id: &str) -> Result<Campaign, CampaignError> {
    let path = config
        .campaigns_dir()
        .join(format!("{}.json", crate::util::slugify(id)));
    if !path.is_file() {
        return Err(CampaignError::NotFound { id: id.to_string() });
    }
    let mut campaign = Campaign::load(&path)?;
    campaign.reset_in_progress();
    Ok(campaign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CampaignKind, Phase, PhaseStatus, Task, TaskStatus, TaskType};

    #[test]
    fn test_load_campaign_resets_in_flight_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::new(dir.path());

        let mut campaign = Campaign::new("campaign_dur1", "D", "goal", CampaignKind::Feature);
        let mut phase = Phase::new("phase_dur1_0", &campaign.id, "Build", 0);
        phase.status = PhaseStatus::InProgress;
        let mut task = Task::new("task_dur1_0_0", &phase.id, "work", TaskType::Generic, 0);
        task.status = TaskStatus::InProgress;
        task.record_attempt(crate::model::AttemptOutcome::Failure, Some("cut".to_string()));
        phase.tasks.push(task);
        campaign.phases.push(phase);
        campaign.recount();
        campaign
            .save(&config.campaigns_dir().join("campaign_dur1.json"))
            .unwrap();

        let loaded = load_campaign(&config, "campaign_dur1").unwrap();
        assert_eq!(loaded.phases[0].status, PhaseStatus::Pending);
        assert_eq!(loaded.phases[0].tasks[0].status, TaskStatus::Pending);
        // Attempt history survives, completion state is untouched.
        assert_eq!(loaded.phases[0].tasks[0].attempts.len(), 1);

        assert!(matches!(
            load_campaign(&config, "missing"),
            Err(CampaignError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_campaigns() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::new(dir.path());
        assert!(list_campaigns(&config).is_empty());

        let campaign = Campaign::new("campaign_a", "A", "g", CampaignKind::Feature);
        campaign
            .save(&config.campaigns_dir().join("campaign_a.json"))
            .unwrap();
        std::fs::write(config.campaigns_dir().join("notes.txt"), "x").unwrap();
        assert_eq!(list_campaigns(&config).len(), 1);
    }
}

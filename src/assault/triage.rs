//! Failure triage: scan assault results, summarise failures, and generate
//! remediation tasks.
//!
//! The LLM is asked for a remediation plan against a strict schema; when it
//! is absent, declines, or returns nothing usable, a deterministic generator
//! produces one code-mutation task per failure instead.

use crate::assault::results::scan_results_dir;
use crate::collaborators::{LlmClient, worker_names};
use crate::errors::AssaultError;
use crate::model::{Artifact, AssaultConfig, AssaultRecord, Campaign, Task, TaskPriority, TaskType};
use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Failures included in the LLM summary, most recent first.
const SUMMARY_FAILURE_CAP: usize = 20;

/// Persisted triage report (`triage_<ts>.json` and `latest.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageReport {
    pub campaign_id: String,
    pub generated_at: chrono::DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub remediation: Vec<RemediationEntry>,
}

/// One remediation task proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationEntry {
    pub description: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub priority: String,
}

#[derive(Debug, Deserialize)]
struct RemediationPlan {
    #[serde(default)]
    tasks: Vec<RemediationEntry>,
}

/// Outcome of a triage pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageSummary {
    pub status: String,
    pub total: usize,
    pub failed: usize,
    pub tasks_added: usize,
}

/// Scan all results, build remediation tasks, and append them to the
/// remediation phase. Idempotent: a remediation phase that already has
/// tasks is left untouched.
pub async fn run_triage(
    campaign: &mut Campaign,
    remediation_phase_id: &str,
    assault_dir: &Path,
    config: &AssaultConfig,
    llm: Option<&Arc<dyn LlmClient>>,
) -> Result<TriageSummary, AssaultError> {
    let Some(phase) = campaign.phase(remediation_phase_id) else {
        return Err(AssaultError::Discovery(format!(
            "remediation phase {remediation_phase_id} not found"
        )));
    };
    if !phase.tasks.is_empty() {
        return Ok(TriageSummary {
            status: "already_triaged".to_string(),
            total: 0,
            failed: 0,
            tasks_added: 0,
        });
    }

    let results_dir = assault_dir.join("results");
    let records = scan_results_dir(&results_dir);
    if records.is_empty() {
        return Err(AssaultError::NoResults { dir: results_dir });
    }

    let total = records.len();
    let passed = records.iter().filter(|r| r.passed()).count();
    let mut failures: Vec<&AssaultRecord> = records.iter().filter(|r| !r.passed()).collect();
    failures.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    failures.truncate(SUMMARY_FAILURE_CAP);

    let mut remediation = if failures.is_empty() {
        Vec::new()
    } else {
        match llm.filter(|_| config.llm_triage) {
            Some(llm) => match ask_llm(llm, &failures).await {
                Ok(entries) if !entries.is_empty() => entries,
                Ok(_) => deterministic_plan(&failures),
                Err(e) => {
                    warn!(error = %e, "LLM triage failed; using deterministic plan");
                    deterministic_plan(&failures)
                }
            },
            None => deterministic_plan(&failures),
        }
    };
    remediation.truncate(config.max_remediation_tasks);

    let report = TriageReport {
        campaign_id: campaign.id.clone(),
        generated_at: Utc::now(),
        total,
        passed,
        failed: total - passed,
        remediation: remediation.clone(),
    };
    persist_report(assault_dir, &report)?;

    let added = append_remediation_tasks(campaign, remediation_phase_id, &remediation);
    campaign.recount();
    info!(total, failed = report.failed, added, "triage complete");
    Ok(TriageSummary {
        status: "triaged".to_string(),
        total,
        failed: report.failed,
        tasks_added: added,
    })
}

async fn ask_llm(
    llm: &Arc<dyn LlmClient>,
    failures: &[&AssaultRecord],
) -> anyhow::Result<Vec<RemediationEntry>> {
    let mut prompt = String::from(
        "Assault stages failed against the targets below. Propose remediation \
         tasks as JSON: {\"tasks\": [{\"description\": string, \"target\": string, \
         \"log_path\": string, \"priority\": \"critical\"|\"high\"|\"normal\"|\"low\"}]}.\n\n",
    );
    for failure in failures {
        prompt.push_str(&format!(
            "{} stage={} cycle={} attempt={} exit={}{} log={}\n",
            failure.target,
            failure.stage.as_str(),
            failure.cycle,
            failure.attempt,
            failure.exit_code,
            failure
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default(),
            failure.log_path,
        ));
    }
    let response = llm.complete(&prompt).await?;
    let json = crate::util::extract_json_value(crate::util::strip_code_fences(&response))
        .context("no JSON in triage response")?;
    let plan: RemediationPlan =
        serde_json::from_str(&json).context("triage response did not match schema")?;
    Ok(plan.tasks)
}

/// Deterministic fallback: one code-mutation task per failure, referencing
/// the captured log.
fn deterministic_plan(failures: &[&AssaultRecord]) -> Vec<RemediationEntry> {
    failures
        .iter()
        .map(|failure| RemediationEntry {
            description: format!(
                "Fix {} failure on {} (cycle {}, attempt {}); see captured log",
                failure.stage.as_str(),
                failure.target,
                failure.cycle,
                failure.attempt
            ),
            target: failure.target.clone(),
            log_path: failure.log_path.clone(),
            priority: "high".to_string(),
        })
        .collect()
}

fn persist_report(assault_dir: &Path, report: &TriageReport) -> Result<(), AssaultError> {
    let triage_dir = assault_dir.join("triage");
    std::fs::create_dir_all(&triage_dir)
        .with_context(|| format!("creating {}", triage_dir.display()))
        .map_err(AssaultError::Other)?;
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| AssaultError::Discovery(format!("report serialise failed: {e}")))?;
    let stamped = triage_dir.join(format!(
        "triage_{}.json",
        report.generated_at.format("%Y%m%dT%H%M%S")
    ));
    std::fs::write(&stamped, &json)
        .with_context(|| format!("writing {}", stamped.display()))
        .map_err(AssaultError::Other)?;
    std::fs::write(triage_dir.join("latest.json"), &json)
        .with_context(|| "writing latest.json")
        .map_err(AssaultError::Other)
}

fn append_remediation_tasks(
    campaign: &mut Campaign,
    phase_id: &str,
    entries: &[RemediationEntry],
) -> usize {
    let short = campaign.short_id();
    let Some(phase) = campaign.phase_mut(phase_id) else {
        return 0;
    };
    let mut added = 0;
    for entry in entries {
        let index = phase.tasks.len();
        let id = format!("task_{}_{}_{}", short, phase.order, index);
        let mut task = Task::new(
            &id,
            phase_id,
            &entry.description,
            TaskType::ShardSpawn,
            index as u32,
        )
        .with_priority(TaskPriority::parse_lenient(&entry.priority))
        .with_worker(worker_names::SHARD, Some(entry.description.clone()));
        if !entry.log_path.is_empty() {
            task.artifacts.push(Artifact::log(entry.log_path.clone()));
        }
        phase.tasks.push(task);
        added += 1;
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assault::results::append_record;
    use crate::model::{CampaignKind, Phase, StageKind};
    use async_trait::async_trait;

    fn record(cycle: u32, exit_code: i32, target: &str) -> AssaultRecord {
        AssaultRecord {
            campaign_id: "c".to_string(),
            batch_id: "batch_0000".to_string(),
            target: target.to_string(),
            cycle,
            stage: StageKind::Test,
            attempt: 1,
            started_at: Utc::now(),
            duration_ms: 3,
            exit_code,
            killed: false,
            kill_reason: None,
            truncated: false,
            log_path: format!("logs/batch_0000/test_{cycle}.log"),
            error: if exit_code == 0 {
                None
            } else {
                Some(format!("exit code {exit_code}"))
            },
        }
    }

    fn campaign_with_remediation() -> Campaign {
        let mut campaign =
            Campaign::new("campaign_as1", "Sweep", "sweep", CampaignKind::AdversarialAssault);
        campaign
            .phases
            .push(Phase::new("phase_rem", &campaign.id, "Remediation", 3));
        campaign
    }

    #[tokio::test]
    async fn test_deterministic_triage() {
        let dir = tempfile::tempdir().unwrap();
        let assault_dir = dir.path().join("assault");
        let results = assault_dir.join("results").join("batch_0000.jsonl");
        append_record(&results, &record(1, 0, "./a/...")).unwrap();
        append_record(&results, &record(1, 1, "./b/...")).unwrap();
        append_record(&results, &record(2, 2, "./b/...")).unwrap();

        let mut campaign = campaign_with_remediation();
        let config = AssaultConfig::default();
        let summary = run_triage(&mut campaign, "phase_rem", &assault_dir, &config, None)
            .await
            .unwrap();

        assert_eq!(summary.status, "triaged");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.tasks_added, 2);

        let phase = campaign.phase("phase_rem").unwrap();
        assert_eq!(phase.tasks.len(), 2);
        assert_eq!(phase.tasks[0].worker.as_deref(), Some("shard"));
        assert!(!phase.tasks[0].artifacts.is_empty());

        assert!(assault_dir.join("triage/latest.json").is_file());
        let stamped = std::fs::read_dir(assault_dir.join("triage"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("triage_"))
            .count();
        assert_eq!(stamped, 1);
    }

    #[tokio::test]
    async fn test_triage_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let assault_dir = dir.path().join("assault");
        let results = assault_dir.join("results").join("batch_0000.jsonl");
        append_record(&results, &record(1, 1, "./a/...")).unwrap();

        let mut campaign = campaign_with_remediation();
        let config = AssaultConfig::default();
        run_triage(&mut campaign, "phase_rem", &assault_dir, &config, None)
            .await
            .unwrap();
        let second = run_triage(&mut campaign, "phase_rem", &assault_dir, &config, None)
            .await
            .unwrap();
        assert_eq!(second.status, "already_triaged");
        assert_eq!(second.tasks_added, 0);
        assert_eq!(campaign.phase("phase_rem").unwrap().tasks.len(), 1);
    }

    struct PlanLlm;

    #[async_trait]
    impl LlmClient for PlanLlm {
        async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(r#"{"tasks": [{"description": "harden parser against crash input", "target": "./b/...", "log_path": "logs/x.log", "priority": "critical"}]}"#.to_string())
        }
    }

    #[tokio::test]
    async fn test_llm_triage_plan_used_when_valid() {
        let dir = tempfile::tempdir().unwrap();
        let assault_dir = dir.path().join("assault");
        let results = assault_dir.join("results").join("batch_0000.jsonl");
        append_record(&results, &record(1, 1, "./b/...")).unwrap();

        let mut campaign = campaign_with_remediation();
        let config = AssaultConfig::default();
        let llm: Arc<dyn LlmClient> = Arc::new(PlanLlm);
        let summary = run_triage(&mut campaign, "phase_rem", &assault_dir, &config, Some(&llm))
            .await
            .unwrap();
        assert_eq!(summary.tasks_added, 1);
        let task = &campaign.phase("phase_rem").unwrap().tasks[0];
        assert!(task.description.contains("harden parser"));
        assert_eq!(task.priority, TaskPriority::Critical);
    }

    #[tokio::test]
    async fn test_remediation_cap() {
        let dir = tempfile::tempdir().unwrap();
        let assault_dir = dir.path().join("assault");
        let results = assault_dir.join("results").join("batch_0000.jsonl");
        for i in 0..6 {
            append_record(&results, &record(i, 1, &format!("./t{i}/..."))).unwrap();
        }
        let mut campaign = campaign_with_remediation();
        let mut config = AssaultConfig::default();
        config.max_remediation_tasks = 3;
        let summary = run_triage(&mut campaign, "phase_rem", &assault_dir, &config, None)
            .await
            .unwrap();
        assert_eq!(summary.tasks_added, 3);
    }

    #[tokio::test]
    async fn test_no_results_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign_with_remediation();
        let config = AssaultConfig::default();
        let result = run_triage(
            &mut campaign,
            "phase_rem",
            &dir.path().join("assault"),
            &config,
            None,
        )
        .await;
        assert!(matches!(result, Err(AssaultError::NoResults { .. })));
    }
}

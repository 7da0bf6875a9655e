//! Replanner: mutate the plan graph in response to observed reality.
//!
//! Three entry points, all structured as "ask the LLM for JSON, validate,
//! apply under the orchestrator's lock": correction after failures or
//! blocks, integration of a new requirement, and rolling-wave refinement of
//! the next phase after each phase completes. Every applied change bumps the
//! campaign revision and reloads the kernel's fact view.

use crate::collaborators::LlmClient;
use crate::config::OrchestratorConfig;
use crate::facts::FactBridge;
use crate::kernel::Pattern;
use crate::model::{Campaign, Task, TaskPriority, TaskStatus, TaskType};
use crate::util::{extract_json_value, strip_code_fences};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Summary of an applied replan.
#[derive(Debug, Clone, Default)]
pub struct ReplanOutcome {
    pub summary: String,
    pub retried: usize,
    pub skipped: usize,
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

#[derive(Debug, Deserialize)]
struct CorrectionPlan {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    change_summary: String,
    #[serde(default)]
    retry_tasks: Vec<RetryEntry>,
    #[serde(default)]
    skip_tasks: Vec<String>,
    #[serde(default)]
    add_tasks: Vec<AddEntry>,
    #[serde(default)]
    modify_dependencies: Vec<DependencyEntry>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RetryEntry {
    task_id: String,
    #[serde(default)]
    new_approach: String,
}

#[derive(Debug, Deserialize)]
struct AddEntry {
    #[serde(default)]
    phase_id: String,
    description: String,
    #[serde(default, rename = "type")]
    task_type: String,
    #[serde(default)]
    priority: String,
    #[serde(default)]
    before_task: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DependencyEntry {
    task_id: String,
    #[serde(default)]
    add: Vec<String>,
    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RequirementPlan {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    tasks: Vec<AddEntry>,
    #[serde(default)]
    modify_tasks: Vec<ModifyEntry>,
}

#[derive(Debug, Deserialize)]
struct ModifyEntry {
    task_id: String,
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WavePlan {
    Object {
        #[serde(default)]
        tasks: Vec<WaveEntry>,
        #[serde(default)]
        summary: String,
    },
    Bare(Vec<WaveEntry>),
}

#[derive(Debug, Deserialize)]
struct WaveEntry {
    #[serde(default)]
    action: String,
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "type")]
    task_type: String,
    #[serde(default)]
    priority: String,
}

/// LLM-driven plan mutation.
pub struct Replanner {
    llm: Arc<dyn LlmClient>,
}

impl Replanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Decode an LLM response into `T`, stripping fences and surrounding
    /// prose first.
    fn decode<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T> {
        let stripped = strip_code_fences(raw);
        let json = extract_json_value(stripped)
            .with_context(|| "no JSON value found in replanner response")?;
        serde_json::from_str(&json).context("replanner response did not match schema")
    }

    /// Correction pass after task failures or a campaign block.
    ///
    /// `scope` optionally focuses the correction on one failed task id.
    pub async fn correct(
        &self,
        campaign: &mut Campaign,
        bridge: &FactBridge,
        config: &OrchestratorConfig,
        scope: Option<&str>,
    ) -> Result<ReplanOutcome> {
        let failed: Vec<&Task> = campaign
            .phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .filter(|t| t.status == TaskStatus::Failed)
            .filter(|t| scope.is_none_or(|id| t.id == id))
            .collect();
        let blocked: Vec<&Task> = campaign
            .phases
            .iter()
            .flat_map(|p| p.tasks.iter())
            .filter(|t| t.status == TaskStatus::Blocked)
            .collect();
        let triggers = bridge
            .kernel()
            .query("replan_trigger", &[Pattern::from(campaign.id.as_str())])?;

        let mut prompt = String::from(
            "You are correcting an execution plan. Respond with one JSON object:\n\
             {\"success\": bool, \"change_summary\": string,\n \
              \"retry_tasks\": [{\"task_id\": string, \"new_approach\": string}],\n \
              \"skip_tasks\": [string],\n \
              \"add_tasks\": [{\"phase_id\": string, \"description\": string, \"type\": string, \"priority\": string, \"before_task\": string|null}],\n \
              \"modify_dependencies\": [{\"task_id\": string, \"add\": [string], \"remove\": [string]}]}\n\n",
        );
        prompt.push_str(&format!("Goal: {}\n", campaign.goal));
        for task in &failed {
            prompt.push_str(&format!(
                "Failed task {} ({} attempts): {} | last error: {}\n",
                task.id,
                task.attempt_count(),
                task.description,
                task.last_error.as_deref().unwrap_or("unknown")
            ));
        }
        for task in &blocked {
            prompt.push_str(&format!("Blocked task {}: {}\n", task.id, task.description));
        }
        for trigger in &triggers {
            prompt.push_str(&format!("Active trigger: {}\n", trigger));
        }

        let response = self.llm.complete(&prompt).await?;
        let plan: CorrectionPlan = Self::decode(&response)?;
        if !plan.success {
            bail!("replanner declined to produce a correction");
        }

        let outcome = self.apply_correction(campaign, plan)?;
        self.finish(campaign, bridge, config, &outcome.summary)?;
        Ok(outcome)
    }

    fn apply_correction(&self, campaign: &mut Campaign, plan: CorrectionPlan) -> Result<ReplanOutcome> {
        let mut outcome = ReplanOutcome {
            summary: if plan.change_summary.is_empty() {
                "correction applied".to_string()
            } else {
                plan.change_summary
            },
            ..Default::default()
        };

        for task_id in &plan.skip_tasks {
            if let Some(task) = campaign.task_mut(task_id) {
                task.status = TaskStatus::Skipped;
                outcome.skipped += 1;
            }
        }

        for retry in &plan.retry_tasks {
            if let Some(task) = campaign.task_mut(&retry.task_id) {
                task.status = TaskStatus::Pending;
                if !retry.new_approach.is_empty() {
                    task.description = retry.new_approach.clone();
                }
                task.attempts.clear();
                task.last_error = None;
                task.next_retry_at = None;
                outcome.retried += 1;
            } else {
                warn!(task_id = %retry.task_id, "retry target not found; ignoring");
            }
        }

        for add in &plan.add_tasks {
            if self.add_task(campaign, add)? {
                outcome.added += 1;
            }
        }

        for entry in &plan.modify_dependencies {
            if let Some(task) = campaign.task_mut(&entry.task_id) {
                task.depends_on.retain(|d| !entry.remove.contains(d));
                for dep in &entry.add {
                    if !task.depends_on.contains(dep) {
                        task.depends_on.push(dep.clone());
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Insert a planner-emitted task into its phase with a synthesized
    /// stable id. Returns false when the phase does not exist.
    fn add_task(&self, campaign: &mut Campaign, add: &AddEntry) -> Result<bool> {
        let short = campaign.short_id();
        let Some(phase) = campaign
            .phases
            .iter_mut()
            .find(|p| p.id == add.phase_id || add.phase_id.is_empty() && p.status == crate::model::PhaseStatus::InProgress)
        else {
            warn!(phase_id = %add.phase_id, "add target phase not found; ignoring");
            return Ok(false);
        };

        let mut index = phase.tasks.len();
        let mut id = format!("task_{}_{}_{}", short, phase.order, index);
        while phase.task(&id).is_some() {
            index += 1;
            id = format!("task_{}_{}_{}", short, phase.order, index);
        }

        let order = phase.tasks.iter().map(|t| t.order + 1).max().unwrap_or(0);
        let mut task = Task::new(
            &id,
            &phase.id.clone(),
            &add.description,
            TaskType::parse_lenient(&add.task_type),
            order,
        )
        .with_priority(TaskPriority::parse_lenient(&add.priority));

        if let Some(before) = &add.before_task {
            // The new task gates the named one rather than re-ordering it.
            if let Some(successor) = phase.task_mut(before) {
                successor.depends_on.push(id.clone());
                task.order = successor.order;
            }
        }

        phase.tasks.push(task);
        Ok(true)
    }

    /// Integrate a new requirement into the phase with the given order.
    pub async fn integrate_requirement(
        &self,
        campaign: &mut Campaign,
        bridge: &FactBridge,
        config: &OrchestratorConfig,
        phase_order: u32,
        requirement: &str,
    ) -> Result<ReplanOutcome> {
        let Some(phase) = campaign.phases.iter().find(|p| p.order == phase_order) else {
            bail!("no phase with order {phase_order}");
        };
        let phase_id = phase.id.clone();
        let existing: Vec<String> = phase
            .tasks
            .iter()
            .map(|t| format!("{}: {}", t.id, t.description))
            .collect();

        let prompt = format!(
            "A new requirement arrived for an in-flight plan. Respond with one JSON object:\n\
             {{\"summary\": string, \"tasks\": [{{\"description\": string, \"type\": string, \"priority\": string}}],\n \
              \"modify_tasks\": [{{\"task_id\": string, \"description\": string}}]}}\n\n\
             Requirement: {requirement}\nTarget phase tasks:\n{}",
            existing.join("\n")
        );

        let response = self.llm.complete(&prompt).await?;
        let plan: RequirementPlan = Self::decode(&response)?;

        let mut outcome = ReplanOutcome {
            summary: if plan.summary.is_empty() {
                format!("integrated requirement: {requirement}")
            } else {
                plan.summary
            },
            ..Default::default()
        };

        for mut add in plan.tasks {
            add.phase_id = phase_id.clone();
            if self.add_task(campaign, &add)? {
                outcome.added += 1;
            }
        }
        for modify in &plan.modify_tasks {
            if let Some(task) = campaign.task_mut(&modify.task_id) {
                task.description = modify.description.clone();
                outcome.updated += 1;
            }
        }

        self.finish(campaign, bridge, config, &outcome.summary)?;
        Ok(outcome)
    }

    /// Rolling-wave refinement: after `completed_phase_id` completes, refine
    /// the next pending phase in order.
    pub async fn rolling_wave(
        &self,
        campaign: &mut Campaign,
        bridge: &FactBridge,
        config: &OrchestratorConfig,
        completed_phase_id: &str,
    ) -> Result<ReplanOutcome> {
        let Some(completed) = campaign.phase(completed_phase_id) else {
            bail!("completed phase {completed_phase_id} not found");
        };
        let Some(upcoming) = campaign
            .phases
            .iter()
            .filter(|p| p.status == crate::model::PhaseStatus::Pending)
            .min_by_key(|p| p.order)
        else {
            // Nothing left to refine.
            return Ok(ReplanOutcome::default());
        };
        let upcoming_id = upcoming.id.clone();

        let completed_lines: Vec<String> = completed
            .tasks
            .iter()
            .map(|t| format!("{} [{}]: {}", t.id, t.status.as_str(), t.description))
            .collect();
        let upcoming_lines: Vec<String> = upcoming
            .tasks
            .iter()
            .map(|t| format!("{}: {}", t.id, t.description))
            .collect();

        let prompt = format!(
            "Refine the next phase of a plan using outcomes from the phase just \
             completed. Respond with a JSON object {{\"tasks\": [...], \"summary\": string}} \
             or a bare JSON array. Each entry: {{\"action\": \"add\"|\"remove\"|\"update\", \
             \"task_id\": string, \"description\": string, \"type\": string, \"priority\": string}}.\n\n\
             Completed phase {}:\n{}\n\nUpcoming phase {}:\n{}",
            completed.name,
            completed_lines.join("\n"),
            campaign.phase(&upcoming_id).map(|p| p.name.clone()).unwrap_or_default(),
            upcoming_lines.join("\n"),
        );

        let response = self.llm.complete(&prompt).await?;
        let plan: WavePlan = Self::decode(&response)?;
        let (entries, summary) = match plan {
            WavePlan::Object { tasks, summary } => (tasks, summary),
            WavePlan::Bare(tasks) => (tasks, String::new()),
        };

        let mut outcome = ReplanOutcome {
            summary: if summary.is_empty() {
                format!("rolling-wave refinement after {completed_phase_id}")
            } else {
                summary
            },
            ..Default::default()
        };

        for entry in entries {
            match entry.action.to_lowercase().as_str() {
                "add" => {
                    let add = AddEntry {
                        phase_id: upcoming_id.clone(),
                        description: entry.description,
                        task_type: entry.task_type,
                        priority: entry.priority,
                        before_task: None,
                    };
                    if self.add_task(campaign, &add)? {
                        outcome.added += 1;
                    }
                }
                "remove" => {
                    let phase = campaign.phase_mut(&upcoming_id).expect("upcoming phase present");
                    let before = phase.tasks.len();
                    phase.tasks.retain(|t| {
                        !(t.id == entry.task_id
                            || (!entry.description.is_empty() && t.description == entry.description))
                    });
                    outcome.removed += before - phase.tasks.len();
                }
                // Unknown actions default to update; an update that matches
                // nothing but carries a description falls through to add.
                _ => {
                    let matched = campaign.task_mut(&entry.task_id).is_some();
                    if matched {
                        let task = campaign.task_mut(&entry.task_id).expect("matched above");
                        if !entry.description.is_empty() {
                            task.description = entry.description.clone();
                        }
                        if !entry.task_type.is_empty() {
                            task.task_type = TaskType::parse_lenient(&entry.task_type);
                        }
                        if !entry.priority.is_empty() {
                            task.priority = TaskPriority::parse_lenient(&entry.priority);
                        }
                        outcome.updated += 1;
                    } else if !entry.description.is_empty() {
                        let add = AddEntry {
                            phase_id: upcoming_id.clone(),
                            description: entry.description,
                            task_type: entry.task_type,
                            priority: entry.priority,
                            before_task: None,
                        };
                        if self.add_task(campaign, &add)? {
                            outcome.added += 1;
                        }
                    }
                }
            }
        }

        self.finish(campaign, bridge, config, &outcome.summary)?;
        Ok(outcome)
    }

    /// Common tail: bump revision, record facts, reload the fact view.
    fn finish(
        &self,
        campaign: &mut Campaign,
        bridge: &FactBridge,
        config: &OrchestratorConfig,
        summary: &str,
    ) -> Result<()> {
        campaign.recount();
        let revision = campaign.record_revision(summary);
        bridge.assert_plan_revision(&campaign.id, revision, summary)?;
        bridge.clear_replan_triggers(&campaign.id)?;
        bridge.load_campaign(campaign, config)?;
        info!(campaign = %campaign.id, revision, %summary, "replan applied");
        Ok(())
    }
}

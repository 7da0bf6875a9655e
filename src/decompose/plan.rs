//! Planner protocol: the JSON plan shape the LLM emits and its conversion
//! into a campaign with stable ids.

use crate::model::{
    Artifact, Campaign, CampaignKind, ContextProfile, Objective, Phase, Task, TaskPriority,
    TaskType, VerificationMethod, normalise_category,
};
use anyhow::{Result, bail};
use serde::Deserialize;
use tracing::warn;

/// The plan proposal the LLM emits.
#[derive(Debug, Deserialize)]
pub struct PlanProposal {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub confidence: f64,
    pub phases: Vec<PhaseProposal>,
}

#[derive(Debug, Deserialize)]
pub struct PhaseProposal {
    pub name: String,
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub objective_type: String,
    #[serde(default)]
    pub verification_method: String,
    #[serde(default)]
    pub complexity: String,
    /// Indices into the emitted phase list.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub focus_patterns: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskProposal>,
}

#[derive(Debug, Deserialize)]
pub struct TaskProposal {
    pub description: String,
    #[serde(default, rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub order: Option<u32>,
    /// Local indices into this phase's task list.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Explicit worker routing.
    #[serde(default)]
    pub shard: Option<String>,
    #[serde(default)]
    pub shard_input: Option<String>,
    /// Global task indices across all phases in emission order.
    #[serde(default)]
    pub context_from: Vec<usize>,
}

/// Convert a validated proposal into a campaign.
///
/// Ids are derived at construction time as `phase_{short}_{i}` and
/// `task_{short}_{i}_{j}` so that tasks added after a replan get
/// deterministic, collision-free ids. `context_from` global indices are
/// resolved to task ids here, once.
pub fn convert(
    proposal: PlanProposal,
    campaign_id: &str,
    goal: &str,
    kind: CampaignKind,
    context_budget: u64,
) -> Result<Campaign> {
    if proposal.phases.is_empty() {
        bail!("plan proposal contains no phases");
    }

    let mut campaign = Campaign::new(
        campaign_id,
        if proposal.title.is_empty() {
            goal
        } else {
            &proposal.title
        },
        goal,
        kind,
    );
    campaign.context_budget = context_budget;
    let short = campaign.short_id();

    // First pass: global task index -> task id, in emission order.
    let mut global_ids: Vec<String> = Vec::new();
    for (pi, phase) in proposal.phases.iter().enumerate() {
        for (tj, _) in phase.tasks.iter().enumerate() {
            global_ids.push(format!("task_{short}_{pi}_{tj}"));
        }
    }

    let phase_ids: Vec<String> = (0..proposal.phases.len())
        .map(|i| format!("phase_{short}_{i}"))
        .collect();

    let mut global_index = 0;
    for (pi, phase_proposal) in proposal.phases.into_iter().enumerate() {
        let phase_id = phase_ids[pi].clone();
        let mut phase = Phase::new(
            &phase_id,
            campaign_id,
            &phase_proposal.name,
            phase_proposal.order.unwrap_or(pi as u32),
        )
        .with_category(&normalise_category(&phase_proposal.category));
        phase.complexity = phase_proposal.complexity;
        phase.estimated_tasks = phase_proposal.tasks.len() as u32;

        for dep in &phase_proposal.depends_on {
            match phase_ids.get(*dep) {
                Some(dep_id) if *dep != pi => phase.depends_on.push(dep_id.clone()),
                _ => warn!(phase = %phase_id, index = dep, "dropping invalid phase dependency"),
            }
        }

        let objective_text = if phase_proposal.description.is_empty() {
            phase_proposal.objective_type.clone()
        } else {
            phase_proposal.description.clone()
        };
        if !objective_text.is_empty() {
            phase.objectives.push(Objective::new(
                &objective_text,
                VerificationMethod::parse_lenient(&phase_proposal.verification_method),
            ));
        }

        if !phase_proposal.focus_patterns.is_empty() || !phase_proposal.required_tools.is_empty() {
            let profile_id = format!("profile_{short}_{pi}");
            campaign.context_profiles.push(
                ContextProfile::new(&profile_id)
                    .with_file_patterns(phase_proposal.focus_patterns.clone())
                    .with_tools(phase_proposal.required_tools.clone()),
            );
            phase.context_profile = profile_id;
        }

        let phase_task_count = phase_proposal.tasks.len();
        let phase_global_base = global_index;
        for (tj, task_proposal) in phase_proposal.tasks.into_iter().enumerate() {
            let task_id = global_ids[global_index].clone();
            let mut task = Task::new(
                &task_id,
                &phase_id,
                &task_proposal.description,
                TaskType::parse_lenient(&task_proposal.task_type),
                task_proposal.order.unwrap_or(tj as u32),
            )
            .with_priority(TaskPriority::parse_lenient(&task_proposal.priority));

            for dep in &task_proposal.depends_on {
                if *dep < phase_task_count && *dep != tj {
                    task.depends_on.push(global_ids[phase_global_base + dep].clone());
                } else {
                    warn!(task = %task_id, index = dep, "dropping invalid task dependency");
                }
            }
            for source in &task_proposal.context_from {
                match global_ids.get(*source) {
                    Some(source_id) if *source_id != task_id => {
                        task.context_from.push(source_id.clone());
                    }
                    _ => warn!(task = %task_id, index = source, "dropping invalid context source"),
                }
            }
            for path in &task_proposal.artifacts {
                task.artifacts.push(Artifact::file(path.clone()));
            }
            if let Some(worker) = &task_proposal.shard {
                task = task.with_worker(worker, task_proposal.shard_input.clone());
            }

            phase.tasks.push(task);
            global_index += 1;
        }

        campaign.phases.push(phase);
    }

    campaign.recount();
    Ok(campaign)
}

/// Build the planning prompt: goal, taxonomy rules, topology hints from the
/// kernel, retrieved snippets, and the available workers.
pub fn build_plan_prompt(
    goal: &str,
    kind: CampaignKind,
    user_hints: &[String],
    max_phases: usize,
    topology_hints: &[String],
    snippets: &[String],
    workers: &[String],
) -> String {
    let mut prompt = format!(
        "Decompose the goal below into an execution plan of at most {max_phases} \
         phases. Respond with one JSON object:\n\
         {{\"title\": string, \"confidence\": number, \"phases\": [{{\n  \
           \"name\": string, \"order\": number, \"category\": string, \"description\": string,\n  \
           \"verification_method\": \"none\"|\"tests-pass\"|\"build-pass\"|\"review\"|\"manual-review\",\n  \
           \"complexity\": \"low\"|\"medium\"|\"high\", \"depends_on\": [phase indices],\n  \
           \"focus_patterns\": [glob], \"required_tools\": [string],\n  \
           \"tasks\": [{{\"description\": string, \"type\": string, \"priority\": string,\n    \
             \"depends_on\": [local task indices], \"artifacts\": [path],\n    \
             \"shard\": string|null, \"shard_input\": string|null,\n    \
             \"context_from\": [global task indices]}}]}}]}}\n\n\
         Task types: file-create, file-modify, test-write, test-run, research, verify, \
         shard-spawn, tool-create, refactor, integrate, document, generic.\n\
         Priorities: critical, high, normal, low.\n\
         `context_from` uses global task indices counted across all phases in order.\n\n\
         Campaign kind: {}\nGoal: {goal}\n",
        kind.as_str()
    );
    if !user_hints.is_empty() {
        prompt.push_str(&format!("Hints:\n{}\n", user_hints.join("\n")));
    }
    if !topology_hints.is_empty() {
        prompt.push_str(&format!("Topology hints:\n{}\n", topology_hints.join("\n")));
    }
    if !workers.is_empty() {
        prompt.push_str(&format!("Available workers: {}\n", workers.join(", ")));
    }
    if !snippets.is_empty() {
        prompt.push_str("\nRetrieved context:\n");
        for snippet in snippets {
            prompt.push_str(snippet);
            prompt.push('\n');
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal_json() -> &'static str {
        r#"{
            "title": "Auth hardening",
            "confidence": 0.8,
            "phases": [
                {
                    "name": "Types",
                    "category": "Domain",
                    "description": "core auth types exist",
                    "verification_method": "build-pass",
                    "complexity": "low",
                    "depends_on": [],
                    "focus_patterns": ["auth/**"],
                    "required_tools": [],
                    "tasks": [
                        {"description": "create auth/types.go", "type": "file-create", "priority": "high", "artifacts": ["auth/types.go"]}
                    ]
                },
                {
                    "name": "Tests",
                    "verification_method": "tests-pass",
                    "depends_on": [0],
                    "tasks": [
                        {"description": "write tests for auth types", "type": "test-write", "depends_on": [], "context_from": [0]},
                        {"description": "run the auth tests", "type": "test-run", "depends_on": [0]}
                    ]
                }
            ]
        }"#
    }

    #[test]
    fn test_convert_derives_stable_ids() {
        let proposal: PlanProposal = serde_json::from_str(proposal_json()).unwrap();
        let campaign = convert(proposal, "campaign_ab12cd34", "harden auth", CampaignKind::Feature, 64_000).unwrap();
        let short = campaign.short_id();

        assert_eq!(campaign.phases.len(), 2);
        assert_eq!(campaign.phases[0].id, format!("phase_{short}_0"));
        assert_eq!(campaign.phases[1].id, format!("phase_{short}_1"));
        assert_eq!(campaign.phases[0].tasks[0].id, format!("task_{short}_0_0"));
        assert_eq!(campaign.phases[1].tasks[0].id, format!("task_{short}_1_0"));
        assert_eq!(campaign.total_tasks, 3);
    }

    #[test]
    fn test_convert_resolves_dependencies_and_context() {
        let proposal: PlanProposal = serde_json::from_str(proposal_json()).unwrap();
        let campaign = convert(proposal, "campaign_ab12cd34", "harden auth", CampaignKind::Feature, 0).unwrap();
        let short = campaign.short_id();

        // Phase dependency index 0 resolved to the first phase id.
        assert_eq!(
            campaign.phases[1].depends_on,
            vec![format!("phase_{short}_0")]
        );
        // Global context index 0 resolved to the first task's id.
        assert_eq!(
            campaign.phases[1].tasks[0].context_from,
            vec![format!("task_{short}_0_0")]
        );
        // Local task dependency 0 within phase 1 resolved.
        assert_eq!(
            campaign.phases[1].tasks[1].depends_on,
            vec![format!("task_{short}_1_0")]
        );
        // Verification method parsed per phase.
        assert_eq!(
            campaign.phases[0].objectives[0].verification,
            VerificationMethod::BuildPass
        );
        assert_eq!(campaign.phases[0].category, "domain");
    }

    #[test]
    fn test_convert_drops_invalid_indices() {
        let json = r#"{
            "phases": [{
                "name": "Only",
                "depends_on": [5],
                "tasks": [{"description": "work", "depends_on": [9], "context_from": [42]}]
            }]
        }"#;
        let proposal: PlanProposal = serde_json::from_str(json).unwrap();
        let campaign = convert(proposal, "c1", "goal", CampaignKind::Custom, 0).unwrap();
        assert!(campaign.phases[0].depends_on.is_empty());
        assert!(campaign.phases[0].tasks[0].depends_on.is_empty());
        assert!(campaign.phases[0].tasks[0].context_from.is_empty());
    }

    #[test]
    fn test_convert_rejects_empty_plan() {
        let proposal = PlanProposal {
            title: String::new(),
            confidence: 0.0,
            phases: Vec::new(),
        };
        assert!(convert(proposal, "c1", "g", CampaignKind::Feature, 0).is_err());
    }

    #[test]
    fn test_shard_routing_sets_worker() {
        let json = r#"{
            "phases": [{
                "name": "Build",
                "tasks": [{"description": "mutate code", "type": "shard-spawn", "shard": "shard", "shard_input": "apply the diff"}]
            }]
        }"#;
        let proposal: PlanProposal = serde_json::from_str(json).unwrap();
        let campaign = convert(proposal, "c1", "g", CampaignKind::Feature, 0).unwrap();
        let task = &campaign.phases[0].tasks[0];
        assert_eq!(task.worker.as_deref(), Some("shard"));
        assert_eq!(task.worker_input.as_deref(), Some("apply the diff"));
    }
}

//! Retrieval-augmented requirement extraction.
//!
//! A small set of discovery questions drives vector-store retrieval; the LLM
//! turns each question's snippets into requirement candidates, which are
//! deduplicated and linked back to tasks by a word-overlap heuristic.

use crate::collaborators::{LlmClient, Snippet, VectorStore};
use crate::fact;
use crate::kernel::{Fact, Kernel};
use crate::model::Campaign;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Snippets retrieved per discovery question.
const RETRIEVAL_K: usize = 6;

/// An extracted requirement with a stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub source: String,
    pub description: String,
}

/// Discovery questions derived from the goal and its topics.
pub fn discovery_questions(goal: &str, topics: &[String]) -> Vec<String> {
    let mut questions = vec![
        format!("What must be true for this goal to be met: {goal}?"),
        format!("What constraints or invariants apply to: {goal}?"),
        format!("What interfaces or data formats are involved in: {goal}?"),
    ];
    if let Some(primary) = topics.first() {
        questions.push(format!(
            "What existing behaviour around '{primary}' must not break?"
        ));
    }
    questions
}

#[derive(Debug, Deserialize)]
struct RequirementAnswer {
    #[serde(default)]
    requirements: Vec<RequirementEntry>,
}

#[derive(Debug, Deserialize)]
struct RequirementEntry {
    #[serde(default)]
    source: String,
    description: String,
}

/// Run retrieval-augmented extraction over the chunked documents.
///
/// `relevant_paths` restricts retrieval when the kernel derived a relevant
/// set; an empty slice leaves retrieval unrestricted.
pub async fn extract_requirements(
    llm: &Arc<dyn LlmClient>,
    store: &Arc<dyn VectorStore>,
    goal: &str,
    topics: &[String],
    relevant_paths: &[String],
) -> Result<Vec<Requirement>> {
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut requirements = Vec::new();

    for question in discovery_questions(goal, topics) {
        let filter = if relevant_paths.is_empty() {
            None
        } else {
            Some(relevant_paths)
        };
        let snippets = match store.search(&question, RETRIEVAL_K, filter).await {
            Ok(snippets) => snippets,
            Err(e) => {
                warn!(error = %e, %question, "retrieval failed for question");
                continue;
            }
        };
        if snippets.is_empty() {
            continue;
        }

        let prompt = build_extraction_prompt(goal, &question, &snippets);
        let response = match llm.complete(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "requirement extraction call failed");
                continue;
            }
        };
        let Some(json) =
            crate::util::extract_json_value(crate::util::strip_code_fences(&response))
        else {
            debug!("no JSON in requirement extraction response");
            continue;
        };
        let Ok(answer) = serde_json::from_str::<RequirementAnswer>(&json) else {
            debug!("requirement extraction response did not match schema");
            continue;
        };

        for entry in answer.requirements {
            let key = (entry.source.clone(), entry.description.clone());
            if entry.description.is_empty() || !seen.insert(key) {
                continue;
            }
            requirements.push(Requirement {
                id: format!("req_{}", requirements.len()),
                source: entry.source,
                description: entry.description,
            });
        }
    }
    Ok(requirements)
}

fn build_extraction_prompt(goal: &str, question: &str, snippets: &[Snippet]) -> String {
    let mut prompt = format!(
        "Extract concrete requirements for the goal below from the retrieved \
         context. Respond with JSON {{\"requirements\": [{{\"source\": string, \
         \"description\": string}}]}}.\n\nGoal: {goal}\nQuestion: {question}\n\nContext:\n"
    );
    for snippet in snippets {
        prompt.push_str(&format!("--- {}\n{}\n", snippet.source, snippet.content));
    }
    prompt
}

/// Words of length > 3, lowercased, for the overlap heuristic.
fn significant_words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 3)
        .collect()
}

/// Link requirements to tasks by word overlap and assert
/// `requirement_coverage` facts. Two or more shared significant words make a
/// link.
pub fn link_requirements(
    kernel: &Arc<dyn Kernel>,
    campaign: &Campaign,
    requirements: &[Requirement],
) -> Result<usize> {
    let mut facts: Vec<Fact> = Vec::new();
    for requirement in requirements {
        let req_words = significant_words(&requirement.description);
        for task in campaign.phases.iter().flat_map(|p| p.tasks.iter()) {
            let task_words = significant_words(&task.description);
            let shared = req_words.intersection(&task_words).count();
            if shared >= 2 {
                facts.push(fact!(
                    "requirement_coverage",
                    requirement.id.as_str(),
                    task.id.as_str(),
                    shared
                ));
            }
        }
    }
    let linked = facts.len();
    if !facts.is_empty() {
        kernel.assert_facts(&facts)?;
    }
    Ok(linked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;
    use crate::model::{CampaignKind, Phase, Task, TaskType};

    #[test]
    fn test_discovery_questions_include_topic() {
        let questions = discovery_questions("harden auth", &["harden".to_string()]);
        assert_eq!(questions.len(), 4);
        assert!(questions[3].contains("harden"));
    }

    #[test]
    fn test_significant_words() {
        let words = significant_words("Create the auth token validation layer");
        assert!(words.contains("auth"));
        assert!(words.contains("token"));
        assert!(!words.contains("the"));
    }

    #[test]
    fn test_link_requirements_by_overlap() {
        let kernel: Arc<dyn Kernel> = Arc::new(MemoryKernel::new());
        let mut campaign = Campaign::new("c1", "t", "g", CampaignKind::Feature);
        let mut phase = Phase::new("p0", "c1", "Build", 0);
        phase.tasks.push(Task::new(
            "t0",
            "p0",
            "implement token validation logic",
            TaskType::FileCreate,
            0,
        ));
        phase.tasks.push(Task::new(
            "t1",
            "p0",
            "write docs index",
            TaskType::Document,
            1,
        ));
        campaign.phases.push(phase);

        let requirements = vec![Requirement {
            id: "req_0".to_string(),
            source: "spec.md".to_string(),
            description: "token validation must reject expired tokens".to_string(),
        }];

        let linked = link_requirements(&kernel, &campaign, &requirements).unwrap();
        assert_eq!(linked, 1);
        let coverage = kernel.query("requirement_coverage", &[]).unwrap();
        assert_eq!(coverage.len(), 1);
        assert_eq!(coverage[0].args[1].as_str(), Some("t0"));
    }
}

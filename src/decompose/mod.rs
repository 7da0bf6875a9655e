//! Decomposer: transform a goal plus source documents into a validated
//! campaign.
//!
//! Pipeline: resolve and inspect documents, seed the kernel with goal and
//! document facts, chunk into the vector store, run retrieval-augmented
//! requirement extraction, ask the LLM for a plan proposal, convert it to a
//! campaign with stable ids, validate against the kernel (with one
//! correction round), and link requirements to tasks.

pub mod docs;
pub mod plan;
pub mod requirements;

use crate::collaborators::{LlmClient, VectorStore};
use crate::config::OrchestratorConfig;
use crate::errors::CampaignError;
use crate::fact;
use crate::facts::FactBridge;
use crate::kernel::{Fact, Kernel};
use crate::model::{Campaign, CampaignKind, CampaignStatus};
use crate::util::{extract_json_value, strip_code_fences};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub use docs::{DocumentMeta, goal_topics};
pub use plan::{PlanProposal, build_plan_prompt, convert};
pub use requirements::{Requirement, extract_requirements, link_requirements};

/// Target chunk size for vector-store ingestion.
const CHUNK_BYTES: usize = 1500;

/// Input to the decomposer.
#[derive(Debug, Clone)]
pub struct DecomposeRequest {
    pub goal: String,
    pub source_paths: Vec<String>,
    pub kind: CampaignKind,
    pub user_hints: Vec<String>,
    pub max_phases: usize,
    pub context_budget: u64,
}

impl DecomposeRequest {
    pub fn new(goal: &str, kind: CampaignKind) -> Self {
        Self {
            goal: goal.to_string(),
            source_paths: Vec::new(),
            kind,
            user_hints: Vec::new(),
            max_phases: 6,
            context_budget: 128_000,
        }
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.source_paths = sources;
        self
    }
}

/// Goal + documents to validated campaign.
pub struct Decomposer {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn VectorStore>,
    kernel: Arc<dyn Kernel>,
    config: OrchestratorConfig,
    /// Worker names advertised to the planner.
    workers: Vec<String>,
}

impl Decomposer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn VectorStore>,
        kernel: Arc<dyn Kernel>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            llm,
            store,
            kernel,
            config,
            workers: Vec::new(),
        }
    }

    pub fn with_workers(mut self, workers: Vec<String>) -> Self {
        self.workers = workers;
        self
    }

    /// Run the full pipeline.
    pub async fn decompose(&self, request: DecomposeRequest) -> Result<Campaign, CampaignError> {
        let campaign_id = format!("campaign_{}", &Uuid::new_v4().simple().to_string()[..8]);
        info!(%campaign_id, goal = %request.goal, "decomposing goal");

        // Resolve documents and seed the kernel.
        let paths = docs::resolve_paths(&self.config.workspace_dir, &request.source_paths)
            .map_err(CampaignError::Other)?;
        let topics = docs::goal_topics(&request.goal);
        let mut seed_facts: Vec<Fact> =
            vec![fact!("campaign_goal", campaign_id.as_str(), request.goal.as_str())];
        for topic in &topics {
            seed_facts.push(fact!("goal_topic", campaign_id.as_str(), topic.as_str()));
        }

        let mut metas = Vec::new();
        for path in &paths {
            match docs::inspect(&self.llm, &self.config.workspace_dir, path).await {
                Ok((meta, content)) => {
                    seed_facts.push(fact!(
                        "doc_metadata",
                        meta.path.as_str(),
                        meta.size,
                        meta.doc_type.as_str()
                    ));
                    seed_facts.push(fact!(
                        "doc_layer",
                        meta.path.as_str(),
                        meta.layer.as_str(),
                        meta.confidence
                    ));
                    for tag in &meta.tags {
                        seed_facts.push(fact!("doc_tag", meta.path.as_str(), tag.as_str()));
                    }
                    if let Err(e) = self
                        .store
                        .add_chunks(&meta.path, chunk_text(&content))
                        .await
                    {
                        warn!(error = %e, path = %meta.path, "chunk ingestion failed");
                    }
                    metas.push(meta);
                }
                Err(e) => warn!(error = %e, path = %path.display(), "skipping unreadable document"),
            }
        }
        self.kernel.assert_facts(&seed_facts)?;

        // Requirement extraction, restricted to kernel-relevant paths when
        // derivable, else to goal-tag matches.
        let relevant = self.relevant_paths(&metas, &topics)?;
        let reqs = extract_requirements(&self.llm, &self.store, &request.goal, &topics, &relevant)
            .await
            .map_err(CampaignError::Other)?;
        info!(count = reqs.len(), "requirements extracted");

        // Plan proposal.
        let topology = self.topology_hints()?;
        let snippets = self.goal_snippets(&request.goal).await;
        let prompt = build_plan_prompt(
            &request.goal,
            request.kind,
            &request.user_hints,
            request.max_phases,
            &topology,
            &snippets,
            &self.workers,
        );
        let mut campaign =
            self.propose_and_convert(&prompt, &campaign_id, &request).await?;
        campaign.transition(CampaignStatus::Decomposing)?;
        campaign.transition(CampaignStatus::Validating)?;

        // Kernel validation with one correction round.
        let bridge = FactBridge::new(self.kernel.clone());
        bridge.load_campaign(&campaign, &self.config)?;
        let issues = self.validation_issues()?;
        if !issues.is_empty() {
            warn!(count = issues.len(), "plan validation issues; requesting correction");
            let correction_prompt = format!(
                "{prompt}\n\nYour previous plan had these validation issues:\n{}\n\
                 Produce a corrected plan in the same JSON shape.",
                issues.join("\n")
            );
            match self
                .propose_and_convert(&correction_prompt, &campaign_id, &request)
                .await
            {
                Ok(mut corrected) => {
                    corrected.transition(CampaignStatus::Decomposing)?;
                    corrected.transition(CampaignStatus::Validating)?;
                    bridge.load_campaign(&corrected, &self.config)?;
                    let remaining = self.validation_issues()?;
                    if !remaining.is_empty() {
                        warn!(count = remaining.len(), "validation issues remain after correction");
                    }
                    campaign = corrected;
                }
                Err(e) => warn!(error = %e, "correction round failed; keeping original plan"),
            }
        }

        let linked = link_requirements(&self.kernel, &campaign, &reqs)
            .map_err(CampaignError::Other)?;
        info!(linked, phases = campaign.phases.len(), tasks = campaign.total_tasks, "plan ready");
        Ok(campaign)
    }

    async fn propose_and_convert(
        &self,
        prompt: &str,
        campaign_id: &str,
        request: &DecomposeRequest,
    ) -> Result<Campaign, CampaignError> {
        let response = self
            .llm
            .complete(prompt)
            .await
            .map_err(CampaignError::Other)?;
        let json = extract_json_value(strip_code_fences(&response))
            .ok_or_else(|| CampaignError::PlanDecode("no JSON value in plan response".into()))?;
        let proposal: PlanProposal = serde_json::from_str(&json)
            .map_err(|e| CampaignError::PlanDecode(format!("plan JSON mismatch: {e}")))?;
        convert(
            proposal,
            campaign_id,
            &request.goal,
            request.kind,
            request.context_budget,
        )
        .map_err(CampaignError::Other)
    }

    /// Paths retrieval should focus on: kernel-derived `is_relevant` paths,
    /// else documents whose tags intersect the goal topics.
    fn relevant_paths(&self, metas: &[DocumentMeta], topics: &[String]) -> Result<Vec<String>, CampaignError> {
        let derived: Vec<String> = self
            .kernel
            .query("is_relevant", &[])?
            .into_iter()
            .filter_map(|f| f.args.first().and_then(|t| t.as_str().map(String::from)))
            .collect();
        if !derived.is_empty() {
            return Ok(derived);
        }
        Ok(metas
            .iter()
            .filter(|m| m.tags.iter().any(|t| topics.contains(t)))
            .map(|m| m.path.clone())
            .collect())
    }

    /// Topology hints the kernel proposes for the planner prompt.
    fn topology_hints(&self) -> Result<Vec<String>, CampaignError> {
        let mut hints = Vec::new();
        for fact in self.kernel.query("proposed_phase", &[])? {
            hints.push(format!("proposed phase: {}", fact.args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ")));
        }
        for fact in self.kernel.query("phase_dependency_generated", &[])? {
            if fact.args.len() >= 2 {
                hints.push(format!("suggested dependency: {} after {}", fact.args[0], fact.args[1]));
            }
        }
        for fact in self.kernel.query("phase_context_scope", &[])? {
            if fact.args.len() >= 2 {
                hints.push(format!("suggested scope for {}: {}", fact.args[0], fact.args[1]));
            }
        }
        for fact in self.kernel.query("doc_conflict", &[])? {
            hints.push(format!("document conflict: {}", fact.args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ")));
        }
        Ok(hints)
    }

    async fn goal_snippets(&self, goal: &str) -> Vec<String> {
        match self.store.search(goal, 6, None).await {
            Ok(snippets) => snippets
                .into_iter()
                .map(|s| format!("--- {}\n{}", s.source, s.content))
                .collect(),
            Err(e) => {
                warn!(error = %e, "goal snippet retrieval failed");
                Vec::new()
            }
        }
    }

    fn validation_issues(&self) -> Result<Vec<String>, CampaignError> {
        Ok(self
            .kernel
            .query("validation_error", &[])?
            .into_iter()
            .map(|f| f.to_string())
            .collect())
    }
}

/// Split text into chunks of roughly [`CHUNK_BYTES`], preferring paragraph
/// boundaries.
pub fn chunk_text(content: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in content.split("\n\n") {
        if !current.is_empty() && current.len() + paragraph.len() > CHUNK_BYTES {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
        // Oversized single paragraphs are split hard.
        while current.len() > 2 * CHUNK_BYTES {
            let mut split = CHUNK_BYTES;
            while !current.is_char_boundary(split) {
                split += 1;
            }
            let rest = current.split_off(split);
            chunks.push(std::mem::replace(&mut current, rest));
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

/// An in-memory vector store good enough for tests and offline runs:
/// ranks chunks by shared-word count with the query.
#[derive(Default)]
pub struct WordOverlapStore {
    chunks: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl VectorStore for WordOverlapStore {
    async fn add_chunks(&self, source: &str, chunks: Vec<String>) -> Result<()> {
        let mut store = self
            .chunks
            .lock()
            .map_err(|_| anyhow!("chunk store poisoned"))?;
        for chunk in chunks {
            store.push((source.to_string(), chunk));
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        k: usize,
        source_filter: Option<&[String]>,
    ) -> Result<Vec<crate::collaborators::Snippet>> {
        let query_words: std::collections::HashSet<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .map(|w| w.to_lowercase())
            .filter(|w| w.len() > 2)
            .collect();
        let store = self
            .chunks
            .lock()
            .map_err(|_| anyhow!("chunk store poisoned"))?;
        let mut scored: Vec<crate::collaborators::Snippet> = store
            .iter()
            .filter(|(source, _)| {
                source_filter.is_none_or(|filter| filter.iter().any(|f| source == f))
            })
            .map(|(source, chunk)| {
                let overlap = chunk
                    .split(|c: char| !c.is_alphanumeric())
                    .map(|w| w.to_lowercase())
                    .filter(|w| query_words.contains(w))
                    .count();
                crate::collaborators::Snippet {
                    source: source.clone(),
                    content: chunk.clone(),
                    score: overlap as f64,
                }
            })
            .filter(|s| s.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_text_respects_paragraphs() {
        let text = format!("{}\n\n{}", "a".repeat(1000), "b".repeat(1000));
        let chunks = chunk_text(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn test_chunk_text_splits_oversized_paragraph() {
        let text = "x".repeat(5000);
        let chunks = chunk_text(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= 2 * CHUNK_BYTES));
    }

    #[tokio::test]
    async fn test_word_overlap_store_ranks_and_filters() {
        let store = WordOverlapStore::default();
        store
            .add_chunks("auth.md", vec!["token validation rules".to_string()])
            .await
            .unwrap();
        store
            .add_chunks("build.md", vec!["makefile targets".to_string()])
            .await
            .unwrap();

        let hits = store.search("how does token validation work", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "auth.md");

        let filtered = store
            .search(
                "token validation",
                5,
                Some(&["build.md".to_string()]),
            )
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }
}

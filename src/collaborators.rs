//! Contracts for the external collaborators the core delegates to.
//!
//! The core treats all of these as injected dependencies: named workers that
//! turn an input string into a result string, the LLM client used for
//! planning and triage, the vector store used during decomposition, the
//! backpressure provider consulted by adaptive concurrency, context paging
//! hooks, and the package lister used by assault discovery.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::model::{Phase, Task};

/// A named executor that turns an input string into a result string.
///
/// Worker errors are plain strings; the retry policy classifies them.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: &str, cancel: &CancellationToken) -> Result<String, String>;
}

/// Registry of workers discoverable by name.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.name().to_string(), worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Well-known worker names the task handlers route to.
pub mod worker_names {
    /// Code-mutation worker (shard).
    pub const SHARD: &str = "shard";
    /// Research worker.
    pub const RESEARCH: &str = "research";
    /// Adversarial review worker.
    pub const REVIEW: &str = "review";
}

/// The LLM client used for planning, replanning, classification, and triage.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

/// A retrieved document snippet.
#[derive(Debug, Clone)]
pub struct Snippet {
    pub source: String,
    pub content: String,
    pub score: f64,
}

/// Campaign-scoped document chunk store with similarity search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Add chunks for a source document.
    async fn add_chunks(&self, source: &str, chunks: Vec<String>) -> anyhow::Result<()>;

    /// Retrieve the top-k snippets for a query, optionally restricted to a
    /// set of source paths.
    async fn search(
        &self,
        query: &str,
        k: usize,
        source_filter: Option<&[String]>,
    ) -> anyhow::Result<Vec<Snippet>>;
}

/// Optional backpressure signal consulted by adaptive concurrency.
pub trait Backpressure: Send + Sync {
    /// Queue utilisation in `[0, 1]`.
    fn utilisation(&self) -> f64;
}

/// Advisory context-paging hooks invoked on phase entry. Failures are soft
/// and never block scheduling.
#[async_trait]
pub trait ContextPager: Send + Sync {
    async fn activate(&self, phase: &Phase) -> anyhow::Result<()>;

    async fn prefetch(&self, upcoming: &[Task]) -> anyhow::Result<()>;
}

/// LLM client backed by a CLI binary: the prompt goes to stdin, the
/// completion is read from stdout.
pub struct CliLlm {
    pub binary: String,
    pub args: Vec<String>,
}

impl CliLlm {
    pub fn new(binary: &str, args: Vec<String>) -> Self {
        Self {
            binary: binary.to_string(),
            args,
        }
    }
}

#[async_trait]
impl LlmClient for CliLlm {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        use tokio::io::AsyncWriteExt;
        let mut child = tokio::process::Command::new(&self.binary)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {e}", self.binary))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!("{} exited with {}", self.binary, output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Adapter exposing an LLM client as a named worker, with a role preamble.
pub struct LlmWorker {
    name: String,
    preamble: String,
    llm: Arc<dyn LlmClient>,
}

impl LlmWorker {
    pub fn new(name: &str, preamble: &str, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: name.to_string(),
            preamble: preamble.to_string(),
            llm,
        }
    }
}

#[async_trait]
impl Worker for LlmWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &str, cancel: &CancellationToken) -> Result<String, String> {
        let prompt = format!("{}\n\n{}", self.preamble, input);
        tokio::select! {
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            result = self.llm.complete(&prompt) => result.map_err(|e| e.to_string()),
        }
    }
}

/// Lists package directories for assault target discovery.
pub trait PackageLister: Send + Sync {
    /// Whether a package manifest exists at the workspace root.
    fn manifest_exists(&self, root: &Path) -> bool;

    /// Package directories relative to the root, slash-normalised.
    fn list_packages(&self, root: &Path) -> anyhow::Result<Vec<String>>;
}

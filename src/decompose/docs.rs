//! Source document resolution and metadata extraction for planning.

use crate::collaborators::LlmClient;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

/// Extensions treated as planning documents when walking directories.
const DOC_EXTENSIONS: &[&str] = &["md", "txt", "rst", "adoc", "org"];

/// Architectural layers the classifier may assign.
const LAYERS: &[&str] = &["domain", "service", "api", "data", "infrastructure", "docs"];

/// Per-file metadata recorded during planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Forward-slash normalised path.
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Type by filename heuristic.
    pub doc_type: String,
    /// Path-derived tags.
    pub tags: Vec<String>,
    /// Architectural layer with classifier confidence.
    pub layer: String,
    pub confidence: f64,
}

/// Resolve a mixed list of files, directories, and glob patterns into
/// concrete document paths.
pub fn resolve_paths(workspace: &Path, sources: &[String]) -> Result<Vec<PathBuf>> {
    let mut resolved = BTreeSet::new();
    for source in sources {
        let candidate = workspace.join(source);
        if candidate.is_file() {
            resolved.insert(candidate);
            continue;
        }
        if candidate.is_dir() {
            for entry in WalkDir::new(&candidate).into_iter().filter_map(Result::ok) {
                let path = entry.path();
                if path.is_file() && has_doc_extension(path) {
                    resolved.insert(path.to_path_buf());
                }
            }
            continue;
        }
        // Fall back to glob interpretation.
        let pattern = workspace.join(source);
        let pattern = pattern.to_string_lossy();
        for path in glob::glob(&pattern)
            .with_context(|| format!("invalid source pattern {source}"))?
            .filter_map(Result::ok)
        {
            if path.is_file() {
                resolved.insert(path);
            }
        }
    }
    Ok(resolved.into_iter().collect())
}

fn has_doc_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| DOC_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// Type-by-filename heuristic.
pub fn doc_type_of(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    if name.starts_with("readme") {
        "readme"
    } else if name.contains("spec") {
        "spec"
    } else if name.contains("design") || name.contains("architecture") {
        "design"
    } else if name.contains("api") {
        "api"
    } else if name.contains("config") || name.ends_with(".toml") || name.ends_with(".yaml") {
        "config"
    } else {
        "document"
    }
    .to_string()
}

/// Tags derived from path components, lowercased, excluding the file name.
pub fn path_tags(workspace: &Path, path: &Path) -> Vec<String> {
    let relative = path.strip_prefix(workspace).unwrap_or(path);
    let mut tags: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect();
    tags.pop();
    tags.retain(|t| !t.is_empty() && t != ".");
    tags
}

/// Deterministic cheap-path layer guess; `None` means the LLM should decide.
fn cheap_layer(doc_type: &str, tags: &[String], content: &str) -> Option<(String, f64)> {
    if content.trim().len() < 64 {
        return Some(("docs".to_string(), 0.5));
    }
    if doc_type == "readme" {
        return Some(("docs".to_string(), 0.9));
    }
    for tag in tags {
        for layer in LAYERS {
            if tag == layer {
                return Some((layer.to_string(), 0.8));
            }
        }
    }
    None
}

/// Classify a document's architectural layer, preferring the deterministic
/// cheap path and falling back to the LLM classifier.
pub async fn classify_layer(
    llm: &Arc<dyn LlmClient>,
    doc_type: &str,
    tags: &[String],
    content: &str,
) -> (String, f64) {
    if let Some(hit) = cheap_layer(doc_type, tags, content) {
        return hit;
    }
    let prompt = format!(
        "Classify this document into exactly one architectural layer out of \
         [{}]. Respond with JSON {{\"layer\": string, \"confidence\": number}}.\n\n{}",
        LAYERS.join(", "),
        crate::util::truncate_output(content, 4000)
    );
    match llm.complete(&prompt).await {
        Ok(response) => {
            #[derive(Deserialize)]
            struct LayerAnswer {
                layer: String,
                #[serde(default)]
                confidence: f64,
            }
            let parsed = crate::util::extract_json_value(crate::util::strip_code_fences(&response))
                .and_then(|json| serde_json::from_str::<LayerAnswer>(&json).ok());
            match parsed {
                Some(answer) if LAYERS.contains(&answer.layer.as_str()) => {
                    (answer.layer, answer.confidence.clamp(0.0, 1.0))
                }
                _ => ("service".to_string(), 0.3),
            }
        }
        Err(e) => {
            debug!(error = %e, "layer classification failed, defaulting");
            ("service".to_string(), 0.2)
        }
    }
}

/// Gather metadata for a resolved document.
pub async fn inspect(
    llm: &Arc<dyn LlmClient>,
    workspace: &Path,
    path: &Path,
) -> Result<(DocumentMeta, String)> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let doc_type = doc_type_of(path);
    let tags = path_tags(workspace, path);
    let (layer, confidence) = classify_layer(llm, &doc_type, &tags, &content).await;
    let modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let relative = path.strip_prefix(workspace).unwrap_or(path);
    Ok((
        DocumentMeta {
            path: crate::util::normalise_slashes(&relative.to_string_lossy()),
            size: metadata.len(),
            modified,
            doc_type,
            tags,
            layer,
            confidence,
        },
        content,
    ))
}

/// Tokenised goal words of at least 3 characters, lowercased.
pub fn goal_topics(goal: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    goal.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() >= 3)
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_type_of() {
        assert_eq!(doc_type_of(Path::new("README.md")), "readme");
        assert_eq!(doc_type_of(Path::new("auth-spec.md")), "spec");
        assert_eq!(doc_type_of(Path::new("system_design.txt")), "design");
        assert_eq!(doc_type_of(Path::new("notes.md")), "document");
    }

    #[test]
    fn test_path_tags() {
        let tags = path_tags(Path::new("/w"), Path::new("/w/docs/api/auth.md"));
        assert_eq!(tags, vec!["docs", "api"]);
    }

    #[test]
    fn test_goal_topics() {
        let topics = goal_topics("Build an auth service with JWT auth");
        assert_eq!(topics, vec!["build", "auth", "service", "with", "jwt"]);
    }

    #[test]
    fn test_cheap_layer_paths() {
        assert_eq!(
            cheap_layer("readme", &[], &"x".repeat(100)),
            Some(("docs".to_string(), 0.9))
        );
        assert_eq!(
            cheap_layer("spec", &["api".to_string()], &"x".repeat(100)),
            Some(("api".to_string(), 0.8))
        );
        assert_eq!(cheap_layer("spec", &[], &"x".repeat(100)), None);
        // Trivial content never reaches the LLM.
        assert!(cheap_layer("spec", &[], "short").is_some());
    }

    #[test]
    fn test_resolve_paths_files_dirs_globs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("docs/a.md"), "a").unwrap();
        std::fs::write(root.join("docs/b.txt"), "b").unwrap();
        std::fs::write(root.join("docs/code.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join("top.md"), "t").unwrap();

        let resolved = resolve_paths(
            root,
            &["docs".to_string(), "top.md".to_string(), "*.md".to_string()],
        )
        .unwrap();
        let names: Vec<String> = resolved
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"a.md".to_string()));
        assert!(names.contains(&"b.txt".to_string()));
        assert!(names.contains(&"top.md".to_string()));
        // Source files are not documents when walking directories.
        assert!(!names.contains(&"code.rs".to_string()));
    }
}

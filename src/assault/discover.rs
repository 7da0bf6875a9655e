//! Deterministic target discovery for assault sweeps.
//!
//! Package directories come from the [`PackageLister`] collaborator when a
//! manifest is present, grouped into targets by scope, filtered by
//! include/exclude prefixes, then sorted, deduplicated, and chunked into
//! persisted batches.

use crate::collaborators::PackageLister;
use crate::errors::AssaultError;
use crate::model::{AssaultConfig, AssaultScope};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

/// Persisted `targets.json` metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsFile {
    pub campaign_id: String,
    pub scope: AssaultScope,
    pub discovered_at: DateTime<Utc>,
    pub targets: Vec<String>,
}

/// Persisted `batch_XXXX.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFile {
    pub batch_id: String,
    pub index: usize,
    pub targets: Vec<String>,
}

/// Default lister: walks the workspace for directories containing source
/// files when no manifest tooling is wired in.
pub struct WalkingLister {
    /// File extensions that mark a directory as a package.
    pub source_extensions: Vec<String>,
    /// Manifest file names probed at the workspace root.
    pub manifest_names: Vec<String>,
}

impl Default for WalkingLister {
    fn default() -> Self {
        Self {
            source_extensions: vec!["go".to_string()],
            manifest_names: vec!["go.mod".to_string()],
        }
    }
}

impl PackageLister for WalkingLister {
    fn manifest_exists(&self, root: &Path) -> bool {
        self.manifest_names.iter().any(|name| root.join(name).is_file())
    }

    fn list_packages(&self, root: &Path) -> anyhow::Result<Vec<String>> {
        let mut packages = BTreeSet::new();
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| {
                !e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with('.') || n == "vendor" || n == "testdata")
            })
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_source = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| self.source_extensions.iter().any(|s| s == e));
            if !is_source {
                continue;
            }
            let Some(parent) = path.parent() else { continue };
            let relative = parent.strip_prefix(root).unwrap_or(parent);
            let normalised = crate::util::normalise_slashes(&relative.to_string_lossy());
            if !normalised.is_empty() && normalised != "." {
                packages.insert(normalised);
            }
        }
        Ok(packages.into_iter().collect())
    }
}

/// Prefix match in slash-normalised form: equality or `prefix/` boundary.
fn prefix_matches(dir: &str, prefix: &str) -> bool {
    dir == prefix || dir.starts_with(&format!("{prefix}/"))
}

fn passes_filters(dir: &str, config: &AssaultConfig) -> bool {
    if !config.include.is_empty() && !config.include.iter().any(|p| prefix_matches(dir, p)) {
        return false;
    }
    !config.exclude.iter().any(|p| prefix_matches(dir, p))
}

/// Segments treated as organisational roots for subsystem grouping.
const SUBSYSTEM_ROOTS: &[&str] = &["internal", "cmd", "pkg"];

/// Group one package directory into its scope target.
fn target_for(dir: &str, scope: AssaultScope) -> String {
    let segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    match scope {
        AssaultScope::Repo => "./...".to_string(),
        AssaultScope::Module => match segments.first() {
            Some(first) => format!("./{first}/..."),
            None => "./...".to_string(),
        },
        AssaultScope::Subsystem => match segments.as_slice() {
            [first, second, ..] if SUBSYSTEM_ROOTS.contains(first) => {
                format!("./{first}/{second}/...")
            }
            [first, ..] => format!("./{first}/..."),
            [] => "./...".to_string(),
        },
        AssaultScope::Package => format!("./{dir}"),
    }
}

/// Discover sweep targets for a workspace.
pub fn discover_targets(
    lister: &dyn PackageLister,
    workspace: &Path,
    config: &AssaultConfig,
) -> Result<Vec<String>, AssaultError> {
    let dirs: Vec<String> = if lister.manifest_exists(workspace) {
        lister
            .list_packages(workspace)
            .map_err(|e| AssaultError::Discovery(e.to_string()))?
    } else {
        // No manifest: treat the include prefixes themselves as packages.
        info!("no package manifest found; falling back to include prefixes");
        config.include.clone()
    };

    let targets: BTreeSet<String> = dirs
        .iter()
        .filter(|dir| passes_filters(dir, config))
        .map(|dir| target_for(dir, config.scope))
        .collect();
    Ok(targets.into_iter().collect())
}

/// Persist `targets.json` and the chunked batch files, returning the
/// batches in order.
pub fn write_batches(
    assault_dir: &Path,
    campaign_id: &str,
    config: &AssaultConfig,
    targets: &[String],
) -> Result<Vec<BatchFile>, AssaultError> {
    let batches_dir = assault_dir.join("batches");
    for sub in ["batches", "results", "logs", "triage"] {
        std::fs::create_dir_all(assault_dir.join(sub))
            .with_context(|| format!("creating assault subdirectory {sub}"))
            .map_err(AssaultError::Other)?;
    }

    let targets_file = TargetsFile {
        campaign_id: campaign_id.to_string(),
        scope: config.scope,
        discovered_at: Utc::now(),
        targets: targets.to_vec(),
    };
    write_json(&assault_dir.join("targets.json"), &targets_file)?;

    let mut batches = Vec::new();
    for (index, chunk) in targets.chunks(config.batch_size.max(1)).enumerate() {
        let batch = BatchFile {
            batch_id: format!("batch_{:04}", index),
            index,
            targets: chunk.to_vec(),
        };
        write_json(&batches_dir.join(format!("{}.json", batch.batch_id)), &batch)?;
        batches.push(batch);
    }
    info!(targets = targets.len(), batches = batches.len(), "assault discovery persisted");
    Ok(batches)
}

/// Load a persisted batch file.
pub fn load_batch(assault_dir: &Path, batch_id: &str) -> Result<BatchFile, AssaultError> {
    let path = assault_dir.join("batches").join(format!("{batch_id}.json"));
    let content = std::fs::read_to_string(&path).map_err(|_| AssaultError::BatchNotFound {
        batch_id: batch_id.to_string(),
        dir: assault_dir.join("batches"),
    })?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing batch file {}", path.display()))
        .map_err(AssaultError::Other)
}

fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), AssaultError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AssaultError::Discovery(format!("serialise failed: {e}")))?;
    std::fs::write(path, json)
        .with_context(|| format!("writing {}", path.display()))
        .map_err(AssaultError::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLister {
        manifest: bool,
        dirs: Vec<&'static str>,
    }

    impl PackageLister for FixedLister {
        fn manifest_exists(&self, _root: &Path) -> bool {
            self.manifest
        }

        fn list_packages(&self, _root: &Path) -> anyhow::Result<Vec<String>> {
            Ok(self.dirs.iter().map(|s| s.to_string()).collect())
        }
    }

    fn config(scope: AssaultScope, include: &[&str]) -> AssaultConfig {
        let mut config = AssaultConfig {
            scope,
            include: include.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        config.normalise();
        config
    }

    #[test]
    fn test_subsystem_grouping_with_include_filter() {
        let lister = FixedLister {
            manifest: true,
            dirs: vec!["internal/a", "internal/a/sub", "internal/b", "cmd/x"],
        };
        let targets = discover_targets(
            &lister,
            Path::new("/w"),
            &config(AssaultScope::Subsystem, &["internal"]),
        )
        .unwrap();
        assert_eq!(targets, vec!["./internal/a/...", "./internal/b/..."]);
    }

    #[test]
    fn test_repo_scope_single_wildcard() {
        let lister = FixedLister {
            manifest: true,
            dirs: vec!["internal/a", "cmd/x"],
        };
        let targets =
            discover_targets(&lister, Path::new("/w"), &config(AssaultScope::Repo, &[])).unwrap();
        assert_eq!(targets, vec!["./..."]);
    }

    #[test]
    fn test_module_scope_groups_by_first_segment() {
        let lister = FixedLister {
            manifest: true,
            dirs: vec!["internal/a", "internal/b", "cmd/x"],
        };
        let targets =
            discover_targets(&lister, Path::new("/w"), &config(AssaultScope::Module, &[])).unwrap();
        assert_eq!(targets, vec!["./cmd/...", "./internal/..."]);
    }

    #[test]
    fn test_package_scope_one_target_per_dir() {
        let lister = FixedLister {
            manifest: true,
            dirs: vec!["internal/b", "internal/a"],
        };
        let targets =
            discover_targets(&lister, Path::new("/w"), &config(AssaultScope::Package, &[])).unwrap();
        assert_eq!(targets, vec!["./internal/a", "./internal/b"]);
    }

    #[test]
    fn test_exclude_prefix() {
        let lister = FixedLister {
            manifest: true,
            dirs: vec!["internal/a", "internal/generated", "internal/generated/deep"],
        };
        let mut config = config(AssaultScope::Package, &[]);
        config.exclude = vec!["internal/generated".to_string()];
        let targets = discover_targets(&lister, Path::new("/w"), &config).unwrap();
        assert_eq!(targets, vec!["./internal/a"]);
    }

    #[test]
    fn test_prefix_is_a_path_boundary() {
        // "internal" must not match "internals".
        let lister = FixedLister {
            manifest: true,
            dirs: vec!["internals/x", "internal/a"],
        };
        let targets = discover_targets(
            &lister,
            Path::new("/w"),
            &config(AssaultScope::Package, &["internal"]),
        )
        .unwrap();
        assert_eq!(targets, vec!["./internal/a"]);
    }

    #[test]
    fn test_no_manifest_falls_back_to_includes() {
        let lister = FixedLister {
            manifest: false,
            dirs: vec![],
        };
        let targets = discover_targets(
            &lister,
            Path::new("/w"),
            &config(AssaultScope::Module, &["services"]),
        )
        .unwrap();
        assert_eq!(targets, vec!["./services/..."]);
    }

    #[test]
    fn test_write_and_load_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(AssaultScope::Package, &[]);
        cfg.batch_size = 2;
        let targets: Vec<String> = ["./a", "./b", "./c"].iter().map(|s| s.to_string()).collect();
        let batches = write_batches(dir.path(), "c1", &cfg, &targets).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].batch_id, "batch_0000");
        assert_eq!(batches[1].targets, vec!["./c"]);

        let loaded = load_batch(dir.path(), "batch_0001").unwrap();
        assert_eq!(loaded.targets, vec!["./c"]);
        assert!(dir.path().join("targets.json").is_file());
        assert!(dir.path().join("results").is_dir());

        assert!(matches!(
            load_batch(dir.path(), "batch_9999"),
            Err(AssaultError::BatchNotFound { .. })
        ));
    }
}

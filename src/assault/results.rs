//! Append-only JSONL result persistence for assault batches.

use crate::errors::AssaultError;
use crate::model::AssaultRecord;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Append one record as a single JSON line. The file is single-writer per
/// batch; records are never rewritten.
pub fn append_record(path: &Path, record: &AssaultRecord) -> Result<(), AssaultError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| AssaultError::ResultAppendFailed {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let line = serde_json::to_string(record)
        .map_err(|e| AssaultError::Discovery(format!("record serialise failed: {e}")))?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| AssaultError::ResultAppendFailed {
            path: path.to_path_buf(),
            source,
        })?;
    writeln!(file, "{line}").map_err(|source| AssaultError::ResultAppendFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// Load every parseable record from a JSONL file. Unparseable lines are
/// skipped with a warning; a missing file yields an empty list.
pub fn load_records(path: &Path) -> Vec<AssaultRecord> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "skipping corrupt result line");
                None
            }
        })
        .collect()
}

/// Recovery keys already present in a batch's result file.
pub fn load_keys(path: &Path) -> HashSet<String> {
    load_records(path).iter().map(AssaultRecord::key).collect()
}

/// Load records from every `*.jsonl` under a results directory.
pub fn scan_results_dir(dir: &Path) -> Vec<AssaultRecord> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut records = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            records.extend(load_records(&path));
        }
    }
    records
}

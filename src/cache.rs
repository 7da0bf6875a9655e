//! Bounded, dependency-aware store of prior task outputs.
//!
//! Outputs are compacted to a per-entry byte cap and evicted oldest-first,
//! except that an id still referenced by an unfinished task's `context_from`
//! is rotated to the tail instead of deleted. Rotation is bounded by one
//! full pass, so when every remaining entry is needed the cache accepts
//! being over its limit rather than dropping context a task still requires.

use crate::model::{Campaign, TaskStatus};
use std::collections::{HashMap, HashSet, VecDeque};

/// Insertion-ordered task output cache with keep-until-unreferenced
/// eviction.
#[derive(Debug)]
pub struct TaskResultCache {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
    /// Maximum entries retained beyond the needed set.
    limit: usize,
    /// Per-entry byte cap applied on store.
    entry_bytes: usize,
}

impl TaskResultCache {
    pub fn new(limit: usize, entry_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            limit,
            entry_bytes,
        }
    }

    /// Store a task output, compacting it to the entry cap, then enforce the
    /// size limit against the given needed set.
    pub fn store(&mut self, task_id: &str, output: &str, needed: &HashSet<String>) {
        let compacted = crate::util::truncate_output(output, self.entry_bytes);
        if self.entries.insert(task_id.to_string(), compacted).is_some() {
            self.order.retain(|id| id != task_id);
        }
        self.order.push_back(task_id.to_string());
        self.evict(needed);
    }

    /// Fetch a stored output.
    pub fn get(&self, task_id: &str) -> Option<&str> {
        self.entries.get(task_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Oldest-first eviction with rotation for needed ids, bounded by one
    /// full pass since the last deletion.
    fn evict(&mut self, needed: &HashSet<String>) {
        let mut rotations = 0;
        while self.order.len() > self.limit {
            if rotations >= self.order.len() {
                // Everything left is needed; stop rather than drop context.
                break;
            }
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if needed.contains(&oldest) {
                self.order.push_back(oldest);
                rotations += 1;
            } else {
                self.entries.remove(&oldest);
                rotations = 0;
            }
        }
    }
}

/// The union of `context_from` ids across every task that has not finished:
/// pending, in-progress, or blocked.
pub fn compute_needed_ids(campaign: &Campaign) -> HashSet<String> {
    campaign
        .phases
        .iter()
        .flat_map(|p| p.tasks.iter())
        .filter(|t| {
            matches!(
                t.status,
                TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Blocked
            )
        })
        .flat_map(|t| t.context_from.iter().cloned())
        .collect()
}

//! In-memory kernel backend.
//!
//! Stores base facts in a predicate-keyed multiset and codes the derived
//! predicates (`current_phase`, `eligible_task`, `phase_eligible`,
//! `campaign_blocked`, `replan_needed`, `validation_error`,
//! `next_campaign_task`) directly in Rust. Used as the default backend and by
//! the test suite; a production deployment can substitute any other
//! [`Kernel`] implementation.

use crate::errors::KernelError;
use crate::kernel::{Fact, Kernel, Pattern, Term};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

type Store = HashMap<String, Vec<Vec<Term>>>;

/// Thread-safe in-memory fact store with Rust-coded derivations.
#[derive(Default)]
pub struct MemoryKernel {
    store: Mutex<Store>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored fact, for diagnostics.
    pub fn dump(&self) -> Vec<Fact> {
        let store = self.store.lock().expect("kernel store poisoned");
        let mut facts: Vec<Fact> = store
            .iter()
            .flat_map(|(pred, rows)| {
                rows.iter()
                    .map(|args| Fact::new(pred, args.clone()))
            })
            .collect();
        facts.sort_by(|a, b| a.predicate.cmp(&b.predicate));
        facts
    }
}

impl Kernel for MemoryKernel {
    fn assert_facts(&self, facts: &[Fact]) -> Result<(), KernelError> {
        let mut store = self.store.lock().expect("kernel store poisoned");
        for fact in facts {
            store
                .entry(fact.predicate.clone())
                .or_default()
                .push(fact.args.clone());
        }
        Ok(())
    }

    fn retract(&self, predicate: &str, prefix: &[Term]) -> Result<usize, KernelError> {
        let mut store = self.store.lock().expect("kernel store poisoned");
        let Some(rows) = store.get_mut(predicate) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|args| {
            !(prefix.len() <= args.len() && prefix.iter().zip(args.iter()).all(|(p, a)| p == a))
        });
        Ok(before - rows.len())
    }

    fn query(&self, predicate: &str, pattern: &[Pattern]) -> Result<Vec<Fact>, KernelError> {
        let store = self.store.lock().expect("kernel store poisoned");
        let rows = match predicate {
            "current_phase" => derive_current_phase(&store),
            "phase_eligible" => derive_phase_eligible(&store),
            "eligible_task" => derive_eligible_tasks(&store),
            "next_campaign_task" => derive_eligible_tasks(&store).into_iter().take(1).collect(),
            "campaign_blocked" => derive_campaign_blocked(&store),
            "replan_needed" => derive_replan_needed(&store),
            "validation_error" => derive_validation_errors(&store),
            _ => store.get(predicate).cloned().unwrap_or_default(),
        };
        Ok(rows
            .into_iter()
            .filter(|args| {
                pattern.len() <= args.len()
                    && pattern.iter().zip(args.iter()).all(|(p, a)| p.matches(a))
            })
            .map(|args| Fact::new(predicate, args))
            .collect())
    }
}

fn is_done(status: &str) -> bool {
    status == "completed" || status == "skipped"
}

fn str_arg<'a>(args: &'a [Term], idx: usize) -> &'a str {
    args.get(idx).and_then(Term::as_str).unwrap_or("")
}

fn int_arg(args: &[Term], idx: usize) -> i64 {
    args.get(idx).and_then(Term::as_int).unwrap_or(0)
}

fn rows<'a>(store: &'a Store, predicate: &str) -> &'a [Vec<Term>] {
    store.get(predicate).map(Vec::as_slice).unwrap_or(&[])
}

/// `campaign_phase(C, P, Order, Status)` with status in_progress.
fn derive_current_phase(store: &Store) -> Vec<Vec<Term>> {
    rows(store, "campaign_phase")
        .iter()
        .filter(|args| str_arg(args, 3) == "in_progress")
        .map(|args| vec![args[1].clone()])
        .collect()
}

/// Pending phases whose hard dependencies are all completed or skipped,
/// ordered by phase order.
fn derive_phase_eligible(store: &Store) -> Vec<Vec<Term>> {
    let phase_status: HashMap<&str, &str> = rows(store, "campaign_phase")
        .iter()
        .map(|args| (str_arg(args, 1), str_arg(args, 3)))
        .collect();

    let mut eligible: Vec<(i64, Term)> = rows(store, "campaign_phase")
        .iter()
        .filter(|args| str_arg(args, 3) == "pending")
        .filter(|args| {
            let phase = str_arg(args, 1);
            rows(store, "phase_dependency")
                .iter()
                .filter(|dep| str_arg(dep, 0) == phase && str_arg(dep, 2) == "hard")
                .all(|dep| {
                    phase_status
                        .get(str_arg(dep, 1))
                        .is_some_and(|s| is_done(s))
                })
        })
        .map(|args| (int_arg(args, 2), args[1].clone()))
        .collect();
    eligible.sort_by_key(|(order, _)| *order);
    eligible.into_iter().map(|(_, p)| vec![p]).collect()
}

fn priority_rank(priority: &str) -> i64 {
    match priority {
        "critical" => 0,
        "high" => 1,
        "low" => 3,
        _ => 2,
    }
}

/// Pending tasks whose hard dependencies are done, whose backoff has
/// elapsed, and whose resource labels conflict with no in-progress task.
/// Ordered by priority, then stable task order.
fn derive_eligible_tasks(store: &Store) -> Vec<Vec<Term>> {
    let now_ms = Utc::now().timestamp_millis();
    let task_status: HashMap<&str, &str> = rows(store, "campaign_task")
        .iter()
        .map(|args| (str_arg(args, 2), str_arg(args, 3)))
        .collect();
    let retry_at: HashMap<&str, i64> = rows(store, "task_retry_at")
        .iter()
        .map(|args| (str_arg(args, 0), int_arg(args, 1)))
        .collect();
    let priority: HashMap<&str, &str> = rows(store, "task_priority")
        .iter()
        .map(|args| (str_arg(args, 0), str_arg(args, 1)))
        .collect();
    let order: HashMap<&str, i64> = rows(store, "task_order")
        .iter()
        .map(|args| (str_arg(args, 0), int_arg(args, 1)))
        .collect();

    // Resource labels held by in-progress tasks.
    let held: HashSet<&str> = rows(store, "requires_resource")
        .iter()
        .filter(|args| {
            task_status
                .get(str_arg(args, 0))
                .is_some_and(|s| *s == "in_progress")
        })
        .map(|args| str_arg(args, 1))
        .collect();

    let mut eligible: Vec<(i64, i64, Term)> = rows(store, "campaign_task")
        .iter()
        .filter(|args| str_arg(args, 3) == "pending")
        .filter(|args| {
            let task = str_arg(args, 2);
            let deps_done = rows(store, "task_dependency")
                .iter()
                .filter(|dep| str_arg(dep, 0) == task)
                .all(|dep| {
                    task_status
                        .get(str_arg(dep, 1))
                        .is_some_and(|s| is_done(s))
                });
            let retry_ok = retry_at.get(task).is_none_or(|at| now_ms >= *at);
            let resources_free = rows(store, "requires_resource")
                .iter()
                .filter(|r| str_arg(r, 0) == task)
                .all(|r| !held.contains(str_arg(r, 1)));
            deps_done && retry_ok && resources_free
        })
        .map(|args| {
            let task = str_arg(args, 2);
            (
                priority_rank(priority.get(task).copied().unwrap_or("normal")),
                order.get(task).copied().unwrap_or(0),
                args[2].clone(),
            )
        })
        .collect();
    eligible.sort_by_key(|(rank, ord, _)| (*rank, *ord));
    eligible.into_iter().map(|(_, _, t)| vec![t]).collect()
}

/// A campaign is blocked when its current phase has no runnable work left
/// but is not complete, or when no phase can ever become eligible.
fn derive_campaign_blocked(store: &Store) -> Vec<Vec<Term>> {
    let mut blocked = Vec::new();
    let campaigns: HashSet<&str> = rows(store, "campaign_phase")
        .iter()
        .map(|args| str_arg(args, 0))
        .collect();

    for campaign in campaigns {
        let phases: Vec<&Vec<Term>> = rows(store, "campaign_phase")
            .iter()
            .filter(|args| str_arg(args, 0) == campaign)
            .collect();

        if let Some(current) = phases
            .iter()
            .find(|args| str_arg(args, 3) == "in_progress")
        {
            let phase_id = str_arg(current, 1);
            let tasks: Vec<&Vec<Term>> = rows(store, "campaign_task")
                .iter()
                .filter(|args| str_arg(args, 1) == phase_id)
                .collect();
            let open = tasks
                .iter()
                .any(|t| matches!(str_arg(t, 3), "pending" | "in_progress"));
            let failed = tasks.iter().filter(|t| str_arg(t, 3) == "failed").count();
            let blocked_tasks = tasks.iter().filter(|t| str_arg(t, 3) == "blocked").count();
            if !open && failed > 0 {
                blocked.push(vec![
                    Term::from(campaign),
                    Term::from(format!(
                        "phase {phase_id} has {failed} terminally failed task(s)"
                    )),
                ]);
            } else if !open && blocked_tasks > 0 {
                blocked.push(vec![
                    Term::from(campaign),
                    Term::from(format!(
                        "phase {phase_id} has {blocked_tasks} task(s) withheld with no runnable work"
                    )),
                ]);
            }
            continue;
        }

        let all_done = phases.iter().all(|args| is_done(str_arg(args, 3)));
        if all_done {
            continue;
        }
        let any_eligible = derive_phase_eligible(store)
            .iter()
            .any(|row| phases.iter().any(|p| p[1] == row[0]));
        if !any_eligible {
            blocked.push(vec![
                Term::from(campaign),
                Term::from("no phase is eligible and the campaign is not complete"),
            ]);
        }
    }
    blocked
}

/// Replan is needed when a trigger fact is active or the failed-task count
/// has reached the configured threshold.
fn derive_replan_needed(store: &Store) -> Vec<Vec<Term>> {
    let mut needed = Vec::new();
    for args in rows(store, "replan_trigger") {
        needed.push(vec![args[0].clone(), args[1].clone()]);
    }
    for args in rows(store, "failed_campaign_task_count_computed") {
        let campaign = str_arg(args, 0);
        let count = int_arg(args, 1);
        let threshold = rows(store, "campaign_config")
            .iter()
            .find(|c| str_arg(c, 0) == campaign && str_arg(c, 1) == "replan_threshold")
            .map(|c| int_arg(c, 2))
            .unwrap_or(3);
        if count >= threshold {
            needed.push(vec![
                Term::from(campaign),
                Term::from("/failed_task_threshold"),
            ]);
        }
    }
    needed
}

/// Structural plan validation over the loaded facts.
fn derive_validation_errors(store: &Store) -> Vec<Vec<Term>> {
    let mut errors = Vec::new();

    let task_ids: HashSet<&str> = rows(store, "campaign_task")
        .iter()
        .map(|args| str_arg(args, 2))
        .collect();
    let phase_ids: HashSet<&str> = rows(store, "campaign_phase")
        .iter()
        .map(|args| str_arg(args, 1))
        .collect();
    let campaign_of_phase: HashMap<&str, &str> = rows(store, "campaign_phase")
        .iter()
        .map(|args| (str_arg(args, 1), str_arg(args, 0)))
        .collect();
    let campaign_of_task: HashMap<&str, &str> = rows(store, "campaign_task")
        .iter()
        .map(|args| (str_arg(args, 2), str_arg(args, 0)))
        .collect();

    for args in rows(store, "task_dependency") {
        let (task, dep) = (str_arg(args, 0), str_arg(args, 1));
        if !task_ids.contains(dep) {
            let campaign = campaign_of_task.get(task).copied().unwrap_or("");
            errors.push(vec![
                Term::from(campaign),
                Term::from("unknown_task_dependency"),
                Term::from(format!("{task} -> {dep}")),
            ]);
        }
    }

    for args in rows(store, "phase_dependency") {
        let (phase, dep) = (str_arg(args, 0), str_arg(args, 1));
        if !phase_ids.contains(dep) {
            let campaign = campaign_of_phase.get(phase).copied().unwrap_or("");
            errors.push(vec![
                Term::from(campaign),
                Term::from("unknown_phase_dependency"),
                Term::from(format!("{phase} -> {dep}")),
            ]);
        }
    }

    // Duplicate phase orders within a campaign.
    let mut seen_orders: HashMap<(&str, i64), &str> = HashMap::new();
    for args in rows(store, "campaign_phase") {
        let key = (str_arg(args, 0), int_arg(args, 2));
        if let Some(first) = seen_orders.insert(key, str_arg(args, 1)) {
            errors.push(vec![
                Term::from(key.0),
                Term::from("duplicate_phase_order"),
                Term::from(format!("{} and {} share order {}", first, str_arg(args, 1), key.1)),
            ]);
        }
    }

    // Phases with no tasks.
    let phases_with_tasks: HashSet<&str> = rows(store, "campaign_task")
        .iter()
        .map(|args| str_arg(args, 1))
        .collect();
    for args in rows(store, "campaign_phase") {
        let phase = str_arg(args, 1);
        if !phases_with_tasks.contains(phase) {
            errors.push(vec![
                Term::from(str_arg(args, 0)),
                Term::from("empty_phase"),
                Term::from(phase),
            ]);
        }
    }

    // Hard-dependency cycles among phases.
    for phase in &phase_ids {
        if has_cycle(store, phase, &mut HashSet::new()) {
            let campaign = campaign_of_phase.get(*phase).copied().unwrap_or("");
            errors.push(vec![
                Term::from(campaign),
                Term::from("phase_cycle"),
                Term::from(*phase),
            ]);
        }
    }

    errors
}

fn has_cycle<'a>(store: &'a Store, start: &str, visiting: &mut HashSet<&'a str>) -> bool {
    for args in rows(store, "phase_dependency") {
        if str_arg(args, 0) != start || str_arg(args, 2) != "hard" {
            continue;
        }
        let dep = str_arg(args, 1);
        if dep == start || visiting.contains(dep) {
            return true;
        }
        visiting.insert(dep);
        if has_cycle(store, dep, visiting) {
            return true;
        }
        visiting.remove(dep);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact;
    use crate::kernel::KernelExt;

    fn seed_linear_campaign(kernel: &MemoryKernel) {
        kernel
            .assert_facts(&[
                fact!("campaign_phase", "c1", "p0", 0_i64, "in_progress"),
                fact!("campaign_phase", "c1", "p1", 1_i64, "pending"),
                fact!("phase_dependency", "p1", "p0", "hard"),
                fact!("campaign_task", "c1", "p0", "t0", "pending"),
                fact!("campaign_task", "c1", "p0", "t1", "pending"),
                fact!("task_dependency", "t1", "t0"),
                fact!("task_order", "t0", 0_i64),
                fact!("task_order", "t1", 1_i64),
                fact!("campaign_task", "c1", "p1", "t2", "pending"),
                fact!("task_order", "t2", 0_i64),
            ])
            .unwrap();
    }

    #[test]
    fn test_retract_prefix_match() {
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("task_retry_at", "t0", 100_i64),
                fact!("task_retry_at", "t1", 200_i64),
            ])
            .unwrap();
        let removed = kernel.retract("task_retry_at", &[Term::from("t0")]).unwrap();
        assert_eq!(removed, 1);
        let rest = kernel.query("task_retry_at", &[]).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].args[0], Term::from("t1"));
    }

    #[test]
    fn test_current_phase_and_eligible_task() {
        let kernel = MemoryKernel::new();
        seed_linear_campaign(&kernel);

        let current = kernel.query("current_phase", &[]).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].args[0], Term::from("p0"));

        // t1 depends on t0; t2 is in a later phase but task eligibility is
        // phase-agnostic (the scheduler intersects with the current phase).
        let eligible: Vec<String> = kernel
            .query("eligible_task", &[])
            .unwrap()
            .into_iter()
            .map(|f| f.args[0].to_string())
            .collect();
        assert!(eligible.contains(&"t0".to_string()));
        assert!(!eligible.contains(&"t1".to_string()));

        // Completing t0 unlocks t1.
        kernel
            .replace(
                "campaign_task",
                &[Term::from("c1"), Term::from("p0"), Term::from("t0")],
                &[fact!("campaign_task", "c1", "p0", "t0", "completed")],
            )
            .unwrap();
        let eligible: Vec<String> = kernel
            .query("eligible_task", &[])
            .unwrap()
            .into_iter()
            .map(|f| f.args[0].to_string())
            .collect();
        assert!(eligible.contains(&"t1".to_string()));
    }

    #[test]
    fn test_eligible_task_honours_backoff() {
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("campaign_task", "c1", "p0", "t0", "pending"),
                fact!(
                    "task_retry_at",
                    "t0",
                    Utc::now().timestamp_millis() + 60_000
                ),
            ])
            .unwrap();
        assert!(kernel.query("eligible_task", &[]).unwrap().is_empty());

        kernel.retract("task_retry_at", &[Term::from("t0")]).unwrap();
        assert_eq!(kernel.query("eligible_task", &[]).unwrap().len(), 1);
    }

    #[test]
    fn test_eligible_task_resource_exclusion() {
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("campaign_task", "c1", "p0", "t0", "in_progress"),
                fact!("campaign_task", "c1", "p0", "t1", "pending"),
                fact!("requires_resource", "t0", "database"),
                fact!("requires_resource", "t1", "database"),
            ])
            .unwrap();
        assert!(kernel.query("eligible_task", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_eligible_task_priority_order() {
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("campaign_task", "c1", "p0", "t0", "pending"),
                fact!("campaign_task", "c1", "p0", "t1", "pending"),
                fact!("task_order", "t0", 0_i64),
                fact!("task_order", "t1", 1_i64),
                fact!("task_priority", "t1", "critical"),
            ])
            .unwrap();
        let eligible = kernel.query("eligible_task", &[]).unwrap();
        assert_eq!(eligible[0].args[0], Term::from("t1"));
    }

    #[test]
    fn test_phase_eligible_waits_for_hard_dep() {
        let kernel = MemoryKernel::new();
        seed_linear_campaign(&kernel);

        let eligible = kernel.query("phase_eligible", &[]).unwrap();
        assert!(eligible.is_empty());

        kernel
            .replace(
                "campaign_phase",
                &[Term::from("c1"), Term::from("p0")],
                &[fact!("campaign_phase", "c1", "p0", 0_i64, "completed")],
            )
            .unwrap();
        let eligible = kernel.query("phase_eligible", &[]).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].args[0], Term::from("p1"));
    }

    #[test]
    fn test_campaign_blocked_on_failed_tasks() {
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("campaign_phase", "c1", "p0", 0_i64, "in_progress"),
                fact!("campaign_task", "c1", "p0", "t0", "failed"),
                fact!("campaign_task", "c1", "p0", "t1", "completed"),
            ])
            .unwrap();
        let blocked = kernel
            .query("campaign_blocked", &[Pattern::from("c1"), Pattern::Any])
            .unwrap();
        assert_eq!(blocked.len(), 1);
        assert!(blocked[0].args[1].to_string().contains("failed"));
    }

    #[test]
    fn test_campaign_not_blocked_while_work_remains() {
        let kernel = MemoryKernel::new();
        seed_linear_campaign(&kernel);
        assert!(kernel.query("campaign_blocked", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_replan_needed_from_trigger_and_threshold() {
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[fact!("replan_trigger", "c1", "/checkpoint_failed", 1_i64)])
            .unwrap();
        let needed = kernel.query("replan_needed", &[]).unwrap();
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].args[1], Term::from("/checkpoint_failed"));

        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("failed_campaign_task_count_computed", "c1", 1_i64),
                fact!("campaign_config", "c1", "replan_threshold", 1_i64),
            ])
            .unwrap();
        assert!(kernel.holds("replan_needed", &[Pattern::from("c1")]).unwrap());

        // Below threshold: no derivation.
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[fact!("failed_campaign_task_count_computed", "c1", 1_i64)])
            .unwrap();
        assert!(!kernel.holds("replan_needed", &[]).unwrap());
    }

    #[test]
    fn test_validation_errors() {
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("campaign_phase", "c1", "p0", 0_i64, "pending"),
                fact!("campaign_phase", "c1", "p1", 0_i64, "pending"),
                fact!("campaign_task", "c1", "p0", "t0", "pending"),
                fact!("task_dependency", "t0", "missing"),
            ])
            .unwrap();
        let errors = kernel.query("validation_error", &[]).unwrap();
        let kinds: HashSet<String> = errors
            .iter()
            .map(|f| f.args[1].to_string())
            .collect();
        assert!(kinds.contains("unknown_task_dependency"));
        assert!(kinds.contains("duplicate_phase_order"));
        assert!(kinds.contains("empty_phase"));
    }

    #[test]
    fn test_validation_detects_phase_cycle() {
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("campaign_phase", "c1", "p0", 0_i64, "pending"),
                fact!("campaign_phase", "c1", "p1", 1_i64, "pending"),
                fact!("campaign_task", "c1", "p0", "t0", "pending"),
                fact!("campaign_task", "c1", "p1", "t1", "pending"),
                fact!("phase_dependency", "p0", "p1", "hard"),
                fact!("phase_dependency", "p1", "p0", "hard"),
            ])
            .unwrap();
        let errors = kernel.query("validation_error", &[Pattern::Any, Pattern::from("phase_cycle")]).unwrap();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_batch_assert_is_atomic_under_lock() {
        // Both tuples from one batch are visible to the next query.
        let kernel = MemoryKernel::new();
        kernel
            .assert_facts(&[
                fact!("campaign_goal", "c1", "ship auth"),
                fact!("goal_topic", "c1", "auth"),
            ])
            .unwrap();
        assert!(kernel.holds("campaign_goal", &[]).unwrap());
        assert!(kernel.holds("goal_topic", &[]).unwrap());
    }
}

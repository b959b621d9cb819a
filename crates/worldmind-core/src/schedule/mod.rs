//! Wave scheduling: which tasks are eligible to dispatch next.
//!
//! [`next_wave`] is a pure function of its inputs, which is what makes
//! checkpoint replay deterministic: the same tasks, completion set,
//! strategy, and parallelism limit always yield the same wave, with ties
//! broken by declared task order.

use std::collections::HashMap;

use crate::mission::{ExecutionStrategy, Task};

/// Compute the next wave of task ids to dispatch.
///
/// A task is eligible when it is not yet in `completed_ids` and every
/// dependency is satisfied. A dependency may name a task id or an agent tag
/// (e.g. `"researcher"`); a tag is satisfied by any completed task of that
/// agent kind.
///
/// Under [`ExecutionStrategy::Parallel`] a task is additionally deferred
/// when any of its `target_files` overlaps a file already claimed by a wave
/// member; the wave is capped at `max_parallel`. Under
/// [`ExecutionStrategy::Sequential`] the cap is 1.
///
/// A task with empty `target_files` claims nothing and co-schedules freely
/// with file-touching tasks.
pub fn next_wave(
    tasks: &[Task],
    completed_ids: &[String],
    strategy: ExecutionStrategy,
    max_parallel: usize,
) -> Vec<String> {
    let limit = match strategy {
        ExecutionStrategy::Sequential => 1,
        ExecutionStrategy::Parallel => max_parallel.max(1),
    };

    // Dependencies may name an agent tag instead of a concrete task id;
    // map each completed task's agent tag to its id.
    let mut completed_agents: HashMap<String, &str> = HashMap::new();
    for task in tasks {
        if completed_ids.iter().any(|id| id == &task.id) {
            completed_agents
                .entry(task.agent.to_string())
                .or_insert(&task.id);
        }
    }

    let dependency_satisfied = |dep: &str| -> bool {
        completed_ids.iter().any(|id| id == dep)
            || completed_agents.contains_key(&dep.to_ascii_lowercase())
    };

    let mut wave: Vec<String> = Vec::new();
    let mut claimed_files: Vec<&str> = Vec::new();

    for task in tasks {
        if wave.len() >= limit {
            break;
        }
        if completed_ids.iter().any(|id| id == &task.id) {
            continue;
        }
        if !task.dependencies.iter().all(|d| dependency_satisfied(d)) {
            continue;
        }

        if strategy == ExecutionStrategy::Parallel {
            let overlaps = task.target_files.iter().any(|candidate| {
                claimed_files
                    .iter()
                    .any(|claimed| paths_conflict(candidate, claimed))
            });
            if overlaps {
                crate::metrics::global_metrics()
                    .incr(crate::metrics::name::FILE_OVERLAP_DEFERRALS_TOTAL, &[]);
                continue;
            }
            claimed_files.extend(task.target_files.iter().map(String::as_str));
        }

        wave.push(task.id.clone());
    }

    wave
}

/// Conservative path-overlap rule.
///
/// Two paths conflict when, after stripping a leading `./`, they are equal
/// or one is a suffix of the other joined at a `/` boundary (which covers
/// relative vs absolute spellings of the same file). The suffix check is
/// directional and can over-serialize unrelated paths sharing trailing
/// segments; false positives only serialize work, never admit a conflict.
pub fn paths_conflict(a: &str, b: &str) -> bool {
    let a = a.strip_prefix("./").unwrap_or(a);
    let b = b.strip_prefix("./").unwrap_or(b);
    if a == b {
        return true;
    }
    is_path_suffix(a, b) || is_path_suffix(b, a)
}

/// True when `suffix` matches the tail of `path` at a `/` boundary.
fn is_path_suffix(path: &str, suffix: &str) -> bool {
    path.len() > suffix.len()
        && path.ends_with(suffix)
        && path.as_bytes()[path.len() - suffix.len() - 1] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::AgentKind;

    fn task(id: &str, deps: &[&str], files: &[&str]) -> Task {
        let mut t = Task::new(id, AgentKind::Coder, format!("objective for {id}"));
        t.dependencies = deps.iter().map(|s| s.to_string()).collect();
        t.target_files = files.iter().map(|s| s.to_string()).collect();
        t
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    // -- paths_conflict --

    #[test]
    fn identical_paths_conflict() {
        assert!(paths_conflict("src/x.rs", "src/x.rs"));
    }

    #[test]
    fn dot_slash_prefix_is_stripped() {
        assert!(paths_conflict("./src/x.rs", "src/x.rs"));
        assert!(paths_conflict("src/x.rs", "./src/x.rs"));
    }

    #[test]
    fn suffix_at_slash_boundary_conflicts() {
        assert!(paths_conflict("/repo/src/x.rs", "src/x.rs"));
        assert!(paths_conflict("src/x.rs", "/repo/src/x.rs"));
    }

    #[test]
    fn partial_filename_does_not_conflict() {
        // "x.rs" is a suffix of "max.rs" but not at a path boundary.
        assert!(!paths_conflict("src/max.rs", "x.rs"));
        assert!(!paths_conflict("src/a.rs", "src/b.rs"));
    }

    // -- next_wave --

    #[test]
    fn linear_chain_dispatches_one_at_a_time() {
        // A, then B after A, then C after B.
        let tasks = vec![
            task("a", &[], &[]),
            task("b", &["a"], &[]),
            task("c", &["b"], &[]),
        ];

        assert_eq!(
            next_wave(&tasks, &[], ExecutionStrategy::Parallel, 10),
            ids(&["a"])
        );
        assert_eq!(
            next_wave(&tasks, &ids(&["a"]), ExecutionStrategy::Parallel, 10),
            ids(&["b"])
        );
        assert_eq!(
            next_wave(&tasks, &ids(&["a", "b"]), ExecutionStrategy::Parallel, 10),
            ids(&["c"])
        );
        assert!(next_wave(&tasks, &ids(&["a", "b", "c"]), ExecutionStrategy::Parallel, 10)
            .is_empty());
    }

    #[test]
    fn diamond_fans_out_in_the_middle() {
        // A; B and C after A; D after both.
        let tasks = vec![
            task("a", &[], &[]),
            task("b", &["a"], &[]),
            task("c", &["a"], &[]),
            task("d", &["b", "c"], &[]),
        ];

        assert_eq!(
            next_wave(&tasks, &[], ExecutionStrategy::Parallel, 10),
            ids(&["a"])
        );
        let middle = next_wave(&tasks, &ids(&["a"]), ExecutionStrategy::Parallel, 10);
        assert_eq!(middle.len(), 2);
        assert!(middle.contains(&"b".to_string()));
        assert!(middle.contains(&"c".to_string()));
        assert_eq!(
            next_wave(&tasks, &ids(&["a", "b", "c"]), ExecutionStrategy::Parallel, 10),
            ids(&["d"])
        );
        assert!(
            next_wave(&tasks, &ids(&["a", "b", "c", "d"]), ExecutionStrategy::Parallel, 10)
                .is_empty()
        );
    }

    #[test]
    fn file_overlap_defers_second_task() {
        // A and B both target src/x.j; B is deferred to the next wave.
        let tasks = vec![
            task("a", &[], &["src/x.j"]),
            task("b", &[], &["src/x.j", "src/y.j"]),
        ];

        assert_eq!(
            next_wave(&tasks, &[], ExecutionStrategy::Parallel, 10),
            ids(&["a"])
        );
        assert_eq!(
            next_wave(&tasks, &ids(&["a"]), ExecutionStrategy::Parallel, 10),
            ids(&["b"])
        );
    }

    #[test]
    fn sequential_strategy_caps_at_one() {
        let tasks = vec![task("a", &[], &[]), task("b", &[], &[])];
        assert_eq!(
            next_wave(&tasks, &[], ExecutionStrategy::Sequential, 10),
            ids(&["a"])
        );
    }

    #[test]
    fn max_parallel_caps_the_wave() {
        let tasks = vec![
            task("a", &[], &[]),
            task("b", &[], &[]),
            task("c", &[], &[]),
        ];
        assert_eq!(
            next_wave(&tasks, &[], ExecutionStrategy::Parallel, 2),
            ids(&["a", "b"])
        );
    }

    #[test]
    fn agent_tag_dependency_resolves_to_completed_task() {
        let mut research = task("gather-context", &[], &[]);
        research.agent = AgentKind::Researcher;
        let dependent = task("implement", &["researcher"], &[]);
        let tasks = vec![research, dependent];

        // Unsatisfied while the researcher task is incomplete.
        assert_eq!(
            next_wave(&tasks, &[], ExecutionStrategy::Parallel, 10),
            ids(&["gather-context"])
        );
        // The tag resolves once it completes.
        assert_eq!(
            next_wave(&tasks, &ids(&["gather-context"]), ExecutionStrategy::Parallel, 10),
            ids(&["implement"])
        );
    }

    #[test]
    fn agent_tag_matches_case_insensitively() {
        let mut research = task("r1", &[], &[]);
        research.agent = AgentKind::Researcher;
        let dependent = task("impl", &["RESEARCHER"], &[]);
        let tasks = vec![research, dependent];

        assert_eq!(
            next_wave(&tasks, &ids(&["r1"]), ExecutionStrategy::Parallel, 10),
            ids(&["impl"])
        );
    }

    #[test]
    fn empty_target_files_claims_nothing() {
        // A file-less task co-schedules with file-touching tasks.
        let tasks = vec![
            task("a", &[], &["src/x.rs"]),
            task("b", &[], &[]),
            task("c", &[], &["src/x.rs"]),
        ];
        let wave = next_wave(&tasks, &[], ExecutionStrategy::Parallel, 10);
        assert_eq!(wave, ids(&["a", "b"]));
    }

    #[test]
    fn same_inputs_same_output() {
        let tasks = vec![
            task("a", &[], &["src/a.rs"]),
            task("b", &[], &["src/b.rs"]),
            task("c", &["a"], &[]),
        ];
        let first = next_wave(&tasks, &[], ExecutionStrategy::Parallel, 4);
        for _ in 0..10 {
            assert_eq!(next_wave(&tasks, &[], ExecutionStrategy::Parallel, 4), first);
        }
    }

    #[test]
    fn wave_members_never_share_files_under_parallel() {
        // Property check over a handful of overlap layouts.
        let layouts: Vec<Vec<Task>> = vec![
            vec![
                task("a", &[], &["src/x.rs"]),
                task("b", &[], &["./src/x.rs"]),
                task("c", &[], &["src/y.rs"]),
            ],
            vec![
                task("a", &[], &["lib/core.rs", "lib/util.rs"]),
                task("b", &[], &["lib/util.rs"]),
                task("c", &[], &["/abs/lib/core.rs"]),
            ],
        ];

        for tasks in &layouts {
            let wave = next_wave(tasks, &[], ExecutionStrategy::Parallel, 10);
            for (i, left) in wave.iter().enumerate() {
                for right in &wave[i + 1..] {
                    let lt = tasks.iter().find(|t| &t.id == left).unwrap();
                    let rt = tasks.iter().find(|t| &t.id == right).unwrap();
                    for lf in &lt.target_files {
                        for rf in &rt.target_files {
                            assert!(
                                !paths_conflict(lf, rf),
                                "wave admitted overlapping files {lf:?} and {rf:?}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn completed_tasks_are_skipped() {
        let tasks = vec![task("a", &[], &[]), task("b", &[], &[])];
        assert_eq!(
            next_wave(&tasks, &ids(&["a"]), ExecutionStrategy::Parallel, 10),
            ids(&["b"])
        );
    }
}

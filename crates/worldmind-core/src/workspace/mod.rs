//! Mission workspace and per-task git isolation.
//!
//! Each mission owns a clone of the target repository at
//! `<workdir>/mission-<id>/repo` and gives every dispatched task its own
//! working tree under `<workdir>/mission-<id>/worktrees/task-<id>`, either
//! as a linked git worktree (sharing the object store) or as a full clone
//! when no shared filesystem is available.
//!
//! Git does not support concurrent worktree operations on one repository
//! (a lock file guards the shared object store), and merges into the base
//! branch must not interleave; all mutating operations here serialize
//! through an internal mutex, which also enforces "at most one merge in
//! flight per mission".

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::metrics::{self, name};

/// Rebase conflicts are retried this many times before giving up.
const MERGE_RETRY_LIMIT: u32 = 2;

/// Fixed backoff between merge attempts, giving pushes from other tasks
/// time to land.
const MERGE_BACKOFF: Duration = Duration::from_millis(500);

/// Errors from workspace git operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A git command could not be executed at all.
    #[error("git command failed: {command}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Filesystem bookkeeping around the workspace failed.
    #[error("workspace io error at {path}: {source}")]
    Fs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of the merge protocol for one task branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: bool,
    /// Number of rebase attempts made (1 when the first try lands).
    pub attempts: u32,
    /// `Some("unresolvable_conflict")` when every attempt conflicted.
    pub reason: Option<String>,
}

/// The git isolation engine for one mission.
pub struct MissionWorkspace {
    mission_root: PathBuf,
    mission_id: String,
    base_branch: String,
    worktrees_enabled: bool,
    git_lock: Arc<Mutex<()>>,
}

impl MissionWorkspace {
    /// Create (or reopen) the workspace for a mission.
    ///
    /// Idempotent: when `<workdir>/mission-<id>/repo` already holds a git
    /// repository the clone is skipped.
    pub fn create(
        workdir: &Path,
        mission_id: &str,
        repo_url: &str,
        base_branch: &str,
        worktrees_enabled: bool,
    ) -> Result<Self, WorkspaceError> {
        let mission_root = workdir.join(format!("mission-{mission_id}"));
        let repo_path = mission_root.join("repo");

        std::fs::create_dir_all(&mission_root).map_err(|e| WorkspaceError::Fs {
            path: mission_root.clone(),
            source: e,
        })?;

        if repo_path.join(".git").exists() {
            tracing::info!(
                mission_id,
                repo = %repo_path.display(),
                "mission repository already cloned"
            );
        } else {
            run_checked(
                &mission_root,
                &["clone", repo_url, "repo"],
            )?;
            tracing::info!(mission_id, repo_url, "cloned mission repository");
        }

        Ok(Self {
            mission_root,
            mission_id: mission_id.to_string(),
            base_branch: base_branch.to_string(),
            worktrees_enabled,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn mission_id(&self) -> &str {
        &self.mission_id
    }

    pub fn repo_path(&self) -> PathBuf {
        self.mission_root.join("repo")
    }

    /// Directory of a task's working tree.
    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.mission_root.join("worktrees").join(format!("task-{task_id}"))
    }

    /// Branch name convention for a task.
    pub fn branch_name(task_id: &str) -> String {
        format!("task-{task_id}")
    }

    /// Acquire a fresh working tree for a task.
    ///
    /// Always fresh: any pre-existing working tree, local branch, or remote
    /// branch of the task's name is removed first, so a retry starts from
    /// the latest base branch rather than a stale tip.
    pub fn acquire_worktree(&self, task_id: &str) -> Result<PathBuf, WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let repo = self.repo_path();
        let branch = Self::branch_name(task_id);
        let tree_path = self.worktree_path(task_id);

        let result = self.acquire_locked(&repo, &branch, &tree_path);
        metrics::global_metrics().incr(
            name::WORKTREE_OPS_TOTAL,
            &[("op", "acquire"), ("success", bool_label(result.is_ok()))],
        );
        result
    }

    fn acquire_locked(
        &self,
        repo: &Path,
        branch: &str,
        tree_path: &Path,
    ) -> Result<PathBuf, WorkspaceError> {
        // Tear down any leftover tree from a prior attempt.
        if tree_path.exists() {
            let _ = run_checked(repo, &["worktree", "remove", "--force", &tree_path.to_string_lossy()]);
            if tree_path.exists() {
                std::fs::remove_dir_all(tree_path).map_err(|e| WorkspaceError::Fs {
                    path: tree_path.to_path_buf(),
                    source: e,
                })?;
            }
            let _ = run_checked(repo, &["worktree", "prune"]);
        }

        // Pick up the latest base branch before branching off it.
        run_checked(repo, &["fetch", "origin"])?;

        // Force-delete stale branches, local and remote. Both are
        // best-effort: absence is the normal case.
        let _ = run_checked(repo, &["branch", "-D", branch]);
        let _ = run_checked(repo, &["push", "origin", "--delete", branch]);

        let parent = tree_path.parent().expect("worktree path has a parent");
        std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::Fs {
            path: parent.to_path_buf(),
            source: e,
        })?;

        // Branch from the remote-tracking ref so a retry always starts at
        // the latest pushed base, not a stale local tip.
        let base_ref = format!("origin/{}", self.base_branch);

        if self.worktrees_enabled {
            run_checked(
                repo,
                &[
                    "worktree",
                    "add",
                    "-B",
                    branch,
                    &tree_path.to_string_lossy(),
                    &base_ref,
                ],
            )?;
        } else {
            // Shared-nothing backend: a full clone from the mission's
            // origin, branched locally.
            let origin_url = run_checked(repo, &["config", "--get", "remote.origin.url"])?
                .trim()
                .to_string();
            run_checked(
                parent,
                &["clone", &origin_url, &tree_path.to_string_lossy()],
            )?;
            run_checked(tree_path, &["checkout", "-B", branch, &base_ref])?;
        }

        tracing::info!(
            mission_id = %self.mission_id,
            branch,
            path = %tree_path.display(),
            "acquired fresh working tree"
        );
        Ok(tree_path.to_path_buf())
    }

    /// Commit all changes in a task's working tree and push its branch.
    ///
    /// Returns `true` when a commit was created, `false` when the tree was
    /// clean (the branch is pushed either way so the merge step can find
    /// it).
    pub fn commit_and_push(&self, task_id: &str, message: &str) -> Result<bool, WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let tree = self.worktree_path(task_id);
        let branch = Self::branch_name(task_id);

        // The worktree may not inherit identity config.
        let _ = run_checked(&tree, &["config", "user.email", "worldmind@localhost"]);
        let _ = run_checked(&tree, &["config", "user.name", "worldmind"]);

        run_checked(&tree, &["add", "-A"])?;

        let status = run_checked(&tree, &["status", "--porcelain"])?;
        let committed = if status.trim().is_empty() {
            false
        } else {
            run_checked(&tree, &["commit", "-m", message])?;
            true
        };

        // Fresh branches are force-pushed: acquire recreated them from base.
        run_checked(&tree, &["push", "--force", "-u", "origin", &branch])?;

        metrics::global_metrics().incr(
            name::WORKTREE_OPS_TOTAL,
            &[("op", "commit_push"), ("success", "true")],
        );
        Ok(committed)
    }

    /// Merge a task branch into the base branch, rebase-first with bounded
    /// retry.
    ///
    /// Protocol per attempt: fetch, fast-forward the local base branch,
    /// rebase it onto `origin/task-<id>`, push. A rebase conflict aborts
    /// and retries after a fixed backoff, at most [`MERGE_RETRY_LIMIT`]
    /// times; persistent conflicts yield `merged = false` with reason
    /// `unresolvable_conflict` rather than an error.
    pub async fn merge_branch(&self, task_id: &str) -> Result<MergeOutcome, WorkspaceError> {
        let branch = Self::branch_name(task_id);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.merge_once(&branch)? {
                MergeAttempt::Merged => {
                    if attempts > 1 {
                        metrics::global_metrics().incr(name::MERGE_RETRY_SUCCESS_TOTAL, &[]);
                        metrics::global_metrics()
                            .incr(name::MERGE_CONFLICTS_TOTAL, &[("resolved", "true")]);
                    }
                    tracing::info!(
                        mission_id = %self.mission_id,
                        branch = %branch,
                        attempts,
                        "merged task branch into base"
                    );
                    return Ok(MergeOutcome {
                        merged: true,
                        attempts,
                        reason: None,
                    });
                }
                MergeAttempt::Conflict { details } => {
                    if attempts <= MERGE_RETRY_LIMIT {
                        tracing::warn!(
                            mission_id = %self.mission_id,
                            branch = %branch,
                            attempts,
                            "rebase conflict, backing off and retrying"
                        );
                        tokio::time::sleep(MERGE_BACKOFF).await;
                        continue;
                    }
                    metrics::global_metrics()
                        .incr(name::MERGE_CONFLICTS_TOTAL, &[("resolved", "false")]);
                    tracing::warn!(
                        mission_id = %self.mission_id,
                        branch = %branch,
                        attempts,
                        details = %details,
                        "merge abandoned after repeated conflicts"
                    );
                    return Ok(MergeOutcome {
                        merged: false,
                        attempts,
                        reason: Some("unresolvable_conflict".to_string()),
                    });
                }
            }
        }
    }

    /// One merge attempt under the git lock.
    fn merge_once(&self, branch: &str) -> Result<MergeAttempt, WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let repo = self.repo_path();

        run_checked(&repo, &["fetch", "origin"])?;
        run_checked(&repo, &["checkout", &self.base_branch])?;
        run_checked(&repo, &["pull", "--ff-only"])?;

        let rebase = run_git(&repo, &["rebase", &format!("origin/{branch}")])?;
        if rebase.status.success() {
            run_checked(&repo, &["push", "origin", &self.base_branch])?;
            return Ok(MergeAttempt::Merged);
        }

        let stderr = String::from_utf8_lossy(&rebase.stderr).to_string();
        let stdout = String::from_utf8_lossy(&rebase.stdout).to_string();
        let _ = run_git(&repo, &["rebase", "--abort"]);

        if stderr.contains("CONFLICT")
            || stdout.contains("CONFLICT")
            || stderr.contains("could not apply")
            || stdout.contains("could not apply")
        {
            return Ok(MergeAttempt::Conflict {
                details: format!("{stdout}\n{stderr}").trim().to_string(),
            });
        }

        Err(WorkspaceError::GitExit {
            command: format!("rebase origin/{branch}"),
            code: rebase.status.code().unwrap_or(-1),
            stderr,
        })
    }

    /// Remove a task's working tree. The branch may linger until cleanup.
    /// Idempotent.
    pub fn release_worktree(&self, task_id: &str) -> Result<(), WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let tree = self.worktree_path(task_id);
        if !tree.exists() {
            return Ok(());
        }

        let repo = self.repo_path();
        let removed = run_checked(
            &repo,
            &["worktree", "remove", "--force", &tree.to_string_lossy()],
        );
        if removed.is_err() && tree.exists() {
            // Clone backend, or a tree git no longer recognises.
            std::fs::remove_dir_all(&tree).map_err(|e| WorkspaceError::Fs {
                path: tree.clone(),
                source: e,
            })?;
        }
        let _ = run_checked(&repo, &["worktree", "prune"]);

        metrics::global_metrics().incr(
            name::WORKTREE_OPS_TOTAL,
            &[("op", "release"), ("success", "true")],
        );
        Ok(())
    }

    /// List the files a task's branch changed relative to the base branch.
    ///
    /// Used by the shared-nothing backend where the dispatcher cannot watch
    /// the working tree directly.
    pub fn files_changed(&self, task_id: &str) -> Result<Vec<String>, WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let repo = self.repo_path();
        let branch = Self::branch_name(task_id);

        run_checked(&repo, &["fetch", "origin"])?;
        let out = run_checked(
            &repo,
            &[
                "diff",
                "--name-only",
                &format!("{}...origin/{branch}", self.base_branch),
            ],
        )?;
        Ok(out.lines().map(str::to_owned).filter(|l| !l.is_empty()).collect())
    }

    /// Remove the entire mission workspace: repo, trees, everything.
    pub fn cleanup(&self) -> Result<(), WorkspaceError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.mission_root.exists() {
            std::fs::remove_dir_all(&self.mission_root).map_err(|e| WorkspaceError::Fs {
                path: self.mission_root.clone(),
                source: e,
            })?;
        }
        tracing::info!(mission_id = %self.mission_id, "mission workspace removed");
        Ok(())
    }
}

enum MergeAttempt {
    Merged,
    Conflict { details: String },
}

fn bool_label(b: bool) -> &'static str {
    if b { "true" } else { "false" }
}

/// Run a git command, surfacing spawn failures only.
fn run_git(dir: &Path, args: &[&str]) -> Result<std::process::Output, WorkspaceError> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| WorkspaceError::Io {
            command: format!("git {}", args.join(" ")),
            source: e,
        })
}

/// Run a git command and require a zero exit, returning stdout.
fn run_checked(dir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = run_git(dir, args)?;
    if !output.status.success() {
        return Err(WorkspaceError::GitExit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// List uncommitted changes (modified + untracked) in a working tree.
///
/// Fallback source for `files_affected` when the agent did not self-report.
pub fn uncommitted_files(tree: &Path) -> Result<Vec<String>, WorkspaceError> {
    let out = run_checked(tree, &["status", "--porcelain"])?;
    Ok(out
        .lines()
        .filter_map(|line| {
            // Porcelain format: "XY path" or "XY old -> new".
            let path = line.get(3..)?;
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            Some(path.to_string())
        })
        .collect())
}

//! Remote task-runner sandbox backend (shared-nothing).
//!
//! Used when no shared filesystem is available: instead of mounting a host
//! working tree, each dispatch submits a one-shot job whose bootstrap
//! clones the repository, checks out the task branch from base, writes the
//! instruction file, runs the same agent entrypoint, and pushes the branch
//! on success. The caller recovers `files_affected` by diffing the pushed
//! branch against base in the mission repository.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::mission::DispatchResult;
use crate::workspace::MissionWorkspace;

use super::{
    DispatchRequest, SandboxDriver, build_agent_env, instructions_rel_path,
    materialize_instructions, parse_files_affected, resolve_credentials, supervise_child,
};

/// Shell bootstrap executed inside the one-shot job container.
///
/// Environment contract: `WORLDMIND_REPO_URL`, `WORLDMIND_TASK_BRANCH`,
/// `WORLDMIND_BASE_BRANCH`, `WORLDMIND_INSTRUCTIONS_PATH`, and
/// `WORLDMIND_INSTRUCTIONS` (the rendered instruction file).
const BOOTSTRAP: &str = r#"set -e
git clone "$WORLDMIND_REPO_URL" /workspace
cd /workspace
git checkout -B "$WORLDMIND_TASK_BRANCH" "origin/$WORLDMIND_BASE_BRANCH"
mkdir -p "$(dirname "$WORLDMIND_INSTRUCTIONS_PATH")"
printf '%s' "$WORLDMIND_INSTRUCTIONS" > "$WORLDMIND_INSTRUCTIONS_PATH"
agent-entrypoint -i "$WORLDMIND_INSTRUCTIONS_PATH"
git add -A
git -c user.email=worldmind@localhost -c user.name=worldmind \
    commit -m "worldmind: $WORLDMIND_TASK_BRANCH" || true
git push --force -u origin "$WORLDMIND_TASK_BRANCH"
"#;

/// Sandbox backend submitting one-shot jobs with their own clones.
pub struct TaskRunnerSandbox {
    docker_binary: String,
    image_prefix: String,
}

impl TaskRunnerSandbox {
    pub fn new() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            image_prefix: "sandbox".to_string(),
        }
    }

    fn job_name(request: &DispatchRequest) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                .collect()
        };
        format!(
            "wm-job-{}-{}-{}",
            sanitize(&request.mission_id),
            sanitize(&request.task.id),
            request.task.iteration
        )
    }
}

impl Default for TaskRunnerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxDriver for TaskRunnerSandbox {
    fn name(&self) -> &str {
        "task_runner"
    }

    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchResult> {
        let started = Instant::now();
        let task_id = request.task.id.clone();
        let branch = MissionWorkspace::branch_name(&task_id);
        let job_name = Self::job_name(request);

        let process_env: HashMap<String, String> = std::env::vars().collect();
        let credentials = resolve_credentials(
            process_env.get("WORLDMIND_PROVIDER_KEY").map(String::as_str),
            process_env.get("WORLDMIND_PROVIDER").map(String::as_str),
            process_env.get("WORLDMIND_MODEL").map(String::as_str),
            &process_env,
        );

        let mut cmd = Command::new(&self.docker_binary);
        cmd.args(["run", "--rm", "--name", job_name.as_str()])
            .args(["--entrypoint", "/bin/sh"]);

        for (key, value) in build_agent_env(request, &credentials) {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        let bootstrap_env = [
            ("WORLDMIND_REPO_URL", request.repo_url.clone()),
            ("WORLDMIND_TASK_BRANCH", branch.clone()),
            ("WORLDMIND_BASE_BRANCH", request.base_branch.clone()),
            (
                "WORLDMIND_INSTRUCTIONS_PATH",
                instructions_rel_path(&task_id),
            ),
            (
                "WORLDMIND_INSTRUCTIONS",
                materialize_instructions(&request.task, &request.dependency_summaries),
            ),
        ];
        for (key, value) in bootstrap_env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }

        cmd.arg(format!("{}:{}", self.image_prefix, request.runtime))
            .args(["-c", BOOTSTRAP]);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            mission_id = %request.mission_id,
            task_id = %task_id,
            job = %job_name,
            "submitting one-shot task-runner job"
        );

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to submit job via {}", self.docker_binary))?;

        let exit = supervise_child(child, request.timeout, &cancel).await?;

        if !exit.success {
            let _ = Command::new(&self.docker_binary)
                .args(["rm", "-f", job_name.as_str()])
                .output()
                .await;
        }

        // No shared tree here; trust the self-report and let the caller
        // recover the rest from the pushed branch.
        let files_affected = parse_files_affected(&exit.raw_output);

        tracing::info!(
            mission_id = %request.mission_id,
            task_id = %task_id,
            success = exit.success,
            "task-runner job finished"
        );

        Ok(DispatchResult {
            task_id,
            success: exit.success,
            failure_reason: exit.failure_reason,
            files_affected,
            raw_output: exit.raw_output,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

//! Local container sandbox backend.
//!
//! Runs the agent image with the task's working tree bind-mounted
//! read-write at `/workspace`. The image tag is derived from the project's
//! detected runtime (`sandbox:<runtime>`), the agent entrypoint reads its
//! instruction file via `-i`, and the per-task wall-clock timeout is
//! enforced on the container process.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::mission::DispatchResult;

use super::{
    DispatchRequest, SandboxDriver, build_agent_env, instructions_rel_path,
    materialize_instructions, parse_files_affected, resolve_credentials, supervise_child,
};

/// Sandbox backend running one local container per dispatch.
pub struct ContainerSandbox {
    docker_binary: String,
    /// Image name prefix; the runtime tag is appended (`sandbox:maven`).
    image_prefix: String,
    extra_flags: Vec<String>,
}

impl ContainerSandbox {
    pub fn new() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            image_prefix: "sandbox".to_string(),
            extra_flags: Vec::new(),
        }
    }

    /// Override the container runtime binary (e.g. `podman`) and flags.
    pub fn with_binary(binary: impl Into<String>, extra_flags: Vec<String>) -> Self {
        Self {
            docker_binary: binary.into(),
            image_prefix: "sandbox".to_string(),
            extra_flags,
        }
    }

    fn container_name(request: &DispatchRequest) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                .collect()
        };
        format!(
            "wm-{}-{}-{}",
            sanitize(&request.mission_id),
            sanitize(&request.task.id),
            request.task.iteration
        )
    }

    fn image(&self, runtime: &str) -> String {
        format!("{}:{}", self.image_prefix, runtime)
    }
}

impl Default for ContainerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxDriver for ContainerSandbox {
    fn name(&self) -> &str {
        "container"
    }

    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchResult> {
        let started = Instant::now();
        let task_id = request.task.id.clone();

        // Write the instruction file into the tree before mounting it.
        let rel_path = instructions_rel_path(&task_id);
        let instructions_path = request.working_tree.join(&rel_path);
        if let Some(parent) = instructions_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(
            &instructions_path,
            materialize_instructions(&request.task, &request.dependency_summaries),
        )
        .with_context(|| format!("failed to write {}", instructions_path.display()))?;

        let process_env: HashMap<String, String> = std::env::vars().collect();
        let credentials = resolve_credentials(
            process_env.get("WORLDMIND_PROVIDER_KEY").map(String::as_str),
            process_env.get("WORLDMIND_PROVIDER").map(String::as_str),
            process_env.get("WORLDMIND_MODEL").map(String::as_str),
            &process_env,
        );

        let container_name = Self::container_name(request);
        let mut cmd = Command::new(&self.docker_binary);
        cmd.args(["run", "--rm", "--name", container_name.as_str()])
            .arg("-v")
            .arg(format!("{}:/workspace", request.working_tree.display()))
            .args(["-w", "/workspace"]);

        for (key, value) in build_agent_env(request, &credentials) {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        for flag in &self.extra_flags {
            cmd.arg(flag);
        }

        cmd.arg(self.image(&request.runtime))
            .arg("-i")
            .arg(format!("/workspace/{rel_path}"));

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            mission_id = %request.mission_id,
            task_id = %task_id,
            container = %container_name,
            image = %self.image(&request.runtime),
            "dispatching task to container"
        );

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {} run", self.docker_binary))?;

        let exit = supervise_child(child, request.timeout, &cancel).await?;

        // Killing the docker client does not stop the container; remove it
        // explicitly on any abnormal path.
        if !exit.success {
            let _ = Command::new(&self.docker_binary)
                .args(["rm", "-f", container_name.as_str()])
                .output()
                .await;
        }

        let mut files_affected = parse_files_affected(&exit.raw_output);
        if files_affected.is_empty() {
            // The agent mutated the mounted tree in place; ask git.
            files_affected =
                crate::workspace::uncommitted_files(&request.working_tree).unwrap_or_default();
        }

        tracing::info!(
            mission_id = %request.mission_id,
            task_id = %task_id,
            success = exit.success,
            files = files_affected.len(),
            "container dispatch finished"
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

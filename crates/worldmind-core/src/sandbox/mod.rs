//! Sandbox drivers: run one task in isolation and return a structured
//! [`DispatchResult`].
//!
//! Two backends share the [`SandboxDriver`] contract. The container backend
//! mounts the task's working tree into a local container; the task-runner
//! backend submits a one-shot job that clones the repository itself
//! (shared-nothing). Which one runs is a deployment-time choice
//! (`provider` in the configuration).

pub mod container;
pub mod task_runner;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use crate::mission::{DispatchResult, Task};

/// An external tool endpoint exposed to the agent.
#[derive(Debug, Clone)]
pub struct McpEndpoint {
    /// Short name; becomes part of the env var names.
    pub name: String,
    pub url: String,
    pub token: Option<String>,
}

/// Everything a driver needs to run one task once.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub mission_id: String,
    pub task: Task,
    /// Summaries of outputs from already-completed dependency tasks.
    pub dependency_summaries: Vec<String>,
    /// Host path of the task's working tree (container backend).
    pub working_tree: PathBuf,
    /// Clone URL of the mission repository (task-runner backend).
    pub repo_url: String,
    pub base_branch: String,
    /// Short-lived signed credential scoping this execution.
    pub credential_token: String,
    pub mcp_endpoints: Vec<McpEndpoint>,
    /// Runtime tag derived from the project's build system; selects the
    /// sandbox image `sandbox:<runtime>`.
    pub runtime: String,
    /// Per-task wall-clock cap.
    pub timeout: Duration,
}

/// A sandbox backend. Dispatch blocks until the task's container exits,
/// times out, or is cancelled.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchResult>;
}

/// Build a driver from the configured provider name.
pub fn create_driver(provider: &str) -> Result<Arc<dyn SandboxDriver>> {
    match provider {
        "container" => Ok(Arc::new(container::ContainerSandbox::new())),
        "task_runner" => Ok(Arc::new(task_runner::TaskRunnerSandbox::new())),
        other => anyhow::bail!(
            "unknown sandbox provider: {other:?} (expected \"container\" or \"task_runner\")"
        ),
    }
}

// ---------------------------------------------------------------------------
// Agent environment
// ---------------------------------------------------------------------------

/// Provider credentials resolved for the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub host: Option<String>,
}

/// Provider-native key env vars checked during auto-detection, in order.
const NATIVE_KEYS: &[(&str, &str)] = &[
    ("ANTHROPIC_API_KEY", "anthropic"),
    ("OPENAI_API_KEY", "openai"),
    ("GEMINI_API_KEY", "gemini"),
];

const DEFAULT_PROVIDER: &str = "anthropic";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Resolve the provider credentials the sandbox should run with.
///
/// Resolution order: an explicit provider key from configuration, then
/// auto-detection by any provider-native key in `env`, then bound service
/// credentials (JSON in `WORLDMIND_BOUND_CREDENTIALS`), then the default
/// provider with no key. A bound credential is only consumed when no
/// explicit key was provided.
pub fn resolve_credentials(
    explicit_key: Option<&str>,
    configured_provider: Option<&str>,
    configured_model: Option<&str>,
    env: &HashMap<String, String>,
) -> ProviderCredentials {
    let model = configured_model.unwrap_or(DEFAULT_MODEL).to_string();

    if let Some(key) = explicit_key {
        return ProviderCredentials {
            provider: configured_provider.unwrap_or(DEFAULT_PROVIDER).to_string(),
            model,
            api_key: Some(key.to_string()),
            host: env.get("WORLDMIND_PROVIDER_HOST").cloned(),
        };
    }

    for (var, provider) in NATIVE_KEYS {
        if let Some(key) = env.get(*var) {
            if !key.is_empty() {
                return ProviderCredentials {
                    provider: (*provider).to_string(),
                    model,
                    api_key: Some(key.clone()),
                    host: env.get("WORLDMIND_PROVIDER_HOST").cloned(),
                };
            }
        }
    }

    if let Some(bound) = env.get("WORLDMIND_BOUND_CREDENTIALS") {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(bound) {
            if let Some(key) = parsed.get("api_key").and_then(|v| v.as_str()) {
                return ProviderCredentials {
                    provider: parsed
                        .get("provider")
                        .and_then(|v| v.as_str())
                        .unwrap_or(DEFAULT_PROVIDER)
                        .to_string(),
                    model,
                    api_key: Some(key.to_string()),
                    host: parsed
                        .get("host")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                };
            }
        }
    }

    ProviderCredentials {
        provider: configured_provider.unwrap_or(DEFAULT_PROVIDER).to_string(),
        model,
        api_key: None,
        host: None,
    }
}

/// Build the environment the agent entrypoint reads.
pub fn build_agent_env(
    request: &DispatchRequest,
    credentials: &ProviderCredentials,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("GOOSE_PROVIDER".to_string(), credentials.provider.clone()),
        ("GOOSE_MODEL".to_string(), credentials.model.clone()),
        (
            "WORLDMIND_AGENT_TOKEN".to_string(),
            request.credential_token.clone(),
        ),
    ];
    if let Some(key) = &credentials.api_key {
        env.push(("GOOSE_PROVIDER__API_KEY".to_string(), key.clone()));
    }
    if let Some(host) = &credentials.host {
        env.push(("GOOSE_PROVIDER__HOST".to_string(), host.clone()));
    }

    if !request.mcp_endpoints.is_empty() {
        let names: Vec<&str> = request
            .mcp_endpoints
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        env.push(("MCP_SERVERS".to_string(), names.join(",")));
        for endpoint in &request.mcp_endpoints {
            let tag = endpoint
                .name
                .to_ascii_uppercase()
                .replace(|c: char| !c.is_ascii_alphanumeric(), "_");
            env.push((format!("MCP_SERVER_{tag}_URL"), endpoint.url.clone()));
            if let Some(token) = &endpoint.token {
                env.push((format!("MCP_SERVER_{tag}_TOKEN"), token.clone()));
            }
        }
    }

    env
}

// ---------------------------------------------------------------------------
// Instruction file
// ---------------------------------------------------------------------------

/// Render the instruction file the agent entrypoint receives via `-i`.
pub fn materialize_instructions(task: &Task, dependency_summaries: &[String]) -> String {
    let mut text = String::with_capacity(1024);
    text.push_str(&format!("# Task: {}\n\n", task.id));
    text.push_str(&format!("Role: {}\n\n", task.agent));
    text.push_str("## Objective\n\n");
    text.push_str(&task.objective);
    text.push_str("\n\n");

    if !task.acceptance_criteria.is_empty() {
        text.push_str("## Acceptance criteria\n\n");
        for criterion in &task.acceptance_criteria {
            text.push_str(&format!("- {criterion}\n"));
        }
        text.push('\n');
    }

    if !task.target_files.is_empty() {
        text.push_str("## Files in scope\n\n");
        for file in &task.target_files {
            text.push_str(&format!("- `{file}`\n"));
        }
        text.push('\n');
    }

    if !dependency_summaries.is_empty() {
        text.push_str("## Context from earlier tasks\n\n");
        for summary in dependency_summaries {
            text.push_str(&format!("- {summary}\n"));
        }
        text.push('\n');
    }

    if task.iteration > 0 {
        text.push_str(&format!(
            "## Retry\n\nThis is attempt {} of {}. ",
            task.iteration + 1,
            task.max_iterations + 1
        ));
        if let Some(feedback) = &task.review_feedback {
            text.push_str("Address the previous review feedback:\n\n");
            for issue in &feedback.issues {
                text.push_str(&format!("- {issue}\n"));
            }
        }
        text.push('\n');
    }

    text.push_str(
        "When finished, print a final line `FILES_AFFECTED: <comma-separated paths>` \
         listing every file you changed.\n",
    );
    text
}

/// Relative path of the instruction file inside a working tree.
pub fn instructions_rel_path(task_id: &str) -> String {
    format!(".worldmind/instructions-{task_id}.md")
}

/// Extract the agent's `FILES_AFFECTED:` self-report from its output.
///
/// The last occurrence wins. Returns an empty list when the agent never
/// reported; callers fall back to `git diff`.
pub fn parse_files_affected(raw_output: &str) -> Vec<String> {
    raw_output
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix("FILES_AFFECTED:"))
        .map(|rest| {
            rest.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Child supervision (shared by both backends)
// ---------------------------------------------------------------------------

/// Outcome of supervising a sandbox process to completion.
pub(crate) struct SupervisedExit {
    pub success: bool,
    pub failure_reason: Option<String>,
    pub raw_output: String,
}

/// Drive a spawned sandbox process to exit, timeout, or cancellation,
/// capturing interleaved stdout/stderr as it arrives so partial output
/// survives a kill.
pub(crate) async fn supervise_child(
    mut child: tokio::process::Child,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<SupervisedExit> {
    use std::sync::Mutex;

    let buffer = Arc::new(Mutex::new(String::new()));

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let buffer = Arc::clone(&buffer);
        readers.push(tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
                buf.push_str(&line);
                buf.push('\n');
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let buffer = Arc::clone(&buffer);
        readers.push(tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
                buf.push_str(&line);
                buf.push('\n');
            }
        }));
    }

    enum Waited {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    // The wait future's borrow of `child` ends with the select expression,
    // so the abnormal paths can kill it afterwards.
    let waited = tokio::select! {
        outcome = tokio::time::timeout(timeout, child.wait()) => match outcome {
            Ok(status) => Waited::Exited(status),
            Err(_elapsed) => Waited::TimedOut,
        },
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    let (success, failure_reason) = match waited {
        Waited::Exited(Ok(status)) if status.success() => (true, None),
        Waited::Exited(Ok(status)) => (
            false,
            Some(format!("crash: exit status {}", status.code().unwrap_or(-1))),
        ),
        Waited::Exited(Err(e)) => (false, Some(format!("crash: {e}"))),
        Waited::TimedOut => {
            let _ = child.kill().await;
            (false, Some("timeout".to_string()))
        }
        Waited::Cancelled => {
            let _ = child.kill().await;
            (false, Some("cancelled".to_string()))
        }
    };

    // Let the readers drain whatever the pipes still hold.
    for reader in readers {
        let _ = reader.await;
    }

    let raw_output = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
    Ok(SupervisedExit {
        success,
        failure_reason,
        raw_output,
    })
}

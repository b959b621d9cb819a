//! `worldmind run` / `worldmind resume`: drive a mission through the graph.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use worldmind_core::bus::EventBus;
use worldmind_core::checkpoint::{CheckpointStore, DurableCheckpointStore, InMemoryCheckpointStore};
use worldmind_core::graph::{MissionGraph, MissionRuntime};
use worldmind_core::llm::ScriptedModel;
use worldmind_core::mission::{ExecutionStrategy, InteractionMode, MissionState, MissionStatus};
use worldmind_core::sandbox;

use crate::config::ResolvedConfig;

pub struct RunArgs {
    pub request: String,
    pub repo_url: String,
    pub mode: String,
    pub strategy: String,
    pub responses: std::path::PathBuf,
    pub ephemeral: bool,
}

/// Load a recorded-responses file: a JSON array of model responses,
/// consumed in call order.
fn load_responses(path: &Path) -> Result<ScriptedModel> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read responses file {}", path.display()))?;
    let values: Vec<serde_json::Value> =
        serde_json::from_str(&contents).context("responses file must be a JSON array")?;
    Ok(ScriptedModel::new(values))
}

async fn checkpoint_store(
    resolved: &ResolvedConfig,
    ephemeral: bool,
) -> Result<Arc<dyn CheckpointStore>> {
    if ephemeral {
        return Ok(Arc::new(InMemoryCheckpointStore::new()));
    }
    let db = worldmind_db::pool::create_pool(&resolved.db_config)
        .await
        .context("failed to connect to database (use --ephemeral for a databaseless run)")?;
    Ok(Arc::new(DurableCheckpointStore::new(db)))
}

fn build_runtime(
    resolved: &ResolvedConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    model: ScriptedModel,
) -> Result<(MissionRuntime, worldmind_core::bus::SubscriptionHandle)> {
    let bus = EventBus::new();
    // Forward every event as a JSON line, the same shape the SSE surface
    // streams.
    let forwarder = bus.subscribe_global(|event| {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
    });

    let driver = sandbox::create_driver(&resolved.pipeline.provider.to_string())?;
    let runtime = MissionRuntime::new(
        resolved.pipeline.clone(),
        bus,
        checkpoints,
        Arc::new(model),
        driver,
        resolved.token_config.clone(),
    );
    Ok((runtime, forwarder))
}

/// Print the user-visible mission response: status, error list, completed
/// task summary.
fn print_summary(state: &MissionState) {
    println!("mission {}: {}", state.mission_id, state.status);
    if !state.completed_task_ids.is_empty() {
        println!("completed tasks:");
        for id in &state.completed_task_ids {
            if let Some(task) = state.task(id) {
                println!("  {} [{}] {}", task.id, task.status, task.objective);
            }
        }
    }
    if !state.errors.is_empty() {
        println!("errors:");
        for error in &state.errors {
            println!("  [{}] {}", error.phase, error.message);
        }
    }
    if state.status == MissionStatus::AwaitingClarification {
        println!("clarification needed:");
        for question in &state.clarification_questions {
            println!("  - {question}");
        }
        println!("amend the request and run `worldmind resume {}`", state.mission_id);
    }
    if state.status == MissionStatus::AwaitingApproval {
        println!("awaiting approval; run `worldmind resume {}`", state.mission_id);
    }
}

pub async fn run_mission(resolved: &ResolvedConfig, args: RunArgs) -> Result<()> {
    let mode: InteractionMode = args
        .mode
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let strategy: ExecutionStrategy = args
        .strategy
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let model = load_responses(&args.responses)?;
    let checkpoints = checkpoint_store(resolved, args.ephemeral).await?;
    let (runtime, _forwarder) = build_runtime(resolved, checkpoints, model)?;

    let mission_id = uuid::Uuid::new_v4().to_string();
    let state = MissionState::new(&mission_id, &args.request, &args.repo_url, mode, strategy);

    let graph = MissionGraph::standard();
    let final_state = graph.run(&runtime, state).await?;
    print_summary(&final_state);
    Ok(())
}

pub async fn resume_mission(
    resolved: &ResolvedConfig,
    mission_id: &str,
    responses: &Path,
) -> Result<()> {
    let model = load_responses(responses)?;
    let checkpoints = checkpoint_store(resolved, false).await?;

    let Some(latest) = checkpoints.latest(mission_id).await? else {
        bail!("no checkpoints found for mission {mission_id}");
    };
    let mut state = latest.rehydrate()?;

    if state.status.is_terminal() {
        bail!(
            "mission {mission_id} already finished with status {}",
            state.status
        );
    }
    // Resuming a clarification pause implies the operator amended the
    // request out of band; drop the pause marker so the graph re-enters.
    if state.status == MissionStatus::AwaitingClarification {
        state.needs_clarification = false;
    }

    let (runtime, _forwarder) = build_runtime(resolved, checkpoints, model)?;
    let graph = MissionGraph::standard();
    let final_state = graph.run(&runtime, state).await?;
    print_summary(&final_state);
    Ok(())
}

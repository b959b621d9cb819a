//! `worldmind status` / `worldmind checkpoints`: inspect the checkpoint
//! log.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use worldmind_core::mission::MissionState;
use worldmind_db::queries::checkpoints as cp_db;

pub async fn show_status(db: &PgPool, mission_id: Option<&str>) -> Result<()> {
    match mission_id {
        Some(id) => show_one(db, id).await,
        None => list_all(db).await,
    }
}

async fn list_all(db: &PgPool) -> Result<()> {
    let mission_ids = cp_db::list_mission_ids(db).await?;
    if mission_ids.is_empty() {
        println!("no missions recorded");
        return Ok(());
    }
    for id in mission_ids {
        let Some(row) = cp_db::latest_checkpoint(db, &id).await? else {
            continue;
        };
        let state: MissionState = serde_json::from_value(row.state)
            .with_context(|| format!("corrupt checkpoint for mission {id}"))?;
        println!(
            "{}  {}  wave {}  {} tasks  {}",
            state.mission_id,
            state.status,
            state.wave_counter,
            state.tasks.len(),
            row.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn show_one(db: &PgPool, mission_id: &str) -> Result<()> {
    let Some(row) = cp_db::latest_checkpoint(db, mission_id).await? else {
        bail!("no checkpoints found for mission {mission_id}");
    };
    let state: MissionState = serde_json::from_value(row.state)
        .with_context(|| format!("corrupt checkpoint for mission {mission_id}"))?;

    println!("mission:  {}", state.mission_id);
    println!("status:   {}", state.status);
    println!("request:  {}", state.request);
    println!("strategy: {}", state.execution_strategy);
    println!("waves:    {}", state.wave_counter);
    println!();
    for task in &state.tasks {
        println!(
            "  {:<24} {:<10} [{}] iteration {}/{}",
            task.id, task.status.to_string(), task.agent, task.iteration, task.max_iterations
        );
    }
    if !state.errors.is_empty() {
        println!();
        println!("errors:");
        for error in &state.errors {
            println!("  [{}] {}", error.phase, error.message);
        }
    }
    Ok(())
}

pub async fn show_checkpoints(db: &PgPool, mission_id: &str) -> Result<()> {
    let rows = cp_db::list_checkpoints(db, mission_id).await?;
    if rows.is_empty() {
        bail!("no checkpoints found for mission {mission_id}");
    }
    for row in rows {
        let status = row
            .state
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("?")
            .to_owned();
        println!(
            "step {:<4} parent {:<4} {}  {}",
            row.step_id,
            row.parent_step_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status,
            row.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

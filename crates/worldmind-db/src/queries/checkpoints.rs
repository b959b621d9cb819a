//! Query functions for the `checkpoints` table.
//!
//! The table is an append-only log: rows are inserted once and never
//! updated. The primary key `(mission_id, step_id)` rejects duplicate step
//! commits, which surfaces replay bugs instead of silently overwriting
//! history.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::CheckpointRow;

/// Insert a checkpoint row. Fails if `(mission_id, step_id)` already exists.
pub async fn insert_checkpoint(
    pool: &PgPool,
    mission_id: &str,
    step_id: i64,
    parent_step_id: Option<i64>,
    state: &serde_json::Value,
) -> Result<CheckpointRow> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "INSERT INTO checkpoints (mission_id, step_id, parent_step_id, state) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(mission_id)
    .bind(step_id)
    .bind(parent_step_id)
    .bind(state)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert checkpoint {step_id} for mission {mission_id}"))?;

    Ok(row)
}

/// Fetch the highest-numbered checkpoint for a mission, if any.
pub async fn latest_checkpoint(pool: &PgPool, mission_id: &str) -> Result<Option<CheckpointRow>> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "SELECT * FROM checkpoints \
         WHERE mission_id = $1 \
         ORDER BY step_id DESC \
         LIMIT 1",
    )
    .bind(mission_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch latest checkpoint for mission {mission_id}"))?;

    Ok(row)
}

/// List all checkpoints for a mission in step order (oldest first).
pub async fn list_checkpoints(pool: &PgPool, mission_id: &str) -> Result<Vec<CheckpointRow>> {
    let rows = sqlx::query_as::<_, CheckpointRow>(
        "SELECT * FROM checkpoints \
         WHERE mission_id = $1 \
         ORDER BY step_id ASC",
    )
    .bind(mission_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list checkpoints for mission {mission_id}"))?;

    Ok(rows)
}

/// List the distinct mission ids present in the log, most recently
/// checkpointed first.
pub async fn list_mission_ids(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT mission_id FROM checkpoints \
         GROUP BY mission_id \
         ORDER BY MAX(created_at) DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list mission ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

//! Checkpoint store: the durable snapshot log that makes missions
//! resumable.
//!
//! Every graph node that mutates mission state commits one checkpoint. A
//! checkpoint carries the *full* serialized [`MissionState`] so replay needs
//! only the latest row. Two implementations share the [`CheckpointStore`]
//! trait: a PostgreSQL-backed store (via `worldmind-db`) and an in-memory
//! fallback used for tests and database-less deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::mission::MissionState;

/// One committed graph step for a mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub mission_id: String,
    /// Monotonic within a mission; resuming continues the sequence.
    pub step_id: i64,
    pub parent_step_id: Option<i64>,
    /// Full mission state snapshot as JSON.
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a checkpoint from a mission state snapshot.
    pub fn snapshot(
        state: &MissionState,
        step_id: i64,
        parent_step_id: Option<i64>,
    ) -> Result<Self> {
        let json = serde_json::to_value(state).context("failed to serialize mission state")?;
        Ok(Self {
            mission_id: state.mission_id.clone(),
            step_id,
            parent_step_id,
            state: json,
            created_at: Utc::now(),
        })
    }

    /// Rehydrate the mission state held in this checkpoint.
    pub fn rehydrate(&self) -> Result<MissionState> {
        serde_json::from_value(self.state.clone())
            .context("failed to deserialize mission state from checkpoint")
    }
}

/// Append-only log of checkpoints keyed by mission id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint. Fails on a duplicate `(mission_id, step_id)`.
    async fn put(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// The highest-numbered checkpoint for a mission, if any.
    async fn latest(&self, mission_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints for a mission in step order (oldest first).
    async fn list(&self, mission_id: &str) -> Result<Vec<Checkpoint>>;

    /// Every mission id present in the log.
    async fn list_missions(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory fallback store. State is lost on process exit.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let log = entries.entry(checkpoint.mission_id.clone()).or_default();
        if log.iter().any(|c| c.step_id == checkpoint.step_id) {
            anyhow::bail!(
                "duplicate checkpoint step {} for mission {}",
                checkpoint.step_id,
                checkpoint.mission_id
            );
        }
        log.push(checkpoint.clone());
        log.sort_by_key(|c| c.step_id);
        Ok(())
    }

    async fn latest(&self, mission_id: &str) -> Result<Option<Checkpoint>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(mission_id)
            .and_then(|log| log.last())
            .cloned())
    }

    async fn list(&self, mission_id: &str) -> Result<Vec<Checkpoint>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(mission_id).cloned().unwrap_or_default())
    }

    async fn list_missions(&self) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Durable store
// ---------------------------------------------------------------------------

/// PostgreSQL-backed store over the `checkpoints` table.
pub struct DurableCheckpointStore {
    pool: PgPool,
}

impl DurableCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for DurableCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<()> {
        worldmind_db::queries::checkpoints::insert_checkpoint(
            &self.pool,
            &checkpoint.mission_id,
            checkpoint.step_id,
            checkpoint.parent_step_id,
            &checkpoint.state,
        )
        .await?;
        Ok(())
    }

    async fn latest(&self, mission_id: &str) -> Result<Option<Checkpoint>> {
        let row =
            worldmind_db::queries::checkpoints::latest_checkpoint(&self.pool, mission_id).await?;
        Ok(row.map(row_to_checkpoint))
    }

    async fn list(&self, mission_id: &str) -> Result<Vec<Checkpoint>> {
        let rows =
            worldmind_db::queries::checkpoints::list_checkpoints(&self.pool, mission_id).await?;
        Ok(rows.into_iter().map(row_to_checkpoint).collect())
    }

    async fn list_missions(&self) -> Result<Vec<String>> {
        worldmind_db::queries::checkpoints::list_mission_ids(&self.pool).await
    }
}

fn row_to_checkpoint(row: worldmind_db::models::CheckpointRow) -> Checkpoint {
    Checkpoint {
        mission_id: row.mission_id,
        step_id: row.step_id,
        parent_step_id: row.parent_step_id,
        state: row.state,
        created_at: row.created_at,
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A persisted checkpoint row: one committed graph step for a mission.
///
/// `state` is the full mission-state snapshot as JSON, so replay needs
/// nothing beyond the latest row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointRow {
    pub mission_id: String,
    pub step_id: i64,
    pub parent_step_id: Option<i64>,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

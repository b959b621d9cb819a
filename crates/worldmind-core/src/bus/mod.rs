//! In-process event bus.
//!
//! Synchronous fan-out pub/sub with two subscription scopes: per-mission and
//! global. Delivery is at-most-once with no buffering for late subscribers;
//! replay after reconnect is served by re-reading checkpoints, not by the
//! bus.
//!
//! Each delivery is isolated: a subscriber that panics is logged and skipped
//! without affecting other subscribers or the publisher. Subscriptions
//! return a handle that unsubscribes on drop.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recognized event type names, dot-separated as they appear on the wire.
pub mod kind {
    pub const MISSION_CREATED: &str = "mission.created";
    pub const CLASSIFY_STARTED: &str = "classify.started";
    pub const CLASSIFY_COMPLETED: &str = "classify.completed";
    pub const SPEC_GENERATED: &str = "spec.generated";
    pub const PLAN_GENERATED: &str = "plan.generated";
    pub const WAVE_SCHEDULED: &str = "wave.scheduled";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_PROGRESS: &str = "task.progress";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const QUALITY_GRANTED: &str = "quality.granted";
    pub const QUALITY_DENIED: &str = "quality.denied";
    pub const WAVE_COMPLETED: &str = "wave.completed";
    pub const MISSION_COMPLETED: &str = "mission.completed";
    pub const MISSION_FAILED: &str = "mission.failed";

    /// `<phase>.started` marker emitted by every graph node before work.
    pub fn phase_started(phase: &str) -> String {
        format!("{phase}.started")
    }

    /// `<phase>.completed` marker emitted after a node finishes.
    pub fn phase_completed(phase: &str) -> String {
        format!("{phase}.completed")
    }

    /// `<phase>.failed` marker emitted when a node faults.
    pub fn phase_failed(phase: &str) -> String {
        format!("{phase}.failed")
    }
}

/// A single event as published on the bus and forwarded to SSE/log sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub mission_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        mission_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            mission_id: mission_id.into(),
            task_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(
        event_type: impl Into<String>,
        mission_id: impl Into<String>,
        task_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::new(event_type, mission_id, payload)
        }
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    mission: HashMap<String, Vec<(u64, Callback)>>,
    global: Vec<(u64, Callback)>,
}

/// The process-wide event bus. Cheap to clone; all clones share one
/// subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event synchronously: mission-scoped subscribers first,
    /// then global subscribers.
    ///
    /// Delivery happens outside the registry lock against a snapshot of the
    /// subscriber lists, so subscribers may themselves subscribe or
    /// unsubscribe without deadlocking.
    pub fn publish(&self, event: &Event) {
        let (mission_subs, global_subs) = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let mission_subs: Vec<Callback> = registry
                .mission
                .get(&event.mission_id)
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default();
            let global_subs: Vec<Callback> = registry
                .global
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            (mission_subs, global_subs)
        };

        for cb in mission_subs.iter().chain(global_subs.iter()) {
            if catch_unwind(AssertUnwindSafe(|| cb(event))).is_err() {
                tracing::warn!(
                    event_type = %event.event_type,
                    mission_id = %event.mission_id,
                    "event subscriber panicked; continuing delivery"
                );
            }
        }
    }

    /// Subscribe to events for a single mission.
    pub fn subscribe_mission(
        &self,
        mission_id: impl Into<String>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let mission_id = mission_id.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .mission
                .entry(mission_id.clone())
                .or_default()
                .push((id, Arc::new(callback)));
        }
        SubscriptionHandle {
            id,
            scope: Scope::Mission(mission_id),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Subscribe to events from every mission.
    pub fn subscribe_global(
        &self,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.global.push((id, Arc::new(callback)));
        }
        SubscriptionHandle {
            id,
            scope: Scope::Global,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of live subscriptions across both scopes.
    pub fn subscriber_count(&self) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.global.len() + registry.mission.values().map(Vec::len).sum::<usize>()
    }
}

enum Scope {
    Mission(String),
    Global,
}

/// Removes its subscription when dropped.
///
/// Holds only a weak reference to the registry so a forgotten handle does
/// not keep the bus alive.
pub struct SubscriptionHandle {
    id: u64,
    scope: Scope,
    registry: Weak<Mutex<Registry>>,
}

impl SubscriptionHandle {
    /// Remove the subscription now instead of waiting for drop.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        match &self.scope {
            Scope::Global => registry.global.retain(|(id, _)| *id != self.id),
            Scope::Mission(mission_id) => {
                if let Some(subs) = registry.mission.get_mut(mission_id) {
                    subs.retain(|(id, _)| *id != self.id);
                    if subs.is_empty() {
                        registry.mission.remove(mission_id);
                    }
                }
            }
        }
    }
}

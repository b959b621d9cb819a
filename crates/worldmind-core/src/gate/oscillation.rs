//! Oscillation detection over retry error histories.
//!
//! A task that alternates between two distinct failures (A, B, A) is not
//! converging; retrying it burns iterations without progress. The evaluator
//! converts such a task's pending RETRY into an ESCALATE.

use std::collections::HashMap;
use std::sync::Mutex;

/// Most recent error keys kept per task.
const HISTORY_CAP: usize = 10;

/// Per-task bounded error history with A-B-A detection.
#[derive(Default)]
pub struct OscillationDetector {
    histories: Mutex<HashMap<String, Vec<String>>>,
}

impl OscillationDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error key to the task's history.
    pub fn record_failure(&self, task_id: &str, error_key: &str) {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let history = histories.entry(task_id.to_string()).or_default();
        history.push(error_key.to_string());
        if history.len() > HISTORY_CAP {
            let excess = history.len() - HISTORY_CAP;
            history.drain(..excess);
        }
    }

    /// True when the history contains an A-B-A pattern: some entry equals
    /// the entry two positions back while differing from its immediate
    /// predecessor.
    pub fn is_oscillating(&self, task_id: &str) -> bool {
        let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let Some(history) = histories.get(task_id) else {
            return false;
        };
        if history.len() < 3 {
            return false;
        }
        history
            .windows(3)
            .any(|w| w[2] == w[0] && w[2] != w[1])
    }

    /// Drop a task's history, e.g. after it finally passes.
    pub fn clear(&self, task_id: &str) {
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        histories.remove(task_id);
    }
}

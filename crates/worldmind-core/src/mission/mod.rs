//! Mission and task data model.
//!
//! `MissionState` is the unit of checkpointing: a fully serializable record
//! of everything a mission knows, mutated only by graph nodes through
//! [`StateUpdate`] application so every change lands in exactly one
//! checkpoint.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Classifying,
    Uploading,
    Clarifying,
    Specifying,
    Planning,
    AwaitingClarification,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl MissionStatus {
    /// A mission in a terminal status accepts no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// A paused mission is waiting for human input and resumes from its
    /// latest checkpoint.
    pub fn is_paused(self) -> bool {
        matches!(self, Self::AwaitingClarification | Self::AwaitingApproval)
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Classifying => "classifying",
            Self::Uploading => "uploading",
            Self::Clarifying => "clarifying",
            Self::Specifying => "specifying",
            Self::Planning => "planning",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for MissionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classifying" => Ok(Self::Classifying),
            "uploading" => Ok(Self::Uploading),
            "clarifying" => Ok(Self::Clarifying),
            "specifying" => Ok(Self::Specifying),
            "planning" => Ok(Self::Planning),
            "awaiting_clarification" => Ok(Self::AwaitingClarification),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelling" => Ok(Self::Cancelling),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("mission status", other)),
        }
    }
}

/// Status of a task within a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

/// The typed role that fulfills a task. Behavior differences between roles
/// live in the instruction template selected by the tag, not in subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Coder,
    Tester,
    Reviewer,
    Researcher,
    Refactorer,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        Self::Coder,
        Self::Tester,
        Self::Reviewer,
        Self::Researcher,
        Self::Refactorer,
    ];
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coder => "coder",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Researcher => "researcher",
            Self::Refactorer => "refactorer",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Plans sometimes name agents in upper case ("RESEARCHER").
        match s.to_ascii_lowercase().as_str() {
            "coder" => Ok(Self::Coder),
            "tester" => Ok(Self::Tester),
            "reviewer" => Ok(Self::Reviewer),
            "researcher" => Ok(Self::Researcher),
            "refactorer" => Ok(Self::Refactorer),
            other => Err(ParseEnumError::new("agent kind", other)),
        }
    }
}

/// How the mission interacts with its operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    FullAuto,
    ApprovePlan,
    StepByStep,
}

impl fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FullAuto => "full_auto",
            Self::ApprovePlan => "approve_plan",
            Self::StepByStep => "step_by_step",
        };
        f.write_str(s)
    }
}

impl FromStr for InteractionMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_auto" => Ok(Self::FullAuto),
            "approve_plan" => Ok(Self::ApprovePlan),
            "step_by_step" => Ok(Self::StepByStep),
            other => Err(ParseEnumError::new("interaction mode", other)),
        }
    }
}

/// Wave dispatch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStrategy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(ParseEnumError::new("execution strategy", other)),
        }
    }
}

/// What to do when a task's quality gate denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Retry,
    Skip,
    Escalate,
    Abort,
}

impl fmt::Display for OnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Escalate => "escalate",
            Self::Abort => "abort",
        };
        f.write_str(s)
    }
}

impl FromStr for OnFailure {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            "escalate" => Ok(Self::Escalate),
            "abort" => Ok(Self::Abort),
            other => Err(ParseEnumError::new("failure policy", other)),
        }
    }
}

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------
// Task-level records
// ---------------------------------------------------------------------------

/// Outcome of the tester agent's raw output, derived by pattern matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub task_id: String,
    pub passed: bool,
    pub total_tests: u32,
    pub failed_tests: u32,
    pub raw_output: String,
    pub duration_ms: u64,
}

/// Outcome of the reviewer agent's raw output, derived by language-model
/// extraction with a regex fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub task_id: String,
    pub approved: bool,
    pub summary: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    /// Review score in 0..=10.
    pub score: u8,
}

/// The quality gate's structured verdict for one task execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityDecision {
    pub granted: bool,
    /// `None` when granted; otherwise the action the evaluator must take.
    pub next_action: Option<OnFailure>,
    pub reason: String,
}

/// Per-task outcome of a dispatched wave. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub task_id: String,
    pub success: bool,
    /// Failure category when `success` is false (`timeout`, `crash`,
    /// `cancelled`, `unresolvable_conflict`, ...).
    pub failure_reason: Option<String>,
    pub files_affected: Vec<String>,
    pub raw_output: String,
    pub duration_ms: u64,
}

/// A unit of agent work inside a mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the mission.
    pub id: String,
    pub agent: AgentKind,
    pub objective: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Each entry is a task id or an agent tag (e.g. "researcher"); a tag
    /// resolves to any completed task of that agent kind.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    /// Retry count, starting at 0 for the first execution.
    pub iteration: u32,
    pub max_iterations: u32,
    pub on_failure: OnFailure,
    /// Repo-relative paths the task declares it will touch.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Populated after execution; may differ from `target_files`.
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub review_feedback: Option<ReviewFeedback>,
    #[serde(default)]
    pub test_result: Option<TestResult>,
}

impl Task {
    /// Create a pending task with defaults suitable for planner output.
    pub fn new(id: impl Into<String>, agent: AgentKind, objective: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent,
            objective: objective.into(),
            acceptance_criteria: Vec::new(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            iteration: 0,
            max_iterations: 3,
            on_failure: OnFailure::Retry,
            target_files: Vec::new(),
            files_affected: Vec::new(),
            review_feedback: None,
            test_result: None,
        }
    }

    /// A settled task is a member of the mission's completion set: passed,
    /// skipped, or failed with a skip-on-failure policy.
    pub fn is_settled(&self) -> bool {
        match self.status {
            TaskStatus::Passed | TaskStatus::Skipped => true,
            TaskStatus::Failed => self.on_failure == OnFailure::Skip,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Mission-level records
// ---------------------------------------------------------------------------

/// Structured error record appended to the mission state by graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionError {
    /// The graph phase that recorded the error.
    pub phase: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl MissionError {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// The planner's classification of the original request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestClassification {
    /// Request category (e.g. "feature", "bugfix", "refactor").
    pub category: String,
    /// Rough complexity band ("low", "medium", "high").
    pub complexity: String,
    pub summary: String,
}

/// The full, serializable state of one mission. The unit of checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionState {
    pub mission_id: String,
    /// The original natural-language request.
    pub request: String,
    /// URL of the repository the mission operates on.
    pub repo_url: String,
    pub interaction_mode: InteractionMode,
    pub execution_strategy: ExecutionStrategy,
    pub status: MissionStatus,
    #[serde(default)]
    pub classification: Option<RequestClassification>,
    #[serde(default)]
    pub product_spec: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Ids of settled tasks, in settlement order, no duplicates. Every
    /// entry names a task in `tasks`.
    #[serde(default)]
    pub completed_task_ids: Vec<String>,
    #[serde(default)]
    pub errors: Vec<MissionError>,
    /// Task ids scheduled for the next dispatch; consumed by the dispatch
    /// node.
    #[serde(default)]
    pub pending_wave: Vec<String>,
    /// Dispatch outcomes of the most recent wave; consumed by the evaluate
    /// node.
    #[serde(default)]
    pub last_wave_results: Vec<DispatchResult>,
    /// Number of waves dispatched so far.
    #[serde(default)]
    pub wave_counter: u32,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_questions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MissionState {
    pub fn new(
        mission_id: impl Into<String>,
        request: impl Into<String>,
        repo_url: impl Into<String>,
        interaction_mode: InteractionMode,
        execution_strategy: ExecutionStrategy,
    ) -> Self {
        Self {
            mission_id: mission_id.into(),
            request: request.into(),
            repo_url: repo_url.into(),
            interaction_mode,
            execution_strategy,
            status: MissionStatus::Classifying,
            classification: None,
            product_spec: None,
            tasks: Vec::new(),
            completed_task_ids: Vec::new(),
            errors: Vec::new(),
            pending_wave: Vec::new(),
            last_wave_results: Vec::new(),
            wave_counter: 0,
            needs_clarification: false,
            clarification_questions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Recompute `completed_task_ids` from task statuses, preserving
    /// existing settlement order and appending newly settled tasks in
    /// declared order.
    pub fn refresh_completed_ids(&mut self) {
        let settled: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.is_settled())
            .map(|t| t.id.clone())
            .collect();
        self.completed_task_ids.retain(|id| settled.contains(id));
        for id in settled {
            if !self.completed_task_ids.contains(&id) {
                self.completed_task_ids.push(id);
            }
        }
    }

    /// True when every task is settled.
    pub fn all_tasks_settled(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(Task::is_settled)
    }

    /// Count of tasks that ended in a non-skip failure.
    pub fn failed_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed && t.on_failure != OnFailure::Skip)
            .count()
    }

    pub fn record_error(&mut self, phase: &str, message: impl Into<String>) {
        self.errors.push(MissionError::new(phase, message));
    }

    /// Validate the structural invariants that checkpoints rely on.
    ///
    /// Returns a description of the first violation found, if any.
    pub fn check_invariants(&self) -> Option<String> {
        let mut seen = std::collections::HashSet::new();
        for id in &self.completed_task_ids {
            if !seen.insert(id) {
                return Some(format!("duplicate completed task id {id:?}"));
            }
            if self.task(id).is_none() {
                return Some(format!("completed task id {id:?} names no task"));
            }
        }
        for t in &self.tasks {
            if t.iteration > t.max_iterations {
                return Some(format!(
                    "task {:?} iteration {} exceeds max {}",
                    t.id, t.iteration, t.max_iterations
                ));
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// State updates
// ---------------------------------------------------------------------------

/// A partial state update produced by one graph node.
///
/// Only the fields a node actually touched are set; the graph runner applies
/// the update and commits exactly one checkpoint for it.
#[derive(Debug, Default, Clone)]
pub struct StateUpdate {
    pub status: Option<MissionStatus>,
    pub classification: Option<RequestClassification>,
    pub product_spec: Option<String>,
    pub tasks: Option<Vec<Task>>,
    pub needs_clarification: Option<bool>,
    pub clarification_questions: Option<Vec<String>>,
    pub pending_wave: Option<Vec<String>>,
    pub last_wave_results: Option<Vec<DispatchResult>>,
    pub wave_counter: Option<u32>,
    pub errors: Vec<MissionError>,
}

impl StateUpdate {
    pub fn status(status: MissionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Apply this update to a state, consuming the update.
    pub fn apply(self, state: &mut MissionState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(classification) = self.classification {
            state.classification = Some(classification);
        }
        if let Some(spec) = self.product_spec {
            state.product_spec = Some(spec);
        }
        if let Some(tasks) = self.tasks {
            state.tasks = tasks;
        }
        if let Some(needs) = self.needs_clarification {
            state.needs_clarification = needs;
        }
        if let Some(questions) = self.clarification_questions {
            state.clarification_questions = questions;
        }
        if let Some(wave) = self.pending_wave {
            state.pending_wave = wave;
        }
        if let Some(results) = self.last_wave_results {
            state.last_wave_results = results;
        }
        if let Some(counter) = self.wave_counter {
            state.wave_counter = counter;
        }
        state.errors.extend(self.errors);
        state.refresh_completed_ids();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Planner prompts and schemas.
//!
//! The classify / clarify / generate-spec / plan graph nodes all call the
//! language model with a fixed system prompt and expect JSON matching one of
//! the schema structs here. Generated plans are validated before they
//! become mission tasks; a plan the scheduler could never finish (unknown
//! agent, unresolvable dependency, cycle) is rejected up front.

use serde::Deserialize;
use thiserror::Error;

use crate::mission::{AgentKind, OnFailure, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

pub const CLASSIFY_SCHEMA: &str = "request_classification";
pub const CLARIFY_SCHEMA: &str = "clarification_check";
pub const SPEC_SCHEMA: &str = "product_spec";
pub const PLAN_SCHEMA: &str = "task_plan";

/// Response of the classify node.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationResponse {
    pub category: String,
    pub complexity: String,
    pub summary: String,
}

/// Response of the clarify node.
#[derive(Debug, Clone, Deserialize)]
pub struct ClarificationResponse {
    pub needs_clarification: bool,
    #[serde(default)]
    pub questions: Vec<String>,
}

/// Response of the generate-spec node.
#[derive(Debug, Clone, Deserialize)]
pub struct SpecResponse {
    pub product_spec: String,
}

/// One task as planned by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub agent: String,
    pub objective: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub on_failure: Option<String>,
}

fn default_max_iterations() -> u32 {
    3
}

/// Response of the plan node.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanResponse {
    pub tasks: Vec<PlannedTask>,
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

pub const CLASSIFY_SYSTEM_PROMPT: &str = "\
You classify change requests against a source repository. Respond with a \
single JSON object: {\"category\": one of \"feature\" | \"bugfix\" | \
\"refactor\" | \"chore\" | \"investigation\", \"complexity\": one of \
\"low\" | \"medium\" | \"high\", \"summary\": a one-sentence restatement of \
the request}.";

pub const CLARIFY_SYSTEM_PROMPT: &str = "\
You decide whether a change request is actionable as written. If essential \
information is missing (which component, what behavior, acceptance \
criteria), ask for it. Respond with a single JSON object: \
{\"needs_clarification\": bool, \"questions\": [<string>]}. Ask at most \
three questions and only when genuinely blocked.";

pub const SPEC_SYSTEM_PROMPT: &str = "\
You turn a classified change request into a short product specification: \
what to build, observable behavior, and explicit non-goals. Respond with a \
single JSON object: {\"product_spec\": <markdown string>}.";

/// System prompt for the plan node.
///
/// The decomposition guidance mirrors what makes wave scheduling effective:
/// narrow tasks, explicit dependencies, declared target files.
pub const PLAN_SYSTEM_PROMPT: &str = "\
You decompose a product specification into tasks for autonomous coding \
agents. Agents: coder, tester, reviewer, researcher, refactorer.\n\
Rules:\n\
1. Prefer narrow tasks touching few files; list those files in \
\"target_files\" (repo-relative). Tasks that share a file cannot run \
concurrently.\n\
2. Use \"dependencies\" for ordering: entries are task ids, or an agent \
name to depend on whichever task of that role completed.\n\
3. Every change needs a tester task and a reviewer task downstream of it.\n\
4. Task ids are kebab-case and unique.\n\
Respond with a single JSON object: {\"tasks\": [{\"id\", \"agent\", \
\"objective\", \"acceptance_criteria\": [..], \"dependencies\": [..], \
\"target_files\": [..], \"max_iterations\": <int>, \"on_failure\": \
\"retry\" | \"skip\" | \"escalate\" | \"abort\"}]}.";

/// Compose the user prompt for the plan node.
pub fn build_plan_user_prompt(request: &str, product_spec: &str) -> String {
    format!("## Original request\n\n{request}\n\n## Product specification\n\n{product_spec}\n")
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reasons a generated plan is rejected.
#[derive(Debug, Error)]
pub enum PlanValidationError {
    #[error("plan contains no tasks")]
    Empty,

    #[error("duplicate task id {0:?}")]
    DuplicateId(String),

    #[error("task {task:?} has unknown agent {agent:?}")]
    UnknownAgent { task: String, agent: String },

    #[error("task {task:?} depends on itself")]
    SelfDependency { task: String },

    #[error("task {task:?} has unresolvable dependency {dependency:?}")]
    UnresolvableDependency { task: String, dependency: String },

    #[error("dependency cycle involving tasks {0:?}")]
    Cycle(Vec<String>),
}

/// Validate a generated plan and convert it into mission tasks.
pub fn materialize_plan(plan: &PlanResponse) -> Result<Vec<Task>, PlanValidationError> {
    if plan.tasks.is_empty() {
        return Err(PlanValidationError::Empty);
    }

    let mut ids = std::collections::HashSet::new();
    for planned in &plan.tasks {
        if !ids.insert(planned.id.as_str()) {
            return Err(PlanValidationError::DuplicateId(planned.id.clone()));
        }
    }

    let mut tasks = Vec::with_capacity(plan.tasks.len());
    for planned in &plan.tasks {
        let agent: AgentKind =
            planned
                .agent
                .parse()
                .map_err(|_| PlanValidationError::UnknownAgent {
                    task: planned.id.clone(),
                    agent: planned.agent.clone(),
                })?;

        for dep in &planned.dependencies {
            if dep == &planned.id {
                return Err(PlanValidationError::SelfDependency {
                    task: planned.id.clone(),
                });
            }
            let is_task_id = ids.contains(dep.as_str());
            let is_agent_tag = dep.parse::<AgentKind>().is_ok();
            if !is_task_id && !is_agent_tag {
                return Err(PlanValidationError::UnresolvableDependency {
                    task: planned.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let on_failure = planned
            .on_failure
            .as_deref()
            .and_then(|s| s.parse::<OnFailure>().ok())
            .unwrap_or(OnFailure::Retry);

        let mut task = Task::new(&planned.id, agent, &planned.objective);
        task.acceptance_criteria = planned.acceptance_criteria.clone();
        task.dependencies = planned.dependencies.clone();
        task.target_files = planned.target_files.clone();
        task.max_iterations = planned.max_iterations;
        task.on_failure = on_failure;
        task.status = TaskStatus::Pending;
        tasks.push(task);
    }

    check_acyclic(&tasks)?;
    Ok(tasks)
}

/// Reject plans the scheduler could never drain.
///
/// Repeatedly removes tasks whose dependencies are all satisfied (agent-tag
/// dependencies count as satisfiable when any task of that kind exists
/// outside the remainder or is removable). Whatever remains is cyclic.
fn check_acyclic(tasks: &[Task]) -> Result<(), PlanValidationError> {
    let mut remaining: Vec<&Task> = tasks.iter().collect();

    loop {
        // A task stays blocked while any dependency (by id or agent tag)
        // still names another remaining task.
        let still_blocked: Vec<&Task> = remaining
            .iter()
            .filter(|task| {
                task.dependencies.iter().any(|dep| {
                    remaining.iter().any(|other| {
                        other.id != task.id
                            && (&other.id == dep
                                || dep
                                    .parse::<AgentKind>()
                                    .is_ok_and(|kind| other.agent == kind))
                    })
                })
            })
            .copied()
            .collect();

        if still_blocked.is_empty() {
            return Ok(());
        }
        if still_blocked.len() == remaining.len() {
            return Err(PlanValidationError::Cycle(
                still_blocked.iter().map(|t| t.id.clone()).collect(),
            ));
        }
        remaining = still_blocked;
    }
}

//! Graph node implementations.
//!
//! Every node takes `(&MissionRuntime, &MissionState)` and returns the
//! partial update the runner applies and checkpoints. Nodes are idempotent
//! on the same input state; the only nondeterminism they touch is the
//! language-model collaborator, which replay swaps for a recorded stub.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc;

use crate::bus::{Event, kind};
use crate::config::SandboxProvider;
use crate::gate;
use crate::llm;
use crate::metrics::name;
use crate::mission::{
    DispatchResult, MissionState, MissionStatus, OnFailure, QualityDecision, StateUpdate, Task,
    TaskStatus,
};
use crate::planner;
use crate::sandbox::DispatchRequest;
use crate::schedule;
use crate::token;

use super::MissionRuntime;

// ---------------------------------------------------------------------------
// Planning phase nodes
// ---------------------------------------------------------------------------

/// Classify the original request.
pub async fn classify(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let classification: planner::ClassificationResponse = llm::structured(
        rt.model.as_ref(),
        planner::CLASSIFY_SYSTEM_PROMPT,
        &state.request,
        planner::CLASSIFY_SCHEMA,
    )
    .await
    .map_err(|e| anyhow!("classification failed: {e}"))?;

    tracing::info!(
        mission_id = %state.mission_id,
        category = %classification.category,
        complexity = %classification.complexity,
        "request classified"
    );

    Ok(StateUpdate {
        status: Some(MissionStatus::Uploading),
        classification: Some(crate::mission::RequestClassification {
            category: classification.category,
            complexity: classification.complexity,
            summary: classification.summary,
        }),
        ..StateUpdate::default()
    })
}

/// Prepare the mission workspace: idempotent clone of the target
/// repository.
pub async fn upload_context(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let workspace = rt
        .ensure_workspace(state)
        .context("failed to prepare mission workspace")?;
    tracing::info!(
        mission_id = %state.mission_id,
        repo = %workspace.repo_path().display(),
        "mission workspace ready"
    );
    Ok(StateUpdate::status(MissionStatus::Clarifying))
}

/// Ask whether the request is actionable; pause for the operator if not.
pub async fn clarify(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let context_summary = state
        .classification
        .as_ref()
        .map(|c| format!("Classified as {} ({} complexity): {}", c.category, c.complexity, c.summary))
        .unwrap_or_default();
    let user_prompt = format!("{}\n\n{}", state.request, context_summary);

    let response: planner::ClarificationResponse = llm::structured(
        rt.model.as_ref(),
        planner::CLARIFY_SYSTEM_PROMPT,
        &user_prompt,
        planner::CLARIFY_SCHEMA,
    )
    .await
    .map_err(|e| anyhow!("clarification check failed: {e}"))?;

    if response.needs_clarification {
        tracing::info!(
            mission_id = %state.mission_id,
            questions = response.questions.len(),
            "mission needs clarification"
        );
        return Ok(StateUpdate {
            status: Some(MissionStatus::AwaitingClarification),
            needs_clarification: Some(true),
            clarification_questions: Some(response.questions),
            ..StateUpdate::default()
        });
    }

    Ok(StateUpdate {
        status: Some(MissionStatus::Specifying),
        needs_clarification: Some(false),
        clarification_questions: Some(Vec::new()),
        ..StateUpdate::default()
    })
}

/// Turn the classified request into a product specification.
pub async fn generate_spec(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let response: planner::SpecResponse = llm::structured(
        rt.model.as_ref(),
        planner::SPEC_SYSTEM_PROMPT,
        &state.request,
        planner::SPEC_SCHEMA,
    )
    .await
    .map_err(|e| anyhow!("spec generation failed: {e}"))?;

    rt.bus.publish(&Event::new(
        kind::SPEC_GENERATED,
        &state.mission_id,
        serde_json::json!({"length": response.product_spec.len()}),
    ));

    Ok(StateUpdate {
        status: Some(MissionStatus::Planning),
        product_spec: Some(response.product_spec),
        ..StateUpdate::default()
    })
}

/// Decompose the specification into a validated task plan.
pub async fn plan(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let started = Instant::now();
    let spec = state.product_spec.as_deref().unwrap_or(&state.request);

    let response: planner::PlanResponse = llm::structured(
        rt.model.as_ref(),
        planner::PLAN_SYSTEM_PROMPT,
        &planner::build_plan_user_prompt(&state.request, spec),
        planner::PLAN_SCHEMA,
    )
    .await
    .map_err(|e| anyhow!("plan generation failed: {e}"))?;

    let tasks = planner::materialize_plan(&response).context("generated plan is invalid")?;

    rt.metrics
        .record_duration(name::PLANNING_DURATION_MS, &[], started);
    rt.bus.publish(&Event::new(
        kind::PLAN_GENERATED,
        &state.mission_id,
        serde_json::json!({
            "task_count": tasks.len(),
            "task_ids": tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
        }),
    ));
    tracing::info!(
        mission_id = %state.mission_id,
        tasks = tasks.len(),
        "plan generated"
    );

    let status = match state.interaction_mode {
        crate::mission::InteractionMode::ApprovePlan => MissionStatus::AwaitingApproval,
        _ => MissionStatus::Executing,
    };

    Ok(StateUpdate {
        status: Some(status),
        tasks: Some(tasks),
        ..StateUpdate::default()
    })
}

// ---------------------------------------------------------------------------
// Execution phase nodes
// ---------------------------------------------------------------------------

/// Compute the next wave and mark its members as executing.
pub async fn schedule_wave(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let wave = schedule::next_wave(
        &state.tasks,
        &state.completed_task_ids,
        state.execution_strategy,
        rt.config.max_parallel,
    );

    let mut update = StateUpdate {
        status: Some(MissionStatus::Executing),
        pending_wave: Some(wave.clone()),
        ..StateUpdate::default()
    };

    if wave.is_empty() {
        return Ok(update);
    }

    let mut tasks = state.tasks.clone();
    for task in tasks.iter_mut() {
        if wave.contains(&task.id) {
            task.status = TaskStatus::Executing;
        }
    }
    update.tasks = Some(tasks);
    update.wave_counter = Some(state.wave_counter + 1);

    rt.bus.publish(&Event::new(
        kind::WAVE_SCHEDULED,
        &state.mission_id,
        serde_json::json!({
            "wave": state.wave_counter + 1,
            "task_ids": wave,
        }),
    ));
    Ok(update)
}

/// Dispatch every wave member to the sandbox driver, then merge results
/// back in completion order.
///
/// This is the only fan-out in the graph: one worker per wave member,
/// joined through a channel barrier before the node returns. Merges into
/// the base branch are serialized by the workspace and happen in the order
/// results arrive, not in wave-declared order.
pub async fn dispatch_wave(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let wave = state.pending_wave.clone();
    if wave.is_empty() {
        return Ok(StateUpdate::default());
    }

    let workspace = rt.ensure_workspace(state)?;
    let runtime_tag = rt
        .config
        .runtime
        .clone()
        .unwrap_or_else(|| crate::config::detect_runtime(&workspace.repo_path()));
    let strategy = state.execution_strategy.to_string();

    rt.metrics.incr(name::WAVES_TOTAL, &[("strategy", &strategy)]);
    rt.metrics.observe(name::WAVE_SIZE, &[], wave.len() as u64);
    rt.metrics
        .observe(name::ACTIVE_WORKTREES, &[], wave.len() as u64);

    let (tx, mut rx) = mpsc::channel::<(String, Result<DispatchResult>)>(wave.len());
    let mut in_flight = 0usize;

    for task_id in &wave {
        let Some(task) = state.task(task_id) else {
            tracing::error!(task_id = %task_id, "scheduled wave names an unknown task");
            continue;
        };

        rt.bus.publish(&Event::for_task(
            kind::TASK_STARTED,
            &state.mission_id,
            task_id,
            serde_json::json!({"wave": state.wave_counter, "iteration": task.iteration}),
        ));

        // The container backend needs a working tree up front; the task
        // runner's job clones for itself.
        let working_tree = if rt.config.provider == SandboxProvider::Container {
            match workspace.acquire_worktree(task_id) {
                Ok(path) => {
                    rt.bus.publish(&Event::for_task(
                        kind::TASK_PROGRESS,
                        &state.mission_id,
                        task_id,
                        serde_json::json!({"stage": "worktree_acquired"}),
                    ));
                    path
                }
                Err(e) => {
                    in_flight += 1;
                    let failed = DispatchResult {
                        task_id: task_id.clone(),
                        success: false,
                        failure_reason: Some(format!("workspace: {e}")),
                        files_affected: Vec::new(),
                        raw_output: String::new(),
                        duration_ms: 0,
                    };
                    let _ = tx.send((task_id.clone(), Ok(failed))).await;
                    continue;
                }
            }
        } else {
            PathBuf::new()
        };

        let request = DispatchRequest {
            mission_id: state.mission_id.clone(),
            task: task.clone(),
            dependency_summaries: dependency_summaries(state, task),
            working_tree,
            repo_url: state.repo_url.clone(),
            base_branch: rt.config.base_branch.clone(),
            credential_token: token::generate_token(
                &rt.token_config,
                &state.mission_id,
                task_id,
                task.iteration,
            ),
            mcp_endpoints: rt.config.mcp_endpoints.clone(),
            runtime: runtime_tag.clone(),
            timeout: rt.config.task_timeout,
        };

        let driver = std::sync::Arc::clone(&rt.driver);
        let cancel = rt.cancel.child_token();
        let tx = tx.clone();
        let tid = task_id.clone();
        in_flight += 1;
        tokio::spawn(async move {
            let outcome = driver.dispatch(&request, cancel).await;
            let _ = tx.send((tid, outcome)).await;
        });
    }
    drop(tx);

    let mut results: Vec<DispatchResult> = Vec::with_capacity(in_flight);
    while let Some((task_id, outcome)) = rx.recv().await {
        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => DispatchResult {
                task_id: task_id.clone(),
                success: false,
                failure_reason: Some(format!("crash: {e:#}")),
                files_affected: Vec::new(),
                raw_output: String::new(),
                duration_ms: 0,
            },
        };

        if result.success {
            merge_result_back(rt, &workspace, &task_id, &mut result).await;
        }

        if rt.config.provider == SandboxProvider::Container {
            if let Err(e) = workspace.release_worktree(&task_id) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to release working tree");
            }
        }

        if let Some(task) = state.task(&task_id) {
            rt.metrics.observe(
                name::TASK_DURATION_MS,
                &[("agent", &task.agent.to_string())],
                result.duration_ms,
            );
        }
        let event_type = if result.success { kind::TASK_COMPLETED } else { kind::TASK_FAILED };
        rt.bus.publish(&Event::for_task(
            event_type,
            &state.mission_id,
            &task_id,
            serde_json::json!({
                "duration_ms": result.duration_ms,
                "failure_reason": result.failure_reason,
                "files_affected": result.files_affected,
            }),
        ));

        results.push(result);
    }

    rt.bus.publish(&Event::new(
        kind::WAVE_COMPLETED,
        &state.mission_id,
        serde_json::json!({"wave": state.wave_counter, "dispatched": results.len()}),
    ));

    // Post-wave settle delay: lets pushes propagate before the next
    // schedule. Skipped when cancelling.
    if !rt.config.wave_cooldown.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(rt.config.wave_cooldown) => {}
            _ = rt.cancel.cancelled() => {}
        }
    }

    Ok(StateUpdate {
        last_wave_results: Some(results),
        ..StateUpdate::default()
    })
}

/// Merge a successful task's branch into base; downgrades the result to a
/// retryable failure on an unresolvable conflict.
async fn merge_result_back(
    rt: &MissionRuntime,
    workspace: &crate::workspace::MissionWorkspace,
    task_id: &str,
    result: &mut DispatchResult,
) {
    if rt.config.provider == SandboxProvider::Container {
        if let Err(e) = workspace.commit_and_push(task_id, &format!("worldmind: {task_id}")) {
            tracing::warn!(task_id, error = %e, "commit-and-push failed");
            result.success = false;
            result.failure_reason = Some(format!("workspace: {e}"));
            return;
        }
    }

    match workspace.merge_branch(task_id).await {
        Ok(outcome) if outcome.merged => {
            if result.files_affected.is_empty() {
                // Shared-nothing backend: recover the file list from the
                // pushed branch.
                result.files_affected = workspace.files_changed(task_id).unwrap_or_default();
            }
        }
        Ok(outcome) => {
            result.success = false;
            result.failure_reason =
                Some(outcome.reason.unwrap_or_else(|| "unresolvable_conflict".to_string()));
        }
        Err(e) => {
            tracing::warn!(task_id, error = %e, "merge failed");
            result.success = false;
            result.failure_reason = Some(format!("merge: {e}"));
        }
    }
}

/// Build the dependency-output summaries handed to an agent.
fn dependency_summaries(state: &MissionState, task: &Task) -> Vec<String> {
    let mut summaries = Vec::new();
    for dep in &task.dependencies {
        let matched: Vec<&Task> = state
            .tasks
            .iter()
            .filter(|t| {
                t.is_settled()
                    && (&t.id == dep
                        || dep
                            .parse::<crate::mission::AgentKind>()
                            .is_ok_and(|kind| t.agent == kind))
            })
            .collect();
        for dep_task in matched {
            let mut line = format!("{} ({}): {}", dep_task.id, dep_task.agent, dep_task.objective);
            if let Some(review) = &dep_task.review_feedback {
                if !review.summary.is_empty() {
                    line.push_str(&format!(" -- {}", review.summary));
                }
            }
            summaries.push(line);
        }
    }
    summaries
}

/// Run the quality gate over the wave's dispatch results and apply each
/// decision.
pub async fn evaluate_wave(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let threshold = rt.config.review_score_threshold;
    let mut tasks = state.tasks.clone();
    let mut mission_status: Option<MissionStatus> = None;

    for result in &state.last_wave_results {
        let Some(task) = tasks.iter_mut().find(|t| t.id == result.task_id) else {
            continue;
        };
        // Replay safety: a task already settled by this wave is not
        // re-evaluated.
        if task.status != TaskStatus::Executing {
            continue;
        }

        let decision = if result.success {
            let test = gate::parse_test_output(&task.id, &result.raw_output, result.duration_ms);
            let review = gate::review::parse_review_output(
                rt.model.as_ref(),
                &task.id,
                &result.raw_output,
                threshold,
            )
            .await
            .map_err(|e| anyhow!("review extraction for task {}: {e}", task.id))?;
            let decision = gate::decide(task, &test, &review, threshold);
            task.test_result = Some(test);
            task.review_feedback = Some(review);
            decision
        } else {
            dispatch_failure_decision(task, result)
        };

        if decision.granted {
            task.status = TaskStatus::Passed;
            task.files_affected = result.files_affected.clone();
            rt.oscillation.clear(&task.id);
            rt.metrics
                .incr(name::QUALITY_GATE_TOTAL, &[("granted", "true")]);
            rt.metrics
                .observe(name::TASK_ITERATIONS, &[], u64::from(task.iteration));
            rt.bus.publish(&Event::for_task(
                kind::QUALITY_GRANTED,
                &state.mission_id,
                &task.id,
                serde_json::json!({"reason": decision.reason}),
            ));
            continue;
        }

        rt.metrics
            .incr(name::QUALITY_GATE_TOTAL, &[("granted", "false")]);
        rt.bus.publish(&Event::for_task(
            kind::QUALITY_DENIED,
            &state.mission_id,
            &task.id,
            serde_json::json!({"reason": decision.reason, "next_action": decision.next_action}),
        ));

        let error_key = denial_error_key(result, &decision);
        rt.oscillation.record_failure(&task.id, &error_key);

        let mut action = decision.next_action.unwrap_or(task.on_failure);
        let mut escalation_reason = if decision.reason.contains("retries exhausted") {
            "exhausted_retries"
        } else {
            "policy"
        };
        if action == OnFailure::Retry && rt.oscillation.is_oscillating(&task.id) {
            tracing::warn!(
                mission_id = %state.mission_id,
                task_id = %task.id,
                "oscillating failure pattern, escalating"
            );
            action = OnFailure::Escalate;
            escalation_reason = "oscillation";
        }

        match action {
            OnFailure::Retry => {
                task.iteration += 1;
                task.status = TaskStatus::Pending;
                tracing::info!(
                    mission_id = %state.mission_id,
                    task_id = %task.id,
                    iteration = task.iteration,
                    "task will retry"
                );
            }
            OnFailure::Skip => {
                task.status = TaskStatus::Skipped;
                rt.metrics
                    .observe(name::TASK_ITERATIONS, &[], u64::from(task.iteration));
            }
            OnFailure::Escalate => {
                task.status = TaskStatus::Failed;
                mission_status = Some(MissionStatus::AwaitingApproval);
                rt.metrics
                    .incr(name::ESCALATIONS_TOTAL, &[("reason", escalation_reason)]);
                rt.metrics
                    .observe(name::TASK_ITERATIONS, &[], u64::from(task.iteration));
            }
            OnFailure::Abort => {
                task.status = TaskStatus::Failed;
                mission_status = Some(MissionStatus::Failed);
                rt.metrics
                    .observe(name::TASK_ITERATIONS, &[], u64::from(task.iteration));
            }
        }
    }

    Ok(StateUpdate {
        status: mission_status,
        tasks: Some(tasks),
        pending_wave: Some(Vec::new()),
        last_wave_results: Some(Vec::new()),
        ..StateUpdate::default()
    })
}

/// Decision for a task whose dispatch itself failed (timeout, crash,
/// cancellation, merge conflict). Mirrors the quality gate's retry
/// exhaustion promotion.
fn dispatch_failure_decision(task: &Task, result: &DispatchResult) -> QualityDecision {
    let reason = result
        .failure_reason
        .clone()
        .unwrap_or_else(|| "dispatch failed".to_string());

    let mut action = task.on_failure;
    let mut full_reason = reason;
    if action == OnFailure::Retry && task.iteration >= task.max_iterations {
        full_reason.push_str(&format!(
            "; retries exhausted ({}/{})",
            task.iteration, task.max_iterations
        ));
        action = OnFailure::Escalate;
    }

    QualityDecision {
        granted: false,
        next_action: Some(action),
        reason: full_reason,
    }
}

/// Stable error key for oscillation tracking.
fn denial_error_key(result: &DispatchResult, decision: &QualityDecision) -> String {
    if let Some(reason) = &result.failure_reason {
        return reason.split(&[':', ';'][..]).next().unwrap_or(reason).trim().to_string();
    }
    if decision.reason.contains("tests failed") {
        "tests_failed".to_string()
    } else {
        "review_below_threshold".to_string()
    }
}

/// Terminal bookkeeping: final status, in-flight task conversion, cleanup.
pub async fn converge(rt: &MissionRuntime, state: &MissionState) -> Result<StateUpdate> {
    let cancelled = state.status == MissionStatus::Cancelling;
    let mut tasks = state.tasks.clone();
    for task in tasks.iter_mut() {
        if task.status == TaskStatus::Executing {
            task.status = TaskStatus::Failed;
        }
    }

    let all_settled = !tasks.is_empty() && tasks.iter().all(Task::is_settled);
    let hard_failures = tasks
        .iter()
        .any(|t| t.status == TaskStatus::Failed && t.on_failure != OnFailure::Skip);

    let final_status = if cancelled {
        MissionStatus::Cancelled
    } else if state.status == MissionStatus::Failed || hard_failures || !all_settled {
        MissionStatus::Failed
    } else {
        MissionStatus::Completed
    };

    if let Some(workspace) = rt.workspace_if_created() {
        if let Err(e) = workspace.cleanup() {
            tracing::warn!(mission_id = %state.mission_id, error = %e, "workspace cleanup failed");
        }
    }

    let completed: Vec<&str> = state.completed_task_ids.iter().map(String::as_str).collect();
    let payload = serde_json::json!({
        "status": final_status.to_string(),
        "completed_task_ids": completed,
        "waves": state.wave_counter,
        "errors": state.errors.len(),
    });
    let event_type = if final_status == MissionStatus::Completed {
        kind::MISSION_COMPLETED
    } else {
        kind::MISSION_FAILED
    };
    rt.bus
        .publish(&Event::new(event_type, &state.mission_id, payload));
    rt.metrics.incr(
        name::MISSIONS_TOTAL,
        &[("status", &final_status.to_string())],
    );

    tracing::info!(
        mission_id = %state.mission_id,
        status = %final_status,
        waves = state.wave_counter,
        "mission converged"
    );

    Ok(StateUpdate {
        status: Some(final_status),
        tasks: Some(tasks),
        ..StateUpdate::default()
    })
}

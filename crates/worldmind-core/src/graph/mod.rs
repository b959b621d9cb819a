//! The mission state graph.
//!
//! A deterministic state machine over [`MissionState`]: each node is a
//! typed record with an async `run` function producing a partial state
//! update, and conditional edges are router records that pick the next node
//! from the updated state. There is no subclassing anywhere; advancing the
//! mission is a table lookup.
//!
//! The runner enforces the graph contracts: `<phase>.started` /
//! `.completed` / `.failed` events around every node, one checkpoint per
//! state mutation, a single retry for a faulting node before the mission
//! fails, a recursion budget against pathological loops, and a cancel path
//! that drains into the converge node.

pub mod nodes;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus, kind};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::WorldmindConfig;
use crate::gate::oscillation::OscillationDetector;
use crate::llm::LanguageModel;
use crate::metrics::{self, MetricsRegistry};
use crate::mission::{MissionState, MissionStatus, StateUpdate};
use crate::sandbox::SandboxDriver;
use crate::token::TokenConfig;
use crate::workspace::MissionWorkspace;

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Process-wide collaborators handed to every graph node. Nothing here is
/// reached implicitly; nodes receive the runtime explicitly.
pub struct MissionRuntime {
    pub config: WorldmindConfig,
    pub bus: EventBus,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub model: Arc<dyn LanguageModel>,
    pub driver: Arc<dyn SandboxDriver>,
    pub token_config: TokenConfig,
    pub oscillation: OscillationDetector,
    pub cancel: CancellationToken,
    pub metrics: &'static MetricsRegistry,
    workspace: Mutex<Option<Arc<MissionWorkspace>>>,
}

impl MissionRuntime {
    pub fn new(
        config: WorldmindConfig,
        bus: EventBus,
        checkpoints: Arc<dyn CheckpointStore>,
        model: Arc<dyn LanguageModel>,
        driver: Arc<dyn SandboxDriver>,
        token_config: TokenConfig,
    ) -> Self {
        Self {
            config,
            bus,
            checkpoints,
            model,
            driver,
            token_config,
            oscillation: OscillationDetector::new(),
            cancel: CancellationToken::new(),
            metrics: metrics::global_metrics(),
            workspace: Mutex::new(None),
        }
    }

    /// The mission workspace, creating it (idempotent clone) on first use.
    ///
    /// Lazy so a resumed mission rebuilds its workspace handle without
    /// re-running the upload node.
    pub fn ensure_workspace(&self, state: &MissionState) -> Result<Arc<MissionWorkspace>> {
        let mut slot = self.workspace.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ws) = slot.as_ref() {
            return Ok(Arc::clone(ws));
        }
        let ws = Arc::new(MissionWorkspace::create(
            &self.config.workdir,
            &state.mission_id,
            &state.repo_url,
            &self.config.base_branch,
            self.config.worktrees_enabled,
        )?);
        *slot = Some(Arc::clone(&ws));
        Ok(ws)
    }

    /// The workspace handle if one was created during this run.
    pub fn workspace_if_created(&self) -> Option<Arc<MissionWorkspace>> {
        self.workspace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Graph records
// ---------------------------------------------------------------------------

pub type NodeFuture<'a> = Pin<Box<dyn Future<Output = Result<StateUpdate>> + Send + 'a>>;

/// Async node body; a plain function pointer so the graph stays a value.
pub type NodeFn = for<'a> fn(&'a MissionRuntime, &'a MissionState) -> NodeFuture<'a>;

/// A graph node: name plus state-transition function.
pub struct GraphNode {
    pub name: &'static str,
    pub run: NodeFn,
}

/// Where a router sends the mission next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Node(&'static str),
    End,
}

/// A conditional edge: routes on the post-update state.
pub type RouterFn = fn(&MissionState) -> Route;

/// The compiled mission graph: dispatch tables for nodes and edges.
pub struct MissionGraph {
    nodes: HashMap<&'static str, GraphNode>,
    edges: HashMap<&'static str, &'static str>,
    routers: HashMap<&'static str, RouterFn>,
}

// Node name constants keep the tables and routers typo-safe.
pub const CLASSIFY: &str = "classify";
pub const UPLOAD_CONTEXT: &str = "upload_context";
pub const CLARIFY: &str = "clarify";
pub const GENERATE_SPEC: &str = "generate_spec";
pub const PLAN: &str = "plan";
pub const SCHEDULE_WAVE: &str = "schedule_wave";
pub const DISPATCH_WAVE: &str = "dispatch_wave";
pub const EVALUATE_WAVE: &str = "evaluate_wave";
pub const CONVERGE: &str = "converge";

fn run_classify<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::classify(rt, state))
}
fn run_upload_context<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::upload_context(rt, state))
}
fn run_clarify<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::clarify(rt, state))
}
fn run_generate_spec<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::generate_spec(rt, state))
}
fn run_plan<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::plan(rt, state))
}
fn run_schedule_wave<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::schedule_wave(rt, state))
}
fn run_dispatch_wave<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::dispatch_wave(rt, state))
}
fn run_evaluate_wave<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::evaluate_wave(rt, state))
}
fn run_converge<'a>(rt: &'a MissionRuntime, state: &'a MissionState) -> NodeFuture<'a> {
    Box::pin(nodes::converge(rt, state))
}

fn route_after_clarify(state: &MissionState) -> Route {
    if state.needs_clarification {
        Route::End
    } else {
        Route::Node(GENERATE_SPEC)
    }
}

fn route_after_plan(state: &MissionState) -> Route {
    if state.status == MissionStatus::AwaitingApproval {
        Route::End
    } else {
        Route::Node(SCHEDULE_WAVE)
    }
}

fn route_after_schedule(state: &MissionState) -> Route {
    if state.pending_wave.is_empty() {
        Route::Node(CONVERGE)
    } else {
        Route::Node(DISPATCH_WAVE)
    }
}

fn route_after_evaluate(state: &MissionState) -> Route {
    if state.status == MissionStatus::Failed || state.all_tasks_settled() {
        Route::Node(CONVERGE)
    } else {
        Route::Node(SCHEDULE_WAVE)
    }
}

impl MissionGraph {
    /// The standard worldmind topology.
    pub fn standard() -> Self {
        let node_list = [
            GraphNode { name: CLASSIFY, run: run_classify },
            GraphNode { name: UPLOAD_CONTEXT, run: run_upload_context },
            GraphNode { name: CLARIFY, run: run_clarify },
            GraphNode { name: GENERATE_SPEC, run: run_generate_spec },
            GraphNode { name: PLAN, run: run_plan },
            GraphNode { name: SCHEDULE_WAVE, run: run_schedule_wave },
            GraphNode { name: DISPATCH_WAVE, run: run_dispatch_wave },
            GraphNode { name: EVALUATE_WAVE, run: run_evaluate_wave },
            GraphNode { name: CONVERGE, run: run_converge },
        ];
        let mut nodes = HashMap::new();
        for node in node_list {
            nodes.insert(node.name, node);
        }

        let edges = HashMap::from([
            (CLASSIFY, UPLOAD_CONTEXT),
            (UPLOAD_CONTEXT, CLARIFY),
            (GENERATE_SPEC, PLAN),
            (DISPATCH_WAVE, EVALUATE_WAVE),
        ]);

        let mut routers: HashMap<&'static str, RouterFn> = HashMap::new();
        routers.insert(CLARIFY, route_after_clarify);
        routers.insert(PLAN, route_after_plan);
        routers.insert(SCHEDULE_WAVE, route_after_schedule);
        routers.insert(EVALUATE_WAVE, route_after_evaluate);

        Self { nodes, edges, routers }
    }

    /// Pick the node a (possibly resumed) mission enters at.
    ///
    /// Resuming an approval pause implies the operator approved; resuming a
    /// clarification pause implies the request was amended.
    pub fn entry_for(state: &MissionState) -> &'static str {
        use MissionStatus::*;
        match state.status {
            Classifying => CLASSIFY,
            Uploading => UPLOAD_CONTEXT,
            Clarifying | AwaitingClarification => CLARIFY,
            Specifying => GENERATE_SPEC,
            Planning => PLAN,
            AwaitingApproval | Executing => SCHEDULE_WAVE,
            Completed | Failed | Cancelled | Cancelling => CONVERGE,
        }
    }

    /// Drive a mission until it pauses, completes, or fails.
    ///
    /// Returns the final state; the same state is always the content of the
    /// newest checkpoint.
    pub async fn run(&self, rt: &MissionRuntime, mut state: MissionState) -> Result<MissionState> {
        let mission_id = state.mission_id.clone();

        let mut step_id = rt
            .checkpoints
            .latest(&mission_id)
            .await?
            .map(|c| c.step_id)
            .unwrap_or(0);
        let mut parent_step = (step_id > 0).then_some(step_id);

        if step_id == 0 {
            rt.bus.publish(&Event::new(
                kind::MISSION_CREATED,
                &mission_id,
                serde_json::json!({
                    "request": state.request,
                    "strategy": state.execution_strategy.to_string(),
                }),
            ));
            step_id += 1;
            rt.checkpoints
                .put(&Checkpoint::snapshot(&state, step_id, parent_step)?)
                .await?;
            parent_step = Some(step_id);
        }

        let mut current = Self::entry_for(&state);
        let mut invocations: u32 = 0;
        let mut retried_current = false;

        loop {
            // Cancellation drains into converge, which marks in-flight tasks
            // failed and cleans up.
            if rt.cancel.is_cancelled() && current != CONVERGE {
                tracing::info!(mission_id = %mission_id, "cancel requested, converging");
                state.status = MissionStatus::Cancelling;
                current = CONVERGE;
            }

            if invocations >= rt.config.recursion_limit {
                state.record_error("graph", "recursion_exhausted");
                state.status = MissionStatus::Failed;
                step_id += 1;
                rt.checkpoints
                    .put(&Checkpoint::snapshot(&state, step_id, parent_step)?)
                    .await?;
                rt.bus.publish(&Event::new(
                    kind::MISSION_FAILED,
                    &mission_id,
                    serde_json::json!({"reason": "recursion_exhausted"}),
                ));
                rt.metrics
                    .incr(metrics::name::MISSIONS_TOTAL, &[("status", "failed")]);
                tracing::error!(
                    mission_id = %mission_id,
                    limit = rt.config.recursion_limit,
                    "graph recursion budget exhausted"
                );
                return Ok(state);
            }
            invocations += 1;

            let node = self
                .nodes
                .get(current)
                .with_context(|| format!("graph has no node named {current:?}"))?;

            rt.bus.publish(&Event::new(
                kind::phase_started(current),
                &mission_id,
                serde_json::Value::Null,
            ));
            tracing::debug!(mission_id = %mission_id, node = current, "running graph node");

            match (node.run)(rt, &state).await {
                Ok(update) => {
                    retried_current = false;
                    update.apply(&mut state);
                    if let Some(violation) = state.check_invariants() {
                        tracing::error!(
                            mission_id = %mission_id,
                            node = current,
                            violation = %violation,
                            "state invariant violated after node update"
                        );
                    }
                    step_id += 1;
                    rt.checkpoints
                        .put(&Checkpoint::snapshot(&state, step_id, parent_step)?)
                        .await?;
                    parent_step = Some(step_id);
                    rt.bus.publish(&Event::new(
                        kind::phase_completed(current),
                        &mission_id,
                        serde_json::Value::Null,
                    ));
                }
                Err(e) => {
                    rt.bus.publish(&Event::new(
                        kind::phase_failed(current),
                        &mission_id,
                        serde_json::json!({"error": e.to_string()}),
                    ));
                    state.record_error(current, format!("{e:#}"));
                    if !retried_current {
                        retried_current = true;
                        tracing::warn!(
                            mission_id = %mission_id,
                            node = current,
                            error = %e,
                            "graph node failed, retrying once"
                        );
                        continue;
                    }
                    tracing::error!(
                        mission_id = %mission_id,
                        node = current,
                        error = %e,
                        "graph node failed twice, failing mission"
                    );
                    state.status = MissionStatus::Failed;
                    step_id += 1;
                    rt.checkpoints
                        .put(&Checkpoint::snapshot(&state, step_id, parent_step)?)
                        .await?;
                    rt.bus.publish(&Event::new(
                        kind::MISSION_FAILED,
                        &mission_id,
                        serde_json::json!({"reason": "node_failed", "node": current}),
                    ));
                    rt.metrics
                        .incr(metrics::name::MISSIONS_TOTAL, &[("status", "failed")]);
                    return Ok(state);
                }
            }

            // A paused mission stops here and resumes from its checkpoint.
            if state.status.is_paused() {
                tracing::info!(
                    mission_id = %mission_id,
                    status = %state.status,
                    "mission paused awaiting human input"
                );
                return Ok(state);
            }

            current = match self.edges.get(current).copied() {
                Some(next) => next,
                None => match self.routers.get(current).map(|router| router(&state)) {
                    Some(Route::Node(next)) => next,
                    Some(Route::End) | None => return Ok(state),
                },
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::{ExecutionStrategy, InteractionMode};

    fn state_with_status(status: MissionStatus) -> MissionState {
        let mut state = MissionState::new(
            "m-1",
            "req",
            "https://example.com/r.git",
            InteractionMode::FullAuto,
            ExecutionStrategy::Parallel,
        );
        state.status = status;
        state
    }

    #[test]
    fn standard_graph_has_all_nodes_and_edges() {
        let graph = MissionGraph::standard();
        for name in [
            CLASSIFY, UPLOAD_CONTEXT, CLARIFY, GENERATE_SPEC, PLAN, SCHEDULE_WAVE,
            DISPATCH_WAVE, EVALUATE_WAVE, CONVERGE,
        ] {
            assert!(graph.nodes.contains_key(name), "missing node {name}");
        }
        assert_eq!(graph.edges[CLASSIFY], UPLOAD_CONTEXT);
        assert_eq!(graph.edges[DISPATCH_WAVE], EVALUATE_WAVE);
        assert!(graph.routers.contains_key(EVALUATE_WAVE));
        // Converge terminates: no outgoing edge, no router.
        assert!(!graph.edges.contains_key(CONVERGE));
        assert!(!graph.routers.contains_key(CONVERGE));
    }

    #[test]
    fn clarify_router_pauses_or_continues() {
        let mut state = state_with_status(MissionStatus::Clarifying);
        state.needs_clarification = true;
        assert_eq!(route_after_clarify(&state), Route::End);
        state.needs_clarification = false;
        assert_eq!(route_after_clarify(&state), Route::Node(GENERATE_SPEC));
    }

    #[test]
    fn schedule_router_converges_on_empty_wave() {
        let mut state = state_with_status(MissionStatus::Executing);
        assert_eq!(route_after_schedule(&state), Route::Node(CONVERGE));
        state.pending_wave = vec!["a".to_string()];
        assert_eq!(route_after_schedule(&state), Route::Node(DISPATCH_WAVE));
    }

    #[test]
    fn evaluate_router_loops_until_done() {
        let mut state = state_with_status(MissionStatus::Executing);
        state.tasks = vec![crate::mission::Task::new(
            "a",
            crate::mission::AgentKind::Coder,
            "obj",
        )];
        assert_eq!(route_after_evaluate(&state), Route::Node(SCHEDULE_WAVE));

        state.tasks[0].status = crate::mission::TaskStatus::Passed;
        assert_eq!(route_after_evaluate(&state), Route::Node(CONVERGE));

        let mut failed = state_with_status(MissionStatus::Failed);
        failed.tasks = vec![];
        assert_eq!(route_after_evaluate(&failed), Route::Node(CONVERGE));
    }

    #[test]
    fn entry_points_follow_status() {
        assert_eq!(
            MissionGraph::entry_for(&state_with_status(MissionStatus::Classifying)),
            CLASSIFY
        );
        assert_eq!(
            MissionGraph::entry_for(&state_with_status(MissionStatus::AwaitingClarification)),
            CLARIFY
        );
        assert_eq!(
            MissionGraph::entry_for(&state_with_status(MissionStatus::AwaitingApproval)),
            SCHEDULE_WAVE
        );
        assert_eq!(
            MissionGraph::entry_for(&state_with_status(MissionStatus::Executing)),
            SCHEDULE_WAVE
        );
        assert_eq!(
            MissionGraph::entry_for(&state_with_status(MissionStatus::Cancelling)),
            CONVERGE
        );
    }
}

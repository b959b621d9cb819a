//! End-to-end mission graph tests.
//!
//! These drive the real state graph against a scripted language model, a
//! fake sandbox driver, the in-memory checkpoint store, and a real git
//! origin, so wave shapes, retries, escalation, pausing, replay, and
//! cancellation are all exercised through the same code paths production
//! uses.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use worldmind_core::bus::{Event, EventBus};
use worldmind_core::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use worldmind_core::config::WorldmindConfig;
use worldmind_core::gate::review::REVIEW_SCHEMA;
use worldmind_core::graph::{MissionGraph, MissionRuntime};
use worldmind_core::llm::{LanguageModel, LlmError};
use worldmind_core::metrics::{global_metrics, name};
use worldmind_core::mission::{
    DispatchResult, ExecutionStrategy, InteractionMode, MissionState, MissionStatus, TaskStatus,
};
use worldmind_core::sandbox::{DispatchRequest, SandboxDriver};
use worldmind_core::token::TokenConfig;

// ===========================================================================
// Test doubles
// ===========================================================================

/// Scripted model: planning-phase responses come from a queue; review
/// extraction always answers the same way (reviews arrive in wave
/// completion order, which is nondeterministic under parallel dispatch).
struct TestModel {
    queue: Mutex<VecDeque<serde_json::Value>>,
    review: serde_json::Value,
}

impl TestModel {
    fn new(planning: Vec<serde_json::Value>) -> Self {
        Self {
            queue: Mutex::new(planning.into()),
            review: serde_json::json!({
                "score": 9,
                "summary": "looks good",
                "issues": [],
                "suggestions": [],
            }),
        }
    }
}

#[async_trait]
impl LanguageModel for TestModel {
    async fn structured_call(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        schema: &str,
    ) -> Result<serde_json::Value, LlmError> {
        if schema == REVIEW_SCHEMA {
            return Ok(self.review.clone());
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(LlmError::EmptyResponse)
    }
}

/// What the fake driver does for one dispatch of a task.
#[derive(Clone)]
enum FakeOutcome {
    /// Write the task's (first) target file and report passing tests and a
    /// 9/10 review.
    Pass,
    /// Dispatch succeeds but the reported tests fail.
    FailTests,
    /// Dispatch itself fails with this reason.
    Fail(&'static str),
    /// Block until cancelled.
    Hang,
}

struct FakeDriver {
    script: Mutex<HashMap<String, VecDeque<FakeOutcome>>>,
}

impl FakeDriver {
    fn passing() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
        }
    }

    fn scripted(script: &[(&str, &[FakeOutcome])]) -> Self {
        let map = script
            .iter()
            .map(|(id, outcomes)| (id.to_string(), outcomes.iter().cloned().collect()))
            .collect();
        Self {
            script: Mutex::new(map),
        }
    }

    fn next_outcome(&self, task_id: &str) -> FakeOutcome {
        self.script
            .lock()
            .unwrap()
            .get_mut(task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(FakeOutcome::Pass)
    }
}

#[async_trait]
impl SandboxDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchResult> {
        let task_id = request.task.id.clone();
        let mut result = DispatchResult {
            task_id: task_id.clone(),
            success: true,
            failure_reason: None,
            files_affected: Vec::new(),
            raw_output: String::new(),
            duration_ms: 5,
        };

        match self.next_outcome(&task_id) {
            FakeOutcome::Pass => {
                let file = request
                    .task
                    .target_files
                    .first()
                    .cloned()
                    .unwrap_or_else(|| format!("{task_id}.out"));
                let path = request.working_tree.join(&file);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(
                    &path,
                    format!("{} iteration {}\n", task_id, request.task.iteration),
                )?;
                result.raw_output =
                    format!("Tests run: 2, Failures: 0\nScore: 9/10\nFILES_AFFECTED: {file}");
                result.files_affected = vec![file];
            }
            FakeOutcome::FailTests => {
                result.raw_output = "Tests run: 2, Failures: 1\nScore: 9/10".to_string();
            }
            FakeOutcome::Fail(reason) => {
                result.success = false;
                result.failure_reason = Some(reason.to_string());
            }
            FakeOutcome::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        result.success = false;
                        result.failure_reason = Some("cancelled".to_string());
                    }
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        result.success = false;
                        result.failure_reason = Some("timeout".to_string());
                    }
                }
            }
        }

        Ok(result)
    }
}

// ===========================================================================
// Harness
// ===========================================================================

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to spawn: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn create_origin(base: &Path) -> PathBuf {
    let origin = base.join("origin.git");
    run_git(base, &["init", "--bare", "-b", "main", "origin.git"]);
    let seed = base.join("seed");
    run_git(base, &["clone", origin.to_str().unwrap(), "seed"]);
    run_git(&seed, &["config", "user.email", "test@worldmind.dev"]);
    run_git(&seed, &["config", "user.name", "Worldmind Test"]);
    run_git(&seed, &["checkout", "-b", "main"]);
    std::fs::write(seed.join("README.md"), "# seed\n").unwrap();
    run_git(&seed, &["add", "."]);
    run_git(&seed, &["commit", "-m", "seed"]);
    run_git(&seed, &["push", "-u", "origin", "main"]);
    origin
}

struct Harness {
    _dir: TempDir,
    origin: PathBuf,
    runtime: MissionRuntime,
    store: Arc<InMemoryCheckpointStore>,
    events: Arc<Mutex<Vec<Event>>>,
    _subscription: worldmind_core::bus::SubscriptionHandle,
}

impl Harness {
    fn new(planning: Vec<serde_json::Value>, driver: FakeDriver) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let origin = create_origin(dir.path());

        let mut config = WorldmindConfig::default();
        config.workdir = dir.path().join("work");
        config.wave_cooldown = Duration::ZERO;
        config.task_timeout = Duration::from_secs(30);
        config.max_parallel = 10;
        config.runtime = Some("test".to_string());

        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = bus.subscribe_global(move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        let store = Arc::new(InMemoryCheckpointStore::new());
        let runtime = MissionRuntime::new(
            config,
            bus,
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            Arc::new(TestModel::new(planning)),
            Arc::new(driver),
            TokenConfig::new(b"graph-test-secret".to_vec()),
        );

        Self {
            _dir: dir,
            origin,
            runtime,
            store,
            events,
            _subscription: subscription,
        }
    }

    fn initial_state(&self, mode: InteractionMode, strategy: ExecutionStrategy) -> MissionState {
        MissionState::new(
            "m-test",
            "add the widget",
            self.origin.to_str().unwrap(),
            mode,
            strategy,
        )
    }

    async fn run(&self, state: MissionState) -> MissionState {
        MissionGraph::standard()
            .run(&self.runtime, state)
            .await
            .expect("graph run failed")
    }

    fn events_of_type(&self, event_type: &str) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Task-id sets of every non-empty scheduled wave, in order.
    fn scheduled_waves(&self) -> Vec<Vec<String>> {
        self.events_of_type("wave.scheduled")
            .iter()
            .map(|e| {
                e.payload["task_ids"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|v| v.as_str().unwrap().to_string())
                    .collect()
            })
            .collect()
    }
}

/// Planning responses for a FULL_AUTO run: classify, clarify (actionable),
/// spec, then the given plan.
fn planning(plan: serde_json::Value) -> Vec<serde_json::Value> {
    vec![
        serde_json::json!({"category": "feature", "complexity": "low", "summary": "add widget"}),
        serde_json::json!({"needs_clarification": false, "questions": []}),
        serde_json::json!({"product_spec": "Build the widget."}),
        plan,
    ]
}

fn chain_plan() -> serde_json::Value {
    serde_json::json!({"tasks": [
        {"id": "a", "agent": "coder", "objective": "implement"},
        {"id": "b", "agent": "tester", "objective": "test", "dependencies": ["a"]},
        {"id": "c", "agent": "reviewer", "objective": "review", "dependencies": ["b"]},
    ]})
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linear_chain_runs_one_task_per_wave() {
    let harness = Harness::new(planning(chain_plan()), FakeDriver::passing());
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let final_state = harness.run(state).await;

    assert_eq!(final_state.status, MissionStatus::Completed);
    assert_eq!(final_state.completed_task_ids, vec!["a", "b", "c"]);
    assert_eq!(final_state.wave_counter, 3);
    assert_eq!(
        harness.scheduled_waves(),
        vec![vec!["a"], vec!["b"], vec!["c"]]
    );

    // The event stream is framed by mission.created and exactly one
    // terminal mission event.
    let events = harness.events.lock().unwrap();
    assert_eq!(events.first().unwrap().event_type, "mission.created");
    let completed: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "mission.completed")
        .collect();
    assert_eq!(completed.len(), 1);
    assert!(!events.iter().any(|e| e.event_type == "mission.failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_chain_is_monotonic_with_parent_links() {
    let harness = Harness::new(planning(chain_plan()), FakeDriver::passing());
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);
    harness.run(state).await;

    let chain = harness.store.list("m-test").await.unwrap();
    assert!(!chain.is_empty());
    for (i, checkpoint) in chain.iter().enumerate() {
        assert_eq!(checkpoint.step_id, i as i64 + 1);
        if i == 0 {
            assert_eq!(checkpoint.parent_step_id, None);
        } else {
            assert_eq!(checkpoint.parent_step_id, Some(i as i64));
        }
        // Every snapshot rehydrates and upholds the state invariants.
        let snapshot = checkpoint.rehydrate().unwrap();
        assert!(snapshot.check_invariants().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diamond_fans_out_in_the_middle_wave() {
    let plan = serde_json::json!({"tasks": [
        {"id": "a", "agent": "coder", "objective": "base"},
        {"id": "b", "agent": "coder", "objective": "left", "dependencies": ["a"]},
        {"id": "c", "agent": "coder", "objective": "right", "dependencies": ["a"]},
        {"id": "d", "agent": "tester", "objective": "join", "dependencies": ["b", "c"]},
    ]});
    let harness = Harness::new(planning(plan), FakeDriver::passing());
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let final_state = harness.run(state).await;
    assert_eq!(final_state.status, MissionStatus::Completed);

    let waves = harness.scheduled_waves();
    assert_eq!(waves.len(), 3);
    assert_eq!(waves[0], vec!["a"]);
    let mut middle = waves[1].clone();
    middle.sort();
    assert_eq!(middle, vec!["b", "c"]);
    assert_eq!(waves[2], vec!["d"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_target_files_defer_to_the_next_wave() {
    let plan = serde_json::json!({"tasks": [
        {"id": "a", "agent": "coder", "objective": "first", "target_files": ["src/x.j"]},
        {"id": "b", "agent": "coder", "objective": "second", "target_files": ["src/x.j", "src/y.j"]},
    ]});
    let harness = Harness::new(planning(plan), FakeDriver::passing());
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let final_state = harness.run(state).await;
    assert_eq!(final_state.status, MissionStatus::Completed);
    assert_eq!(harness.scheduled_waves(), vec![vec!["a"], vec!["b"]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_strategy_never_fans_out() {
    let plan = serde_json::json!({"tasks": [
        {"id": "a", "agent": "coder", "objective": "one"},
        {"id": "b", "agent": "coder", "objective": "two"},
    ]});
    let harness = Harness::new(planning(plan), FakeDriver::passing());
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Sequential);

    let final_state = harness.run(state).await;
    assert_eq!(final_state.status, MissionStatus::Completed);
    for wave in harness.scheduled_waves() {
        assert_eq!(wave.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn approve_plan_mode_pauses_then_resumes_to_completion() {
    let harness = Harness::new(planning(chain_plan()), FakeDriver::passing());
    let state = harness.initial_state(InteractionMode::ApprovePlan, ExecutionStrategy::Parallel);

    let paused = harness.run(state).await;
    assert_eq!(paused.status, MissionStatus::AwaitingApproval);
    assert_eq!(paused.tasks.len(), 3);
    assert!(paused.completed_task_ids.is_empty());

    // Resume from the latest checkpoint, as the CLI does after approval.
    let latest = harness.store.latest("m-test").await.unwrap().unwrap();
    let resumed_entry = latest.rehydrate().unwrap();
    let final_state = harness.run(resumed_entry).await;

    assert_eq!(final_state.status, MissionStatus::Completed);
    assert_eq!(final_state.completed_task_ids, vec!["a", "b", "c"]);

    // The checkpoint chain continues across the pause without gaps.
    let chain = harness.store.list("m-test").await.unwrap();
    let ids: Vec<i64> = chain.iter().map(|c| c.step_id).collect();
    let expected: Vec<i64> = (1..=ids.len() as i64).collect();
    assert_eq!(ids, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unactionable_request_pauses_for_clarification() {
    let responses = vec![
        serde_json::json!({"category": "feature", "complexity": "low", "summary": "vague"}),
        serde_json::json!({
            "needs_clarification": true,
            "questions": ["Which widget?", "Where should it live?"],
        }),
    ];
    let harness = Harness::new(responses, FakeDriver::passing());
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let paused = harness.run(state).await;
    assert_eq!(paused.status, MissionStatus::AwaitingClarification);
    assert!(paused.needs_clarification);
    assert_eq!(paused.clarification_questions.len(), 2);
    assert!(paused.tasks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_exhaustion_escalates_and_pauses_the_mission() {
    // With max_iterations=2, three denied gates; the third denial escalates.
    let plan = serde_json::json!({"tasks": [
        {"id": "t", "agent": "coder", "objective": "flaky", "max_iterations": 2},
    ]});
    let script: &[(&str, &[FakeOutcome])] = &[(
        "t",
        &[FakeOutcome::FailTests, FakeOutcome::FailTests, FakeOutcome::FailTests],
    )];
    let before_escalations =
        global_metrics().counter(name::ESCALATIONS_TOTAL, &[("reason", "exhausted_retries")]);

    let harness = Harness::new(planning(plan), FakeDriver::scripted(script));
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let final_state = harness.run(state).await;
    assert_eq!(final_state.status, MissionStatus::AwaitingApproval);

    let task = final_state.task("t").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.iteration, 2);

    assert_eq!(harness.events_of_type("quality.denied").len(), 3);
    assert_eq!(
        global_metrics().counter(name::ESCALATIONS_TOTAL, &[("reason", "exhausted_retries")]),
        before_escalations + 1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oscillating_failures_escalate_before_retries_run_out() {
    // Error keys timeout, crash, timeout form an A-B-A pattern; the
    // third failure escalates even though iterations remain.
    let plan = serde_json::json!({"tasks": [
        {"id": "u", "agent": "coder", "objective": "wobbly", "max_iterations": 5},
    ]});
    let script: &[(&str, &[FakeOutcome])] = &[(
        "u",
        &[
            FakeOutcome::Fail("timeout"),
            FakeOutcome::Fail("crash: boom"),
            FakeOutcome::Fail("timeout"),
        ],
    )];
    let before_oscillation =
        global_metrics().counter(name::ESCALATIONS_TOTAL, &[("reason", "oscillation")]);

    let harness = Harness::new(planning(plan), FakeDriver::scripted(script));
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let final_state = harness.run(state).await;
    assert_eq!(final_state.status, MissionStatus::AwaitingApproval);

    let task = final_state.task("u").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.iteration < task.max_iterations);
    assert_eq!(
        global_metrics().counter(name::ESCALATIONS_TOTAL, &[("reason", "oscillation")]),
        before_oscillation + 1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_policy_fails_the_mission() {
    let plan = serde_json::json!({"tasks": [
        {"id": "t", "agent": "coder", "objective": "critical", "on_failure": "abort"},
    ]});
    let script: &[(&str, &[FakeOutcome])] = &[("t", &[FakeOutcome::FailTests])];
    let harness = Harness::new(planning(plan), FakeDriver::scripted(script));
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let final_state = harness.run(state).await;
    assert_eq!(final_state.status, MissionStatus::Failed);
    assert_eq!(final_state.task("t").unwrap().status, TaskStatus::Failed);
    assert_eq!(harness.events_of_type("mission.failed").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn skip_policy_settles_the_task_and_completes() {
    let plan = serde_json::json!({"tasks": [
        {"id": "x", "agent": "coder", "objective": "optional", "on_failure": "skip"},
        {"id": "y", "agent": "coder", "objective": "required"},
    ]});
    let script: &[(&str, &[FakeOutcome])] = &[("x", &[FakeOutcome::Fail("crash: nope")])];
    let harness = Harness::new(planning(plan), FakeDriver::scripted(script));
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let final_state = harness.run(state).await;
    assert_eq!(final_state.status, MissionStatus::Completed);
    assert_eq!(final_state.task("x").unwrap().status, TaskStatus::Skipped);
    assert_eq!(final_state.task("y").unwrap().status, TaskStatus::Passed);
    assert!(final_state.completed_task_ids.contains(&"x".to_string()));
    assert!(final_state.completed_task_ids.contains(&"y".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replay_with_identical_responses_yields_identical_chain() {
    // Two fresh runs with the same scripted responses produce the same
    // logical checkpoint chain (timestamps and durations aside).
    async fn chain_signature() -> Vec<(i64, String, Vec<String>, u32)> {
        let harness = Harness::new(planning(chain_plan()), FakeDriver::passing());
        let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);
        harness.run(state).await;
        let chain = harness.store.list("m-test").await.unwrap();
        chain
            .iter()
            .map(|c| {
                let s = c.rehydrate().unwrap();
                (
                    c.step_id,
                    s.status.to_string(),
                    s.completed_task_ids.clone(),
                    s.wave_counter,
                )
            })
            .collect()
    }

    let first = chain_signature().await;
    let second = chain_signature().await;
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recursion_budget_fails_the_mission() {
    let harness = Harness::new(planning(chain_plan()), FakeDriver::passing());
    // Tight budget: the mission cannot even finish planning.
    let mut state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);
    state.mission_id = "m-test".to_string();

    let mut config = harness.runtime.config.clone();
    config.recursion_limit = 3;
    // Rebuild a runtime with the tightened budget but shared collaborators.
    let runtime = MissionRuntime::new(
        config,
        harness.runtime.bus.clone(),
        Arc::clone(&harness.runtime.checkpoints),
        Arc::clone(&harness.runtime.model),
        Arc::clone(&harness.runtime.driver),
        TokenConfig::new(b"graph-test-secret".to_vec()),
    );

    let final_state = MissionGraph::standard().run(&runtime, state).await.unwrap();
    assert_eq!(final_state.status, MissionStatus::Failed);
    assert!(
        final_state
            .errors
            .iter()
            .any(|e| e.message.contains("recursion_exhausted"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_drains_to_cancelled() {
    let plan = serde_json::json!({"tasks": [
        {"id": "t", "agent": "coder", "objective": "long-running"},
    ]});
    let script: &[(&str, &[FakeOutcome])] = &[("t", &[FakeOutcome::Hang])];
    let harness = Harness::new(planning(plan), FakeDriver::scripted(script));
    let state = harness.initial_state(InteractionMode::FullAuto, ExecutionStrategy::Parallel);

    let cancel = harness.runtime.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let final_state = harness.run(state).await;
    assert_eq!(final_state.status, MissionStatus::Cancelled);
    // The in-flight task surfaces as failed, not stuck executing.
    assert_eq!(final_state.task("t").unwrap().status, TaskStatus::Failed);
}

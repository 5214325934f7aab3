//! End-to-end engine tests against the in-memory store.
//!
//! These drive full runs through `RunEngine`: fan-out, callback ingestion,
//! fan-in, decision routing, sub-runs, cancellation, and the standalone
//! batch job aggregator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use weft_core::engine::{
    BatchJobConfig, BatchJobManager, CallbackRequest, EngineError, RunEngine,
};
use weft_core::event::EventBus;
use weft_core::outbound::{OutboundError, OutboundExecutor, OutboundRequest, OutboundResponse};
use weft_infra::memory::MemoryRunStore;
use weft_types::batch::BatchJobStatus;
use weft_types::event::RunEvent;
use weft_types::run::{Run, RunStatus, UnitStatus};
use weft_types::step::{Connection, StepConfig, StepDefinition, StepType, ThresholdMissPolicy};
use weft_types::workflow::Workflow;

// ---------------------------------------------------------------------------
// Test outbound executor
// ---------------------------------------------------------------------------

/// Records every outbound request and answers with a fixed status.
#[derive(Clone)]
struct RecordingOutbound {
    requests: Arc<Mutex<Vec<OutboundRequest>>>,
    status: u16,
}

impl RecordingOutbound {
    fn ok() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            status: 200,
        }
    }

    fn failing() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            status: 502,
        }
    }

    fn recorded(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl OutboundExecutor for RecordingOutbound {
    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse, OutboundError> {
        self.requests.lock().unwrap().push(request);
        Ok(OutboundResponse {
            status: self.status,
            body: json!({"ok": self.status < 300}),
        })
    }
}

type TestEngine = RunEngine<MemoryRunStore, RecordingOutbound>;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn engine_with(outbound: RecordingOutbound) -> (TestEngine, MemoryRunStore, EventBus) {
    let store = MemoryRunStore::new();
    let bus = EventBus::new(256);
    let engine = RunEngine::new(store.clone(), outbound, bus.clone());
    (engine, store, bus)
}

fn engine() -> (TestEngine, MemoryRunStore, EventBus) {
    engine_with(RecordingOutbound::ok())
}

fn trigger(id: &str) -> StepDefinition {
    StepDefinition::new(id, id, StepType::Trigger)
}

fn agent(id: &str) -> StepDefinition {
    StepDefinition::new(id, id, StepType::Agent)
}

fn manual(id: &str) -> StepDefinition {
    StepDefinition::new(id, id, StepType::Manual)
}

fn foreach(id: &str, path: &str) -> StepDefinition {
    let mut step = StepDefinition::new(id, id, StepType::Foreach);
    step.config = StepConfig::Foreach {
        collection_path: path.to_string(),
        item_var: "item".to_string(),
        max_items: None,
        streaming: false,
        extra: HashMap::new(),
    };
    step
}

fn streaming_foreach(id: &str) -> StepDefinition {
    let mut step = StepDefinition::new(id, id, StepType::Foreach);
    step.config = StepConfig::Foreach {
        collection_path: String::new(),
        item_var: "item".to_string(),
        max_items: None,
        streaming: true,
        extra: HashMap::new(),
    };
    step
}

fn join(id: &str, source: &str, percent: f64) -> StepDefinition {
    let mut step = StepDefinition::new(id, id, StepType::Join);
    step.config = StepConfig::Join {
        source_step: source.to_string(),
        min_count: None,
        min_success_percent: Some(percent),
        max_wait_ms: None,
        fail_on_timeout: true,
        on_threshold_miss: ThresholdMissPolicy::Fail,
        extra: HashMap::new(),
    };
    step
}

fn linked(mut steps: Vec<StepDefinition>) -> Vec<StepDefinition> {
    for i in 0..steps.len().saturating_sub(1) {
        let next = steps[i + 1].id.clone();
        steps[i].connections.push(Connection::to(next));
    }
    steps
}

async fn save_workflow(store: &MemoryRunStore, name: &str, steps: Vec<StepDefinition>) -> Workflow {
    use weft_core::repository::run::RunStore;
    let mut wf = Workflow::new(name);
    wf.steps = steps;
    store.save_workflow(&wf).await.unwrap();
    wf
}

fn items_callback(payload: Value) -> CallbackRequest {
    CallbackRequest::from_parts(payload, None, None, None)
}

async fn report_unit(engine: &TestEngine, run: &Run, step_id: &str, unit_id: Uuid, success: bool) {
    let status = if success { "success" } else { "failed" };
    engine
        .handle_callback(
            &run.id,
            step_id,
            Some(&run.callback_secret),
            items_callback(json!({"unit_id": unit_id.to_string(), "status": status})),
        )
        .await
        .unwrap();
}

async fn wait_for_status(engine: &TestEngine, run_id: &Uuid, status: RunStatus) -> Run {
    for _ in 0..200 {
        let run = engine.run_status(run_id).await.unwrap();
        if run.status == status {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never reached {status:?}");
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Linear runs and callbacks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_run_completes_via_callback() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "triage", linked(vec![trigger("start"), agent("assess")])).await;

    let run = engine.start_run(&wf.id, json!({"ticket": 7})).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.current_step_ids, vec!["assess"]);
    assert!(run.completed_step_ids.contains(&"start".to_string()));

    let ack = engine
        .handle_callback(
            &run.id,
            "assess",
            Some(&run.callback_secret),
            items_callback(json!({"status": "success", "output": {"category": "billing"}})),
        )
        .await
        .unwrap();
    assert_eq!(ack.received_count, 1);
    assert_eq!(ack.processed_count, 1);

    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output, Some(json!({"category": "billing"})));
    assert!(done.completed_step_ids.contains(&"assess".to_string()));
}

#[tokio::test]
async fn failed_callback_fails_the_run() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "triage", linked(vec![trigger("start"), agent("assess")])).await;
    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();

    engine
        .handle_callback(
            &run.id,
            "assess",
            Some(&run.callback_secret),
            items_callback(json!({"status": "failed", "error": "model unavailable"})),
        )
        .await
        .unwrap();

    let failed = engine.run_status(&run.id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.failed_step_id.as_deref(), Some("assess"));
    assert!(failed.error.as_deref().unwrap().contains("model unavailable"));
}

#[tokio::test]
async fn wrong_secret_is_rejected_before_any_effect() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "triage", linked(vec![trigger("start"), agent("assess")])).await;
    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();

    let err = engine
        .handle_callback(
            &run.id,
            "assess",
            Some("Bearer wrong"),
            items_callback(json!({"status": "success"})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized));

    // Nothing moved.
    let still = engine.run_status(&run.id).await.unwrap();
    assert_eq!(still.status, RunStatus::Running);
    assert_eq!(still.current_step_ids, vec!["assess"]);
}

#[tokio::test]
async fn unknown_run_and_step_are_not_found() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "triage", linked(vec![trigger("start"), agent("assess")])).await;
    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();

    let err = engine
        .handle_callback(&Uuid::now_v7(), "assess", None, CallbackRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound));

    let err = engine
        .handle_callback(
            &run.id,
            "ghost",
            Some(&run.callback_secret),
            CallbackRequest::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownStep(_)));
}

#[tokio::test]
async fn empty_payload_is_acknowledged_as_zero_items() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "triage", linked(vec![trigger("start"), agent("assess")])).await;
    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();

    let ack = engine
        .handle_callback(
            &run.id,
            "assess",
            Some(&run.callback_secret),
            items_callback(Value::Null),
        )
        .await
        .unwrap();
    assert_eq!(ack.received_count, 0);
    assert_eq!(
        engine.run_status(&run.id).await.unwrap().status,
        RunStatus::Running
    );
}

#[tokio::test]
async fn inactive_workflow_cannot_start() {
    let (engine, store, _bus) = engine();
    use weft_core::repository::run::RunStore;
    let mut wf = Workflow::new("dormant");
    wf.is_active = false;
    wf.steps = vec![trigger("start")];
    store.save_workflow(&wf).await.unwrap();

    let err = engine.start_run(&wf.id, json!(null)).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowInactive(_)));
}

// ---------------------------------------------------------------------------
// Decision routing
// ---------------------------------------------------------------------------

fn decision_workflow() -> Vec<StepDefinition> {
    let mut start = trigger("start");
    start.connections.push(Connection::to("route"));
    let mut route = StepDefinition::new("route", "route", StepType::Decision);
    route
        .connections
        .push(Connection::when("hi", "output.score > 5"));
    route.connections.push(Connection::to("lo"));
    vec![start, route, manual("hi"), manual("lo")]
}

#[tokio::test]
async fn decision_routes_deterministically() {
    for _ in 0..3 {
        let (engine, store, _bus) = engine();
        let wf = save_workflow(&store, "score", decision_workflow()).await;
        let run = engine.start_run(&wf.id, json!({"score": 7})).await.unwrap();
        assert_eq!(run.current_step_ids, vec!["hi"]);
    }
}

#[tokio::test]
async fn decision_falls_back_to_default_branch() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "score", decision_workflow()).await;
    let run = engine.start_run(&wf.id, json!({"score": 2})).await.unwrap();
    assert_eq!(run.current_step_ids, vec!["lo"]);
}

#[tokio::test]
async fn decision_without_match_or_default_fails_the_run() {
    let (engine, store, _bus) = engine();
    let mut steps = decision_workflow();
    steps[1].connections.pop(); // drop the default branch
    let wf = save_workflow(&store, "score", steps).await;

    let run = engine.start_run(&wf.id, json!({"score": 2})).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_step_id.as_deref(), Some("route"));
    assert!(run.error.as_deref().unwrap().contains("no default"));
}

// ---------------------------------------------------------------------------
// Foreach / join
// ---------------------------------------------------------------------------

fn fan_join_workflow(percent: f64) -> Vec<StepDefinition> {
    linked(vec![
        trigger("start"),
        foreach("fan", "items"),
        join("merge", "fan", percent),
    ])
}

async fn run_fan_join(percent: f64) -> (TestEngine, Run, Vec<Uuid>) {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "fanout", fan_join_workflow(percent)).await;
    let run = engine
        .start_run(&wf.id, json!({"items": ["a", "b", "c"]}))
        .await
        .unwrap();

    use weft_core::repository::run::RunStore;
    let units = store.list_units_for_step(&run.id, "fan").await.unwrap();
    assert_eq!(units.len(), 3, "foreach spawns one unit per element");
    assert!(units.iter().all(|u| u.status == UnitStatus::Waiting));
    assert_eq!(run.current_step_ids, vec!["merge"]);

    let ids = units.iter().map(|u| u.id).collect();
    (engine, run, ids)
}

#[tokio::test]
async fn foreach_spawns_units_with_loop_context() {
    let (engine, run, _ids) = run_fan_join(100.0).await;
    use weft_core::repository::run::RunStore;
    let units = engine
        .store()
        .list_units_for_step(&run.id, "fan")
        .await
        .unwrap();
    assert_eq!(units[0].input, json!("a"));
    assert_eq!(units[2].input, json!("c"));
    assert_eq!(units[1].loop_index, Some(1));
    assert_eq!(units[1].loop_total, Some(3));
}

#[tokio::test]
async fn join_at_sixty_percent_fires_success() {
    let (engine, run, ids) = run_fan_join(60.0).await;
    report_unit(&engine, &run, "fan", ids[0], true).await;
    report_unit(&engine, &run, "fan", ids[1], true).await;
    report_unit(&engine, &run, "fan", ids[2], false).await;

    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    let output = done.output.unwrap();
    assert_eq!(output["processed"], json!(2));
    assert_eq!(output["failed"], json!(1));
    assert_eq!(output["received"], json!(3));
    assert_eq!(output["outcomes"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn join_at_eighty_percent_fires_failure() {
    let (engine, run, ids) = run_fan_join(80.0).await;
    report_unit(&engine, &run, "fan", ids[0], true).await;
    report_unit(&engine, &run, "fan", ids[1], true).await;
    report_unit(&engine, &run, "fan", ids[2], false).await;

    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.failed_step_id.as_deref(), Some("merge"));
    assert!(done.error.as_deref().unwrap().contains("threshold"));
}

#[tokio::test]
async fn threshold_miss_pauses_for_manual_review_when_configured() {
    let (engine, store, bus) = engine();
    let mut steps = fan_join_workflow(80.0);
    if let StepConfig::Join {
        on_threshold_miss, ..
    } = &mut steps[2].config
    {
        *on_threshold_miss = ThresholdMissPolicy::ManualReview;
    }
    let wf = save_workflow(&store, "fanout", steps).await;
    let mut rx = bus.subscribe();

    let run = engine
        .start_run(&wf.id, json!({"items": ["a", "b", "c"]}))
        .await
        .unwrap();
    use weft_core::repository::run::RunStore;
    let units = store.list_units_for_step(&run.id, "fan").await.unwrap();
    report_unit(&engine, &run, "fan", units[0].id, true).await;
    report_unit(&engine, &run, "fan", units[1].id, true).await;
    report_unit(&engine, &run, "fan", units[2].id, false).await;

    let paused = engine.run_status(&run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, RunEvent::JoinManualReview { .. })),
        "manual review event published"
    );
}

#[tokio::test]
async fn empty_collection_joins_immediately() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "fanout", fan_join_workflow(100.0)).await;
    let run = engine.start_run(&wf.id, json!({"items": []})).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let output = run.output.unwrap();
    assert_eq!(output["received"], json!(0));
    assert_eq!(output["outcomes"], json!([]));
}

#[tokio::test]
async fn fan_out_cap_exceeded_fails_the_run() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "fanout", fan_join_workflow(100.0)).await;
    let items: Vec<u32> = (0..150).collect();
    let run = engine.start_run(&wf.id, json!({"items": items})).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("cap"));
}

#[tokio::test]
async fn concurrent_callbacks_fire_the_join_exactly_once() {
    let (engine, store, bus) = engine();
    let wf = save_workflow(&store, "fanout", fan_join_workflow(100.0)).await;
    let mut rx = bus.subscribe();
    let run = engine
        .start_run(&wf.id, json!({"items": ["a", "b", "c"]}))
        .await
        .unwrap();

    use weft_core::repository::run::RunStore;
    let units = store.list_units_for_step(&run.id, "fan").await.unwrap();
    let mut handles = Vec::new();
    for unit in units {
        let engine = engine.clone();
        let run_id = run.id;
        let secret = run.callback_secret.clone();
        handles.push(tokio::spawn(async move {
            engine
                .handle_callback(
                    &run_id,
                    "fan",
                    Some(&secret),
                    items_callback(
                        json!({"unit_id": unit.id.to_string(), "status": "success"}),
                    ),
                )
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    let output = done.output.unwrap();
    assert_eq!(output["processed"], json!(3), "aggregate reflects all contributions");

    let fired: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RunEvent::JoinFired { .. }))
        .collect();
    assert_eq!(fired.len(), 1, "join fired exactly once");
}

#[tokio::test]
async fn duplicate_idempotency_key_changes_nothing() {
    let (engine, run, ids) = run_fan_join(100.0).await;

    let request = CallbackRequest::from_parts(
        json!({"unit_id": ids[0].to_string(), "status": "success"}),
        None,
        None,
        Some("evt-1".to_string()),
    );
    let first = engine
        .handle_callback(&run.id, "fan", Some(&run.callback_secret), request.clone())
        .await
        .unwrap();
    assert_eq!(first.received_count, 1);
    assert!(!first.duplicate);

    let second = engine
        .handle_callback(&run.id, "fan", Some(&run.callback_secret), request)
        .await
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(second.received_count, 1, "counters unchanged on duplicate");
}

#[tokio::test]
async fn late_delivery_after_completion_is_a_no_op() {
    let (engine, run, ids) = run_fan_join(60.0).await;
    for id in &ids {
        report_unit(&engine, &run, "fan", *id, true).await;
    }
    assert_eq!(
        engine.run_status(&run.id).await.unwrap().status,
        RunStatus::Completed
    );

    let ack = engine
        .handle_callback(
            &run.id,
            "fan",
            Some(&run.callback_secret),
            items_callback(json!({"status": "success"})),
        )
        .await
        .unwrap();
    assert!(ack.no_op);
    assert_eq!(ack.received_count, 3);
}

// ---------------------------------------------------------------------------
// Streaming fan-out
// ---------------------------------------------------------------------------

fn streaming_workflow() -> Vec<StepDefinition> {
    linked(vec![
        trigger("start"),
        streaming_foreach("fan"),
        join("merge", "fan", 100.0),
    ])
}

#[tokio::test]
async fn streaming_completion_before_count() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "stream", streaming_workflow()).await;
    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();
    assert_eq!(run.current_step_ids, vec!["merge"]);

    // Five items arrive; no expected count is ever declared.
    for i in 0..5 {
        let ack = engine
            .handle_callback(
                &run.id,
                "fan",
                Some(&run.callback_secret),
                items_callback(json!({"output": {"row": i}, "status": "success"})),
            )
            .await
            .unwrap();
        assert_eq!(ack.created_unit_ids.len(), 1, "each item creates a unit");
        assert!(!ack.complete);
    }

    // The explicit completion signal closes the batch at received=5.
    let ack = engine
        .handle_callback(
            &run.id,
            "fan",
            Some(&run.callback_secret),
            CallbackRequest::from_parts(Value::Null, None, Some(true), None),
        )
        .await
        .unwrap();
    assert!(ack.complete);
    assert_eq!(ack.received_count, 5);
    assert_eq!(ack.expected_count, None);

    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output.unwrap()["received"], json!(5));
}

#[tokio::test]
async fn late_expected_count_declaration() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "stream", streaming_workflow()).await;
    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();

    // Three items arrive first.
    for _ in 0..3 {
        engine
            .handle_callback(
                &run.id,
                "fan",
                Some(&run.callback_secret),
                items_callback(json!({"status": "success"})),
            )
            .await
            .unwrap();
    }

    // The expected total of 5 arrives afterwards, out of band.
    let ack = engine
        .handle_callback(
            &run.id,
            "fan",
            Some(&run.callback_secret),
            CallbackRequest::from_parts(Value::Null, Some(5), None, None),
        )
        .await
        .unwrap();
    assert_eq!(ack.expected_count, Some(5));
    assert_eq!(ack.received_count, 3, "accumulated counts are not recomputed");
    assert!(!ack.complete);

    // Two more items reach the declared total.
    for _ in 0..2 {
        engine
            .handle_callback(
                &run.id,
                "fan",
                Some(&run.callback_secret),
                items_callback(json!({"status": "success"})),
            )
            .await
            .unwrap();
    }

    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    let output = done.output.unwrap();
    assert_eq!(output["received"], json!(5));
    assert_eq!(output["expected"], json!(5));
}

#[tokio::test]
async fn conflicting_expected_count_warns_and_keeps_known() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "stream", streaming_workflow()).await;
    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();

    engine
        .handle_callback(
            &run.id,
            "fan",
            Some(&run.callback_secret),
            CallbackRequest::from_parts(Value::Null, Some(5), None, None),
        )
        .await
        .unwrap();
    let ack = engine
        .handle_callback(
            &run.id,
            "fan",
            Some(&run.callback_secret),
            CallbackRequest::from_parts(Value::Null, Some(9), None, None),
        )
        .await
        .unwrap();
    assert_eq!(ack.expected_count, Some(5));
    assert_eq!(ack.warnings.len(), 1);
    assert!(ack.warnings[0].contains("conflicts"));
}

// ---------------------------------------------------------------------------
// Join timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timer_reevaluation_fires_partial_continuation() {
    let (engine, store, _bus) = engine();
    let mut steps = fan_join_workflow(100.0);
    if let StepConfig::Join {
        max_wait_ms,
        fail_on_timeout,
        ..
    } = &mut steps[2].config
    {
        *max_wait_ms = Some(50);
        *fail_on_timeout = false;
    }
    let wf = save_workflow(&store, "fanout", steps).await;
    let run = engine
        .start_run(&wf.id, json!({"items": ["a", "b", "c"]}))
        .await
        .unwrap();

    use weft_core::repository::run::RunStore;
    let units = store.list_units_for_step(&run.id, "fan").await.unwrap();
    report_unit(&engine, &run, "fan", units[0].id, true).await;

    tokio::time::sleep(Duration::from_millis(70)).await;
    let fired = engine.reevaluate_join(&run.id, "merge").await.unwrap();
    assert!(fired, "timer re-evaluation fired the join");

    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    let output = done.output.unwrap();
    assert_eq!(output["partial"], json!(true));
    assert_eq!(output["timed_out"], json!(true));
    assert_eq!(output["processed"], json!(1));

    // A second re-evaluation finds the join already fired.
    assert!(!engine.reevaluate_join(&run.id, "merge").await.unwrap());
}

#[tokio::test]
async fn timer_reevaluation_fails_on_timeout_when_configured() {
    let (engine, store, _bus) = engine();
    let mut steps = fan_join_workflow(100.0);
    if let StepConfig::Join { max_wait_ms, .. } = &mut steps[2].config {
        *max_wait_ms = Some(50);
    }
    let wf = save_workflow(&store, "fanout", steps).await;
    let run = engine
        .start_run(&wf.id, json!({"items": ["a", "b"]}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(engine.reevaluate_join(&run.id, "merge").await.unwrap());

    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("timed out"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_stops_the_run_and_late_callbacks_are_no_ops() {
    let (engine, store, _bus) = engine();
    let wf = save_workflow(&store, "triage", linked(vec![trigger("start"), manual("review")])).await;
    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();

    let cancelled = engine.cancel_run(&run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    // Cancelling again is a no-op.
    let again = engine.cancel_run(&run.id).await.unwrap();
    assert_eq!(again.status, RunStatus::Cancelled);

    let ack = engine
        .handle_callback(
            &run.id,
            "review",
            Some(&run.callback_secret),
            items_callback(json!({"status": "success"})),
        )
        .await
        .unwrap();
    assert!(ack.no_op);
    assert_eq!(
        engine.run_status(&run.id).await.unwrap().status,
        RunStatus::Cancelled
    );
}

// ---------------------------------------------------------------------------
// Outbound steps
// ---------------------------------------------------------------------------

fn external_step(id: &str, url: &str, body: &str) -> StepDefinition {
    let mut step = StepDefinition::new(id, id, StepType::External);
    step.config = StepConfig::External {
        url: url.to_string(),
        method: "POST".to_string(),
        headers: None,
        body: Some(body.to_string()),
        extra: HashMap::new(),
    };
    step
}

#[tokio::test]
async fn external_step_dispatches_and_awaits_callback() {
    let outbound = RecordingOutbound::ok();
    let (engine, store, _bus) = engine_with(outbound.clone());
    let wf = save_workflow(
        &store,
        "enrich",
        linked(vec![
            trigger("start"),
            external_step(
                "crm",
                "https://crm.example.com/enrich",
                r#"{"ticket": {{ input.ticket }}}"#,
            ),
        ]),
    )
    .await;

    let run = engine.start_run(&wf.id, json!({"ticket": 42})).await.unwrap();
    assert_eq!(run.current_step_ids, vec!["crm"]);

    // The dispatch task records the interpolated request.
    for _ in 0..100 {
        if !outbound.recorded().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let recorded = outbound.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].url, "https://crm.example.com/enrich");
    assert_eq!(recorded[0].body.as_deref(), Some(r#"{"ticket": 42}"#));

    // The transport ack does not complete the step; the callback does.
    assert_eq!(
        engine.run_status(&run.id).await.unwrap().status,
        RunStatus::Running
    );
    engine
        .handle_callback(
            &run.id,
            "crm",
            Some(&run.callback_secret),
            items_callback(json!({"status": "success", "output": {"enriched": true}})),
        )
        .await
        .unwrap();
    let done = engine.run_status(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.output, Some(json!({"enriched": true})));
}

#[tokio::test]
async fn external_dispatch_failure_fails_the_run() {
    let (engine, store, _bus) = engine_with(RecordingOutbound::failing());
    let wf = save_workflow(
        &store,
        "enrich",
        linked(vec![
            trigger("start"),
            external_step("crm", "https://crm.example.com/enrich", "{}"),
        ]),
    )
    .await;

    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();
    let failed = wait_for_status(&engine, &run.id, RunStatus::Failed).await;
    assert!(failed.error.as_deref().unwrap().contains("502"));
}

#[tokio::test]
async fn fire_and_forget_webhook_does_not_block() {
    let outbound = RecordingOutbound::ok();
    let (engine, store, _bus) = engine_with(outbound.clone());
    let mut hook = StepDefinition::new("notify", "notify", StepType::Webhook);
    hook.config = StepConfig::Webhook {
        url: "https://hooks.example.com/notify".to_string(),
        method: "POST".to_string(),
        headers: None,
        body: None,
        await_callback: false,
        extra: HashMap::new(),
    };
    let wf = save_workflow(
        &store,
        "notify",
        linked(vec![trigger("start"), hook, manual("review")]),
    )
    .await;

    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();
    // The webhook completed on dispatch; the run moved on to the manual step.
    assert_eq!(run.current_step_ids, vec!["review"]);
    assert!(run.completed_step_ids.contains(&"notify".to_string()));

    for _ in 0..100 {
        if !outbound.recorded().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(outbound.recorded().len(), 1);
}

// ---------------------------------------------------------------------------
// Sub-runs (flow steps)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flow_step_runs_a_sub_workflow_and_resumes_the_parent() {
    let (engine, store, _bus) = engine();
    save_workflow(&store, "child", vec![trigger("start")]).await;

    let mut flow = StepDefinition::new("delegate", "delegate", StepType::Flow);
    flow.config = StepConfig::Flow {
        workflow: "child".to_string(),
        input: Some(json!({"from": "parent"})),
        extra: HashMap::new(),
    };
    let wf = save_workflow(&store, "parent", linked(vec![trigger("start"), flow])).await;

    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();
    let done = wait_for_status(&engine, &run.id, RunStatus::Completed).await;
    assert!(done.completed_step_ids.contains(&"delegate".to_string()));
    // The child's output (its input, passed through the trigger) resumed us.
    assert_eq!(done.output, Some(json!({"from": "parent"})));
}

#[tokio::test]
async fn flow_step_with_unknown_target_fails_the_run() {
    let (engine, store, _bus) = engine();
    let mut flow = StepDefinition::new("delegate", "delegate", StepType::Flow);
    flow.config = StepConfig::Flow {
        workflow: "missing".to_string(),
        input: None,
        extra: HashMap::new(),
    };
    let wf = save_workflow(&store, "parent", linked(vec![trigger("start"), flow])).await;

    let run = engine.start_run(&wf.id, json!(null)).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("missing"));
}

// ---------------------------------------------------------------------------
// Batch jobs
// ---------------------------------------------------------------------------

fn job_manager(store: &MemoryRunStore) -> BatchJobManager<MemoryRunStore> {
    BatchJobManager::new(store.clone(), EventBus::new(64))
}

#[tokio::test]
async fn batch_job_settles_at_expected_count() {
    let store = MemoryRunStore::new();
    let manager = job_manager(&store);
    let job = manager
        .create_job(BatchJobConfig {
            name: "bulk-enrich".to_string(),
            expected_count: Some(3),
            min_success_percent: Some(60.0),
            max_wait_ms: None,
            fail_on_timeout: true,
            requires_manual_review: false,
        })
        .await
        .unwrap();

    for status in ["success", "success", "failed"] {
        manager
            .handle_callback(
                &job.id,
                Some(&job.callback_secret),
                items_callback(json!({"status": status})),
            )
            .await
            .unwrap();
    }

    let settled = manager.get_job(&job.id).await.unwrap();
    assert_eq!(settled.status, BatchJobStatus::Completed);
    let result = settled.result.unwrap();
    assert_eq!(result["processed"], json!(2));
    assert_eq!(result["failed"], json!(1));
}

#[tokio::test]
async fn batch_job_threshold_miss_flags_manual_review() {
    let store = MemoryRunStore::new();
    let manager = job_manager(&store);
    let job = manager
        .create_job(BatchJobConfig {
            name: "bulk".to_string(),
            expected_count: Some(2),
            min_success_percent: None, // default 100
            max_wait_ms: None,
            fail_on_timeout: true,
            requires_manual_review: true,
        })
        .await
        .unwrap();

    manager
        .handle_callback(
            &job.id,
            Some(&job.callback_secret),
            items_callback(json!({"items": [{"status": "success"}, {"status": "failed"}]})),
        )
        .await
        .unwrap();

    let settled = manager.get_job(&job.id).await.unwrap();
    assert_eq!(settled.status, BatchJobStatus::ManualReview);
}

#[tokio::test]
async fn batch_job_explicit_completion_closes_stream() {
    let store = MemoryRunStore::new();
    let manager = job_manager(&store);
    let job = manager
        .create_job(BatchJobConfig {
            name: "stream".to_string(),
            expected_count: None,
            min_success_percent: None,
            max_wait_ms: None,
            fail_on_timeout: true,
            requires_manual_review: false,
        })
        .await
        .unwrap();

    for _ in 0..5 {
        manager
            .handle_callback(
                &job.id,
                Some(&job.callback_secret),
                items_callback(json!({"status": "success"})),
            )
            .await
            .unwrap();
    }
    assert_eq!(
        manager.get_job(&job.id).await.unwrap().status,
        BatchJobStatus::Accumulating
    );

    let ack = manager
        .handle_callback(
            &job.id,
            Some(&job.callback_secret),
            CallbackRequest::from_parts(Value::Null, None, Some(true), None),
        )
        .await
        .unwrap();
    assert!(ack.complete);
    assert_eq!(ack.received_count, 5);

    let settled = manager.get_job(&job.id).await.unwrap();
    assert_eq!(settled.status, BatchJobStatus::Completed);
}

#[tokio::test]
async fn batch_job_timeout_reevaluation() {
    let store = MemoryRunStore::new();
    let manager = job_manager(&store);
    let job = manager
        .create_job(BatchJobConfig {
            name: "slow".to_string(),
            expected_count: Some(10),
            min_success_percent: None,
            max_wait_ms: Some(30),
            fail_on_timeout: false,
            requires_manual_review: false,
        })
        .await
        .unwrap();

    manager
        .handle_callback(
            &job.id,
            Some(&job.callback_secret),
            items_callback(json!({"status": "success"})),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.reevaluate(&job.id).await.unwrap());
    let settled = manager.get_job(&job.id).await.unwrap();
    assert_eq!(settled.status, BatchJobStatus::Completed);
    assert_eq!(settled.result.unwrap()["partial"], json!(true));

    // Already settled: further re-evaluation and callbacks are no-ops.
    assert!(!manager.reevaluate(&job.id).await.unwrap());
    let ack = manager
        .handle_callback(
            &job.id,
            Some(&job.callback_secret),
            items_callback(json!({"status": "success"})),
        )
        .await
        .unwrap();
    assert!(ack.no_op);
}

#[tokio::test]
async fn batch_job_wrong_secret_rejected() {
    let store = MemoryRunStore::new();
    let manager = job_manager(&store);
    let job = manager
        .create_job(BatchJobConfig {
            name: "bulk".to_string(),
            expected_count: None,
            min_success_percent: None,
            max_wait_ms: None,
            fail_on_timeout: true,
            requires_manual_review: false,
        })
        .await
        .unwrap();

    let err = manager
        .handle_callback(&job.id, Some("nope"), items_callback(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        weft_core::engine::BatchJobError::Unauthorized
    ));
}

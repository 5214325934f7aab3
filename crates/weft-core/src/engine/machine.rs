//! Run state machine.
//!
//! The sole authority over a run's `status`, `current_step_ids` and
//! `completed_step_ids`. Consumes events from the fan-out coordinator, the
//! callback ingestion protocol, and the fan-in aggregator, and drives step
//! transitions (including decision routing).
//!
//! # Concurrency discipline
//!
//! Many external callers report into the same run concurrently. Every public
//! entry point serializes on a per-run async mutex, loads fresh state, and
//! persists before releasing -- so run transitions are linearized per run
//! while different runs proceed fully in parallel. Counter mutation is
//! delegated to the store's atomic increments, and join firing goes through
//! the store's compare-and-set: the first caller to satisfy a boundary wins,
//! concurrent losers observe `fired == true` and no-op.
//!
//! Cancellation is cooperative: a cancelled run stops advancing and in-flight
//! outbound calls are abandoned via a per-run cancellation token, but
//! already-dispatched execution units are not recalled -- late results for a
//! terminal run are acknowledged as no-ops.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::batch::{BatchDelta, BatchKey, BatchState};
use weft_types::error::RepositoryError;
use weft_types::event::RunEvent;
use weft_types::run::{ExecutionUnit, Run, RunStatus, UnitStatus};
use weft_types::step::{StepConfig, StepDefinition, StepType};
use weft_types::workflow::Workflow;

use crate::event::EventBus;
use crate::expression::{ConditionEvaluator, ExpressionError};
use crate::outbound::{OutboundError, OutboundExecutor, OutboundRequest, OutboundResponse};
use crate::repository::run::{ExpectedOutcome, RunStore};

use super::fanout::{FanOutError, plan_fan_out};
use super::ingest::{CallbackAck, CallbackRequest, normalize_items, secret_matches};
use super::join::{BoundaryDecision, JoinBoundary, build_aggregate, evaluate_boundary};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by the run state machine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found")]
    WorkflowNotFound,

    #[error("workflow '{0}' is inactive and cannot be started")]
    WorkflowInactive(String),

    #[error("run not found")]
    RunNotFound,

    #[error("step '{0}' not found in workflow")]
    UnknownStep(String),

    #[error("flow step references unknown workflow '{0}'")]
    FlowTargetNotFound(String),

    #[error("callback authentication failed")]
    Unauthorized,

    #[error("decision step '{0}' matched no connection and has no default")]
    Routing(String),

    #[error(transparent)]
    FanOut(#[from] FanOutError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("store error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Unit of progress inside `advance`. Activation may complete immediately
/// (trigger, decision, foreach, fire-and-forget webhook), queueing a
/// completion, which in turn queues downstream activations.
#[derive(Debug)]
enum WorkItem {
    Activate { step_id: String, prev: Value },
    Complete { step_id: String, output: Value },
}

/// What activating a step produced.
enum Activation {
    /// The step finished synchronously with this output.
    Done(Value),
    /// The step now waits for an external signal.
    Waiting,
}

// ---------------------------------------------------------------------------
// RunEngine
// ---------------------------------------------------------------------------

/// The orchestration engine: one instance drives every run.
pub struct RunEngine<S, O> {
    store: Arc<S>,
    outbound: Arc<O>,
    bus: EventBus,
    evaluator: Arc<ConditionEvaluator>,
    /// Per-run serialization locks.
    run_locks: Arc<DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// Cancellation tokens for abandoning in-flight outbound calls.
    cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<S, O> Clone for RunEngine<S, O> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            outbound: Arc::clone(&self.outbound),
            bus: self.bus.clone(),
            evaluator: Arc::clone(&self.evaluator),
            run_locks: Arc::clone(&self.run_locks),
            cancel_tokens: Arc::clone(&self.cancel_tokens),
        }
    }
}

impl<S, O> RunEngine<S, O>
where
    S: RunStore + 'static,
    O: OutboundExecutor + 'static,
{
    pub fn new(store: S, outbound: O, bus: EventBus) -> Self {
        Self {
            store: Arc::new(store),
            outbound: Arc::new(outbound),
            bus,
            evaluator: Arc::new(ConditionEvaluator::new()),
            run_locks: Arc::new(DashMap::new()),
            cancel_tokens: Arc::new(DashMap::new()),
        }
    }

    /// The store this engine persists through.
    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Start a run of a workflow. The run is created `pending`, transitions
    /// to `running` as its entry steps activate, and may already be terminal
    /// by the time this returns if every step completed synchronously.
    pub async fn start_run(&self, workflow_id: &Uuid, input: Value) -> Result<Run, EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound)?;
        self.start_run_for(workflow, input, None, Uuid::now_v7())
            .await
    }

    /// Fetch the current state of a run.
    pub async fn run_status(&self, run_id: &Uuid) -> Result<Run, EngineError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound)
    }

    /// Cancel a run. Any non-terminal run moves to `cancelled` immediately,
    /// regardless of in-flight step state; cancelling a terminal run is a
    /// no-op returning the run as-is.
    pub async fn cancel_run(&self, run_id: &Uuid) -> Result<Run, EngineError> {
        let _guard = self.lock_run(*run_id).await;
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound)?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        run.status = RunStatus::Cancelled;
        run.completed_at = Some(Utc::now());
        self.store.update_run(&run).await?;
        self.bus.publish(RunEvent::RunCancelled { run_id: run.id });
        tracing::info!(run_id = %run.id, "run cancelled");

        if let Some((_, token)) = self.cancel_tokens.remove(&run.id) {
            token.cancel();
        }
        self.propagate_to_parent(&run).await?;
        Ok(run)
    }

    // Returns a boxed, type-erased future to break the mutual-recursion cycle
    // `start_run_for -> advance -> activate -> (spawn) start_run_for`; without
    // the erasure rustc cannot prove the spawned future `Send` (same technique
    // as `propagate_to_parent`).
    fn start_run_for<'a>(
        &'a self,
        workflow: Workflow,
        input: Value,
        parent: Option<(Uuid, String)>,
        run_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Run, EngineError>> + Send + 'a>> {
        Box::pin(async move {
        if !workflow.is_active {
            return Err(EngineError::WorkflowInactive(workflow.name.clone()));
        }

        let _guard = self.lock_run(run_id).await;
        let now = Utc::now();
        let (parent_run_id, parent_step_id) = match parent {
            Some((r, s)) => (Some(r), Some(s)),
            None => (None, None),
        };
        let mut run = Run {
            id: run_id,
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            status: RunStatus::Pending,
            current_step_ids: Vec::new(),
            completed_step_ids: Vec::new(),
            failed_step_id: None,
            error: None,
            input,
            step_outputs: Default::default(),
            output: None,
            callback_secret: format!("wr_{}", Uuid::new_v4().simple()),
            parent_run_id,
            parent_step_id,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.store.create_run(&run).await?;
        self.token_for(run.id);

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.bus.publish(RunEvent::RunStarted {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
        });
        tracing::info!(
            run_id = %run.id,
            workflow = workflow.name.as_str(),
            "starting run"
        );

        let seeds = workflow
            .entry_step_ids()
            .into_iter()
            .map(|step_id| WorkItem::Activate {
                step_id,
                prev: run.input.clone(),
            })
            .collect();
        self.advance(&workflow, &mut run, seeds).await?;
        Ok(run)
        })
    }

    // -----------------------------------------------------------------------
    // Callback ingestion
    // -----------------------------------------------------------------------

    /// Ingest an authenticated callback for a run+step.
    ///
    /// When `presented_secret` is `Some`, it is compared against the run's
    /// callback secret in constant time before any state is touched; pass
    /// `None` only when the transport layer already verified a body
    /// signature derived from the same secret.
    pub async fn handle_callback(
        &self,
        run_id: &Uuid,
        step_id: &str,
        presented_secret: Option<&str>,
        request: CallbackRequest,
    ) -> Result<CallbackAck, EngineError> {
        let _guard = self.lock_run(*run_id).await;
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound)?;
        if let Some(presented) = presented_secret {
            if !secret_matches(&run.callback_secret, presented) {
                return Err(EngineError::Unauthorized);
            }
        }
        let workflow = self
            .store
            .get_workflow(&run.workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound)?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::UnknownStep(step_id.to_string()))?
            .clone();
        let key = BatchKey::new(*run_id, step_id);

        // Late delivery: a terminal run, or a settled step that is not a
        // fan-out target, acknowledges without effect.
        let step_done = run.completed_step_ids.iter().any(|s| s == step_id);
        if run.status.is_terminal() || (step_done && step.step_type != StepType::Foreach) {
            let state = self.store.get_batch(&key).await?;
            return Ok(ack_from(state.as_ref(), true, false, Vec::new(), Vec::new()));
        }

        // Idempotency: a repeated delivery key changes nothing.
        if let Some(idem) = &request.idempotency_key {
            if !self.store.register_ingest_key(&key, idem).await? {
                tracing::debug!(batch = %key, idempotency_key = idem.as_str(), "duplicate delivery");
                let state = self.store.get_batch(&key).await?;
                return Ok(ack_from(state.as_ref(), false, true, Vec::new(), Vec::new()));
            }
        }

        let mut warnings = Vec::new();

        // Out-of-band expected count: set if unknown, otherwise the stored
        // value wins and the mismatch is a warning, never a hard failure.
        if let Some(expected) = request.expected_count {
            if let ExpectedOutcome::AlreadyKnown(known) =
                self.store.declare_expected(&key, expected).await?
            {
                if known != expected {
                    tracing::warn!(
                        batch = %key,
                        declared = expected,
                        known,
                        "conflicting expected count; keeping known value"
                    );
                    warnings.push(format!(
                        "expected count {expected} conflicts with previously declared {known}; keeping {known}"
                    ));
                }
            }
        }

        let items = normalize_items(&request.payload);
        let mut created_unit_ids = Vec::new();
        let mut delta = BatchDelta::default();
        let mut own_outcome: Option<(bool, Value, Option<String>)> = None;

        for item in items {
            let success = item.status.is_success();
            if let Some(unit_id) = item.unit_id {
                // Outcome for a previously spawned unit.
                let Some(mut unit) = self.store.get_unit(&unit_id).await? else {
                    warnings.push(format!("unknown unit {unit_id} ignored"));
                    continue;
                };
                if unit.run_id != *run_id || unit.status.is_terminal() {
                    continue;
                }
                settle_unit(&mut unit, success, item.output, item.error);
                self.store.update_unit(&unit).await?;
                delta.apply_item(success);
            } else if step.step_type == StepType::Foreach {
                // Streamed item: the result arrives together with the work.
                let mut unit =
                    ExecutionUnit::new(*run_id, step_id, StepType::Foreach, Value::Null);
                if let StepConfig::Foreach { item_var, .. } = &step.config {
                    unit.item_var = Some(item_var.clone());
                }
                settle_unit(&mut unit, success, item.output, item.error);
                self.store.create_unit(&unit).await?;
                created_unit_ids.push(unit.id);
                delta.apply_item(success);
            } else {
                // Outcome for the step's own unit of work.
                delta.apply_item(success);
                if own_outcome.is_none() {
                    own_outcome = Some((success, item.output, item.error));
                }
            }
        }

        let mut state = if delta.is_empty() {
            self.store.get_batch(&key).await?
        } else {
            Some(self.store.apply_batch_delta(&key, delta).await?)
        };
        if request.complete {
            state = Some(self.store.mark_batch_complete(&key).await?);
        }
        if let Some(s) = &state {
            self.bus.publish(RunEvent::BatchProgress {
                run_id: run.id,
                step_id: step_id.to_string(),
                received: s.counters.received_count,
                processed: s.counters.processed_count,
                failed: s.counters.failed_count,
                expected: s.counters.expected_count,
            });
        }

        match own_outcome {
            Some((success, output, error)) if step_awaits_callback(&step) && !step_done => {
                if let Some(mut unit) = self
                    .store
                    .list_units_for_step(run_id, step_id)
                    .await?
                    .into_iter()
                    .find(|u| !u.status.is_terminal())
                {
                    settle_unit(&mut unit, success, output.clone(), error.clone());
                    self.store.update_unit(&unit).await?;
                }
                if success {
                    self.advance(
                        &workflow,
                        &mut run,
                        vec![WorkItem::Complete {
                            step_id: step_id.to_string(),
                            output,
                        }],
                    )
                    .await?;
                } else {
                    self.fail_run(
                        &mut run,
                        Some(step_id),
                        error.unwrap_or_else(|| "step reported failure".to_string()),
                    )
                    .await?;
                }
            }
            // Counters moved (or nothing did); give waiting joins a chance.
            _ => self.advance(&workflow, &mut run, Vec::new()).await?,
        }

        let final_state = self.store.get_batch(&key).await?;
        Ok(ack_from(
            final_state.as_ref().or(state.as_ref()),
            false,
            false,
            created_unit_ids,
            warnings,
        ))
    }

    /// Re-evaluate a waiting join, typically from a timer after its
    /// `max_wait_ms`. Returns whether this call fired it.
    pub async fn reevaluate_join(
        &self,
        run_id: &Uuid,
        join_step_id: &str,
    ) -> Result<bool, EngineError> {
        let _guard = self.lock_run(*run_id).await;
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound)?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        let workflow = self
            .store
            .get_workflow(&run.workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound)?;
        if workflow.step(join_step_id).is_none() {
            return Err(EngineError::UnknownStep(join_step_id.to_string()));
        }

        let fire_key = BatchKey::new(*run_id, join_step_id);
        let fired_before = self
            .store
            .get_batch(&fire_key)
            .await?
            .is_some_and(|s| s.fired);
        self.advance(&workflow, &mut run, Vec::new()).await?;
        let fired_after = self
            .store
            .get_batch(&fire_key)
            .await?
            .is_some_and(|s| s.fired);
        Ok(fired_after && !fired_before)
    }

    // -----------------------------------------------------------------------
    // Advancement
    // -----------------------------------------------------------------------

    /// Drain a queue of step activations/completions, then sweep waiting
    /// joins, until the run has no more synchronous progress to make.
    async fn advance(
        &self,
        workflow: &Workflow,
        run: &mut Run,
        seeds: Vec<WorkItem>,
    ) -> Result<(), EngineError> {
        let mut queue: VecDeque<WorkItem> = seeds.into();
        let mut last_output: Option<Value> = None;

        loop {
            while let Some(item) = queue.pop_front() {
                if run.status != RunStatus::Running {
                    break;
                }
                match item {
                    WorkItem::Activate { step_id, prev } => {
                        if run.completed_step_ids.iter().any(|s| s == &step_id)
                            || run.current_step_ids.iter().any(|s| s == &step_id)
                        {
                            continue;
                        }
                        let Some(step) = workflow.step(&step_id) else {
                            self.fail_run(
                                run,
                                None,
                                format!("connection targets unknown step '{step_id}'"),
                            )
                            .await?;
                            break;
                        };
                        let step = step.clone();
                        run.current_step_ids.push(step_id.clone());
                        self.bus.publish(RunEvent::StepStarted {
                            run_id: run.id,
                            step_id: step_id.clone(),
                            step_type: step.step_type.to_string(),
                        });
                        tracing::debug!(
                            run_id = %run.id,
                            step_id = step_id.as_str(),
                            step_type = %step.step_type,
                            "activating step"
                        );
                        match self.activate(run, &step, &prev).await {
                            Ok(Activation::Done(output)) => {
                                queue.push_back(WorkItem::Complete { step_id, output });
                            }
                            Ok(Activation::Waiting) => {}
                            Err(EngineError::Repository(e)) => return Err(e.into()),
                            Err(e) => {
                                self.fail_run(run, Some(&step_id), e.to_string()).await?;
                                break;
                            }
                        }
                    }
                    WorkItem::Complete { step_id, output } => {
                        run.current_step_ids.retain(|s| s != &step_id);
                        if !run.completed_step_ids.iter().any(|s| s == &step_id) {
                            run.completed_step_ids.push(step_id.clone());
                        }
                        run.step_outputs.insert(step_id.clone(), output.clone());
                        self.bus.publish(RunEvent::StepCompleted {
                            run_id: run.id,
                            step_id: step_id.clone(),
                        });
                        let Some(step) = workflow.step(&step_id) else {
                            continue;
                        };
                        match self.route(run, step, &output) {
                            Ok(next_ids) => {
                                for next in next_ids {
                                    queue.push_back(WorkItem::Activate {
                                        step_id: next,
                                        prev: output.clone(),
                                    });
                                }
                            }
                            Err(EngineError::Repository(e)) => return Err(e.into()),
                            Err(e) => {
                                self.fail_run(run, Some(&step_id), e.to_string()).await?;
                                break;
                            }
                        }
                        last_output = Some(output);
                    }
                }
            }

            if run.status != RunStatus::Running {
                break;
            }
            self.sweep_joins(workflow, run, &mut queue).await?;
            if run.status != RunStatus::Running || queue.is_empty() {
                break;
            }
        }

        // No outgoing steps and no pending work: the run completed.
        if run.status == RunStatus::Running && run.current_step_ids.is_empty() {
            run.status = RunStatus::Completed;
            run.completed_at = Some(Utc::now());
            run.output = last_output.or_else(|| Some(run.input.clone()));
            self.bus.publish(RunEvent::RunCompleted {
                run_id: run.id,
                workflow_name: run.workflow_name.clone(),
                output: run.output.clone(),
            });
            tracing::info!(
                run_id = %run.id,
                steps = run.completed_step_ids.len(),
                "run completed"
            );
        }

        self.store.update_run(run).await?;

        if run.status == RunStatus::Completed {
            self.cancel_tokens.remove(&run.id);
            self.propagate_to_parent(run).await?;
        }
        Ok(())
    }

    /// Activate one step. Returns what the run should do next; storage and
    /// fan-out errors are the caller's to turn into a run failure.
    async fn activate(
        &self,
        run: &mut Run,
        step: &StepDefinition,
        prev: &Value,
    ) -> Result<Activation, EngineError> {
        match &step.config {
            StepConfig::Trigger { .. } | StepConfig::Decision { .. } => {
                // Pass-through: triggers emit the run input, decisions emit
                // the previous output (routing happens at completion).
                Ok(Activation::Done(prev.clone()))
            }

            StepConfig::Agent { .. } | StepConfig::Manual { .. } => {
                let mut unit =
                    ExecutionUnit::new(run.id, &step.id, step.step_type, prev.clone());
                unit.status = UnitStatus::Waiting;
                self.store.create_unit(&unit).await?;
                Ok(Activation::Waiting)
            }

            StepConfig::External {
                url,
                method,
                headers,
                body,
                ..
            } => {
                let mut unit =
                    ExecutionUnit::new(run.id, &step.id, step.step_type, prev.clone());
                unit.status = UnitStatus::Waiting;
                self.store.create_unit(&unit).await?;
                let request = OutboundRequest::from_config(
                    url,
                    method,
                    headers.as_ref(),
                    body.as_deref(),
                    &template_context(run, prev),
                );
                self.dispatch(run.id, step.id.clone(), unit.id, request, true);
                Ok(Activation::Waiting)
            }

            StepConfig::Webhook {
                url,
                method,
                headers,
                body,
                await_callback,
                ..
            } => {
                let mut unit =
                    ExecutionUnit::new(run.id, &step.id, step.step_type, prev.clone());
                unit.status = if *await_callback {
                    UnitStatus::Waiting
                } else {
                    UnitStatus::InProgress
                };
                self.store.create_unit(&unit).await?;
                let request = OutboundRequest::from_config(
                    url,
                    method,
                    headers.as_ref(),
                    body.as_deref(),
                    &template_context(run, prev),
                );
                self.dispatch(run.id, step.id.clone(), unit.id, request, *await_callback);
                if *await_callback {
                    Ok(Activation::Waiting)
                } else {
                    Ok(Activation::Done(json!({ "dispatched": true })))
                }
            }

            StepConfig::Foreach { .. } => {
                let plan = plan_fan_out(run.id, step, prev)?;
                let count = plan.units.len() as u32;
                self.store.init_batch(&plan.key, plan.counters).await?;
                for unit in &plan.units {
                    self.store.create_unit(unit).await?;
                }
                self.bus.publish(RunEvent::UnitsSpawned {
                    run_id: run.id,
                    step_id: step.id.clone(),
                    count,
                });
                tracing::debug!(
                    run_id = %run.id,
                    step_id = step.id.as_str(),
                    count,
                    "fan-out spawned units"
                );
                Ok(Activation::Done(json!({ "spawned": count })))
            }

            StepConfig::Join { .. } => {
                // The waiting unit's creation time is the join's wait start.
                let mut unit =
                    ExecutionUnit::new(run.id, &step.id, step.step_type, prev.clone());
                unit.status = UnitStatus::Waiting;
                self.store.create_unit(&unit).await?;
                Ok(Activation::Waiting)
            }

            StepConfig::Flow {
                workflow: target,
                input,
                ..
            } => {
                let sub_workflow = self
                    .resolve_workflow(target)
                    .await?
                    .ok_or_else(|| EngineError::FlowTargetNotFound(target.clone()))?;
                if !sub_workflow.is_active {
                    return Err(EngineError::WorkflowInactive(sub_workflow.name.clone()));
                }
                let sub_input = input.clone().unwrap_or_else(|| prev.clone());
                let sub_run_id = Uuid::now_v7();
                let mut unit =
                    ExecutionUnit::new(run.id, &step.id, step.step_type, sub_input.clone());
                unit.status = UnitStatus::Waiting;
                unit.sub_run_id = Some(sub_run_id);
                self.store.create_unit(&unit).await?;

                // Checkpoint before spawning so the child's completion sees
                // the flow step as current even if it finishes instantly.
                self.store.update_run(run).await?;

                let engine = self.clone();
                let parent = (run.id, step.id.clone());
                let parent_step = step.id.clone();
                let parent_run_id = run.id;
                tokio::spawn(async move {
                    if let Err(e) = engine
                        .start_run_for(sub_workflow, sub_input, Some(parent), sub_run_id)
                        .await
                    {
                        tracing::error!(
                            run_id = %parent_run_id,
                            step_id = parent_step.as_str(),
                            error = %e,
                            "sub-run failed to start"
                        );
                        let _ = engine
                            .fail_step_external(
                                parent_run_id,
                                &parent_step,
                                format!("sub-run failed to start: {e}"),
                            )
                            .await;
                    }
                });
                Ok(Activation::Waiting)
            }
        }
    }

    /// Resolve next step ids for a completed step.
    ///
    /// Decision steps follow the first connection whose condition holds,
    /// falling back to the configured default connection or a conditionless
    /// edge; no match and no default is a routing failure, not a silent
    /// drop. All other steps follow every connection.
    fn route(
        &self,
        run: &Run,
        step: &StepDefinition,
        output: &Value,
    ) -> Result<Vec<String>, EngineError> {
        if step.step_type != StepType::Decision {
            return Ok(step.connections.iter().map(|c| c.to.clone()).collect());
        }

        let context = json!({
            "output": output,
            "input": run.input,
            "steps": run.step_outputs,
        });
        let mut default = match &step.config {
            StepConfig::Decision {
                default_connection, ..
            } => default_connection.clone(),
            _ => None,
        };
        for conn in &step.connections {
            match &conn.condition {
                Some(condition) => {
                    if self.evaluator.evaluate_bool(condition, &context)? {
                        return Ok(vec![conn.to.clone()]);
                    }
                }
                None => {
                    if default.is_none() {
                        default = Some(conn.to.clone());
                    }
                }
            }
        }
        default
            .map(|d| vec![d])
            .ok_or_else(|| EngineError::Routing(step.id.clone()))
    }

    /// Evaluate every waiting join against its boundary, firing winners via
    /// the store's compare-and-set.
    async fn sweep_joins(
        &self,
        workflow: &Workflow,
        run: &mut Run,
        queue: &mut VecDeque<WorkItem>,
    ) -> Result<(), EngineError> {
        let waiting_joins: Vec<StepDefinition> = workflow
            .steps
            .iter()
            .filter(|s| {
                s.step_type == StepType::Join
                    && run.current_step_ids.iter().any(|c| c == &s.id)
            })
            .cloned()
            .collect();

        for join_step in waiting_joins {
            let Some(boundary) = JoinBoundary::from_join_config(&join_step.config) else {
                continue;
            };
            let StepConfig::Join { source_step, .. } = &join_step.config else {
                continue;
            };
            let Some(source) = resolve_source(workflow, source_step) else {
                self.fail_run(
                    run,
                    Some(&join_step.id),
                    format!("join references unknown source step '{source_step}'"),
                )
                .await?;
                return Ok(());
            };

            let counter_key = BatchKey::new(run.id, &source.id);
            let counters = self
                .store
                .get_batch(&counter_key)
                .await?
                .map(|s| s.counters)
                .unwrap_or_default();
            let elapsed_ms = self
                .store
                .list_units_for_step(&run.id, &join_step.id)
                .await?
                .iter()
                .find(|u| !u.status.is_terminal())
                .map(|u| (Utc::now() - u.created_at).num_milliseconds().max(0) as u64);

            let decision = evaluate_boundary(&counters, &boundary, elapsed_ms);
            if decision == BoundaryDecision::Wait {
                continue;
            }

            // First to satisfy wins; losers observe the flag and no-op.
            let fire_key = BatchKey::new(run.id, &join_step.id);
            if !self.store.try_mark_fired(&fire_key).await? {
                continue;
            }

            let units = self.store.list_units_for_step(&run.id, &source.id).await?;
            let aggregate = build_aggregate(&counters, &units, decision);
            self.bus.publish(RunEvent::JoinFired {
                run_id: run.id,
                step_id: join_step.id.clone(),
                success: decision.is_continuation(),
            });
            tracing::info!(
                run_id = %run.id,
                step_id = join_step.id.as_str(),
                ?decision,
                processed = counters.processed_count,
                failed = counters.failed_count,
                "join fired"
            );

            if let Some(mut unit) = self
                .store
                .list_units_for_step(&run.id, &join_step.id)
                .await?
                .into_iter()
                .find(|u| !u.status.is_terminal())
            {
                settle_unit(
                    &mut unit,
                    decision.is_continuation(),
                    aggregate.clone(),
                    None,
                );
                self.store.update_unit(&unit).await?;
            }

            match decision {
                BoundaryDecision::Success | BoundaryDecision::TimeoutPartial => {
                    queue.push_back(WorkItem::Complete {
                        step_id: join_step.id.clone(),
                        output: aggregate,
                    });
                }
                BoundaryDecision::ManualReview => {
                    run.status = RunStatus::Paused;
                    self.bus.publish(RunEvent::JoinManualReview {
                        run_id: run.id,
                        step_id: join_step.id.clone(),
                    });
                    tracing::warn!(
                        run_id = %run.id,
                        step_id = join_step.id.as_str(),
                        "join flagged for manual review"
                    );
                    return Ok(());
                }
                BoundaryDecision::Failure => {
                    self.fail_run(
                        run,
                        Some(&join_step.id),
                        format!(
                            "success threshold missed: {:.1}% < {:.1}%",
                            counters.success_percent(),
                            boundary.min_success_percent
                        ),
                    )
                    .await?;
                    return Ok(());
                }
                BoundaryDecision::TimeoutFailure => {
                    self.fail_run(
                        run,
                        Some(&join_step.id),
                        "join timed out before its boundary was met".to_string(),
                    )
                    .await?;
                    return Ok(());
                }
                BoundaryDecision::Wait => unreachable!("wait filtered above"),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Failure and parent propagation
    // -----------------------------------------------------------------------

    /// Move a run to `failed`, recording the failing step and error. Sibling
    /// in-flight steps are not forcibly aborted.
    async fn fail_run(
        &self,
        run: &mut Run,
        step_id: Option<&str>,
        error: String,
    ) -> Result<(), EngineError> {
        if run.status.is_terminal() {
            return Ok(());
        }
        run.status = RunStatus::Failed;
        run.failed_step_id = step_id.map(String::from);
        run.error = Some(error.clone());
        run.completed_at = Some(Utc::now());
        if let Some(failed) = step_id {
            run.current_step_ids.retain(|s| s != failed);
            self.bus.publish(RunEvent::StepFailed {
                run_id: run.id,
                step_id: failed.to_string(),
                error: error.clone(),
            });
        }
        self.bus.publish(RunEvent::RunFailed {
            run_id: run.id,
            failed_step_id: run.failed_step_id.clone(),
            error: error.clone(),
        });
        tracing::warn!(
            run_id = %run.id,
            failed_step = run.failed_step_id.as_deref().unwrap_or("-"),
            error = error.as_str(),
            "run failed"
        );
        self.store.update_run(run).await?;
        self.cancel_tokens.remove(&run.id);
        self.propagate_to_parent(run).await?;
        Ok(())
    }

    /// Fail a waiting step from outside an `advance` pass (e.g. a dispatch
    /// task reporting an unreachable target).
    async fn fail_step_external(
        &self,
        run_id: Uuid,
        step_id: &str,
        error: String,
    ) -> Result<(), EngineError> {
        let _guard = self.lock_run(run_id).await;
        let Some(mut run) = self.store.get_run(&run_id).await? else {
            return Ok(());
        };
        if run.status.is_terminal() {
            return Ok(());
        }
        self.fail_run(&mut run, Some(step_id), error).await
    }

    /// Resume (or fail) the parent of a terminal sub-run.
    fn propagate_to_parent<'a>(
        &'a self,
        child: &'a Run,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let (Some(parent_run_id), Some(parent_step_id)) =
                (child.parent_run_id, child.parent_step_id.clone())
            else {
                return Ok(());
            };

            let _guard = self.lock_run(parent_run_id).await;
            let Some(mut parent) = self.store.get_run(&parent_run_id).await? else {
                return Ok(());
            };
            if parent.status.is_terminal()
                || !parent.current_step_ids.iter().any(|s| s == &parent_step_id)
            {
                return Ok(());
            }
            let Some(workflow) = self.store.get_workflow(&parent.workflow_id).await? else {
                return Ok(());
            };

            // Settle the flow unit tracking this sub-run.
            if let Some(mut unit) = self
                .store
                .list_units_for_step(&parent_run_id, &parent_step_id)
                .await?
                .into_iter()
                .find(|u| u.sub_run_id == Some(child.id) && !u.status.is_terminal())
            {
                settle_unit(
                    &mut unit,
                    child.status == RunStatus::Completed,
                    child.output.clone().unwrap_or(Value::Null),
                    child.error.clone(),
                );
                self.store.update_unit(&unit).await?;
            }

            match child.status {
                RunStatus::Completed => {
                    let output = child.output.clone().unwrap_or(Value::Null);
                    self.advance(
                        &workflow,
                        &mut parent,
                        vec![WorkItem::Complete {
                            step_id: parent_step_id,
                            output,
                        }],
                    )
                    .await
                }
                RunStatus::Failed => {
                    let reason = child
                        .error
                        .clone()
                        .unwrap_or_else(|| "sub-run failed".to_string());
                    self.fail_run(
                        &mut parent,
                        Some(&parent_step_id),
                        format!("sub-run failed: {reason}"),
                    )
                    .await
                }
                RunStatus::Cancelled => {
                    self.fail_run(
                        &mut parent,
                        Some(&parent_step_id),
                        "sub-run was cancelled".to_string(),
                    )
                    .await
                }
                _ => Ok(()),
            }
        })
    }

    // -----------------------------------------------------------------------
    // Outbound dispatch
    // -----------------------------------------------------------------------

    /// Perform an outbound call off the advancing task. The call is
    /// abandoned if the run's cancellation token fires first.
    fn dispatch(
        &self,
        run_id: Uuid,
        step_id: String,
        unit_id: Uuid,
        request: OutboundRequest,
        awaits: bool,
    ) {
        let engine = self.clone();
        let token = self.token_for(run_id);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(run_id = %run_id, step_id = step_id.as_str(), "outbound call abandoned, run cancelled");
                    return;
                }
                r = engine.outbound.execute(request) => r,
            };
            if let Err(e) = engine
                .handle_outbound_result(run_id, &step_id, unit_id, awaits, result)
                .await
            {
                tracing::error!(
                    run_id = %run_id,
                    step_id = step_id.as_str(),
                    error = %e,
                    "failed to record outbound result"
                );
            }
        });
    }

    async fn handle_outbound_result(
        &self,
        run_id: Uuid,
        step_id: &str,
        unit_id: Uuid,
        awaits: bool,
        result: Result<OutboundResponse, OutboundError>,
    ) -> Result<(), EngineError> {
        let _guard = self.lock_run(run_id).await;
        let Some(mut run) = self.store.get_run(&run_id).await? else {
            return Ok(());
        };
        // Late result for a terminal run is ignored (cooperative
        // cancellation).
        if run.status.is_terminal() {
            return Ok(());
        }
        let Some(mut unit) = self.store.get_unit(&unit_id).await? else {
            return Ok(());
        };

        match result {
            Ok(response) if response.is_success() => {
                if !awaits {
                    // Fire-and-forget delivery confirmed.
                    settle_unit(&mut unit, true, json!({ "status": response.status }), None);
                    self.store.update_unit(&unit).await?;
                }
                // Awaited steps keep waiting for the actual callback.
                Ok(())
            }
            Ok(response) => {
                let error = format!("target responded with status {}", response.status);
                self.record_outbound_failure(&mut run, unit, step_id, awaits, error)
                    .await
            }
            Err(e) => {
                self.record_outbound_failure(&mut run, unit, step_id, awaits, e.to_string())
                    .await
            }
        }
    }

    async fn record_outbound_failure(
        &self,
        run: &mut Run,
        mut unit: ExecutionUnit,
        step_id: &str,
        awaits: bool,
        error: String,
    ) -> Result<(), EngineError> {
        settle_unit(&mut unit, false, Value::Null, Some(error.clone()));
        self.store.update_unit(&unit).await?;
        if awaits {
            // The awaited callback can never arrive; the step is
            // unrecoverable.
            self.fail_run(run, Some(step_id), format!("outbound call failed: {error}"))
                .await
        } else {
            tracing::warn!(
                run_id = %run.id,
                step_id,
                error = error.as_str(),
                "fire-and-forget delivery failed"
            );
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn resolve_workflow(&self, target: &str) -> Result<Option<Workflow>, EngineError> {
        if let Some(found) = self.store.get_workflow_by_name(target).await? {
            return Ok(Some(found));
        }
        if let Ok(id) = Uuid::parse_str(target) {
            return Ok(self.store.get_workflow(&id).await?);
        }
        Ok(None)
    }

    async fn lock_run(&self, run_id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self
            .run_locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    fn token_for(&self, run_id: Uuid) -> CancellationToken {
        self.cancel_tokens.entry(run_id).or_default().clone()
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Whether a step's completion arrives via the callback endpoint.
fn step_awaits_callback(step: &StepDefinition) -> bool {
    match &step.config {
        StepConfig::Webhook { await_callback, .. } => *await_callback,
        _ => step.step_type.awaits_callback(),
    }
}

/// A join's source reference: an exact step id, or a trailing-`*` pattern
/// resolved to the first matching step in graph order.
fn resolve_source<'a>(workflow: &'a Workflow, reference: &str) -> Option<&'a StepDefinition> {
    if let Some(step) = workflow.step(reference) {
        return Some(step);
    }
    let prefix = reference.strip_suffix('*')?;
    workflow.steps.iter().find(|s| s.id.starts_with(prefix))
}

fn settle_unit(unit: &mut ExecutionUnit, success: bool, output: Value, error: Option<String>) {
    unit.status = if success {
        UnitStatus::Completed
    } else {
        UnitStatus::Failed
    };
    unit.output = Some(output);
    unit.error = error;
    unit.completed_at = Some(Utc::now());
}

fn template_context(run: &Run, prev: &Value) -> Value {
    json!({
        "steps": run.step_outputs,
        "input": run.input,
        "output": prev,
    })
}

fn ack_from(
    state: Option<&BatchState>,
    no_op: bool,
    duplicate: bool,
    created_unit_ids: Vec<Uuid>,
    warnings: Vec<String>,
) -> CallbackAck {
    let counters = state.map(|s| s.counters).unwrap_or_default();
    CallbackAck {
        received_count: counters.received_count,
        expected_count: counters.expected_count,
        processed_count: counters.processed_count,
        failed_count: counters.failed_count,
        complete: counters.is_complete || counters.count_satisfied(),
        duplicate,
        no_op,
        created_unit_ids,
        warnings,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::batch::BatchCounters;

    #[test]
    fn engine_error_display() {
        let err = EngineError::Routing("route-ticket".to_string());
        assert!(err.to_string().contains("route-ticket"));
        assert!(err.to_string().contains("no default"));

        let err = EngineError::WorkflowInactive("digest".to_string());
        assert!(err.to_string().contains("digest"));
        assert!(err.to_string().contains("inactive"));
    }

    #[test]
    fn resolve_source_exact_and_pattern() {
        let mut workflow = Workflow::new("wf");
        workflow
            .steps
            .push(StepDefinition::new("fan-users", "Fan", StepType::Foreach));
        workflow
            .steps
            .push(StepDefinition::new("other", "Other", StepType::Agent));

        assert_eq!(resolve_source(&workflow, "fan-users").unwrap().id, "fan-users");
        assert_eq!(resolve_source(&workflow, "fan-*").unwrap().id, "fan-users");
        assert!(resolve_source(&workflow, "missing").is_none());
        assert!(resolve_source(&workflow, "zzz-*").is_none());
    }

    #[test]
    fn webhook_awaits_only_when_configured() {
        let mut hook = StepDefinition::new("w", "Notify", StepType::Webhook);
        assert!(!step_awaits_callback(&hook));
        hook.config = StepConfig::Webhook {
            url: String::new(),
            method: "POST".to_string(),
            headers: None,
            body: None,
            await_callback: true,
            extra: Default::default(),
        };
        assert!(step_awaits_callback(&hook));

        let agent = StepDefinition::new("a", "A", StepType::Agent);
        assert!(step_awaits_callback(&agent));
        let fan = StepDefinition::new("f", "F", StepType::Foreach);
        assert!(!step_awaits_callback(&fan));
    }

    #[test]
    fn ack_reports_completion_by_count_or_signal() {
        let key = BatchKey::new(Uuid::now_v7(), "fan");
        let mut state = BatchState::new(key, BatchCounters::static_spawn(2, 100.0));
        let a = ack_from(Some(&state), false, false, Vec::new(), Vec::new());
        assert!(!a.complete);

        state.counters.apply(BatchDelta::item(true));
        state.counters.apply(BatchDelta::item(true));
        let a = ack_from(Some(&state), false, false, Vec::new(), Vec::new());
        assert!(a.complete);
        assert_eq!(a.received_count, 2);

        let key = BatchKey::new(Uuid::now_v7(), "stream");
        let mut state = BatchState::new(key, BatchCounters::default());
        state.counters.is_complete = true;
        let a = ack_from(Some(&state), false, false, Vec::new(), Vec::new());
        assert!(a.complete);
    }

    #[test]
    fn ack_without_batch_state_is_zeroed() {
        let a = ack_from(None, true, false, Vec::new(), Vec::new());
        assert_eq!(a.received_count, 0);
        assert!(a.no_op);
        assert!(!a.complete);
    }
}


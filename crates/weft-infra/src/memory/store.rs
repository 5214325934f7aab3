//! DashMap-backed `RunStore` implementation.
//!
//! The store the engine's concurrency model assumes: counter mutation happens
//! under the entry's shard lock (an atomic read-modify-write, never exposed
//! as separate read and write), and the "fired" flag is a compare-and-set
//! that returns `true` to exactly one caller per key. Cloning the store
//! clones handles to the same underlying maps, like a database pool.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;
use weft_types::batch::{BatchCounters, BatchDelta, BatchJob, BatchKey, BatchState};
use weft_types::error::RepositoryError;
use weft_types::run::{ExecutionUnit, Run};
use weft_types::workflow::Workflow;

use weft_core::repository::run::{ExpectedOutcome, RunStore};

/// Per-batch entry: counter state plus the idempotency keys already seen.
#[derive(Debug)]
struct BatchEntry {
    state: BatchState,
    seen_keys: HashSet<String>,
}

impl BatchEntry {
    fn new(state: BatchState) -> Self {
        Self {
            state,
            seen_keys: HashSet::new(),
        }
    }
}

/// In-memory store for workflows, runs, units, batches, and batch jobs.
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    workflows: Arc<DashMap<Uuid, Workflow>>,
    runs: Arc<DashMap<Uuid, Run>>,
    units: Arc<DashMap<Uuid, ExecutionUnit>>,
    /// Unit ids per (run, step), in creation order.
    unit_order: Arc<DashMap<(Uuid, String), Vec<Uuid>>>,
    batches: Arc<DashMap<BatchKey, BatchEntry>>,
    jobs: Arc<DashMap<Uuid, BatchJob>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.workflows.get(id).map(|w| w.value().clone()))
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self
            .workflows
            .iter()
            .find(|w| w.value().name == name)
            .map(|w| w.value().clone()))
    }

    async fn list_workflows(
        &self,
        include_inactive: bool,
    ) -> Result<Vec<Workflow>, RepositoryError> {
        let mut all: Vec<Workflow> = self
            .workflows
            .iter()
            .map(|w| w.value().clone())
            .filter(|w| include_inactive || w.is_active)
            .collect();
        all.sort_by_key(|w| w.created_at);
        Ok(all)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        if self.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.id
            )));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.runs.get(id).map(|r| r.value().clone()))
    }

    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        if !self.runs.contains_key(&run.id) {
            return Err(RepositoryError::NotFound);
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution units
    // -----------------------------------------------------------------------

    async fn create_unit(&self, unit: &ExecutionUnit) -> Result<(), RepositoryError> {
        self.units.insert(unit.id, unit.clone());
        self.unit_order
            .entry((unit.run_id, unit.step_id.clone()))
            .or_default()
            .push(unit.id);
        Ok(())
    }

    async fn get_unit(&self, id: &Uuid) -> Result<Option<ExecutionUnit>, RepositoryError> {
        Ok(self.units.get(id).map(|u| u.value().clone()))
    }

    async fn update_unit(&self, unit: &ExecutionUnit) -> Result<(), RepositoryError> {
        if !self.units.contains_key(&unit.id) {
            return Err(RepositoryError::NotFound);
        }
        self.units.insert(unit.id, unit.clone());
        Ok(())
    }

    async fn list_units_for_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> Result<Vec<ExecutionUnit>, RepositoryError> {
        let Some(order) = self.unit_order.get(&(*run_id, step_id.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(order
            .iter()
            .filter_map(|id| self.units.get(id).map(|u| u.value().clone()))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Batch counters
    // -----------------------------------------------------------------------

    async fn init_batch(
        &self,
        key: &BatchKey,
        counters: BatchCounters,
    ) -> Result<BatchState, RepositoryError> {
        let entry = self
            .batches
            .entry(key.clone())
            .or_insert_with(|| BatchEntry::new(BatchState::new(key.clone(), counters)));
        Ok(entry.state.clone())
    }

    async fn get_batch(&self, key: &BatchKey) -> Result<Option<BatchState>, RepositoryError> {
        Ok(self.batches.get(key).map(|e| e.state.clone()))
    }

    async fn apply_batch_delta(
        &self,
        key: &BatchKey,
        delta: BatchDelta,
    ) -> Result<BatchState, RepositoryError> {
        let mut entry = self
            .batches
            .entry(key.clone())
            .or_insert_with(|| BatchEntry::new(BatchState::new(key.clone(), BatchCounters::default())));
        entry.state.counters.apply(delta);
        debug_assert!(entry.state.counters.is_consistent());
        Ok(entry.state.clone())
    }

    async fn declare_expected(
        &self,
        key: &BatchKey,
        expected: u32,
    ) -> Result<ExpectedOutcome, RepositoryError> {
        let mut entry = self
            .batches
            .entry(key.clone())
            .or_insert_with(|| BatchEntry::new(BatchState::new(key.clone(), BatchCounters::default())));
        match entry.state.counters.expected_count {
            Some(known) => Ok(ExpectedOutcome::AlreadyKnown(known)),
            None => {
                entry.state.counters.expected_count = Some(expected);
                Ok(ExpectedOutcome::Set)
            }
        }
    }

    async fn mark_batch_complete(&self, key: &BatchKey) -> Result<BatchState, RepositoryError> {
        let mut entry = self
            .batches
            .entry(key.clone())
            .or_insert_with(|| BatchEntry::new(BatchState::new(key.clone(), BatchCounters::default())));
        entry.state.counters.is_complete = true;
        Ok(entry.state.clone())
    }

    async fn try_mark_fired(&self, key: &BatchKey) -> Result<bool, RepositoryError> {
        let mut entry = self
            .batches
            .entry(key.clone())
            .or_insert_with(|| BatchEntry::new(BatchState::new(key.clone(), BatchCounters::default())));
        if entry.state.fired {
            Ok(false)
        } else {
            entry.state.fired = true;
            Ok(true)
        }
    }

    async fn register_ingest_key(
        &self,
        key: &BatchKey,
        idempotency_key: &str,
    ) -> Result<bool, RepositoryError> {
        let mut entry = self
            .batches
            .entry(key.clone())
            .or_insert_with(|| BatchEntry::new(BatchState::new(key.clone(), BatchCounters::default())));
        Ok(entry.seen_keys.insert(idempotency_key.to_string()))
    }

    // -----------------------------------------------------------------------
    // Batch jobs
    // -----------------------------------------------------------------------

    async fn create_batch_job(&self, job: &BatchJob) -> Result<(), RepositoryError> {
        if self.jobs.contains_key(&job.id) {
            return Err(RepositoryError::Conflict(format!(
                "batch job {} already exists",
                job.id
            )));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_batch_job(&self, id: &Uuid) -> Result<Option<BatchJob>, RepositoryError> {
        Ok(self.jobs.get(id).map(|j| j.value().clone()))
    }

    async fn update_batch_job(&self, job: &BatchJob) -> Result<(), RepositoryError> {
        if !self.jobs.contains_key(&job.id) {
            return Err(RepositoryError::NotFound);
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

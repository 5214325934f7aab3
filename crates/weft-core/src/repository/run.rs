//! Run store trait definition.
//!
//! Defines the storage interface the engine requires: workflows, runs,
//! execution units, batch counters, and standalone batch jobs. Counter
//! mutation is atomic at the store level -- the engine never reads, modifies
//! and writes counters at the application level -- and join firing is a
//! one-shot compare-and-set.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use uuid::Uuid;
use weft_types::batch::{BatchCounters, BatchDelta, BatchJob, BatchKey, BatchState};
use weft_types::error::RepositoryError;
use weft_types::run::{ExecutionUnit, Run};
use weft_types::workflow::Workflow;

/// Result of an out-of-band expected-count declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOutcome {
    /// The count was not previously known and is now set.
    Set,
    /// The count was already known; the stored value is returned and wins.
    AlreadyKnown(u32),
}

/// Storage interface for the orchestration engine.
///
/// Covers four entity families:
/// - **Workflows:** save (upsert) and query workflow containers.
/// - **Runs / Units:** create/update/query execution instances and their
///   spawned units.
/// - **Batches:** atomic counter increments, out-of-band expected-count
///   declaration, explicit completion, idempotency-key registration, and the
///   compare-and-set "join fired" flag.
/// - **Batch jobs:** standalone bulk-work records.
pub trait RunStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Upsert a workflow (insert or replace by ID).
    fn save_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow by its UUID.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Get a workflow by name.
    fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List workflows. Inactive workflows are excluded unless requested.
    fn list_workflows(
        &self,
        include_inactive: bool,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record.
    fn create_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    /// Replace a run record. Only the run state machine calls this.
    fn update_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Execution units
    // -----------------------------------------------------------------------

    /// Create a new execution unit.
    fn create_unit(
        &self,
        unit: &ExecutionUnit,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a unit by its UUID.
    fn get_unit(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionUnit>, RepositoryError>> + Send;

    /// Replace a unit record.
    fn update_unit(
        &self,
        unit: &ExecutionUnit,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All units produced by a given step of a given run, in creation order.
    fn list_units_for_step(
        &self,
        run_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionUnit>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Batch counters
    // -----------------------------------------------------------------------

    /// Initialize batch state for a key. A no-op if the key already exists
    /// (streamed items may have arrived before the initializer ran).
    fn init_batch(
        &self,
        key: &BatchKey,
        counters: BatchCounters,
    ) -> impl std::future::Future<Output = Result<BatchState, RepositoryError>> + Send;

    /// Current batch state for a key.
    fn get_batch(
        &self,
        key: &BatchKey,
    ) -> impl std::future::Future<Output = Result<Option<BatchState>, RepositoryError>> + Send;

    /// Atomically apply a counter increment, creating the batch if absent.
    /// Returns the post-increment state.
    fn apply_batch_delta(
        &self,
        key: &BatchKey,
        delta: BatchDelta,
    ) -> impl std::future::Future<Output = Result<BatchState, RepositoryError>> + Send;

    /// Declare the expected total. Sets it only if not already known;
    /// already-accumulated counts are never discarded or recomputed.
    fn declare_expected(
        &self,
        key: &BatchKey,
        expected: u32,
    ) -> impl std::future::Future<Output = Result<ExpectedOutcome, RepositoryError>> + Send;

    /// Record the explicit "no more items will be sent" signal.
    /// Returns the post-mutation state.
    fn mark_batch_complete(
        &self,
        key: &BatchKey,
    ) -> impl std::future::Future<Output = Result<BatchState, RepositoryError>> + Send;

    /// One-shot compare-and-set of the "fired" flag. Returns `true` exactly
    /// once per key; every later call returns `false`.
    fn try_mark_fired(
        &self,
        key: &BatchKey,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Register a source-provided idempotency key for a batch. Returns `true`
    /// on first sight, `false` when the key was seen before (duplicate).
    fn register_ingest_key(
        &self,
        key: &BatchKey,
        idempotency_key: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Batch jobs
    // -----------------------------------------------------------------------

    /// Create a standalone batch job record.
    fn create_batch_job(
        &self,
        job: &BatchJob,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a batch job by its UUID.
    fn get_batch_job(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<BatchJob>, RepositoryError>> + Send;

    /// Replace a batch job record.
    fn update_batch_job(
        &self,
        job: &BatchJob,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

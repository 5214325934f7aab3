//! The orchestration engine.
//!
//! - `fanout` -- one execution unit per collection element (§fan-out)
//! - `ingest` -- callback payload normalization and acknowledgment
//! - `join` -- fan-in boundary evaluation, shared with batch jobs
//! - `machine` -- the run state machine driving step transitions
//! - `batch_job` -- standalone bulk-work aggregation

pub mod batch_job;
pub mod fanout;
pub mod ingest;
pub mod join;
pub mod machine;

pub use batch_job::{BatchJobConfig, BatchJobError, BatchJobManager};
pub use ingest::{CallbackAck, CallbackRequest};
pub use join::{BoundaryDecision, JoinBoundary};
pub use machine::{EngineError, RunEngine};

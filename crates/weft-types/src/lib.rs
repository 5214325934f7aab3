//! Shared domain types for Weft.
//!
//! This crate contains the core domain types used across the Weft engine:
//! steps, workflows, runs, execution units, batch counters, lifecycle events,
//! and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod batch;
pub mod error;
pub mod event;
pub mod run;
pub mod step;
pub mod workflow;

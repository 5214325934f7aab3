//! Orchestration engine and repository trait definitions for Weft.
//!
//! This crate defines the "ports" (the run store and outbound executor
//! traits) that the infrastructure layer implements, plus the engine itself:
//! - `diagram` -- bidirectional flowchart-text <-> step-graph compiler
//! - `definition` -- workflow ingestion boundary (parse, normalize, repair)
//! - `expression` -- condition evaluation, path lookup, template interpolation
//! - `engine` -- fan-out, callback ingestion, fan-in, run state machine,
//!   standalone batch jobs
//! - `event` -- broadcast bus for run lifecycle events
//!
//! It depends only on `weft-types` -- never on `weft-infra` or any
//! database/HTTP-client crate.

pub mod definition;
pub mod diagram;
pub mod engine;
pub mod event;
pub mod expression;
pub mod outbound;
pub mod repository;

//! Infrastructure layer for Weft.
//!
//! Contains implementations of the ports defined in `weft-core`: the
//! in-memory run store (the single-owner store the engine's concurrency
//! model assumes) and HTTP adapters (outbound call executor on reqwest,
//! callback signature verification).

pub mod http;
pub mod memory;

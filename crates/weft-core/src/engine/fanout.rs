//! Fan-out coordination: one execution unit per collection element.
//!
//! Given a `foreach` step and the previous step's output, locates the
//! collection via the configured path expression, enforces the safety cap,
//! and produces the units plus the initial batch counters for the
//! (run id, step id) batch key the fan-in aggregator later queries by.

use serde_json::Value;
use uuid::Uuid;
use weft_types::batch::{BatchCounters, BatchKey};
use weft_types::run::{ExecutionUnit, UnitStatus};
use weft_types::step::{StepConfig, StepDefinition, StepType};

use crate::expression::resolve_path;

/// Safety cap on fan-out width when the step does not configure one.
pub const DEFAULT_MAX_ITEMS: u32 = 100;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised when planning a fan-out.
#[derive(Debug, thiserror::Error)]
pub enum FanOutError {
    /// The step handed in is not a foreach step.
    #[error("step '{0}' is not a foreach step")]
    NotForeach(String),

    /// The collection path resolved to nothing.
    #[error("collection path '{0}' not found in previous step output")]
    CollectionNotFound(String),

    /// The path resolved to a non-array value.
    #[error("collection path '{0}' did not resolve to an array")]
    NotACollection(String),

    /// The collection is wider than the cap allows. A configuration error,
    /// never silently truncated.
    #[error("collection has {len} items, exceeding the cap of {cap}")]
    CapExceeded { len: usize, cap: u32 },
}

// ---------------------------------------------------------------------------
// FanOutPlan
// ---------------------------------------------------------------------------

/// The units and counter state a fan-out produces.
#[derive(Debug)]
pub struct FanOutPlan {
    /// Batch key shared by every spawned unit.
    pub key: BatchKey,
    /// One unit per collection element, in collection order.
    pub units: Vec<ExecutionUnit>,
    /// Initial counters: `expected` = collection length, known immediately.
    pub counters: BatchCounters,
}

/// Plan a fan-out for a foreach step.
///
/// Pure with respect to storage: the caller persists the units and
/// initializes the batch.
pub fn plan_fan_out(
    run_id: Uuid,
    step: &StepDefinition,
    prev_output: &Value,
) -> Result<FanOutPlan, FanOutError> {
    let StepConfig::Foreach {
        collection_path,
        item_var,
        max_items,
        streaming,
        ..
    } = &step.config
    else {
        return Err(FanOutError::NotForeach(step.id.clone()));
    };

    // Streaming fan-out: no static collection, no expected count. Units and
    // their total arrive entirely through the callback endpoint.
    if *streaming {
        return Ok(FanOutPlan {
            key: BatchKey::new(run_id, &step.id),
            units: Vec::new(),
            counters: BatchCounters::default(),
        });
    }

    let collection = resolve_path(prev_output, collection_path)
        .ok_or_else(|| FanOutError::CollectionNotFound(collection_path.clone()))?;
    let items = collection
        .as_array()
        .ok_or_else(|| FanOutError::NotACollection(collection_path.clone()))?;

    let cap = max_items.unwrap_or(DEFAULT_MAX_ITEMS);
    if items.len() > cap as usize {
        return Err(FanOutError::CapExceeded {
            len: items.len(),
            cap,
        });
    }

    let total = items.len() as u32;
    let units = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut unit = ExecutionUnit::new(run_id, &step.id, StepType::Foreach, item.clone());
            unit.status = UnitStatus::Waiting;
            unit.loop_index = Some(index as u32);
            unit.loop_total = Some(total);
            unit.item_var = Some(item_var.clone());
            unit
        })
        .collect();

    Ok(FanOutPlan {
        key: BatchKey::new(run_id, &step.id),
        units,
        counters: BatchCounters::static_spawn(total, 100.0),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

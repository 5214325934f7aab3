//! Application state wiring the engine to concrete infrastructure.
//!
//! The engine and job manager are generic over store/outbound traits;
//! AppState pins them to the in-memory store and the reqwest outbound
//! executor.

use weft_core::engine::{BatchJobManager, RunEngine};
use weft_core::event::EventBus;
use weft_infra::http::outbound::HttpOutboundExecutor;
use weft_infra::memory::MemoryRunStore;

/// Concrete type aliases for the engine generics pinned to infra
/// implementations.
pub type ConcreteEngine = RunEngine<MemoryRunStore, HttpOutboundExecutor>;
pub type ConcreteJobManager = BatchJobManager<MemoryRunStore>;

/// Shared application state holding the engine, job manager, and their
/// store/bus handles.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub jobs: ConcreteJobManager,
    pub store: MemoryRunStore,
    pub bus: EventBus,
}

impl AppState {
    /// Wire the engine against the in-memory store and HTTP outbound
    /// executor.
    pub fn init() -> Self {
        let store = MemoryRunStore::new();
        let bus = EventBus::new(1024);
        let engine = RunEngine::new(store.clone(), HttpOutboundExecutor::new(), bus.clone());
        let jobs = BatchJobManager::new(store.clone(), bus.clone());
        Self {
            engine,
            jobs,
            store,
            bus,
        }
    }
}

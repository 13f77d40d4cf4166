//! State shared across handlers.

use patrol::scheduler::Scheduler;
use patrol::{BroadcastPublisher, Engine};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Fan-out the engine publishes into; `/events` subscribes here
    pub bus: BroadcastPublisher,
    /// Background jobs, also used for manual triggers
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// `bus` must be the publisher the engine was built with.
    pub fn new(engine: Engine, bus: BroadcastPublisher) -> Self {
        let scheduler = Arc::new(engine.scheduler());
        Self {
            engine,
            bus,
            scheduler,
        }
    }
}

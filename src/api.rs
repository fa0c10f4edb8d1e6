//! HTTP API
//!
//! Inbound transports post raw payloads to `/webhook/:source`; operators read
//! conversation state and audit trails under `/api/conversations`.

mod handlers;
mod types;

pub use handlers::create_router;

use crate::normalize::{Clock, SystemClock};
use crate::runtime::ProductionManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ProductionManager>,
    pub clock: Arc<dyn Clock>,
    pub backend: &'static str,
    pub delivery: &'static str,
}

impl AppState {
    pub fn new(manager: Arc<ProductionManager>, backend: &'static str, delivery: &'static str) -> Self {
        Self {
            manager,
            clock: Arc::new(SystemClock),
            backend,
            delivery,
        }
    }

    /// Replace the wall clock
    #[allow(dead_code)] // Used in tests
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

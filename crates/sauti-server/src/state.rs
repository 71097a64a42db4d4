//! Application state management

use std::sync::Arc;

use sauti_core::pipeline::{Orchestrator, SynthesisClient};
use sauti_core::StreamConfig;
use tokio::sync::RwLock;

/// The stream currently owned by the server, if any. A finished stream
/// stays in the slot so `/v1/status` can report its final counters until
/// the next speak request replaces it.
pub type ActiveStream = Arc<RwLock<Option<Arc<Orchestrator<SynthesisClient>>>>>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<StreamConfig>,
    pub active: ActiveStream,
}

impl AppState {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config: Arc::new(config),
            active: Arc::new(RwLock::new(None)),
        }
    }
}

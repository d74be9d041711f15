//! Shared application state.

use std::sync::Arc;

use tokio::sync::watch;

use crate::accel::AcceleratorGate;
use crate::config::Config;
use crate::model::{ModelBackend, ModelRegistry, TextEncoder};
use crate::service::{EmbeddingService, GenerationService};

/// Shared application state passed to all handlers.
///
/// Wires the single gate into both services; handlers only ever talk to the
/// services and the advertised-identity watch, never to the gate directly.
pub struct AppState {
    pub config: Config,
    pub generation: GenerationService,
    pub embedding: EmbeddingService,
    /// Latest advertised generation identity; `None` until the first load.
    pub advertised_model: watch::Receiver<Option<String>>,
}

impl AppState {
    pub fn new(
        config: Config,
        backend: Arc<dyn ModelBackend>,
        encoder: Arc<dyn TextEncoder>,
    ) -> Self {
        let (registry, advertised_model) = ModelRegistry::new(backend);
        let gate = AcceleratorGate::new(registry);

        Self {
            config,
            generation: GenerationService::new(gate.clone()),
            embedding: EmbeddingService::new(gate, encoder),
            advertised_model,
        }
    }
}

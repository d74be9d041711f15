//! Embeddings over the resident encoder model.

use std::sync::Arc;

use crate::accel::AcceleratorGate;
use crate::error::{Error, Result};
use crate::model::TextEncoder;

/// Fixed document-retrieval prefix applied to every input before encoding.
/// The embedding model's quality depends on this convention, so it is not
/// request-configurable.
pub const DOCUMENT_PREFIX: &str = "search_document: ";

/// Encodes texts with the always-resident embedding model. Stateless after
/// construction; shares the accelerator gate with generation, so embeddings
/// and generation never run concurrently.
#[derive(Clone)]
pub struct EmbeddingService {
    gate: AcceleratorGate,
    encoder: Arc<dyn TextEncoder>,
}

impl EmbeddingService {
    pub fn new(gate: AcceleratorGate, encoder: Arc<dyn TextEncoder>) -> Self {
        Self { gate, encoder }
    }

    /// Encode `texts` into one vector each, order-preserving.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _accelerator = self.gate.acquire().await;

        let prefixed: Vec<String> = texts
            .iter()
            .map(|text| format!("{DOCUMENT_PREFIX}{text}"))
            .collect();

        self.encoder.encode(&prefixed).await.map_err(as_encoding)
    }
}

fn as_encoding(e: Error) -> Error {
    match e {
        Error::Encoding(_) => e,
        other => Error::Encoding(other.to_string()),
    }
}

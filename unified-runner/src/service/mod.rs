//! Accelerator-facing services.
//!
//! Both services funnel every model operation through the accelerator gate;
//! the HTTP layer above them never touches the gate itself.

mod embedding;
mod generation;

pub use embedding::{EmbeddingService, DOCUMENT_PREFIX};
pub use generation::{GenerationService, GenerationStream, StreamEvent};

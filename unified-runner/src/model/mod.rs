//! Model collaborator abstraction layer.
//!
//! The actual tokenization, generation, and encoding live in external
//! collaborators behind the traits below. The production implementation
//! (`llama.rs`) drives llama-server subprocesses; tests substitute stubs.

mod llama;
mod registry;

pub use llama::{LlamaBackend, LlamaEncoder, LlamaServer};
pub use registry::ModelRegistry;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use unified_ai_common::{ChatCompletionRequest, ChatMessage};

use crate::error::Result;

/// Lazy, finite, non-restartable sequence of generated text deltas.
pub type TokenStream = BoxStream<'static, Result<String>>;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f32 = 0.1;
pub const DEFAULT_TOP_P: f32 = 1.0;

/// Sampling parameters passed through to the generation collaborator.
///
/// Unset request fields take these fixed defaults here, never whatever the
/// collaborator would pick on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl From<&ChatCompletionRequest> for SamplingParams {
    fn from(request: &ChatCompletionRequest) -> Self {
        Self {
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: request.top_p.unwrap_or(DEFAULT_TOP_P),
        }
    }
}

/// Loads generation models by identity.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Bring the artifacts for `identity` into memory and return a handle.
    ///
    /// A failed load must not leave anything resident; the returned error is
    /// wrapped into `Error::ModelLoad` by the registry.
    async fn load(&self, identity: &str) -> Result<Box<dyn LoadedModel>>;
}

/// The in-memory weights/tokenizer pair for exactly one model identity.
#[async_trait]
pub trait LoadedModel: Send + Sync {
    /// Render the conversation through the model's own chat template.
    ///
    /// `None` means the model carries no template and the caller should fall
    /// back to plain role-prefixed concatenation.
    async fn apply_chat_template(&self, messages: &[ChatMessage]) -> Option<String>;

    /// Open a delta stream for a fully rendered prompt.
    ///
    /// The returned stream owns everything it needs; it stays valid for as
    /// long as this model is resident, which the caller guarantees by
    /// holding the accelerator gate until the stream is exhausted.
    async fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<TokenStream>;

    /// Free the weights and any accelerator-side cache.
    async fn release(&mut self);
}

/// Encodes texts into fixed-length vectors, order-preserving.
#[async_trait]
pub trait TextEncoder: Send + Sync {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

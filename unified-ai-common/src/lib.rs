//! UnifiedAI Common Types
//!
//! Wire types shared by the unified runner and its clients: the
//! OpenAI-compatible chat completion and embedding formats.

pub mod chat;
pub mod embedding;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, ChunkDelta,
};
pub use embedding::{
    EmbeddingData, EmbeddingInput, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage,
};

//! Chat completions endpoint (OpenAI-compatible).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::StreamExt;
use unified_ai_common::ChatCompletionRequest;

use crate::error::Result;
use crate::service::StreamEvent;
use crate::state::AppState;

/// Build the chat router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// POST /v1/chat/completions - OpenAI-compatible chat completion.
///
/// Non-streaming requests answer with one JSON envelope; streaming requests
/// answer with an SSE body of `data: {chunk}` lines closed by the literal
/// `data: [DONE]` sentinel.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    tracing::debug!(model = %request.model, stream = request.stream.unwrap_or(false), "chat completion request");

    if request.stream.unwrap_or(false) {
        let events = state.generation.stream(request).await?;
        let sse = events.map(|event| match event {
            StreamEvent::Chunk(chunk) => Event::default().json_data(&chunk),
            StreamEvent::Done => Ok(Event::default().data("[DONE]")),
        });
        Ok(Sse::new(sse)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response())
    } else {
        let response = state.generation.complete(&request).await?;
        Ok(Json(response).into_response())
    }
}

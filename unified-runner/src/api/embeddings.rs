//! Embeddings endpoint (OpenAI-compatible).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use unified_ai_common::{EmbeddingRequest, EmbeddingResponse};

use crate::error::{Error, Result};
use crate::state::AppState;

/// Build the embeddings router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/embeddings", post(create_embeddings))
}

/// POST /v1/embeddings - encode one or more texts.
///
/// The request's `model` is advisory: encoding always uses the resident
/// embedding model, and the name is only echoed back.
async fn create_embeddings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>> {
    let EmbeddingRequest { model, input } = request;

    let texts = input.into_texts();
    if texts.is_empty() {
        return Err(Error::InvalidRequest(
            "input must contain at least one text".to_string(),
        ));
    }

    tracing::debug!(count = texts.len(), "embedding request");
    let vectors = state.embedding.embed(&texts).await?;

    let model = model.unwrap_or_else(|| state.config.embedding.model_name.clone());
    Ok(Json(EmbeddingResponse::new(model, vectors)))
}

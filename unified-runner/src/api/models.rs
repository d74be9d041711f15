//! Models endpoint (OpenAI-compatible).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Identity reported before any generation model has been loaded.
const LOADING_SENTINEL: &str = "loading";

/// Build the models router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

/// OpenAI-compatible model list response.
#[derive(Debug, Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelData>,
}

#[derive(Debug, Serialize)]
struct ModelData {
    id: String,
    object: &'static str,
}

/// GET /v1/models - report the currently loaded generation identity.
///
/// Reads the advertised identity published by the registry instead of
/// taking the gate, so listing keeps answering while a stream holds the
/// accelerator.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let id = state
        .advertised_model
        .borrow()
        .clone()
        .unwrap_or_else(|| LOADING_SENTINEL.to_string());

    Json(ModelsResponse {
        object: "list",
        data: vec![ModelData {
            id,
            object: "model",
        }],
    })
}

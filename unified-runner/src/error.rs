//! Error types for the unified runner.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Request-scoped failures. None of these crash the process, and every one
/// of them reaches the caller with the accelerator gate already released.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load model '{identity}': {message}")]
    ModelLoad { identity: String, message: String },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("embedding encode failed: {0}")]
    Encoding(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend communication error: {0}")]
    Communication(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::ModelLoad { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "model_load_failed"),
            Error::Generation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "generation_failed"),
            Error::Encoding(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encoding_failed"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::Communication(_) => (StatusCode::BAD_GATEWAY, "communication_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

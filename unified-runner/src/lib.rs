//! Unified Runner - chat completions and embeddings over one accelerator.
//!
//! One process serves both capability classes: a hot-swappable generation
//! model and a permanently-resident embedding model. They share a single
//! exclusive accelerator gate; the gate owns the model registry, so every
//! weight-touching operation - including each chunk of a streamed
//! generation - runs fully serialized while non-accelerator endpoints keep
//! answering.

pub mod accel;
pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod service;
pub mod state;
pub mod test_util;

use std::sync::Arc;

use axum::middleware;
use axum::Router;
use tower_http::cors::CorsLayer;

pub use config::{Cli, Config};
pub use error::{Error, Result};
pub use state::AppState;

/// Assemble the full application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/v1", api::router())
        .route("/health", axum::routing::get(api::health::health))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(logging::request_logger))
        .with_state(state)
}

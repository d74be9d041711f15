//! Unified Runner - OpenAI-compatible chat + embeddings on one accelerator.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use unified_runner::config::{Cli, Config};
use unified_runner::model::{LlamaBackend, LlamaEncoder};
use unified_runner::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&cli).map_err(|e| format!("Failed to load configuration: {}", e))?;
    tracing::info!(
        "Starting unified runner: chat (hot-swap) + embeddings, model_dir={}",
        config.llama.model_dir
    );

    // The embedding model is resident for the whole process lifetime; bring
    // it up before accepting traffic.
    let encoder = Arc::new(LlamaEncoder::start(&config.llama, &config.embedding).await?);
    let backend = Arc::new(LlamaBackend::new(config.llama.clone()));

    let state = Arc::new(AppState::new(config.clone(), backend, encoder));
    let app = unified_runner::app(state);

    // Start server
    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

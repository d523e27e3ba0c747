use std::sync::Arc;
use std::time::Duration;

use neuralripper_backend::{app, logging, AppState, BatchEngine, Config, InferenceProvider, OllamaProvider};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load().map_err(|e| format!("Failed to load configuration: {}", e))?;

    // Initialize tracing
    logging::init(&config.logging.level);

    tracing::info!("Starting NeuralRipper gateway");

    let provider = Arc::new(OllamaProvider::new(
        &config.ollama.base_url,
        Duration::from_secs(config.ollama.request_timeout_secs),
    )?);

    match provider.list_models().await {
        Ok(models) => tracing::info!(
            "Provider {} at {} serves {} models: {:?}",
            provider.provider_type(),
            config.ollama.base_url,
            models.len(),
            models
        ),
        Err(e) => tracing::warn!("Could not list models from {}: {}", config.ollama.base_url, e),
    }

    let engine = Arc::new(BatchEngine::new(provider, config.engine_config()));
    if engine.config().queue.max_queue_depth.is_none() {
        tracing::warn!("batching.max_queue_depth is unset, per-model queues are unbounded");
    }
    engine.start_workers(&config.inference.models).await;

    let state = Arc::new(AppState {
        config: config.clone(),
        engine: engine.clone(),
    });

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

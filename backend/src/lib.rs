pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod provider;
pub mod routes;
pub mod test_util;

pub use config::Config;
pub use error::GatewayError;
pub use gateway::{BatchEngine, EngineConfig, ResponseStream};
pub use provider::{GenerationParams, InferenceProvider, OllamaProvider, ProviderError};

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Batching engine shared by every transport.
    pub engine: Arc<BatchEngine>,
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::eval::router())
        .nest("/v1", routes::generate::router())
        .layer(middleware::from_fn(logging::request_logger))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

use std::fmt::Write;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let version = env!("CARGO_PKG_VERSION");
    let mut body = format!(
        "# HELP neuralripper_up Whether the service is up\n\
         # TYPE neuralripper_up gauge\n\
         neuralripper_up 1\n\
         # HELP neuralripper_info Service information\n\
         # TYPE neuralripper_info gauge\n\
         neuralripper_info{{version=\"{}\"}} 1\n\
         # HELP neuralripper_queue_depth Requests waiting to be batched\n\
         # TYPE neuralripper_queue_depth gauge\n",
        version
    );
    for (model, depth) in state.engine.queue_depths().await {
        let _ = writeln!(body, "neuralripper_queue_depth{{model=\"{}\"}} {}", model, depth);
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}

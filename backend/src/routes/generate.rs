//! Server-Sent Events variant of the streaming endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use neuralripper_common::{GenerateRequest, StreamMessage};

use crate::error::{GatewayError, Result};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/generate", post(generate))
}

/// POST /v1/generate - stream a completion as `token`, `error` and `done` events.
async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    if request.prompt.is_empty() {
        return Err(GatewayError::InvalidRequest("No prompt provided".to_string()));
    }

    let model = request
        .model
        .unwrap_or_else(|| state.config.inference.default_model.clone());

    let response = state.engine.submit(&model, request.prompt).await?;

    let events = response
        .map(|item| match item {
            Ok(token) => StreamMessage::Token(token),
            Err(e) => StreamMessage::Error(e.to_string()),
        })
        .chain(stream::once(async { StreamMessage::done() }))
        .map(|message| Ok(to_event(&message)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn to_event(message: &StreamMessage) -> Event {
    let name = match message {
        StreamMessage::Token(_) => "token",
        StreamMessage::Error(_) => "error",
        StreamMessage::Done(_) => "done",
    };

    Event::default().event(name).json_data(message).unwrap_or_else(|e| {
        tracing::warn!("Failed to serialize SSE event: {}", e);
        Event::default().event("error").data("serialization failed")
    })
}

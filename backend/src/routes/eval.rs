//! WebSocket endpoint streaming tokens for interactive evaluation.
//!
//! Each text message carries one [`GenerateRequest`]. Prompts on the same
//! connection are answered one after another; concurrency comes from many
//! connections sharing the model's batches.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use neuralripper_common::{GenerateRequest, StreamMessage};

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws/eval", get(ws_handler))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

async fn handle_client(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket receive error: {}", e);
                break;
            }
        };

        let request: GenerateRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                let error = StreamMessage::Error(format!("Invalid message: {}", e));
                if send_message(&mut ws_tx, &error).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if request.prompt.is_empty() {
            let error = StreamMessage::Error("No prompt provided".to_string());
            if send_message(&mut ws_tx, &error).await.is_err() {
                break;
            }
            continue;
        }

        let model = request
            .model
            .unwrap_or_else(|| state.config.inference.default_model.clone());

        let mut fragments = state.engine.stream(&model, request.prompt).await;
        while let Some(item) = fragments.next().await {
            let message = match item {
                Ok(token) => StreamMessage::Token(token),
                Err(e) => StreamMessage::Error(e.to_string()),
            };
            if let Err(e) = send_message(&mut ws_tx, &message).await {
                // Dropping `fragments` abandons the request
                tracing::info!("Client disconnected mid-stream for model {}: {}", model, e);
                return;
            }
        }

        if send_message(&mut ws_tx, &StreamMessage::done()).await.is_err() {
            break;
        }
    }

    tracing::debug!("Client connection closed");
}

async fn send_message<S>(
    sink: &mut S,
    msg: &StreamMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

//! End-to-end tests for the `/ws/eval` WebSocket endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use neuralripper_backend::test_util::{Script, ScriptedProvider};
use neuralripper_backend::{app, AppState, BatchEngine, Config};
use neuralripper_common::{GenerateRequest, StreamMessage};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(provider: Arc<ScriptedProvider>) -> SocketAddr {
    let config = Config::default();
    let engine = Arc::new(BatchEngine::new(provider, config.engine_config()));
    engine.start_workers(&config.inference.models).await;
    let state = Arc::new(AppState { config, engine });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws/eval", addr)).await.unwrap();
    client
}

async fn send(client: &mut Client, request: &GenerateRequest) {
    let text = serde_json::to_string(request).unwrap();
    client.send(Message::Text(text)).await.unwrap();
}

async fn next_message(client: &mut Client) -> StreamMessage {
    loop {
        match client.next().await.expect("connection closed").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn read_until_done(client: &mut Client) -> Vec<StreamMessage> {
    let mut messages = Vec::new();
    loop {
        let message = next_message(client).await;
        let done = message.is_done();
        messages.push(message);
        if done {
            return messages;
        }
    }
}

fn tokens(prompt: &str) -> Vec<StreamMessage> {
    let mut expected: Vec<_> = (0..3)
        .map(|i| StreamMessage::Token(format!("{}#{}", prompt, i)))
        .collect();
    expected.push(StreamMessage::done());
    expected
}

#[tokio::test]
async fn test_streams_tokens_then_done() {
    let addr = spawn_server(Arc::new(ScriptedProvider::new())).await;
    let mut client = connect(addr).await;

    send(&mut client, &GenerateRequest::new("qwen", "hello")).await;
    assert_eq!(read_until_done(&mut client).await, tokens("hello"));
}

#[tokio::test]
async fn test_upstream_failure_is_error_then_done() {
    let provider = ScriptedProvider::new().with_script("bad", Script::Reject("modal unavailable".to_string()));
    let addr = spawn_server(Arc::new(provider)).await;
    let mut client = connect(addr).await;

    send(&mut client, &GenerateRequest::new("qwen", "bad")).await;
    let messages = read_until_done(&mut client).await;

    assert_eq!(messages.len(), 2);
    match &messages[0] {
        StreamMessage::Error(message) => assert!(message.contains("modal unavailable")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(messages[1], StreamMessage::done());
}

#[tokio::test]
async fn test_empty_prompt_keeps_connection_open() {
    let addr = spawn_server(Arc::new(ScriptedProvider::new())).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text(json!({ "model": "qwen" }).to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut client).await,
        StreamMessage::Error("No prompt provided".to_string())
    );

    send(&mut client, &GenerateRequest::new("qwen", "again")).await;
    assert_eq!(read_until_done(&mut client).await, tokens("again"));
}

#[tokio::test]
async fn test_invalid_json_is_reported() {
    let addr = spawn_server(Arc::new(ScriptedProvider::new())).await;
    let mut client = connect(addr).await;

    client.send(Message::Text("not json".to_string())).await.unwrap();
    match next_message(&mut client).await {
        StreamMessage::Error(message) => assert!(message.starts_with("Invalid message")),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_model_uses_default() {
    let provider = Arc::new(ScriptedProvider::new());
    let addr = spawn_server(provider.clone()).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text(json!({ "prompt": "who" }).to_string()))
        .await
        .unwrap();
    read_until_done(&mut client).await;

    let calls = provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "qwen");
}

#[tokio::test]
async fn test_concurrent_clients_receive_only_their_tokens() {
    let provider = ScriptedProvider::new().with_fragment_delay(std::time::Duration::from_millis(5));
    let addr = spawn_server(Arc::new(provider)).await;

    let clients: Vec<_> = (0..4)
        .map(|i| {
            tokio::spawn(async move {
                let mut client = connect(addr).await;
                let prompt = format!("client-{}", i);
                send(&mut client, &GenerateRequest::new("qwen", prompt.clone())).await;
                (prompt, read_until_done(&mut client).await)
            })
        })
        .collect();

    for handle in clients {
        let (prompt, messages) = handle.await.unwrap();
        assert_eq!(messages, tokens(&prompt));
    }
}

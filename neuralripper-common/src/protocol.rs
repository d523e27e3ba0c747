//! Client-facing streaming protocol.
//!
//! Messages are JSON encoded. A client submits one [`GenerateRequest`] per
//! prompt and receives a sequence of [`StreamMessage`]s back:
//!
//! ```text
//! {"token": "Hel"}
//! {"token": "lo"}
//! {"done": true}
//! ```
//!
//! An upstream failure is reported as a single `{"error": "..."}` message,
//! which is still followed by `{"done": true}`.

use serde::{Deserialize, Serialize};

/// A prompt submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Model to run. The server falls back to its default model when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Prompt text.
    #[serde(default)]
    pub prompt: String,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            prompt: prompt.into(),
        }
    }
}

/// Messages streamed from the server back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMessage {
    /// One generated text fragment.
    Token(String),
    /// Terminal failure for the current prompt.
    Error(String),
    /// End of the current prompt's stream.
    Done(bool),
}

impl StreamMessage {
    pub fn done() -> Self {
        StreamMessage::Done(true)
    }

    /// Whether this message ends the stream for the current prompt.
    pub fn is_done(&self) -> bool {
        matches!(self, StreamMessage::Done(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_message_wire_format() {
        assert_eq!(
            serde_json::to_string(&StreamMessage::Token("hi".to_string())).unwrap(),
            r#"{"token":"hi"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamMessage::done()).unwrap(),
            r#"{"done":true}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamMessage::Error("boom".to_string())).unwrap(),
            r#"{"error":"boom"}"#
        );
    }

    #[test]
    fn test_generate_request_without_model() {
        let request: GenerateRequest = serde_json::from_str(r#"{"prompt": "Hello"}"#).unwrap();
        assert_eq!(request.model, None);
        assert_eq!(request.prompt, "Hello");
    }

    #[test]
    fn test_generate_request_missing_prompt_is_empty() {
        let request: GenerateRequest = serde_json::from_str(r#"{"model": "qwen"}"#).unwrap();
        assert_eq!(request.model.as_deref(), Some("qwen"));
        assert!(request.prompt.is_empty());
    }
}

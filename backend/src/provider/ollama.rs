//! Ollama inference provider implementation.

use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{FragmentStream, GenerationParams, InferenceProvider, ProviderError};

/// Ollama inference provider.
///
/// Streams completions from an Ollama server's `/api/generate` endpoint.
pub struct OllamaProvider {
    http_client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Communication(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// One NDJSON line of a streaming `/api/generate` response.
#[derive(Debug, Deserialize)]
struct OllamaGenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Response from /api/tags endpoint.
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModelInfo>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelInfo {
    name: String,
}

// ============================================================================
// InferenceProvider implementation
// ============================================================================

#[async_trait]
impl InferenceProvider for OllamaProvider {
    fn provider_type(&self) -> &'static str {
        "ollama"
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<FragmentStream, ProviderError> {
        let request = OllamaGenerateRequest {
            model,
            prompt,
            stream: true,
            options: OllamaOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            },
        };

        let url = format!("{}/api/generate", self.base_url);

        tracing::debug!("Sending streaming generate request to Ollama: {} model={}", url, model);

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Communication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream { status, body });
        }

        Ok(ndjson_fragments(response.bytes_stream()))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Communication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream { status, body });
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

// ============================================================================
// NDJSON decoding
// ============================================================================

struct NdjsonState<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    eof: bool,
    finished: bool,
}

enum Line {
    Skip,
    Text(String),
    Done(String),
}

/// Turn a chunked NDJSON body into a stream of text fragments.
///
/// Lines may be split across body chunks. The stream ends after the first
/// `done: true` line; a body that ends before that is an error.
fn ndjson_fragments<S, B, E>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = NdjsonState {
        body: Box::pin(body),
        buffer: Vec::new(),
        eof: false,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match parse_line(&line[..pos]) {
                    Ok(Line::Skip) => continue,
                    Ok(Line::Text(text)) => return Some((Ok(text), state)),
                    Ok(Line::Done(text)) => {
                        state.finished = true;
                        if text.is_empty() {
                            return None;
                        }
                        return Some((Ok(text), state));
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            if state.eof {
                state.finished = true;
                return Some((
                    Err(ProviderError::InvalidResponse(
                        "stream ended before completion".to_string(),
                    )),
                    state,
                ));
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(ProviderError::Communication(e.to_string())), state));
                }
                None => {
                    state.eof = true;
                    // Flush a trailing line that lacks a newline
                    if !state.buffer.iter().all(u8::is_ascii_whitespace) {
                        state.buffer.push(b'\n');
                    } else {
                        state.buffer.clear();
                    }
                }
            }
        }
    }))
}

fn parse_line(line: &[u8]) -> Result<Line, ProviderError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(Line::Skip);
    }

    let chunk: OllamaGenerateChunk = serde_json::from_slice(line)
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Generation(error));
    }

    if chunk.done {
        Ok(Line::Done(chunk.response))
    } else if chunk.response.is_empty() {
        Ok(Line::Skip)
    } else {
        Ok(Line::Text(chunk.response))
    }
}

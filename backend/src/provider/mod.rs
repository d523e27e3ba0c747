//! Inference provider abstraction layer.
//!
//! This module defines the `InferenceProvider` trait that hides the remote
//! model-serving backend behind a "model + prompt in, lazy fragments out"
//! contract consumed by the batching engine.

mod ollama;

pub use ollama::OllamaProvider;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

/// Lazy, finite sequence of generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Sampling parameters forwarded with every upstream call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 500,
        }
    }
}

/// Errors raised by an inference provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider communication error: {0}")]
    Communication(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Generation failed: {0}")]
    Generation(String),
}

/// Primary trait for inference providers.
///
/// Implementations are expected to be cheap to call concurrently; the batching
/// engine issues one `generate` call per queued prompt of a batch at once.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Unique identifier for this provider type (e.g., "ollama").
    fn provider_type(&self) -> &'static str;

    /// Start a streaming generation for `prompt` on `model`.
    ///
    /// Failing to start the call is reported through the outer `Result`;
    /// failures after the first fragment are reported as an `Err` item.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<FragmentStream, ProviderError>;

    /// List the model identifiers the provider can serve.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
}

//! Test helpers: an in-process provider with scripted per-prompt behaviour.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::provider::{FragmentStream, GenerationParams, InferenceProvider, ProviderError};

/// What the scripted provider does for a given prompt.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream the given fragments, then end.
    Fragments(Vec<String>),
    /// Stream the given fragments, then fail with the message.
    FailAfter(Vec<String>, String),
    /// Fail the call before any fragment.
    Reject(String),
    /// Panic inside the call.
    Panic,
    /// Stream `tick-N` fragments forever.
    Endless,
}

impl Script {
    pub fn fragments(parts: &[&str]) -> Self {
        Script::Fragments(parts.iter().map(|p| p.to_string()).collect())
    }
}

/// Provider whose output is scripted per prompt.
///
/// Prompts without a script are echoed back as `<prompt>#0`, `<prompt>#1`,
/// `<prompt>#2`, so every request's fragments are distinguishable.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: HashMap<String, Script>,
    fragment_delay: Duration,
    calls: Mutex<Vec<(String, String, GenerationParams)>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    dropped_streams: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, prompt: &str, script: Script) -> Self {
        self.scripts.insert(prompt.to_string(), script);
        self
    }

    /// Delay before each fragment is yielded.
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// `(model, prompt, params)` of every `generate` call so far.
    pub fn calls(&self) -> Vec<(String, String, GenerationParams)> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of simultaneously open fragment streams.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of fragment streams dropped so far, exhausted or not.
    pub fn dropped_streams(&self) -> usize {
        self.dropped_streams.load(Ordering::SeqCst)
    }

    fn script_for(&self, prompt: &str) -> Script {
        self.scripts.get(prompt).cloned().unwrap_or_else(|| {
            Script::Fragments((0..3).map(|i| format!("{}#{}", prompt, i)).collect())
        })
    }
}

/// Tracks an open fragment stream.
struct StreamGuard {
    in_flight: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn provider_type(&self) -> &'static str {
        "scripted"
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<FragmentStream, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), prompt.to_string(), *params));

        let items: Box<dyn Iterator<Item = Result<String, ProviderError>> + Send> =
            match self.script_for(prompt) {
                Script::Fragments(parts) => Box::new(parts.into_iter().map(Ok)),
                Script::FailAfter(parts, message) => Box::new(
                    parts
                        .into_iter()
                        .map(Ok)
                        .chain(std::iter::once(Err(ProviderError::Generation(message)))),
                ),
                Script::Reject(message) => return Err(ProviderError::Communication(message)),
                Script::Panic => panic!("scripted provider panic for prompt {}", prompt),
                Script::Endless => Box::new((0u64..).map(|i| Ok(format!("tick-{}", i)))),
            };

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let guard = StreamGuard {
            in_flight: self.in_flight.clone(),
            dropped: self.dropped_streams.clone(),
        };

        let delay = self.fragment_delay;
        let fragments = stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            item
        });

        Ok(Box::pin(fragments.map(move |item| {
            let _guard = &guard;
            item
        })))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["scripted".to_string()])
    }
}

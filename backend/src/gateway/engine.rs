//! Batching engine: the per-process registry of model queues and workers.
//!
//! The engine is created once by the composition root and shared with the
//! transport layer. It owns one queue and one supervised worker per model,
//! created at startup for the configured models and lazily for any other
//! model on first use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::batch_dispatcher::BatchDispatcher;
use super::batch_queue::{BatchQueueConfig, ModelQueue};
use super::sink::ResponseStream;
use super::worker::{run_worker, supervise};
use crate::error::Result;
use crate::provider::{GenerationParams, InferenceProvider};

/// Tuning knobs for the batching engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue: BatchQueueConfig,
    /// Pause after a collection cycle that produced no requests.
    pub idle_backoff: Duration,
    /// Pause before restarting a crashed worker.
    pub restart_delay: Duration,
    /// Abort upstream calls whose consumer disconnected.
    pub cancel_on_disconnect: bool,
    pub params: GenerationParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: BatchQueueConfig::default(),
            idle_backoff: Duration::from_millis(100),
            restart_delay: Duration::from_secs(1),
            cancel_on_disconnect: false,
            params: GenerationParams::default(),
        }
    }
}

struct ModelEntry {
    queue: Arc<ModelQueue>,
    worker: JoinHandle<()>,
}

/// Request-batching and streaming-fanout engine.
pub struct BatchEngine {
    config: EngineConfig,
    dispatcher: Arc<BatchDispatcher>,
    models: RwLock<HashMap<String, ModelEntry>>,
}

impl BatchEngine {
    pub fn new(provider: Arc<dyn InferenceProvider>, config: EngineConfig) -> Self {
        let dispatcher = BatchDispatcher::new(provider, config.params)
            .with_cancel_on_disconnect(config.cancel_on_disconnect);

        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a queue and worker for each model that does not have one yet.
    pub async fn start_workers<I, S>(&self, models: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for model in models {
            self.queue_for(model.as_ref()).await;
        }
    }

    /// Enqueue a prompt for `model` and return the stream of its response.
    pub async fn submit(&self, model: &str, prompt: impl Into<String>) -> Result<ResponseStream> {
        self.queue_for(model).await.submit(prompt)
    }

    /// Submit a prompt and stream the response fragments.
    ///
    /// The stream ends after the last fragment. Any failure, including being
    /// rejected by a full queue, is yielded once as the final item.
    pub async fn stream(
        &self,
        model: &str,
        prompt: impl Into<String>,
    ) -> BoxStream<'static, Result<String>> {
        match self.submit(model, prompt).await {
            Ok(response) => response.boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    /// Models that currently have a queue, sorted by name.
    pub async fn models(&self) -> Vec<String> {
        let models = self.models.read().await;
        let mut names: Vec<String> = models.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pending request count per model, sorted by model name.
    pub async fn queue_depths(&self) -> Vec<(String, usize)> {
        let models = self.models.read().await;
        let mut depths: Vec<(String, usize)> = models
            .iter()
            .map(|(model, entry)| (model.clone(), entry.queue.pending_count()))
            .collect();
        depths.sort();
        depths
    }

    /// Stop every worker. Requests still queued are dropped; their streams
    /// end with an error.
    pub async fn shutdown(&self) {
        let mut models = self.models.write().await;
        for (model, entry) in models.drain() {
            tracing::info!("Stopping worker for model {}", model);
            entry.worker.abort();
        }
    }

    async fn queue_for(&self, model: &str) -> Arc<ModelQueue> {
        {
            let models = self.models.read().await;
            if let Some(entry) = models.get(model) {
                return entry.queue.clone();
            }
        }

        // Re-check under the write lock; another request may have won the race
        let mut models = self.models.write().await;
        models
            .entry(model.to_string())
            .or_insert_with(|| self.start_model(model))
            .queue
            .clone()
    }

    fn start_model(&self, model: &str) -> ModelEntry {
        let queue = Arc::new(ModelQueue::new(model, self.config.queue.clone()));

        let worker = {
            let queue = queue.clone();
            let dispatcher = self.dispatcher.clone();
            let idle_backoff = self.config.idle_backoff;
            tokio::spawn(supervise(
                model.to_string(),
                self.config.restart_delay,
                move || run_worker(queue.clone(), dispatcher.clone(), idle_backoff),
            ))
        };

        tracing::info!(
            "Started worker for model {} (batch_timeout={:?}, max_batch_size={})",
            model,
            self.config.queue.batch_timeout,
            self.config.queue.max_batch_size
        );

        ModelEntry { queue, worker }
    }
}

impl Drop for BatchEngine {
    fn drop(&mut self) {
        for entry in self.models.get_mut().values() {
            entry.worker.abort();
        }
    }
}

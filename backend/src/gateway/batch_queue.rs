//! Per-model request queue and batch collection.
//!
//! Every model gets one [`ModelQueue`]. Callers `submit` prompts from any task;
//! the model's worker repeatedly `collect`s batches that are cut either when
//! `max_batch_size` requests arrived or when `batch_timeout` elapsed,
//! whichever comes first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use super::sink::{response_channel, ResponseSink, ResponseStream};
use crate::error::{GatewayError, Result};

/// Upper bound on the capacity reserved up front for one batch.
const MAX_PREALLOCATED: usize = 64;

/// Configuration for the batch queue.
#[derive(Debug, Clone)]
pub struct BatchQueueConfig {
    /// Maximum time a collection cycle waits for the batch to fill.
    pub batch_timeout: Duration,
    /// Maximum number of requests per batch.
    pub max_batch_size: usize,
    /// Maximum number of requests waiting in one model's queue.
    /// `None` leaves the queue unbounded.
    pub max_queue_depth: Option<usize>,
}

impl BatchQueueConfig {
    pub fn new(batch_timeout: Duration, max_batch_size: usize) -> Self {
        Self {
            batch_timeout,
            max_batch_size: max_batch_size.max(1),
            max_queue_depth: None,
        }
    }

    pub fn with_max_queue_depth(mut self, max_queue_depth: Option<usize>) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 5)
    }
}

/// A queued prompt waiting to be dispatched.
#[derive(Debug)]
pub struct PendingRequest {
    /// Identifier used in logs.
    pub id: Uuid,
    /// The prompt text.
    pub prompt: String,
    /// Channel for streaming the response back to the caller.
    pub sink: ResponseSink,
    /// When this request was enqueued.
    pub enqueued_at: Instant,
}

/// Queue of pending requests for a single model.
///
/// Multi-producer, single-consumer: any number of tasks may `submit`, while
/// `collect` is serialized so only one worker drains the queue at a time.
pub struct ModelQueue {
    model: String,
    config: BatchQueueConfig,
    tx: mpsc::UnboundedSender<PendingRequest>,
    rx: Mutex<mpsc::UnboundedReceiver<PendingRequest>>,
    depth: AtomicUsize,
}

impl ModelQueue {
    pub fn new(model: impl Into<String>, config: BatchQueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            model: model.into(),
            config,
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Number of requests waiting to be collected.
    pub fn pending_count(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Enqueue a prompt and return the stream its response will arrive on.
    ///
    /// Never waits. Fails only when a queue depth limit is configured and
    /// already reached.
    pub fn submit(&self, prompt: impl Into<String>) -> Result<ResponseStream> {
        self.reserve_slot()?;

        let (sink, stream) = response_channel();
        let request = PendingRequest {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            sink,
            enqueued_at: Instant::now(),
        };

        tracing::debug!(model = %self.model, request_id = %request.id, "Request enqueued");

        if self.tx.send(request).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::Internal(format!(
                "queue for model '{}' is closed",
                self.model
            )));
        }

        Ok(stream)
    }

    fn reserve_slot(&self) -> Result<()> {
        let Some(max) = self.config.max_queue_depth else {
            self.depth.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };

        self.depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                (depth < max).then_some(depth + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                tracing::warn!("Rejecting request for model {}: queue full ({})", self.model, max);
                GatewayError::QueueFull {
                    model: self.model.clone(),
                    max,
                }
            })
    }

    /// Collect the next batch.
    ///
    /// Waits at most `batch_timeout` from the start of the call and returns
    /// as soon as `max_batch_size` requests have been taken. An empty batch
    /// means nothing arrived within the window.
    pub async fn collect(&self) -> Vec<PendingRequest> {
        let mut rx = self.rx.lock().await;
        // No deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(self.config.batch_timeout);
        let mut batch = Vec::with_capacity(self.config.max_batch_size.min(MAX_PREALLOCATED));

        while batch.len() < self.config.max_batch_size {
            let next = match deadline {
                Some(deadline) => timeout_at(deadline, rx.recv()).await.ok().flatten(),
                None => rx.recv().await,
            };
            match next {
                Some(request) => {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    batch.push(request);
                }
                // Deadline passed, or every sender is gone
                None => break,
            }
        }

        batch
    }
}

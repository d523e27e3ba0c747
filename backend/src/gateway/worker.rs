//! Background worker loop, one per model.
//!
//! A worker alternates between collecting a batch and handing it to the
//! dispatcher as a detached task, so a slow batch never delays the next
//! collection cycle. Workers run under [`supervise`], which restarts them if
//! they panic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::batch_dispatcher::BatchDispatcher;
use super::batch_queue::ModelQueue;

/// Run the collect/dispatch cycle for one model forever.
pub async fn run_worker(
    queue: Arc<ModelQueue>,
    dispatcher: Arc<BatchDispatcher>,
    idle_backoff: Duration,
) {
    let model = queue.model().to_string();
    tracing::info!("Worker started for model {}", model);

    loop {
        let batch = queue.collect().await;

        if batch.is_empty() {
            tokio::time::sleep(idle_backoff).await;
            continue;
        }

        let dispatcher = dispatcher.clone();
        let model = model.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&model, batch).await;
        });
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keep a worker alive.
///
/// `make_worker` is called to start the worker and again after every panic
/// or unexpected exit, with `restart_delay` in between. Aborting the task
/// running `supervise` also aborts the current worker.
pub async fn supervise<F, Fut>(model: String, restart_delay: Duration, mut make_worker: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut restarts: u64 = 0;

    loop {
        let mut worker = AbortOnDrop(tokio::spawn(make_worker()));

        match (&mut worker.0).await {
            Ok(()) => {
                tracing::warn!("Worker for model {} exited unexpectedly", model);
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!("Worker for model {} cancelled", model);
                return;
            }
            Err(e) => {
                tracing::error!("Worker for model {} panicked: {}", model, e);
            }
        }

        restarts += 1;
        tracing::info!(
            "Restarting worker for model {} in {:?} (restart #{})",
            model,
            restart_delay,
            restarts
        );
        tokio::time::sleep(restart_delay).await;
    }
}

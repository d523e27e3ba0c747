//! Batch dispatcher for streaming queued requests upstream.
//!
//! Every request of a batch gets its own upstream call running in its own
//! task. Fragments are forwarded to that request's sink only, and a failing
//! call is reported on its own sink without touching its siblings.

use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::StreamExt;

use super::batch_queue::PendingRequest;
use crate::provider::{GenerationParams, InferenceProvider};

/// Per-batch outcome counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Requests whose upstream stream ran to completion.
    pub completed: usize,
    /// Requests that received an error before end-of-stream.
    pub failed: usize,
    /// Requests abandoned because their consumer disconnected.
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Dispatches collected batches to the inference provider.
pub struct BatchDispatcher {
    provider: Arc<dyn InferenceProvider>,
    params: GenerationParams,
    /// Stop pulling upstream fragments once a request's consumer is gone.
    cancel_on_disconnect: bool,
}

impl BatchDispatcher {
    pub fn new(provider: Arc<dyn InferenceProvider>, params: GenerationParams) -> Self {
        Self {
            provider,
            params,
            cancel_on_disconnect: false,
        }
    }

    pub fn with_cancel_on_disconnect(mut self, enabled: bool) -> Self {
        self.cancel_on_disconnect = enabled;
        self
    }

    /// Stream every request of `batch` concurrently and wait for all of them.
    ///
    /// Individual failures are delivered on the failing request's sink and
    /// only counted here.
    pub async fn dispatch(&self, model: &str, batch: Vec<PendingRequest>) -> DispatchSummary {
        let batch_size = batch.len();
        tracing::info!("Dispatching batch of {} requests for model {}", batch_size, model);

        let tasks: Vec<_> = batch
            .into_iter()
            .map(|request| {
                tokio::spawn(stream_single(
                    self.provider.clone(),
                    model.to_string(),
                    self.params,
                    request,
                    self.cancel_on_disconnect,
                ))
            })
            .collect();

        let mut summary = DispatchSummary::default();
        for result in join_all(tasks).await {
            match result {
                Ok(RequestOutcome::Completed) => summary.completed += 1,
                Ok(RequestOutcome::Failed) => summary.failed += 1,
                Ok(RequestOutcome::Cancelled) => summary.cancelled += 1,
                Err(e) => {
                    // The sink was dropped with the task, which already ended its stream
                    tracing::error!("Request task for model {} died: {}", model, e);
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            model = %model,
            batch_size,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Batch finished"
        );

        summary
    }
}

/// Stream one request's upstream call into its sink.
async fn stream_single(
    provider: Arc<dyn InferenceProvider>,
    model: String,
    params: GenerationParams,
    request: PendingRequest,
    cancel_on_disconnect: bool,
) -> RequestOutcome {
    let PendingRequest {
        id,
        prompt,
        sink,
        enqueued_at,
    } = request;

    if cancel_on_disconnect && sink.is_closed() {
        tracing::debug!(model = %model, request_id = %id, "Consumer gone before dispatch");
        sink.finish();
        return RequestOutcome::Cancelled;
    }

    tracing::debug!(
        model = %model,
        request_id = %id,
        queued_ms = enqueued_at.elapsed().as_millis() as u64,
        "Starting upstream stream"
    );

    let mut fragments = match provider.generate(&model, &prompt, &params).await {
        Ok(fragments) => fragments,
        Err(e) => {
            tracing::warn!("Upstream call failed for model {} (request {}): {}", model, id, e);
            sink.fail(format!("Error: {}", e));
            return RequestOutcome::Failed;
        }
    };

    loop {
        let next = if cancel_on_disconnect {
            tokio::select! {
                biased;
                _ = sink.closed() => {
                    tracing::debug!(model = %model, request_id = %id, "Consumer disconnected, cancelling upstream stream");
                    sink.finish();
                    return RequestOutcome::Cancelled;
                }
                next = fragments.next() => next,
            }
        } else {
            fragments.next().await
        };

        match next {
            Some(Ok(text)) => {
                // Without cancellation the call runs to completion even if nobody listens
                sink.send_fragment(text);
            }
            Some(Err(e)) => {
                tracing::warn!("Upstream stream failed for model {} (request {}): {}", model, id, e);
                sink.fail(format!("Error: {}", e));
                return RequestOutcome::Failed;
            }
            None => break,
        }
    }

    sink.finish();
    RequestOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::Instant;
    use uuid::Uuid;

    use crate::error::GatewayError;
    use crate::gateway::sink::{response_channel, ResponseStream};
    use crate::test_util::{Script, ScriptedProvider};

    fn pending(prompt: &str) -> (PendingRequest, ResponseStream) {
        let (sink, stream) = response_channel();
        let request = PendingRequest {
            id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            sink,
            enqueued_at: Instant::now(),
        };
        (request, stream)
    }

    fn batch(prompts: &[&str]) -> (Vec<PendingRequest>, Vec<ResponseStream>) {
        prompts.iter().map(|p| pending(p)).unzip()
    }

    async fn drain(stream: ResponseStream) -> Vec<Result<String, GatewayError>> {
        stream.collect().await
    }

    fn echo(prompt: &str) -> Vec<Result<String, GatewayError>> {
        (0..3).map(|i| Ok(format!("{}#{}", prompt, i))).collect()
    }

    fn dispatcher(provider: Arc<ScriptedProvider>) -> BatchDispatcher {
        BatchDispatcher::new(provider, GenerationParams::default())
    }

    #[tokio::test]
    async fn test_good_and_bad_in_same_batch() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_script("good", Script::fragments(&["Hello", " there"]))
                .with_script("bad", Script::Reject("connection refused".to_string())),
        );
        let (requests, mut streams) = batch(&["good", "bad"]);

        let summary = dispatcher(provider).dispatch("qwen", requests).await;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);

        let bad = drain(streams.pop().unwrap()).await;
        let good = drain(streams.pop().unwrap()).await;

        assert_eq!(good, vec![Ok("Hello".to_string()), Ok(" there".to_string())]);
        assert_eq!(bad.len(), 1);
        match &bad[0] {
            Err(GatewayError::Upstream(message)) => {
                assert!(message.starts_with("Error: "));
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_third_failure_does_not_affect_siblings() {
        let provider = Arc::new(
            ScriptedProvider::new().with_script("p2", Script::Reject("upstream 500".to_string())),
        );
        let prompts = ["p0", "p1", "p2", "p3", "p4"];
        let (requests, streams) = batch(&prompts);

        let summary = dispatcher(provider).dispatch("qwen", requests).await;
        assert_eq!(
            summary,
            DispatchSummary {
                completed: 4,
                failed: 1,
                cancelled: 0
            }
        );

        for (prompt, stream) in prompts.iter().zip(streams) {
            let items = drain(stream).await;
            if *prompt == "p2" {
                assert_eq!(items.len(), 1);
                assert!(items[0].is_err());
            } else {
                assert_eq!(items, echo(prompt));
            }
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_earlier_fragments() {
        let provider = Arc::new(ScriptedProvider::new().with_script(
            "flaky",
            Script::FailAfter(vec!["a".to_string(), "b".to_string()], "reset by peer".to_string()),
        ));
        let (request, stream) = pending("flaky");

        let summary = dispatcher(provider).dispatch("qwen", vec![request]).await;
        assert_eq!(summary.failed, 1);

        let items = drain(stream).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Ok("a".to_string()));
        assert_eq!(items[1], Ok("b".to_string()));
        assert!(matches!(&items[2], Err(GatewayError::Upstream(m)) if m.contains("reset by peer")));
    }

    #[tokio::test]
    async fn test_panicking_call_is_contained() {
        let provider = Arc::new(ScriptedProvider::new().with_script("boom", Script::Panic));
        let (requests, mut streams) = batch(&["ok", "boom"]);

        let summary = dispatcher(provider).dispatch("qwen", requests).await;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);

        let boom = drain(streams.pop().unwrap()).await;
        let ok = drain(streams.pop().unwrap()).await;
        assert_eq!(ok, echo("ok"));
        assert_eq!(boom.len(), 1);
        assert!(boom[0].is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_streams_stay_isolated_and_ordered() {
        let provider = Arc::new(
            ScriptedProvider::new().with_fragment_delay(Duration::from_millis(20)),
        );
        let prompts = ["alpha", "beta", "gamma", "delta", "epsilon"];
        let (requests, streams) = batch(&prompts);

        let start = Instant::now();
        let summary = dispatcher(provider.clone()).dispatch("qwen", requests).await;
        let elapsed = start.elapsed();

        assert_eq!(summary.completed, 5);
        assert_eq!(provider.max_in_flight(), 5);
        // Three fragments at 20ms each, run side by side rather than back to back
        assert!(elapsed < Duration::from_millis(100), "took {:?}", elapsed);

        for (prompt, stream) in prompts.iter().zip(streams) {
            assert_eq!(drain(stream).await, echo(prompt));
        }
    }

    #[tokio::test]
    async fn test_generation_params_forwarded() {
        let provider = Arc::new(ScriptedProvider::new());
        let params = GenerationParams {
            temperature: 0.2,
            max_tokens: 64,
        };
        let dispatcher = BatchDispatcher::new(provider.clone(), params);
        let (request, _stream) = pending("hi");

        dispatcher.dispatch("llama-3-70b", vec![request]).await;

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "llama-3-70b");
        assert_eq!(calls[0].1, "hi");
        assert_eq!(calls[0].2, params);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_upstream_when_enabled() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_script("forever", Script::Endless)
                .with_fragment_delay(Duration::from_millis(10)),
        );
        let dispatcher = dispatcher(provider.clone()).with_cancel_on_disconnect(true);
        let (request, mut stream) = pending("forever");

        let consumer = tokio::spawn(async move {
            let first = stream.next().await;
            drop(stream);
            first
        });

        let summary = dispatcher.dispatch("qwen", vec![request]).await;
        assert_eq!(summary.cancelled, 1);
        assert_eq!(provider.dropped_streams(), 1);
        assert_eq!(consumer.await.unwrap(), Some(Ok("tick-0".to_string())));
    }

    #[tokio::test]
    async fn test_disconnect_without_cancellation_runs_to_completion() {
        let provider = Arc::new(ScriptedProvider::new());
        let (request, stream) = pending("abandoned");
        drop(stream);

        let summary = dispatcher(provider.clone()).dispatch("qwen", vec![request]).await;
        assert_eq!(summary.completed, 1);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_consumer_skips_call_when_cancelling() {
        let provider = Arc::new(ScriptedProvider::new());
        let (request, stream) = pending("gone");
        drop(stream);

        let summary = dispatcher(provider.clone())
            .with_cancel_on_disconnect(true)
            .dispatch("qwen", vec![request])
            .await;
        assert_eq!(summary.cancelled, 1);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let provider = Arc::new(ScriptedProvider::new());
        let summary = dispatcher(provider).dispatch("qwen", Vec::new()).await;
        assert_eq!(summary, DispatchSummary::default());
    }
}

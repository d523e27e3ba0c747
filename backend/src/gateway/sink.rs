//! Per-request response channel.
//!
//! A [`ResponseSink`] is written by exactly one dispatcher task and read by the
//! [`ResponseStream`] that was handed back to the submitting caller. Every sink
//! writes exactly one `End`, optionally preceded by a single `Failed`, no
//! matter how the writing task exits.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::GatewayError;

/// Message written to a response sink.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One fragment of generated text.
    Fragment(String),
    /// Terminal failure description. Always followed by `End`.
    Failed(String),
    /// End of stream.
    End,
}

/// Create a connected sink/stream pair.
pub fn response_channel() -> (ResponseSink, ResponseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ResponseSink {
            tx,
            terminated: false,
        },
        ResponseStream {
            events: UnboundedReceiverStream::new(rx),
            finished: false,
        },
    )
}

/// Producer half of a response channel.
#[derive(Debug)]
pub struct ResponseSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    terminated: bool,
}

impl ResponseSink {
    /// Forward a fragment. Returns false once the consumer has gone away.
    pub fn send_fragment(&self, text: String) -> bool {
        self.tx.send(StreamEvent::Fragment(text)).is_ok()
    }

    /// Terminate the stream successfully.
    pub fn finish(mut self) {
        self.terminate(None);
    }

    /// Terminate the stream with a failure description.
    pub fn fail(mut self, message: impl Into<String>) {
        self.terminate(Some(message.into()));
    }

    /// Whether the consumer dropped its half.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the consumer drops its half.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    fn terminate(&mut self, failure: Option<String>) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        // Send errors only mean the consumer is gone
        if let Some(message) = failure {
            let _ = self.tx.send(StreamEvent::Failed(message));
        }
        let _ = self.tx.send(StreamEvent::End);
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        if !self.terminated {
            self.terminate(Some("stream terminated unexpectedly".to_string()));
        }
    }
}

/// Consumer half of a response channel.
///
/// Yields `Ok(fragment)` items until the end-of-stream marker. A failure is
/// yielded once as `Err(GatewayError::Upstream)` and the stream ends right
/// after it. Once exhausted the stream keeps returning `None`.
#[derive(Debug)]
pub struct ResponseStream {
    events: UnboundedReceiverStream<StreamEvent>,
    finished: bool,
}

impl Stream for ResponseStream {
    type Item = Result<String, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut self.events).poll_next(cx)) {
            Some(StreamEvent::Fragment(text)) => Poll::Ready(Some(Ok(text))),
            Some(StreamEvent::Failed(message)) => {
                self.finished = true;
                Poll::Ready(Some(Err(GatewayError::Upstream(message))))
            }
            Some(StreamEvent::End) | None => {
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

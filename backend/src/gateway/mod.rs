//! Request batching and streaming fan-out.
//!
//! This module provides:
//! - Per-model request queues with timeout-or-size batch collection
//! - A dispatcher that streams every request of a batch upstream concurrently
//! - Supervised background workers, one per model
//! - The `BatchEngine` facade tying them together

pub mod batch_dispatcher;
pub mod batch_queue;
mod engine;
pub mod sink;
pub mod worker;

pub use batch_dispatcher::{BatchDispatcher, DispatchSummary};
pub use batch_queue::{BatchQueueConfig, ModelQueue, PendingRequest};
pub use engine::{BatchEngine, EngineConfig};
pub use sink::{response_channel, ResponseSink, ResponseStream, StreamEvent};

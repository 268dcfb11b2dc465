//! The terminal consumer.

use super::failure::DRAIN_STAGE;
use super::runtime::PipelineRuntime;
use crate::core::{FailureKind, StageEnvelope};
use crate::queue::BoundedQueue;
use crate::utils::panic_message;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives every item that made it through all stages.
///
/// The item's scope is still live during the call and is released right
/// after it returns.
#[async_trait]
pub trait CompletionSink<T>: Send + Sync {
    /// Handles one completed item.
    async fn on_completed(&self, envelope: &StageEnvelope<T>) -> anyhow::Result<()>;
}

/// A synchronous closure completion sink.
pub struct FnSink<F> {
    func: F,
}

impl<F> FnSink<F> {
    /// Wraps a closure.
    pub const fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnSink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, F> CompletionSink<T> for FnSink<F>
where
    T: Send + Sync + 'static,
    F: Fn(&StageEnvelope<T>) -> anyhow::Result<()> + Send + Sync,
{
    async fn on_completed(&self, envelope: &StageEnvelope<T>) -> anyhow::Result<()> {
        (self.func)(envelope)
    }
}

/// A sink that discards completed items.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

#[async_trait]
impl<T> CompletionSink<T> for DiscardSink
where
    T: Send + Sync + 'static,
{
    async fn on_completed(&self, _envelope: &StageEnvelope<T>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sole reader of the terminal queue.
pub(crate) struct DrainConsumer<T> {
    queue: Arc<BoundedQueue<StageEnvelope<T>>>,
    sink: Arc<dyn CompletionSink<T>>,
    runtime: Arc<PipelineRuntime>,
}

impl<T> DrainConsumer<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        queue: Arc<BoundedQueue<StageEnvelope<T>>>,
        sink: Arc<dyn CompletionSink<T>>,
        runtime: Arc<PipelineRuntime>,
    ) -> Self {
        Self {
            queue,
            sink,
            runtime,
        }
    }

    /// Delivers items until the terminal queue is closed and empty.
    ///
    /// Reads are not cancellable: items already in the terminal queue are
    /// delivered even during a cancelled shutdown.
    pub(crate) async fn run(self) -> u64 {
        let runtime = &self.runtime;
        let mut delivered = 0_u64;

        while let Some(envelope) = self.queue.read().await {
            let correlation_id = envelope.correlation_id();
            let outcome = AssertUnwindSafe(self.sink.on_completed(&envelope))
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(panic) => Some(format!(
                    "completion sink panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            if let Some(error) = error {
                warn!(
                    pipeline = %runtime.name,
                    correlation_id = %correlation_id,
                    "Completion sink failed: {}",
                    error
                );
                runtime
                    .discard(envelope, DRAIN_STAGE, FailureKind::Sink, &error)
                    .await;
                continue;
            }

            runtime.scopes.release(envelope.scope()).await;
            runtime.hub.record_completed();
            delivered += 1;
            debug!(
                pipeline = %runtime.name,
                correlation_id = %correlation_id,
                elapsed_ms = u64::try_from(envelope.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Item completed"
            );
        }

        info!(pipeline = %runtime.name, delivered, "Drain consumer finished");
        delivered
    }
}

//! Drives one stage: admission, transform, forwarding.

use super::{StageContext, Transform};
use crate::core::{FailureKind, StageEnvelope};
use crate::observability::stage_span;
use crate::pipeline::PipelineRuntime;
use crate::queue::BoundedQueue;
use crate::utils::panic_message;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, Instrument};

/// Moves items from a stage's input queue through its transform into its
/// output queue, with at most `max_concurrency` items in flight.
///
/// A permit is taken before the next item is read, so an item is never
/// pulled from the input queue unless the stage can start on it at once.
/// The permit is held until the item has been written downstream: a full
/// output queue therefore throttles the stage.
pub(crate) struct StageRunner<I, O> {
    worker: Arc<StageWorker<I, O>>,
    input: Arc<BoundedQueue<StageEnvelope<I>>>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

struct StageWorker<I, O> {
    name: Arc<str>,
    output: Arc<BoundedQueue<StageEnvelope<O>>>,
    transform: Arc<dyn Transform<I, O>>,
    runtime: Arc<PipelineRuntime>,
}

impl<I, O> StageRunner<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(
        name: &str,
        input: Arc<BoundedQueue<StageEnvelope<I>>>,
        output: Arc<BoundedQueue<StageEnvelope<O>>>,
        transform: Arc<dyn Transform<I, O>>,
        max_concurrency: usize,
        runtime: Arc<PipelineRuntime>,
    ) -> Self {
        Self {
            worker: Arc::new(StageWorker {
                name: Arc::from(name),
                output,
                transform,
                runtime,
            }),
            input,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    /// Runs until the input queue reports end-of-stream or the pipeline is
    /// cancelled, waits for in-flight items, then closes the output queue.
    pub(crate) async fn run(self) {
        let worker = self.worker;
        let token = worker.runtime.cancellation.clone();
        let mut in_flight = JoinSet::new();

        info!(
            stage = %worker.name,
            max_concurrency = self.max_concurrency,
            "Stage runner started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                () = token.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let envelope = match self.input.read_cancellable(&token).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) | Err(_) => break,
            };

            let item_worker = worker.clone();
            in_flight.spawn(async move { item_worker.process(envelope, permit).await });

            while let Some(result) = in_flight.try_join_next() {
                worker.reap(result);
            }
        }

        let reason = if token.is_cancelled() { "cancelled" } else { "end of stream" };
        debug!(
            stage = %worker.name,
            in_flight = in_flight.len(),
            reason,
            "Stage stopped admitting, waiting for in-flight items"
        );

        while let Some(result) = in_flight.join_next().await {
            worker.reap(result);
        }

        worker.output.close();
        info!(stage = %worker.name, reason, "Stage runner finished");
    }
}

impl<I, O> StageWorker<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn process(&self, envelope: StageEnvelope<I>, _permit: OwnedSemaphorePermit) {
        let runtime = &self.runtime;
        let correlation_id = envelope.correlation_id();
        let (payload, header) = envelope.take_payload();
        let ctx = StageContext::new(
            runtime.name.clone(),
            self.name.clone(),
            header.scope_handle().clone(),
            runtime.cancellation.clone(),
        );

        let timer = runtime.hub.stage_started(&self.name, correlation_id);
        debug!(stage = %self.name, correlation_id = %correlation_id, "Transform started");

        let span = stage_span(&runtime.name, &self.name, correlation_id);
        let outcome = AssertUnwindSafe(self.transform.apply(payload, &ctx).instrument(span))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(output)) => {
                let duration_ms = runtime.hub.stage_finished(timer);
                debug!(
                    stage = %self.name,
                    correlation_id = %correlation_id,
                    duration_ms,
                    "Transform finished"
                );
                self.forward(header.with_payload(output)).await;
                return;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => format!("transform panicked: {}", panic_message(panic.as_ref())),
        };

        runtime.hub.stage_failed(timer, &error);
        runtime
            .discard(header, &self.name, FailureKind::Transform, &error)
            .await;
    }

    async fn forward(&self, envelope: StageEnvelope<O>) {
        let runtime = &self.runtime;

        // Results finished after cancellation are not handed downstream.
        if runtime.cancellation.is_cancelled() {
            let reason = runtime.cancel_reason();
            runtime
                .discard(envelope, &self.name, FailureKind::Cancelled, &reason)
                .await;
            return;
        }

        if let Err(err) = self
            .output
            .write_cancellable(envelope, &runtime.cancellation)
            .await
        {
            let detail = if err.is_closed() {
                "output queue closed".to_string()
            } else {
                runtime.cancel_reason()
            };
            runtime
                .discard(err.into_inner(), &self.name, FailureKind::Cancelled, &detail)
                .await;
        }
    }

    fn reap(&self, result: Result<(), JoinError>) {
        if let Err(err) = result {
            self.runtime.hub.record_task_panic();
            error!(stage = %self.name, "Stage item task failed: {}", err);
        }
    }
}

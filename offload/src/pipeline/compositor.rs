//! A running pipeline and its orderly shutdown.

use super::config::PipelineConfig;
use super::ingress::IngressGate;
use super::runtime::PipelineRuntime;
use crate::cancellation::CancellationToken;
use crate::core::{CorrelationId, FailureKind, StageEnvelope};
use crate::errors::AdmissionError;
use crate::observability::MetricsSnapshot;
use crate::queue::BoundedQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

/// Type-erased access to the items left in a queue at shutdown.
pub(crate) trait StrandedItems: Send + Sync {
    /// Removes every queued item, keeping only its scope and correlation id.
    fn take_stranded(&self) -> Vec<StageEnvelope<()>>;
}

impl<T> StrandedItems for BoundedQueue<StageEnvelope<T>>
where
    T: Send + 'static,
{
    fn take_stranded(&self) -> Vec<StageEnvelope<()>> {
        let mut stranded = Vec::new();
        while let Ok(envelope) = self.try_read() {
            stranded.push(envelope.take_payload().1);
        }
        stranded
    }
}

/// A queue to sweep at shutdown, labelled with the stage that reads it.
pub(crate) struct SweptQueue {
    pub(crate) stage: String,
    pub(crate) queue: Arc<dyn StrandedItems>,
}

/// Outcome of [`Pipeline::shutdown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Final counters, captured after the hub was torn down.
    pub metrics: MetricsSnapshot,
    /// Items left in stage queues and released by the sweep.
    pub swept: usize,
    /// Scopes still live after the sweep and released by the manager.
    pub stragglers: usize,
    /// Whether the pipeline had been cancelled.
    pub cancelled: bool,
    /// The cancellation reason, if any.
    pub cancel_reason: Option<String>,
}

/// A running pipeline.
///
/// Created by [`PipelineBuilder`](super::PipelineBuilder). The topology is
/// fixed once built; the only ways to interact with it are submitting
/// payloads, reading metrics, cancelling, and shutting down.
pub struct Pipeline<In, Out> {
    config: PipelineConfig,
    runtime: Arc<PipelineRuntime>,
    ingress: IngressGate<In>,
    stage_names: Vec<String>,
    runners: Vec<(String, JoinHandle<()>)>,
    drain: JoinHandle<u64>,
    queues: Vec<SweptQueue>,
    _out: PhantomData<fn() -> Out>,
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: PipelineConfig,
        runtime: Arc<PipelineRuntime>,
        ingress: IngressGate<In>,
        stage_names: Vec<String>,
        runners: Vec<(String, JoinHandle<()>)>,
        drain: JoinHandle<u64>,
        queues: Vec<SweptQueue>,
    ) -> Self {
        Self {
            config,
            runtime,
            ingress,
            stage_names,
            runners,
            drain,
            queues,
            _out: PhantomData,
        }
    }

    /// Submits a payload through the pipeline's ingress gate.
    pub async fn submit(&self, payload: In) -> Result<CorrelationId, AdmissionError> {
        self.ingress.submit(payload).await
    }

    /// Returns a cloneable handle for submitting from other tasks.
    #[must_use]
    pub fn ingress(&self) -> IngressGate<In> {
        self.ingress.clone()
    }

    /// Requests cancellation. The first reason wins.
    ///
    /// Stages stop admitting, in-flight transforms run to completion, and
    /// nothing new is forwarded. Call [`shutdown`](Self::shutdown) to wait
    /// for the drain and release stranded scopes.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(pipeline = %self.runtime.name, reason = %reason, "Pipeline cancellation requested");
        self.runtime.cancellation.cancel(reason);
    }

    /// Returns the pipeline's cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.runtime.cancellation.clone()
    }

    /// Returns a live snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.runtime.hub.snapshot()
    }

    /// Returns the stage names in pipeline order.
    #[must_use]
    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the configuration the pipeline was built with.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the number of execution scopes currently live.
    #[must_use]
    pub fn live_scopes(&self) -> usize {
        self.runtime.scopes.live_count()
    }

    /// Stops the pipeline and waits until no item is in flight.
    ///
    /// Closes the ingress gate, lets end-of-stream cascade through every
    /// stage, waits for the drain consumer, then releases the scope of every
    /// item left behind (only possible after cancellation) and reports it as
    /// cancelled. Without a prior [`cancel`](Self::cancel) every accepted
    /// item is processed before this returns.
    pub async fn shutdown(self) -> ShutdownReport {
        let runtime = self.runtime;
        info!(pipeline = %runtime.name, "Pipeline shutting down");

        self.ingress.close();

        for (stage, handle) in self.runners {
            if let Err(err) = handle.await {
                task_failed(&runtime, &stage, &err);
            }
        }
        match self.drain.await {
            Ok(delivered) => info!(pipeline = %runtime.name, delivered, "Drain complete"),
            Err(err) => task_failed(&runtime, super::failure::DRAIN_STAGE, &err),
        }

        let mut swept = 0;
        for SweptQueue { stage, queue } in &self.queues {
            let stranded = queue.take_stranded();
            if stranded.is_empty() {
                continue;
            }
            let reason = runtime.cancel_reason();
            warn!(
                pipeline = %runtime.name,
                stage = %stage,
                count = stranded.len(),
                "Releasing items stranded by shutdown"
            );
            for envelope in stranded {
                runtime
                    .discard(envelope, stage, FailureKind::Cancelled, &reason)
                    .await;
                swept += 1;
            }
        }

        let stragglers = runtime.scopes.release_all(self.config.sweep_timeout()).await;
        if stragglers > 0 {
            warn!(
                pipeline = %runtime.name,
                stragglers,
                "Released scopes not owned by any queue"
            );
        }

        let metrics = runtime.hub.teardown().await;
        let report = ShutdownReport {
            metrics,
            swept,
            stragglers,
            cancelled: runtime.cancellation.is_cancelled(),
            cancel_reason: runtime.cancellation.reason(),
        };

        info!(
            pipeline = %runtime.name,
            submitted = report.metrics.submitted,
            completed = report.metrics.completed,
            swept,
            cancelled = report.cancelled,
            "Pipeline stopped"
        );
        report
    }
}

fn task_failed(runtime: &PipelineRuntime, stage: &str, err: &JoinError) {
    runtime.hub.record_task_panic();
    error!(pipeline = %runtime.name, stage = %stage, "Pipeline task failed: {}", err);
}

impl<In, Out> fmt::Debug for Pipeline<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.config.name)
            .field("stages", &self.stage_names)
            .field("policy", &self.config.ingress_policy)
            .field("cancelled", &self.runtime.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

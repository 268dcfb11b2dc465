//! The pipeline's entry point.

use super::config::IngressPolicy;
use super::failure::INGRESS_STAGE;
use super::runtime::PipelineRuntime;
use crate::core::{CorrelationId, FailureKind, StageEnvelope};
use crate::errors::{AdmissionError, QueueError};
use crate::queue::BoundedQueue;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Accepts caller payloads into the first queue.
///
/// Cheap to clone; every clone feeds the same pipeline. Each accepted item
/// gets a fresh correlation id and its own execution scope before it is
/// queued.
pub struct IngressGate<In> {
    queue: Arc<BoundedQueue<StageEnvelope<In>>>,
    policy: IngressPolicy,
    runtime: Arc<PipelineRuntime>,
}

impl<In> Clone for IngressGate<In> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            policy: self.policy,
            runtime: self.runtime.clone(),
        }
    }
}

impl<In> IngressGate<In>
where
    In: Send + 'static,
{
    pub(crate) fn new(
        queue: Arc<BoundedQueue<StageEnvelope<In>>>,
        policy: IngressPolicy,
        runtime: Arc<PipelineRuntime>,
    ) -> Self {
        Self {
            queue,
            policy,
            runtime,
        }
    }

    /// Submits a payload.
    ///
    /// Returns the item's correlation id once it is in the first queue.
    /// Under [`IngressPolicy::Block`] this suspends while the queue is full;
    /// the other policies never wait for queue space. Scope acquisition may
    /// suspend under every policy.
    pub async fn submit(&self, payload: In) -> Result<CorrelationId, AdmissionError> {
        let runtime = &self.runtime;
        let hub = &runtime.hub;

        if runtime.cancellation.is_cancelled() {
            return Err(AdmissionError::Cancelled(runtime.cancel_reason()));
        }
        if self.queue.is_closed() {
            return Err(AdmissionError::Closed);
        }
        // Refuse before paying for scope acquisition.
        if self.policy == IngressPolicy::Reject && self.queue.is_full() {
            hub.record_rejected();
            return Err(self.rejected());
        }

        let correlation_id = CorrelationId::new();
        let scope = match runtime
            .scopes
            .acquire_cancellable(correlation_id, &runtime.cancellation)
            .await
        {
            Ok(scope) => scope,
            Err(err) if err.cancelled => {
                return Err(AdmissionError::Cancelled(runtime.cancel_reason()));
            }
            Err(err) => {
                runtime.report(
                    INGRESS_STAGE,
                    correlation_id,
                    FailureKind::ScopeAcquisition,
                    &err.message,
                );
                return Err(AdmissionError::ScopeUnavailable(err));
            }
        };

        let envelope = StageEnvelope::new(payload, scope);
        let written = match self.policy {
            IngressPolicy::Block => self
                .queue
                .write_cancellable(envelope, &runtime.cancellation)
                .await
                .map(|()| None),
            IngressPolicy::Reject => self.queue.try_write(envelope).map(|()| None),
            IngressPolicy::DropOldest => self.queue.force_write(envelope),
        };

        match written {
            Ok(evicted) => {
                hub.record_submitted();
                debug!(
                    pipeline = %runtime.name,
                    correlation_id = %correlation_id,
                    "Item admitted"
                );
                if let Some(evicted) = evicted {
                    runtime
                        .discard(
                            evicted,
                            INGRESS_STAGE,
                            FailureKind::Evicted,
                            "evicted by a newer submission",
                        )
                        .await;
                }
                Ok(correlation_id)
            }
            Err(err) => {
                let refusal = match &err {
                    QueueError::Full(_) => {
                        hub.record_rejected();
                        self.rejected()
                    }
                    QueueError::Closed(_) => AdmissionError::Closed,
                    QueueError::Cancelled(_) => {
                        AdmissionError::Cancelled(runtime.cancel_reason())
                    }
                };
                // Never accepted, so no failure report; just give the scope back.
                let envelope = err.into_inner();
                runtime.scopes.release(envelope.scope()).await;
                debug!(
                    pipeline = %runtime.name,
                    correlation_id = %correlation_id,
                    "Item refused: {}",
                    refusal
                );
                Err(refusal)
            }
        }
    }

    fn rejected(&self) -> AdmissionError {
        AdmissionError::Rejected {
            capacity: self.queue.capacity(),
        }
    }

    /// Returns the admission policy.
    #[must_use]
    pub const fn policy(&self) -> IngressPolicy {
        self.policy
    }

    /// Returns the number of items waiting in the first queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Returns true once shutdown has closed the gate.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub(crate) fn close(&self) {
        self.queue.close();
    }
}

impl<In> fmt::Debug for IngressGate<In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngressGate")
            .field("pipeline", &self.runtime.name)
            .field("policy", &self.policy)
            .field("queued", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

//! The unit of work carried by every queue.

use super::CorrelationId;
use crate::scope::ExecutionScope;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A payload together with its execution scope and correlation id.
///
/// Envelopes, not bare payloads, flow through the queues so the scope and the
/// correlation id survive each stage changing the payload type.
#[derive(Debug)]
pub struct StageEnvelope<T> {
    pub(crate) payload: T,
    pub(crate) scope: Arc<ExecutionScope>,
    pub(crate) correlation_id: CorrelationId,
    pub(crate) admitted_at: Instant,
}

impl<T> StageEnvelope<T> {
    pub(crate) fn new(payload: T, scope: Arc<ExecutionScope>) -> Self {
        Self {
            correlation_id: scope.correlation_id(),
            payload,
            scope,
            admitted_at: Instant::now(),
        }
    }

    /// Returns the payload.
    #[must_use]
    pub const fn payload(&self) -> &T {
        &self.payload
    }

    /// Consumes the envelope and returns the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Returns the correlation id.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Returns the item's execution scope.
    #[must_use]
    pub fn scope(&self) -> &ExecutionScope {
        &self.scope
    }

    /// Returns when the item was accepted at ingress.
    #[must_use]
    pub const fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Returns the time since the item was accepted at ingress.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.admitted_at.elapsed()
    }

    /// Replaces the payload, keeping scope, correlation id and admission time.
    #[must_use]
    pub fn with_payload<U>(self, payload: U) -> StageEnvelope<U> {
        StageEnvelope {
            payload,
            scope: self.scope,
            correlation_id: self.correlation_id,
            admitted_at: self.admitted_at,
        }
    }

    /// Transforms the payload, keeping scope, correlation id and admission time.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> StageEnvelope<U>
    where
        F: FnOnce(T) -> U,
    {
        let Self {
            payload,
            scope,
            correlation_id,
            admitted_at,
        } = self;
        StageEnvelope {
            payload: f(payload),
            scope,
            correlation_id,
            admitted_at,
        }
    }

    /// Splits off the payload, leaving a payload-less envelope behind.
    pub(crate) fn take_payload(self) -> (T, StageEnvelope<()>) {
        let Self {
            payload,
            scope,
            correlation_id,
            admitted_at,
        } = self;
        (
            payload,
            StageEnvelope {
                payload: (),
                scope,
                correlation_id,
                admitted_at,
            },
        )
    }

    pub(crate) fn scope_handle(&self) -> &Arc<ExecutionScope> {
        &self.scope
    }
}

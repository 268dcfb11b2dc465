//! Tracing spans and timers for stage execution.

use crate::core::CorrelationId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Span;

/// Creates the span a transform invocation runs inside.
#[must_use]
pub fn stage_span(pipeline: &str, stage: &str, correlation_id: CorrelationId) -> Span {
    tracing::info_span!(
        "offload.stage",
        pipeline = %pipeline,
        stage = %stage,
        correlation_id = %correlation_id,
    )
}

/// Measures one item's time inside one stage.
///
/// Returned by [`ObservabilityHub::stage_started`](super::ObservabilityHub::stage_started)
/// and handed back when the item finishes or fails.
#[derive(Debug)]
pub struct StageTimer {
    start: Instant,
    stage: Arc<str>,
    correlation_id: CorrelationId,
}

impl StageTimer {
    pub(crate) fn start(stage: Arc<str>, correlation_id: CorrelationId) -> Self {
        Self {
            start: Instant::now(),
            stage,
            correlation_id,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Returns the item's correlation id.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Returns when the item entered the stage.
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.start
    }

    /// Returns the time elapsed since the item entered the stage.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

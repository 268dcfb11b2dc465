//! Event sink trait and implementations.

use crate::core::{EventKind, PipelineEvent};
use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

/// Trait for event sinks that can receive pipeline events.
///
/// This is the boundary to an external telemetry backend.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously. May suspend.
    async fn emit(&self, event: &PipelineEvent);

    /// Emits an event without blocking.
    ///
    /// This method should never panic. Errors are logged but suppressed.
    fn try_emit(&self, event: &PipelineEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &PipelineEvent) {}

    fn try_emit(&self, _event: &PipelineEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    /// The log level to use for started/finished events.
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &PipelineEvent) {
        // Failures are always surfaced at warn regardless of level.
        if event.kind == EventKind::Failed {
            warn!(
                pipeline = %event.pipeline,
                stage = %event.stage_name,
                correlation_id = %event.correlation_id,
                duration_ms = ?event.duration_ms,
                error = ?event.error,
                "Event: {}", event.event_type()
            );
            return;
        }

        if self.level == Level::DEBUG {
            debug!(
                pipeline = %event.pipeline,
                stage = %event.stage_name,
                correlation_id = %event.correlation_id,
                duration_ms = ?event.duration_ms,
                "Event: {}", event.event_type()
            );
        } else {
            info!(
                pipeline = %event.pipeline,
                stage = %event.stage_name,
                correlation_id = %event.correlation_id,
                duration_ms = ?event.duration_ms,
                "Event: {}", event.event_type()
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.log_event(event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events for one stage, in emission order.
    #[must_use]
    pub fn events_for_stage(&self, stage: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage_name == stage)
            .cloned()
            .collect()
    }

    /// Returns events of one kind, in emission order.
    #[must_use]
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CorrelationId;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        let event = PipelineEvent::started("jobs", "parse", CorrelationId::new());
        NoOpEventSink.emit(&event).await;
        NoOpEventSink.try_emit(&event);

        let sink = LoggingEventSink::default();
        sink.emit(&event).await;
        sink.try_emit(&PipelineEvent::failed("jobs", "parse", CorrelationId::new(), 1.0, "bad"));
        LoggingEventSink::debug().try_emit(&event);
    }

    #[tokio::test]
    async fn test_collecting_sink_filters() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        let id = CorrelationId::new();
        sink.emit(&PipelineEvent::started("jobs", "parse", id)).await;
        sink.try_emit(&PipelineEvent::finished("jobs", "parse", id, 2.0));
        sink.try_emit(&PipelineEvent::started("jobs", "render", id));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_for_stage("parse").len(), 2);
        assert_eq!(sink.events_of_kind(EventKind::Started).len(), 2);

        sink.clear();
        assert!(sink.is_empty());
    }
}

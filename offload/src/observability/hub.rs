//! Per-pipeline aggregation of stage events and counters.

use super::metrics::{MetricsSnapshot, StageMetrics};
use super::spans::StageTimer;
use crate::core::{CorrelationId, FailureKind, PipelineEvent};
use crate::events::{BufferedEventSink, EventSink};
use crate::pipeline::EventDelivery;
use crate::utils::duration_ms;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct PipelineCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    cancelled: AtomicU64,
    sink_errors: AtomicU64,
    scope_failures: AtomicU64,
    task_panics: AtomicU64,
    events_emitted: AtomicU64,
    events_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Receives started/finished/failed notifications from every stage runner,
/// keeps the counters, and forwards events to the external sink.
///
/// Forwarding never blocks the caller. With [`EventDelivery::Inline`] the
/// sink's `try_emit` runs on the runner's task; with
/// [`EventDelivery::Buffered`] events go through a bounded buffer and are
/// dropped (and counted) when it is full.
pub struct ObservabilityHub {
    pipeline: Arc<str>,
    order: Vec<Arc<str>>,
    stages: DashMap<Arc<str>, Arc<StageMetrics>>,
    counters: PipelineCounters,
    sink: Arc<dyn EventSink>,
    buffer: Option<Arc<BufferedEventSink>>,
    torn_down: AtomicBool,
}

impl ObservabilityHub {
    /// Creates the hub for one pipeline.
    ///
    /// Buffered delivery spawns its worker, so this must run inside a tokio
    /// runtime in that case.
    #[must_use]
    pub fn new(
        pipeline: &str,
        stage_names: &[String],
        sink: Arc<dyn EventSink>,
        delivery: EventDelivery,
    ) -> Self {
        let order: Vec<Arc<str>> = stage_names.iter().map(|s| Arc::from(s.as_str())).collect();
        let stages = DashMap::new();
        for name in &order {
            stages.insert(name.clone(), Arc::new(StageMetrics::default()));
        }

        let buffer = match delivery {
            EventDelivery::Inline => None,
            EventDelivery::Buffered { capacity } => {
                Some(BufferedEventSink::start(sink.clone(), capacity))
            }
        };

        Self {
            pipeline: Arc::from(pipeline),
            order,
            stages,
            counters: PipelineCounters::default(),
            sink,
            buffer,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    fn stage(&self, stage: &str) -> (Arc<str>, Arc<StageMetrics>) {
        if let Some(entry) = self.stages.get(stage) {
            return (entry.key().clone(), entry.value().clone());
        }
        let entry = self.stages.entry(Arc::from(stage)).or_default();
        (entry.key().clone(), entry.value().clone())
    }

    /// Records an item admitted into a stage and emits `started`.
    pub fn stage_started(&self, stage: &str, correlation_id: CorrelationId) -> StageTimer {
        let (name, metrics) = self.stage(stage);
        metrics.record_started();
        self.forward(&PipelineEvent::started(&self.pipeline, &name, correlation_id));
        StageTimer::start(name, correlation_id)
    }

    /// Records a successful transform and emits `finished`.
    ///
    /// Returns the time spent in the stage in milliseconds.
    pub fn stage_finished(&self, timer: StageTimer) -> f64 {
        let elapsed = timer.elapsed();
        let (_, metrics) = self.stage(timer.stage());
        metrics.record_finished(elapsed);

        let ms = duration_ms(elapsed);
        self.forward(&PipelineEvent::finished(
            &self.pipeline,
            timer.stage(),
            timer.correlation_id(),
            ms,
        ));
        ms
    }

    /// Records a failed transform and emits `failed`.
    ///
    /// The item itself is counted once its disposal is recorded with
    /// `record_failure`.
    ///
    /// Returns the time spent in the stage in milliseconds.
    pub fn stage_failed(&self, timer: StageTimer, error: &str) -> f64 {
        let elapsed = timer.elapsed();
        let (_, metrics) = self.stage(timer.stage());
        metrics.record_failed(elapsed);

        let ms = duration_ms(elapsed);
        self.forward(&PipelineEvent::failed(
            &self.pipeline,
            timer.stage(),
            timer.correlation_id(),
            ms,
            error,
        ));
        ms
    }

    pub(crate) fn record_submitted(&self) {
        bump(&self.counters.submitted);
    }

    pub(crate) fn record_completed(&self) {
        bump(&self.counters.completed);
    }

    pub(crate) fn record_rejected(&self) {
        bump(&self.counters.rejected);
    }

    /// Counts an item that left the pipeline without being completed.
    pub(crate) fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Transform => &self.counters.failed,
            FailureKind::ScopeAcquisition => &self.counters.scope_failures,
            FailureKind::Evicted => &self.counters.evicted,
            FailureKind::Cancelled => &self.counters.cancelled,
            FailureKind::Sink => &self.counters.sink_errors,
        };
        bump(counter);
    }

    pub(crate) fn record_task_panic(&self) {
        bump(&self.counters.task_panics);
    }

    fn forward(&self, event: &PipelineEvent) {
        if self.torn_down.load(Ordering::Acquire) {
            bump(&self.counters.events_dropped);
            debug!(
                event_type = event.event_type(),
                stage = %event.stage_name,
                "Event after teardown dropped"
            );
            return;
        }

        match &self.buffer {
            // The buffer keeps its own emit/drop counts.
            Some(buffer) => buffer.try_emit(event),
            None => {
                self.sink.try_emit(event);
                bump(&self.counters.events_emitted);
            }
        }
    }

    /// Returns whether [`teardown`](Self::teardown) has run.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Captures the current counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let (buffered_emitted, buffered_dropped) = self
            .buffer
            .as_ref()
            .map_or((0, 0), |b| (b.metrics().emitted(), b.metrics().dropped()));

        MetricsSnapshot {
            pipeline: self.pipeline.to_string(),
            submitted: load(&c.submitted),
            completed: load(&c.completed),
            failed: load(&c.failed),
            rejected: load(&c.rejected),
            evicted: load(&c.evicted),
            cancelled: load(&c.cancelled),
            sink_errors: load(&c.sink_errors),
            scope_failures: load(&c.scope_failures),
            task_panics: load(&c.task_panics),
            events_emitted: load(&c.events_emitted) + buffered_emitted,
            events_dropped: load(&c.events_dropped) + buffered_dropped,
            torn_down: self.is_torn_down(),
            stages: self
                .order
                .iter()
                .filter_map(|name| self.stages.get(name).map(|m| m.snapshot(name)))
                .collect(),
        }
    }

    /// Stops forwarding, drains the event buffer and returns the final counters.
    pub async fn teardown(&self) -> MetricsSnapshot {
        if !self.torn_down.swap(true, Ordering::AcqRel) {
            if let Some(buffer) = &self.buffer {
                buffer.stop().await;
            }
            debug!(pipeline = %self.pipeline, "Observability hub torn down");
        }
        self.snapshot()
    }
}

impl std::fmt::Debug for ObservabilityHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityHub")
            .field("pipeline", &self.pipeline)
            .field("stages", &self.order)
            .field("buffered", &self.buffer.is_some())
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventKind;
    use crate::events::CollectingEventSink;
    use pretty_assertions::assert_eq;

    fn hub(sink: Arc<CollectingEventSink>, delivery: EventDelivery) -> ObservabilityHub {
        ObservabilityHub::new(
            "jobs",
            &["parse".to_string(), "render".to_string()],
            sink,
            delivery,
        )
    }

    #[tokio::test]
    async fn test_inline_events_and_counters() {
        let sink = Arc::new(CollectingEventSink::new());
        let hub = hub(sink.clone(), EventDelivery::Inline);
        let id = CorrelationId::new();

        let timer = hub.stage_started("parse", id);
        assert_eq!(hub.snapshot().stage("parse").unwrap().in_progress, 1);
        hub.stage_finished(timer);

        let timer = hub.stage_started("render", id);
        hub.stage_failed(timer, "boom");
        hub.record_failure(FailureKind::Transform);

        let kinds: Vec<EventKind> = sink.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Started,
                EventKind::Finished,
                EventKind::Started,
                EventKind::Failed
            ]
        );
        let failed = &sink.events()[3];
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.duration_ms.is_some());

        let snap = hub.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.events_emitted, 4);
        assert_eq!(snap.stages.len(), 2);
        assert_eq!(snap.stage("render").unwrap().failed, 1);
        assert_eq!(snap.stage("parse").unwrap().in_progress, 0);
    }

    #[tokio::test]
    async fn test_buffered_delivery_flushes_on_teardown() {
        let sink = Arc::new(CollectingEventSink::new());
        let hub = hub(sink.clone(), EventDelivery::Buffered { capacity: 64 });

        for _ in 0..3 {
            let timer = hub.stage_started("parse", CorrelationId::new());
            hub.stage_finished(timer);
        }

        let snap = hub.teardown().await;
        assert!(snap.torn_down);
        assert_eq!(sink.len(), 6);
        assert_eq!(snap.events_emitted, 6);
        assert_eq!(snap.events_dropped, 0);
    }

    #[tokio::test]
    async fn test_events_after_teardown_are_dropped() {
        let sink = Arc::new(CollectingEventSink::new());
        let hub = hub(sink.clone(), EventDelivery::Inline);
        hub.teardown().await;

        let timer = hub.stage_started("parse", CorrelationId::new());
        hub.stage_finished(timer);

        assert!(sink.is_empty());
        let snap = hub.snapshot();
        assert_eq!(snap.events_dropped, 2);
        // Counters still move after teardown.
        assert_eq!(snap.stage("parse").unwrap().finished, 1);
    }

    #[tokio::test]
    async fn test_unknown_stage_is_counted_but_not_listed() {
        let hub = hub(Arc::new(CollectingEventSink::new()), EventDelivery::Inline);
        let timer = hub.stage_started("extra", CorrelationId::new());
        hub.stage_finished(timer);
        assert!(hub.snapshot().stage("extra").is_none());
        assert_eq!(hub.snapshot().events_emitted, 2);
    }
}

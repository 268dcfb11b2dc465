//! Bounded, non-blocking event forwarding.

use super::EventSink;
use crate::core::PipelineEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Metrics for backpressure monitoring.
#[derive(Debug, Default)]
pub struct BackpressureMetrics {
    /// Number of events accepted into the buffer.
    emitted: AtomicU64,
    /// Number of events dropped because the buffer was full or closed.
    dropped: AtomicU64,
    /// Number of events delivered to the downstream sink.
    delivered: AtomicU64,
}

impl BackpressureMetrics {
    /// Records an event accepted into the buffer.
    pub fn record_emit(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped event.
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an event handed to the downstream sink.
    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of accepted events.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Returns the number of dropped events.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of delivered events.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Returns the drop rate as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn drop_rate(&self) -> f64 {
        let emitted = self.emitted();
        let dropped = self.dropped();
        let total = emitted + dropped;
        if total == 0 {
            0.0
        } else {
            (dropped as f64 / total as f64) * 100.0
        }
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "emitted": self.emitted(),
            "dropped": self.dropped(),
            "delivered": self.delivered(),
            "drop_rate_percent": (self.drop_rate() * 100.0).round() / 100.0
        })
    }
}

/// An event sink that buffers events for a slow downstream sink.
///
/// `try_emit` never blocks: events arriving while the bounded buffer is full
/// are dropped and counted. A background worker drains the buffer into the
/// downstream sink with `emit`.
pub struct BufferedEventSink {
    /// Event sender; `None` once stopped.
    tx: Mutex<Option<mpsc::Sender<PipelineEvent>>>,
    /// Maximum buffer size.
    capacity: usize,
    /// Backpressure metrics.
    metrics: Arc<BackpressureMetrics>,
    /// Worker task handle.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedEventSink {
    /// Creates the sink and starts its worker.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(downstream: Arc<dyn EventSink>, capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<PipelineEvent>(capacity);
        let metrics = Arc::new(BackpressureMetrics::default());

        let worker_metrics = metrics.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                downstream.emit(&event).await;
                worker_metrics.record_delivery();
            }
            debug!("Event buffer worker drained and stopped");
        });

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            capacity,
            metrics,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stops accepting events and waits for buffered events to be delivered.
    pub async fn stop(&self) {
        // Dropping the sender lets the worker finish once the buffer is empty.
        self.tx.lock().take();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Event buffer worker failed: {}", e);
            }
        }
    }

    /// Returns the number of buffered events.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| self.capacity - tx.capacity())
    }

    /// Returns whether the worker is accepting events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Returns the metrics.
    #[must_use]
    pub fn metrics(&self) -> &BackpressureMetrics {
        &self.metrics
    }
}

#[async_trait]
impl EventSink for BufferedEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) if tx.send(event.clone()).await.is_ok() => self.metrics.record_emit(),
            _ => self.metrics.record_drop(),
        }
    }

    fn try_emit(&self, event: &PipelineEvent) {
        let result = match self.tx.lock().as_ref() {
            Some(tx) => tx.try_send(event.clone()).map_err(|_| ()),
            None => Err(()),
        };

        if result.is_ok() {
            self.metrics.record_emit();
        } else {
            self.metrics.record_drop();
            warn!(
                stage = %event.stage_name,
                correlation_id = %event.correlation_id,
                dropped_total = self.metrics.dropped(),
                "Event dropped due to backpressure"
            );
        }
    }
}

impl std::fmt::Debug for BufferedEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedEventSink")
            .field("capacity", &self.capacity)
            .field("running", &self.is_running())
            .field("dropped", &self.metrics.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CorrelationId;
    use crate::events::CollectingEventSink;
    use std::time::Duration;

    /// A sink that blocks until released, to force the buffer to fill.
    struct GatedSink {
        gate: tokio::sync::Semaphore,
        inner: CollectingEventSink,
    }

    #[async_trait]
    impl EventSink for GatedSink {
        async fn emit(&self, event: &PipelineEvent) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.inner.try_emit(event);
        }

        fn try_emit(&self, event: &PipelineEvent) {
            self.inner.try_emit(event);
        }
    }

    fn event() -> PipelineEvent {
        PipelineEvent::started("jobs", "parse", CorrelationId::new())
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = BackpressureMetrics::default();
        metrics.record_emit();
        metrics.record_emit();
        metrics.record_drop();

        assert_eq!(metrics.emitted(), 2);
        assert_eq!(metrics.dropped(), 1);
        assert!((metrics.drop_rate() - 33.333).abs() < 1.0);
        assert_eq!(metrics.to_dict()["dropped"], 1);
    }

    #[tokio::test]
    async fn test_buffered_sink_delivers_on_stop() {
        let downstream = Arc::new(CollectingEventSink::new());
        let sink = BufferedEventSink::start(downstream.clone(), 16);

        for _ in 0..5 {
            sink.try_emit(&event());
        }
        sink.stop().await;

        assert_eq!(downstream.len(), 5);
        assert_eq!(sink.metrics().delivered(), 5);
        assert!(!sink.is_running());
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_blocking() {
        let downstream = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            inner: CollectingEventSink::new(),
        });
        let sink = BufferedEventSink::start(downstream.clone(), 2);

        // The worker takes one event and blocks on the gate; two more fill the buffer.
        sink.try_emit(&event());
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..5 {
            sink.try_emit(&event());
        }

        assert_eq!(sink.metrics().emitted(), 3);
        assert_eq!(sink.metrics().dropped(), 3);

        downstream.gate.add_permits(16);
        sink.stop().await;
        assert_eq!(downstream.inner.len(), 3);
    }

    #[tokio::test]
    async fn test_emit_after_stop_is_dropped() {
        let sink = BufferedEventSink::start(Arc::new(CollectingEventSink::new()), 4);
        sink.stop().await;
        sink.try_emit(&event());
        sink.emit(&event()).await;
        assert_eq!(sink.metrics().dropped(), 2);
        assert_eq!(sink.queue_size(), 0);
    }
}

//! Counters and serializable snapshots.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters for one stage.
#[derive(Debug, Default)]
pub struct StageMetrics {
    started: AtomicU64,
    in_progress: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    total_duration_us: AtomicU64,
    max_duration_us: AtomicU64,
}

impl StageMetrics {
    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.in_progress.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_finished(&self, elapsed: Duration) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.record_exit(elapsed);
    }

    pub(crate) fn record_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_exit(elapsed);
    }

    fn record_exit(&self, elapsed: Duration) {
        // Every exit is paired with a start, so this never wraps.
        self.in_progress.fetch_sub(1, Ordering::AcqRel);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_duration_us.fetch_add(micros, Ordering::Relaxed);
        self.max_duration_us.fetch_max(micros, Ordering::Relaxed);
    }

    /// Returns the number of items admitted into the stage.
    #[must_use]
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Returns the number of items currently being transformed.
    #[must_use]
    pub fn in_progress(&self) -> u64 {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Returns the number of successful transforms.
    #[must_use]
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    /// Returns the number of failed transforms.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Captures the counters under the given stage name.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self, name: &str) -> StageMetricsSnapshot {
        let finished = self.finished();
        let failed = self.failed();
        let completed = finished + failed;
        let total_us = self.total_duration_us.load(Ordering::Relaxed);
        let mean_duration_ms = if completed == 0 {
            0.0
        } else {
            total_us as f64 / completed as f64 / 1000.0
        };

        StageMetricsSnapshot {
            name: name.to_string(),
            started: self.started(),
            in_progress: self.in_progress(),
            finished,
            failed,
            mean_duration_ms,
            max_duration_ms: self.max_duration_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Point-in-time view of one stage's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetricsSnapshot {
    /// Stage name.
    pub name: String,
    /// Items admitted into the stage.
    pub started: u64,
    /// Items currently being transformed.
    pub in_progress: u64,
    /// Successful transforms.
    pub finished: u64,
    /// Failed transforms.
    pub failed: u64,
    /// Mean time per item in milliseconds.
    pub mean_duration_ms: f64,
    /// Longest time any item spent in the stage, in milliseconds.
    pub max_duration_ms: f64,
}

/// Point-in-time view of a pipeline's counters.
///
/// After a completed shutdown every accepted item is accounted for exactly
/// once: `submitted == completed + failed + evicted + cancelled + sink_errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Pipeline name.
    pub pipeline: String,
    /// Items accepted at ingress.
    pub submitted: u64,
    /// Items delivered to the completion sink.
    pub completed: u64,
    /// Items dropped by a transform error or panic.
    pub failed: u64,
    /// Submissions refused because the ingress queue was full.
    pub rejected: u64,
    /// Items evicted by the `drop_oldest` ingress policy.
    pub evicted: u64,
    /// Items released by cancellation or the shutdown sweep.
    pub cancelled: u64,
    /// Items whose completion sink call failed.
    pub sink_errors: u64,
    /// Submissions refused because no scope could be acquired.
    pub scope_failures: u64,
    /// Stage task panics caught at shutdown.
    pub task_panics: u64,
    /// Events handed to the event sink.
    pub events_emitted: u64,
    /// Events dropped by a full buffer or after teardown.
    pub events_dropped: u64,
    /// Whether the hub has been torn down.
    pub torn_down: bool,
    /// Per-stage counters in pipeline order.
    pub stages: Vec<StageMetricsSnapshot>,
}

impl MetricsSnapshot {
    /// Returns the counters of the named stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageMetricsSnapshot> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns the number of accepted items that reached a terminal outcome.
    #[must_use]
    pub const fn accounted(&self) -> u64 {
        self.completed + self.failed + self.evicted + self.cancelled + self.sink_errors
    }

    /// Returns the number of accepted items without a terminal outcome yet.
    #[must_use]
    pub const fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.accounted())
    }

    /// Converts to a JSON representation.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stage_counters() {
        let metrics = StageMetrics::default();
        metrics.record_started();
        metrics.record_started();
        assert_eq!(metrics.in_progress(), 2);

        metrics.record_finished(Duration::from_millis(4));
        metrics.record_failed(Duration::from_millis(2));

        let snap = metrics.snapshot("parse");
        assert_eq!(snap.started, 2);
        assert_eq!(snap.in_progress, 0);
        assert_eq!(snap.finished, 1);
        assert_eq!(snap.failed, 1);
        assert!((snap.mean_duration_ms - 3.0).abs() < f64::EPSILON);
        assert!((snap.max_duration_ms - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_accounting() {
        let snap = MetricsSnapshot {
            pipeline: "jobs".into(),
            submitted: 10,
            completed: 6,
            failed: 1,
            rejected: 3,
            evicted: 1,
            cancelled: 1,
            sink_errors: 0,
            scope_failures: 0,
            task_panics: 0,
            events_emitted: 0,
            events_dropped: 0,
            torn_down: false,
            stages: vec![StageMetrics::default().snapshot("parse")],
        };
        assert_eq!(snap.accounted(), 9);
        assert_eq!(snap.in_flight(), 1);
        assert!(snap.stage("parse").is_some());
        assert!(snap.stage("render").is_none());
        assert_eq!(snap.to_json()["submitted"], 10);
    }
}

//! Assertions over pipeline events and metrics.

use std::collections::HashMap;

use crate::core::{CorrelationId, EventKind, PipelineEvent};
use crate::observability::MetricsSnapshot;

use super::RecordingScopeProvider;

/// Asserts that, for every item, each stage finished before the next stage
/// started.
///
/// `events` must be in emission order, as collected by a
/// `CollectingEventSink` with inline delivery.
pub fn assert_causal_order(events: &[PipelineEvent], stages: &[&str]) {
    let mut positions: HashMap<(CorrelationId, &str, EventKind), usize> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        positions.insert((event.correlation_id, event.stage_name.as_str(), event.kind), index);
    }

    let items: Vec<CorrelationId> = events
        .iter()
        .filter(|e| e.kind == EventKind::Started && e.stage_name == stages[0])
        .map(|e| e.correlation_id)
        .collect();

    for id in items {
        for pair in stages.windows(2) {
            let finished = positions.get(&(id, pair[0], EventKind::Finished));
            let next_started = positions.get(&(id, pair[1], EventKind::Started));
            if let (Some(finished), Some(started)) = (finished, next_started) {
                assert!(
                    finished < started,
                    "Item {id}: stage '{}' started before stage '{}' finished",
                    pair[1],
                    pair[0]
                );
            } else {
                assert!(
                    next_started.is_none(),
                    "Item {id}: stage '{}' started but stage '{}' never finished",
                    pair[1],
                    pair[0]
                );
            }
        }
    }
}

/// Asserts that every accepted item reached exactly one terminal outcome.
pub fn assert_all_accounted(metrics: &MetricsSnapshot) {
    assert_eq!(
        metrics.submitted,
        metrics.accounted(),
        "Accepted items not accounted for: {metrics:#?}"
    );
    for stage in &metrics.stages {
        assert_eq!(stage.in_progress, 0, "Stage '{}' still has items in progress", stage.name);
    }
}

/// Asserts that the provider released every scope it acquired exactly once.
pub fn assert_scopes_released_once(provider: &RecordingScopeProvider) {
    assert!(
        provider.all_released_exactly_once(),
        "Scopes not released exactly once: acquired {}, releases {}",
        provider.acquired(),
        provider.total_releases()
    );
}

//! Stage lifecycle event record.

use super::{CorrelationId, EventKind};
use serde::{Deserialize, Serialize};

/// An event emitted at a stage boundary.
///
/// Events are purely observational: they are produced by stage runners and
/// forwarded by the observability hub to an event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The pipeline that produced the event.
    pub pipeline: String,

    /// The stage the event refers to.
    pub stage_name: String,

    /// The item the event refers to.
    pub correlation_id: CorrelationId,

    /// Which lifecycle point this is.
    #[serde(rename = "event_kind")]
    pub kind: EventKind,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// Time spent in the transform, for finished and failed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,

    /// Error detail, for failed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineEvent {
    fn new(pipeline: &str, stage_name: &str, correlation_id: CorrelationId, kind: EventKind) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            stage_name: stage_name.to_string(),
            correlation_id,
            kind,
            timestamp: crate::utils::iso_timestamp(),
            duration_ms: None,
            error: None,
        }
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn started(pipeline: &str, stage_name: &str, correlation_id: CorrelationId) -> Self {
        Self::new(pipeline, stage_name, correlation_id, EventKind::Started)
    }

    /// Creates a "stage.finished" event.
    #[must_use]
    pub fn finished(
        pipeline: &str,
        stage_name: &str,
        correlation_id: CorrelationId,
        duration_ms: f64,
    ) -> Self {
        let mut event = Self::new(pipeline, stage_name, correlation_id, EventKind::Finished);
        event.duration_ms = Some(duration_ms);
        event
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn failed(
        pipeline: &str,
        stage_name: &str,
        correlation_id: CorrelationId,
        duration_ms: f64,
        error: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(pipeline, stage_name, correlation_id, EventKind::Failed);
        event.duration_ms = Some(duration_ms);
        event.error = Some(error.into());
        event
    }

    /// Returns the dotted event type (e.g. `stage.started`).
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    /// Converts the event to a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_started() {
        let id = CorrelationId::new();
        let event = PipelineEvent::started("jobs", "parse", id);
        assert_eq!(event.event_type(), "stage.started");
        assert_eq!(event.stage_name, "parse");
        assert!(event.duration_ms.is_none());
        assert!(event.error.is_none());
    }

    #[test]
    fn test_event_finished_has_duration() {
        let event = PipelineEvent::finished("jobs", "parse", CorrelationId::new(), 12.5);
        assert_eq!(event.kind, EventKind::Finished);
        assert_eq!(event.duration_ms, Some(12.5));
    }

    #[test]
    fn test_event_json_shape() {
        let id = CorrelationId::new();
        let json = PipelineEvent::failed("jobs", "render", id, 3.0, "boom").to_json();
        assert_eq!(json["stage_name"], "render");
        assert_eq!(json["event_kind"], "failed");
        assert_eq!(json["correlation_id"], id.to_string());
        assert_eq!(json["error"], "boom");
        assert_eq!(json["duration_ms"], 3.0);
    }

    #[test]
    fn test_started_omits_optional_fields() {
        let json = PipelineEvent::started("jobs", "parse", CorrelationId::new()).to_json();
        assert!(json.get("duration_ms").is_none());
        assert!(json.get("error").is_none());
    }
}

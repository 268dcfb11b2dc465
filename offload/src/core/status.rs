//! Event and failure kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle point a stage event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The item was admitted to the stage and its transform started.
    Started,
    /// The transform succeeded.
    Finished,
    /// The transform returned an error or panicked.
    Failed,
}

impl EventKind {
    /// Returns the dotted event type used by event sinks.
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::Started => "stage.started",
            Self::Finished => "stage.finished",
            Self::Failed => "stage.failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why an item left the pipeline without reaching the terminal sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A stage transform returned an error or panicked.
    Transform,
    /// The execution scope could not be acquired at ingress.
    ScopeAcquisition,
    /// The item was evicted from the ingress queue by `drop_oldest`.
    Evicted,
    /// The item was abandoned because the pipeline was cancelled.
    Cancelled,
    /// The terminal sink rejected the item after it traversed every stage.
    Sink,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transform => write!(f, "transform"),
            Self::ScopeAcquisition => write!(f, "scope_acquisition"),
            Self::Evicted => write!(f, "evicted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

//! Error types for the offload pipeline.
//!
//! Configuration errors are the only fatal kind: they stop a pipeline from
//! being built. Everything that happens to an individual item after that is
//! reported through admission results, the failure hook, or the metrics.

use crate::core::CorrelationId;
use std::fmt;
use thiserror::Error;

/// The main error type for offload operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline topology or configuration is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// An item was refused at the ingress boundary.
    #[error("{0}")]
    Admission(#[from] AdmissionError),

    /// Per-item resources could not be acquired.
    #[error("{0}")]
    Scope(#[from] ScopeError),

    /// A cancellation occurred.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error raised when a pipeline definition fails validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Converts to a JSON representation.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.message,
            "stages": self.stages,
        })
    }
}

/// Outcome of a refused `submit` call.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The first queue is full and the ingress policy is `reject`.
    #[error("Ingress queue is full (capacity {capacity})")]
    Rejected {
        /// Capacity of the ingress queue.
        capacity: usize,
    },

    /// The pipeline no longer accepts items because shutdown has begun.
    #[error("Pipeline is shutting down and no longer accepts items")]
    Closed,

    /// The pipeline was cancelled before or while the caller was suspended.
    #[error("Submission cancelled: {0}")]
    Cancelled(String),

    /// The item's execution scope could not be acquired.
    #[error("{0}")]
    ScopeUnavailable(#[from] ScopeError),
}

impl AdmissionError {
    /// Returns true if the caller may retry the submission later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::ScopeUnavailable(_))
    }
}

/// Error raised when per-item resources cannot be acquired.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Scope acquisition failed for {correlation_id}: {message}")]
pub struct ScopeError {
    /// The item whose scope failed.
    pub correlation_id: CorrelationId,
    /// Detail reported by the provider.
    pub message: String,
    /// Whether acquisition was abandoned because of cancellation.
    pub cancelled: bool,
}

impl ScopeError {
    /// Creates a new scope error.
    #[must_use]
    pub fn new(correlation_id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            message: message.into(),
            cancelled: false,
        }
    }

    /// Creates the error for an acquisition interrupted by cancellation.
    #[must_use]
    pub fn cancelled(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            message: "cancelled during acquisition".to_string(),
            cancelled: true,
        }
    }
}

/// Error returned by queue writes. The rejected item is always handed back.
pub enum QueueError<T> {
    /// The queue is at capacity (non-suspending writes only).
    Full(T),
    /// The queue has been closed.
    Closed(T),
    /// The cancellation token fired while the writer was suspended.
    Cancelled(T),
}

impl<T> QueueError<T> {
    /// Recovers the item that could not be written.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) | Self::Cancelled(item) => item,
        }
    }

    /// Returns true if the queue was full.
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Returns true if the queue was closed.
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// Returns true if the write was cancelled.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

// Manual impls so `T` needs no `Debug` bound, like tokio's `SendError`.
impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Cancelled(_) => f.write_str("Cancelled(..)"),
        }
    }
}

impl<T> fmt::Display for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("queue is full"),
            Self::Closed(_) => f.write_str("queue is closed"),
            Self::Cancelled(_) => f.write_str("queue write cancelled"),
        }
    }
}

impl<T> std::error::Error for QueueError<T> {}

/// Error returned by a non-suspending queue read.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TryReadError {
    /// No item is currently available.
    #[error("queue is empty")]
    Empty,
    /// The queue is closed and fully drained.
    #[error("queue is closed")]
    Closed,
}

/// Returned by cancellable reads when the token fires first.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("queue read cancelled")]
pub struct ReadCancelled;

/// Result type for offload operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

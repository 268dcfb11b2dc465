//! Reporting items that leave the pipeline without completing.

use crate::core::{CorrelationId, FailureKind};
use crate::utils::{iso_timestamp, panic_message};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, warn};

/// Stage label used for failures at the ingress boundary.
pub const INGRESS_STAGE: &str = "ingress";

/// Stage label used for failures at the terminal sink.
pub const DRAIN_STAGE: &str = "drain";

/// Record of one item that was dropped, evicted, or abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Pipeline name.
    pub pipeline: String,
    /// Stage the item was in, or `ingress` / `drain`.
    pub stage: String,
    /// The item's correlation id.
    pub correlation_id: CorrelationId,
    /// What happened to the item.
    pub kind: FailureKind,
    /// Error detail.
    pub error: String,
    /// When the failure was observed (RFC 3339).
    pub timestamp: String,
}

impl FailureReport {
    /// Creates a new failure report stamped with the current time.
    #[must_use]
    pub fn new(
        pipeline: impl Into<String>,
        stage: impl Into<String>,
        correlation_id: CorrelationId,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage: stage.into(),
            correlation_id,
            kind,
            error: error.into(),
            timestamp: iso_timestamp(),
        }
    }
}

/// Receives a report for every item that does not reach the completion sink
/// normally, and for every scope acquisition failure at ingress.
///
/// Called from runner tasks, so implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait FailureHook: Send + Sync {
    /// Handles one failure.
    fn on_failure(&self, report: &FailureReport);
}

/// Logs every failure with `warn!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFailureHook;

impl FailureHook for LoggingFailureHook {
    fn on_failure(&self, report: &FailureReport) {
        warn!(
            pipeline = %report.pipeline,
            stage = %report.stage,
            correlation_id = %report.correlation_id,
            kind = %report.kind,
            "Item failed: {}",
            report.error
        );
    }
}

/// A closure-based failure hook.
pub struct FnFailureHook<F>
where
    F: Fn(&FailureReport) + Send + Sync,
{
    func: F,
}

impl<F> FnFailureHook<F>
where
    F: Fn(&FailureReport) + Send + Sync,
{
    /// Wraps a closure.
    pub const fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Debug for FnFailureHook<F>
where
    F: Fn(&FailureReport) + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFailureHook").finish_non_exhaustive()
    }
}

impl<F> FailureHook for FnFailureHook<F>
where
    F: Fn(&FailureReport) + Send + Sync,
{
    fn on_failure(&self, report: &FailureReport) {
        (self.func)(report);
    }
}

/// Invokes a hook, containing any panic it raises.
pub(crate) fn invoke_hook(hook: &dyn FailureHook, report: &FailureReport) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook.on_failure(report))) {
        error!(
            stage = %report.stage,
            correlation_id = %report.correlation_id,
            "Failure hook panicked: {}",
            panic_message(panic.as_ref())
        );
    }
}

//! Stage-level throughput and latency observability.
//!
//! The [`ObservabilityHub`] is owned by one pipeline instance: it is created
//! when the pipeline is built and torn down by `shutdown`, so several
//! pipelines in one process never share counters.

mod hub;
pub mod logging;
mod metrics;
mod spans;

pub use hub::ObservabilityHub;
pub use logging::{init_test_tracing, init_tracing, LogFormat};
pub use metrics::{MetricsSnapshot, StageMetrics, StageMetricsSnapshot};
pub use spans::{stage_span, StageTimer};

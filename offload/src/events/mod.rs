//! Event sink system for observability.
//!
//! Stage runners never talk to a sink directly: the observability hub
//! forwards [`PipelineEvent`](crate::core::PipelineEvent)s to the configured
//! sink, either inline or through a [`BufferedEventSink`].

mod backpressure;
mod sink;

pub use backpressure::{BackpressureMetrics, BufferedEventSink};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

//! # Offload
//!
//! An in-process, multi-stage asynchronous offload pipeline.
//!
//! Offload moves long-running, multi-step work off a latency-sensitive
//! request path. Work flows one way through a chain of bounded queues and
//! concurrency-limited stages:
//!
//! - **Bounded queues**: every hand-off has a fixed capacity, so a slow stage
//!   pushes back on its upstream instead of buffering without limit
//! - **Per-stage concurrency**: each stage transforms at most `k` items at once
//! - **Execution scopes**: every item carries its own resource bundle, released
//!   exactly once however the item leaves the pipeline
//! - **Observability**: per-stage started/finished/failed events and counters,
//!   owned by the pipeline instance
//! - **Cancellation**: an orderly drain that releases every stranded scope
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use offload::prelude::*;
//!
//! let config = PipelineConfig::new("reports", IngressPolicy::Block, EventDelivery::Inline);
//! let pipeline = PipelineBuilder::<String>::new(config)
//!     .stage(StageDefinition::from_sync_fn("parse", 64, 1, |raw: String| Ok(raw.len())))?
//!     .stage(StageDefinition::from_sync_fn("render", 64, 4, |n: usize| Ok(n.to_string())))?
//!     .build(Arc::new(DiscardSink))?;
//!
//! let id = pipeline.submit("payload".to_string()).await?;
//! let report = pipeline.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod scope;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::core::{CorrelationId, EventKind, FailureKind, PipelineEvent, StageEnvelope};
    pub use crate::errors::{
        AdmissionError, PipelineError, PipelineValidationError, QueueError, ScopeError,
    };
    pub use crate::events::{
        BufferedEventSink, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::observability::{init_tracing, LogFormat, MetricsSnapshot, StageMetricsSnapshot};
    pub use crate::pipeline::{
        CompletionSink, DiscardSink, EventDelivery, FailureHook, FailureReport, FnFailureHook,
        FnSink, IngressGate, IngressPolicy, LoggingFailureHook, Pipeline, PipelineBuilder,
        PipelineConfig, ShutdownReport, StageChain, StageDefinition,
    };
    pub use crate::queue::BoundedQueue;
    pub use crate::scope::{ExecutionScope, NoopScopeProvider, ScopeManager, ScopeProvider};
    pub use crate::stages::{FnTransform, IdentityTransform, StageContext, SyncFnTransform, Transform};
    pub use std::sync::Arc;
}

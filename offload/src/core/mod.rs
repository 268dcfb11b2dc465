//! Core domain model types for the offload pipeline.
//!
//! This module contains the fundamental types that flow through every stage:
//! - Correlation identifiers tying one item's events together
//! - The stage envelope carried by every queue
//! - Lifecycle event kinds and the event record itself

mod correlation;
mod envelope;
mod event;
mod status;

pub use correlation::CorrelationId;
pub use envelope::StageEnvelope;
pub use event::PipelineEvent;
pub use status::{EventKind, FailureKind};

//! Pipeline composition, admission, draining and shutdown.
//!
//! A pipeline is a linear chain of stages connected by bounded queues:
//!
//! ```text
//! IngressGate -> Q1 -> stage 1 -> Q2 -> ... -> stage N -> terminal -> DrainConsumer
//! ```
//!
//! Queue *i* is stage *i*'s input and has that stage's capacity. The
//! terminal queue is read only by the drain consumer.

mod builder;
mod compositor;
mod config;
mod drain;
mod failure;
mod ingress;
mod runtime;

#[cfg(test)]
mod integration_tests;

pub use builder::{PipelineBuilder, StageChain};
pub use compositor::{Pipeline, ShutdownReport};
pub use config::{EventDelivery, IngressPolicy, PipelineConfig, StageDefinition};
pub use drain::{CompletionSink, DiscardSink, FnSink};
pub use failure::{
    FailureHook, FailureReport, FnFailureHook, LoggingFailureHook, DRAIN_STAGE, INGRESS_STAGE,
};
pub use ingress::IngressGate;

pub(crate) use runtime::PipelineRuntime;

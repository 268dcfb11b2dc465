//! Fixtures for testing offload pipelines.
//!
//! This module provides:
//! - Recording scope providers, completion sinks and failure hooks
//! - Delay and failure transforms plus a concurrency probe
//! - Assertions over events and metrics

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_all_accounted, assert_causal_order, assert_scopes_released_once};
pub use fixtures::{
    test_config, test_stage_context, ConcurrencyProbe, DelayTransform, FailingTransform,
    ProbeGuard,
};
pub use mocks::{
    CollectingCompletionSink, CollectingFailureHook, FailingScopeProvider,
    RecordingScopeProvider, UnitOfWork,
};

//! State shared by the ingress gate, the runners and the drain consumer.

use super::failure::{invoke_hook, FailureHook, FailureReport};
use crate::cancellation::CancellationToken;
use crate::core::{CorrelationId, FailureKind, StageEnvelope};
use crate::observability::ObservabilityHub;
use crate::scope::ScopeManager;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct PipelineRuntime {
    pub(crate) name: Arc<str>,
    pub(crate) hub: Arc<ObservabilityHub>,
    pub(crate) scopes: Arc<ScopeManager>,
    pub(crate) failure_hook: Arc<dyn FailureHook>,
    pub(crate) cancellation: Arc<CancellationToken>,
}

impl PipelineRuntime {
    /// Sends a report to the failure hook and counts it.
    pub(crate) fn report(
        &self,
        stage: &str,
        correlation_id: CorrelationId,
        kind: FailureKind,
        error: &str,
    ) {
        let report = FailureReport::new(self.name.as_ref(), stage, correlation_id, kind, error);
        invoke_hook(self.failure_hook.as_ref(), &report);
        self.hub.record_failure(kind);
    }

    /// Removes an accepted item from the pipeline: releases its scope, then
    /// reports it.
    pub(crate) async fn discard<T>(
        &self,
        envelope: StageEnvelope<T>,
        stage: &str,
        kind: FailureKind,
        error: &str,
    ) {
        let correlation_id = envelope.correlation_id();
        let (_, header) = envelope.take_payload();
        self.scopes.release(header.scope_handle()).await;
        self.report(stage, correlation_id, kind, error);
        debug!(
            stage = %stage,
            correlation_id = %correlation_id,
            kind = %kind,
            "Item discarded"
        );
    }

    /// Returns the cancellation reason, or a placeholder if none was given.
    pub(crate) fn cancel_reason(&self) -> String {
        self.cancellation
            .reason()
            .unwrap_or_else(|| "pipeline cancelled".to_string())
    }
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("name", &self.name)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

//! Per-item context handed to transforms.

use crate::cancellation::CancellationToken;
use crate::core::CorrelationId;
use crate::scope::ExecutionScope;
use std::any::Any;
use std::sync::Arc;

/// What a transform can see besides its payload.
///
/// The scope is borrowed: releasing it is the pipeline's job, never the
/// transform's. A clone kept past the end of the transform observes an
/// empty, released scope once the item leaves the pipeline.
#[derive(Debug, Clone)]
pub struct StageContext {
    pipeline: Arc<str>,
    stage: Arc<str>,
    scope: Arc<ExecutionScope>,
    cancellation: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a context for one item in one stage.
    #[must_use]
    pub fn new(
        pipeline: impl Into<Arc<str>>,
        stage: impl Into<Arc<str>>,
        scope: Arc<ExecutionScope>,
        cancellation: Arc<CancellationToken>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage: stage.into(),
            scope,
            cancellation,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Returns the item's correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.scope.correlation_id()
    }

    /// Returns the item's execution scope.
    #[must_use]
    pub fn scope(&self) -> &ExecutionScope {
        &self.scope
    }

    /// Looks up a resource attached to the item's scope.
    #[must_use]
    pub fn resource<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        self.scope.get::<R>()
    }

    /// Returns true once the pipeline has been cancelled.
    ///
    /// Long transforms may poll this to finish early; the pipeline never
    /// interrupts a running transform.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns the pipeline's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Connection(u32);

    #[test]
    fn test_context_exposes_scope_resources() {
        let scope = Arc::new(ExecutionScope::new(4, CorrelationId::new()));
        scope.resources().insert(Connection(11));
        let token = Arc::new(CancellationToken::new());
        let ctx = StageContext::new("jobs", "render", scope.clone(), token.clone());

        assert_eq!(ctx.pipeline(), "jobs");
        assert_eq!(ctx.stage(), "render");
        assert_eq!(ctx.correlation_id(), scope.correlation_id());
        assert_eq!(ctx.resource::<Connection>().unwrap().0, 11);

        assert!(!ctx.is_cancelled());
        token.cancel("stop");
        assert!(ctx.is_cancelled());
    }
}

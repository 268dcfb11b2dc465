//! Transforms and probes for exercising stages.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::core::CorrelationId;
use crate::pipeline::{EventDelivery, IngressPolicy, PipelineConfig};
use crate::scope::ExecutionScope;
use crate::stages::{StageContext, Transform};

/// Tracks how many callers are inside a section at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    entered: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Creates a probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the section; the returned guard leaves it when dropped.
    #[must_use]
    pub fn enter(self: &Arc<Self>) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.entered.fetch_add(1, Ordering::SeqCst);
        ProbeGuard {
            probe: Arc::clone(self),
        }
    }

    /// Returns the number of callers currently inside.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Returns the largest number of simultaneous callers seen.
    #[must_use]
    pub fn max_observed(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Returns the total number of entries.
    #[must_use]
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

/// Leaves a [`ConcurrencyProbe`] section on drop.
#[derive(Debug)]
pub struct ProbeGuard {
    probe: Arc<ConcurrencyProbe>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.probe.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Passes payloads through unchanged after sleeping.
#[derive(Debug, Clone)]
pub struct DelayTransform {
    delay: Duration,
    probe: Option<Arc<ConcurrencyProbe>>,
}

impl DelayTransform {
    /// Creates a transform sleeping `delay` per item.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay, probe: None }
    }

    /// Records concurrent invocations in `probe`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

#[async_trait]
impl<T> Transform<T, T> for DelayTransform
where
    T: Send + 'static,
{
    async fn apply(&self, input: T, _ctx: &StageContext) -> anyhow::Result<T> {
        let _guard = self.probe.as_ref().map(ConcurrencyProbe::enter);
        tokio::time::sleep(self.delay).await;
        Ok(input)
    }
}

/// Fails every payload matching a predicate and passes the rest through.
pub struct FailingTransform<T> {
    predicate: Box<dyn Fn(&T) -> bool + Send + Sync>,
    message: String,
}

impl<T> FailingTransform<T> {
    /// Fails payloads for which `predicate` returns true.
    pub fn when<F>(predicate: F, message: impl Into<String>) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            message: message.into(),
        }
    }

    /// Fails every payload.
    pub fn always(message: impl Into<String>) -> Self {
        Self::when(|_| true, message)
    }
}

impl<T> fmt::Debug for FailingTransform<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailingTransform")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T> Transform<T, T> for FailingTransform<T>
where
    T: Send + 'static,
{
    async fn apply(&self, input: T, _ctx: &StageContext) -> anyhow::Result<T> {
        if (self.predicate)(&input) {
            anyhow::bail!("{}", self.message);
        }
        Ok(input)
    }
}

/// Creates a config with inline event delivery and the given policy.
#[must_use]
pub fn test_config(name: &str, policy: IngressPolicy) -> PipelineConfig {
    PipelineConfig::new(name, policy, EventDelivery::Inline)
}

/// Creates a context for calling a transform directly.
#[must_use]
pub fn test_stage_context(stage: &str) -> StageContext {
    let scope = Arc::new(ExecutionScope::new(0, CorrelationId::new()));
    StageContext::new("test", stage, scope, Arc::new(CancellationToken::new()))
}

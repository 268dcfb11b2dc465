//! Recording collaborators: scope providers, sinks and hooks.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::{CorrelationId, FailureKind, StageEnvelope};
use crate::errors::ScopeError;
use crate::pipeline::{CompletionSink, FailureHook, FailureReport};
use crate::scope::{ExecutionScope, ScopeId, ScopeProvider};

/// Resource attached to every scope by [`RecordingScopeProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWork {
    /// The scope this resource belongs to.
    pub scope_id: ScopeId,
}

/// A scope provider that counts acquisitions and releases per scope.
#[derive(Debug, Default)]
pub struct RecordingScopeProvider {
    acquire_delay: Option<Duration>,
    acquired: DashMap<ScopeId, CorrelationId>,
    releases: DashMap<ScopeId, u64>,
}

impl RecordingScopeProvider {
    /// Creates a provider that acquires immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider whose acquisitions take `delay`.
    #[must_use]
    pub fn with_acquire_delay(delay: Duration) -> Self {
        Self {
            acquire_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Returns the number of scopes the provider was asked to acquire.
    #[must_use]
    pub fn acquired(&self) -> usize {
        self.acquired.len()
    }

    /// Returns how often the given scope was released.
    #[must_use]
    pub fn release_count(&self, scope_id: ScopeId) -> u64 {
        self.releases.get(&scope_id).map_or(0, |count| *count)
    }

    /// Returns the total number of release calls.
    #[must_use]
    pub fn total_releases(&self) -> u64 {
        self.releases.iter().map(|entry| *entry.value()).sum()
    }

    /// Returns true if every acquired scope was released exactly once.
    #[must_use]
    pub fn all_released_exactly_once(&self) -> bool {
        self.acquired.len() == self.releases.len()
            && self
                .acquired
                .iter()
                .all(|entry| self.release_count(*entry.key()) == 1)
    }
}

#[async_trait]
impl ScopeProvider for RecordingScopeProvider {
    async fn acquire(&self, scope: &ExecutionScope) -> Result<(), ScopeError> {
        self.acquired.insert(scope.id(), scope.correlation_id());
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        scope.resources().insert(UnitOfWork {
            scope_id: scope.id(),
        });
        Ok(())
    }

    async fn release(&self, scope: &ExecutionScope) {
        *self.releases.entry(scope.id()).or_insert(0) += 1;
    }
}

/// A scope provider whose acquisitions always fail.
#[derive(Debug)]
pub struct FailingScopeProvider {
    message: String,
    releases: AtomicU64,
}

impl FailingScopeProvider {
    /// Creates a provider failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            releases: AtomicU64::new(0),
        }
    }

    /// Returns the number of release calls.
    #[must_use]
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScopeProvider for FailingScopeProvider {
    async fn acquire(&self, scope: &ExecutionScope) -> Result<(), ScopeError> {
        Err(ScopeError::new(scope.correlation_id(), self.message.clone()))
    }

    async fn release(&self, _scope: &ExecutionScope) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// A completion sink that records every delivered payload.
#[derive(Debug)]
pub struct CollectingCompletionSink<T> {
    items: Mutex<Vec<(CorrelationId, T)>>,
    scopes_live_during_delivery: AtomicU64,
}

impl<T: Clone> CollectingCompletionSink<T> {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            scopes_live_during_delivery: AtomicU64::new(0),
        }
    }

    /// Returns the delivered payloads in delivery order.
    #[must_use]
    pub fn payloads(&self) -> Vec<T> {
        self.items.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Returns the correlation ids in delivery order.
    #[must_use]
    pub fn correlation_ids(&self) -> Vec<CorrelationId> {
        self.items.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Returns the number of delivered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing was delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Returns how many items still held a live scope when delivered.
    #[must_use]
    pub fn delivered_with_live_scope(&self) -> u64 {
        self.scopes_live_during_delivery.load(Ordering::SeqCst)
    }
}

impl<T: Clone> Default for CollectingCompletionSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> CompletionSink<T> for CollectingCompletionSink<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn on_completed(&self, envelope: &StageEnvelope<T>) -> anyhow::Result<()> {
        if !envelope.scope().is_released() {
            self.scopes_live_during_delivery.fetch_add(1, Ordering::SeqCst);
        }
        self.items
            .lock()
            .push((envelope.correlation_id(), envelope.payload().clone()));
        Ok(())
    }
}

/// A failure hook that records every report.
#[derive(Debug, Default)]
pub struct CollectingFailureHook {
    reports: Mutex<Vec<FailureReport>>,
}

impl CollectingFailureHook {
    /// Creates an empty hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every report received.
    #[must_use]
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().clone()
    }

    /// Returns the reports of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: FailureKind) -> Vec<FailureReport> {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns the number of reports received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Returns true if no report was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl FailureHook for CollectingFailureHook {
    fn on_failure(&self, report: &FailureReport) {
        self.reports.lock().push(report.clone());
    }
}

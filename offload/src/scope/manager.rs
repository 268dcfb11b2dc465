//! Scope acquisition and exactly-once release.

use super::{ExecutionScope, ScopeId};
use crate::cancellation::CancellationToken;
use crate::core::CorrelationId;
use crate::errors::ScopeError;
use crate::utils::panic_message;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Creates and disposes the resources inside an [`ExecutionScope`].
///
/// `acquire` may perform I/O (opening a transaction, checking out a
/// connection) and therefore may suspend. `release` is called exactly once
/// per scope by the [`ScopeManager`], including for scopes whose acquisition
/// failed part-way.
#[async_trait]
pub trait ScopeProvider: Send + Sync {
    /// Populates the scope's resources.
    async fn acquire(&self, scope: &ExecutionScope) -> Result<(), ScopeError>;

    /// Disposes the scope's resources.
    async fn release(&self, scope: &ExecutionScope);
}

/// A provider that attaches no resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScopeProvider;

#[async_trait]
impl ScopeProvider for NoopScopeProvider {
    async fn acquire(&self, _scope: &ExecutionScope) -> Result<(), ScopeError> {
        Ok(())
    }

    async fn release(&self, _scope: &ExecutionScope) {}
}

/// Owns the lifetime of every execution scope of one pipeline.
///
/// Tracks live scopes so a cancellation sweep can release whatever is still
/// outstanding when the pipeline shuts down.
pub struct ScopeManager {
    provider: Arc<dyn ScopeProvider>,
    live: DashMap<ScopeId, Arc<ExecutionScope>>,
    next_id: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    failed: AtomicU64,
}

impl ScopeManager {
    /// Creates a manager backed by the given provider.
    #[must_use]
    pub fn new(provider: Arc<dyn ScopeProvider>) -> Self {
        Self {
            provider,
            live: DashMap::new(),
            next_id: AtomicU64::new(1),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Acquires a scope for an item.
    ///
    /// Provider errors and provider panics are returned as [`ScopeError`];
    /// this never panics.
    pub async fn acquire(&self, correlation_id: CorrelationId) -> Result<Arc<ExecutionScope>, ScopeError> {
        let scope = self.new_scope(correlation_id);
        let outcome = self.provider_acquire(&scope).await;
        self.settle(scope, outcome).await
    }

    /// Acquires a scope, giving up if `token` is cancelled first.
    ///
    /// An interrupted acquisition still has its partial resources released.
    pub async fn acquire_cancellable(
        &self,
        correlation_id: CorrelationId,
        token: &CancellationToken,
    ) -> Result<Arc<ExecutionScope>, ScopeError> {
        if token.is_cancelled() {
            return Err(ScopeError::cancelled(correlation_id));
        }

        let scope = self.new_scope(correlation_id);
        let outcome = tokio::select! {
            biased;
            outcome = self.provider_acquire(&scope) => outcome,
            () = token.cancelled() => Err(ScopeError::cancelled(correlation_id)),
        };
        self.settle(scope, outcome).await
    }

    /// Releases a scope. Idempotent: only the first call has any effect.
    ///
    /// Returns true if this call performed the release.
    pub async fn release(&self, scope: &ExecutionScope) -> bool {
        if !scope.mark_released() {
            debug!(scope_id = scope.id(), "Scope already released, ignoring");
            return false;
        }

        self.live.remove(&scope.id());
        self.released.fetch_add(1, Ordering::Relaxed);
        self.provider_release(scope).await;
        scope.resources().clear();

        debug!(
            scope_id = scope.id(),
            correlation_id = %scope.correlation_id(),
            age_ms = u64::try_from(scope.age().as_millis()).unwrap_or(u64::MAX),
            "Scope released"
        );
        true
    }

    /// Releases every scope still live.
    ///
    /// Each release gets a share of `timeout`; a provider that overruns its
    /// share is abandoned, but the scope is still counted as released.
    /// Returns the number of scopes this sweep released.
    pub async fn release_all(&self, timeout: Duration) -> usize {
        let outstanding: Vec<Arc<ExecutionScope>> =
            self.live.iter().map(|entry| entry.value().clone()).collect();

        if outstanding.is_empty() {
            return 0;
        }

        let per_scope = (timeout / u32::try_from(outstanding.len()).unwrap_or(u32::MAX))
            .max(Duration::from_millis(10));
        let mut swept = 0;

        for scope in outstanding {
            match tokio::time::timeout(per_scope, self.release(&scope)).await {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(_) => {
                    swept += 1;
                    warn!(
                        scope_id = scope.id(),
                        correlation_id = %scope.correlation_id(),
                        "Scope release timed out during sweep"
                    );
                }
            }
        }

        swept
    }

    /// Returns the number of scopes acquired and not yet released.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Returns the number of successful acquisitions.
    #[must_use]
    pub fn acquired_count(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Returns the number of releases of successfully acquired scopes.
    #[must_use]
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Returns the number of failed acquisitions.
    #[must_use]
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn new_scope(&self, correlation_id: CorrelationId) -> Arc<ExecutionScope> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(ExecutionScope::new(id, correlation_id))
    }

    async fn provider_acquire(&self, scope: &ExecutionScope) -> Result<(), ScopeError> {
        match AssertUnwindSafe(self.provider.acquire(scope)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ScopeError::new(
                scope.correlation_id(),
                format!("scope provider panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }

    async fn provider_release(&self, scope: &ExecutionScope) {
        if let Err(panic) = AssertUnwindSafe(self.provider.release(scope)).catch_unwind().await {
            warn!(
                scope_id = scope.id(),
                correlation_id = %scope.correlation_id(),
                "Scope provider panicked during release: {}",
                panic_message(panic.as_ref())
            );
        }
    }

    async fn settle(
        &self,
        scope: Arc<ExecutionScope>,
        outcome: Result<(), ScopeError>,
    ) -> Result<Arc<ExecutionScope>, ScopeError> {
        match outcome {
            Ok(()) => {
                self.live.insert(scope.id(), scope.clone());
                self.acquired.fetch_add(1, Ordering::Relaxed);
                debug!(
                    scope_id = scope.id(),
                    correlation_id = %scope.correlation_id(),
                    "Scope acquired"
                );
                Ok(scope)
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                // Partially acquired resources are disposed; the scope was
                // never live so it does not count towards `released`.
                scope.mark_released();
                self.provider_release(&scope).await;
                scope.resources().clear();
                warn!(
                    correlation_id = %scope.correlation_id(),
                    cancelled = err.cancelled,
                    "Scope acquisition failed: {}",
                    err.message
                );
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeManager")
            .field("live", &self.live_count())
            .field("acquired", &self.acquired_count())
            .field("released", &self.released_count())
            .field("failed", &self.failed_count())
            .finish()
    }
}

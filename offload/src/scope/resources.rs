//! Execution scope handle and its typed resource bag.

use crate::core::CorrelationId;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier of a scope, unique within one [`ScopeManager`](super::ScopeManager).
pub type ScopeId = u64;

/// A thread-safe bag of per-item resources keyed by type.
///
/// Providers populate it during acquisition; transforms read from it through
/// the stage context. The bag is emptied when the scope is released.
#[derive(Default)]
pub struct ScopeResources {
    entries: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ScopeResources {
    /// Creates an empty resource bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a resource, replacing any previous resource of the same type.
    ///
    /// Returns true if a resource was replaced.
    pub fn insert<R: Any + Send + Sync>(&self, resource: R) -> bool {
        self.entries
            .write()
            .insert(TypeId::of::<R>(), Arc::new(resource))
            .is_some()
    }

    /// Returns a shared handle to the resource of type `R`.
    #[must_use]
    pub fn get<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        let entry = self.entries.read().get(&TypeId::of::<R>()).cloned()?;
        entry.downcast::<R>().ok()
    }

    /// Removes and returns the resource of type `R`.
    pub fn take<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        let entry = self.entries.write().remove(&TypeId::of::<R>())?;
        entry.downcast::<R>().ok()
    }

    /// Checks if a resource of type `R` is present.
    #[must_use]
    pub fn contains<R: Any + Send + Sync>(&self) -> bool {
        self.entries.read().contains_key(&TypeId::of::<R>())
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no resources are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every resource.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl fmt::Debug for ScopeResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeResources")
            .field("len", &self.len())
            .finish()
    }
}

/// The per-item resource bundle that travels with a work item.
pub struct ExecutionScope {
    id: ScopeId,
    correlation_id: CorrelationId,
    created_at: Instant,
    resources: ScopeResources,
    released: AtomicBool,
}

impl ExecutionScope {
    pub(crate) fn new(id: ScopeId, correlation_id: CorrelationId) -> Self {
        Self {
            id,
            correlation_id,
            created_at: Instant::now(),
            resources: ScopeResources::new(),
            released: AtomicBool::new(false),
        }
    }

    /// Returns the scope identifier.
    #[must_use]
    pub const fn id(&self) -> ScopeId {
        self.id
    }

    /// Returns the correlation id of the item owning this scope.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Returns how long the scope has been alive.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns the resource bag.
    #[must_use]
    pub const fn resources(&self) -> &ScopeResources {
        &self.resources
    }

    /// Shortcut for `resources().get::<R>()`.
    #[must_use]
    pub fn get<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        self.resources.get::<R>()
    }

    /// Returns true once the scope has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Flips the scope to released. Only the first caller gets `true`.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("resources", &self.resources.len())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct UnitOfWork(&'static str);

    #[test]
    fn test_resources_typed_access() {
        let bag = ScopeResources::new();
        assert!(bag.is_empty());

        assert!(!bag.insert(UnitOfWork("tx-1")));
        bag.insert(42_u32);

        assert_eq!(bag.len(), 2);
        assert_eq!(*bag.get::<UnitOfWork>().unwrap(), UnitOfWork("tx-1"));
        assert_eq!(*bag.get::<u32>().unwrap(), 42);
        assert!(bag.get::<String>().is_none());
    }

    #[test]
    fn test_resources_replace_and_take() {
        let bag = ScopeResources::new();
        bag.insert(UnitOfWork("a"));
        assert!(bag.insert(UnitOfWork("b")));

        let taken = bag.take::<UnitOfWork>().unwrap();
        assert_eq!(*taken, UnitOfWork("b"));
        assert!(!bag.contains::<UnitOfWork>());
    }

    #[test]
    fn test_scope_marks_released_once() {
        let scope = ExecutionScope::new(1, CorrelationId::new());
        assert!(!scope.is_released());
        assert!(scope.mark_released());
        assert!(!scope.mark_released());
        assert!(scope.is_released());
    }
}

//! Per-item execution scopes.
//!
//! Every accepted item gets exactly one [`ExecutionScope`]: a bundle of
//! per-item resources (a transactional handle, a cache of per-item services)
//! created at ingress and disposed exactly once when the item leaves the
//! pipeline. Stages only borrow the scope; the pipeline owns its lifetime.

mod manager;
mod resources;

pub use manager::{NoopScopeProvider, ScopeManager, ScopeProvider};
pub use resources::{ExecutionScope, ScopeId, ScopeResources};

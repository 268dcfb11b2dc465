//! Stage transforms and the runner that drives them.
//!
//! A stage is a [`Transform`] applied to every item read from the stage's
//! input queue, with at most `max_concurrency` items in flight at once.

mod context;
pub(crate) mod runner;

pub use context::StageContext;

use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

/// Business logic of one stage: turns an `I` into an `O`.
///
/// Errors and panics are isolated to the item being transformed: the item is
/// reported to the failure hook, its scope is released, and the stage keeps
/// serving other items.
#[async_trait]
pub trait Transform<I, O>: Send + Sync {
    /// Transforms one payload.
    async fn apply(&self, input: I, ctx: &StageContext) -> anyhow::Result<O>;
}

/// An async closure transform.
///
/// The closure receives an owned clone of the [`StageContext`] so its future
/// can be `'static`.
pub struct FnTransform<F, Fut> {
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnTransform<F, Fut> {
    /// Wraps an async closure.
    pub const fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnTransform<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransform").finish_non_exhaustive()
    }
}

#[async_trait]
impl<I, O, F, Fut> Transform<I, O> for FnTransform<F, Fut>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send,
{
    async fn apply(&self, input: I, ctx: &StageContext) -> anyhow::Result<O> {
        (self.func)(input, ctx.clone()).await
    }
}

/// A synchronous closure transform, for cheap CPU-only steps.
pub struct SyncFnTransform<F> {
    func: F,
}

impl<F> SyncFnTransform<F> {
    /// Wraps a synchronous closure.
    pub const fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Debug for SyncFnTransform<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncFnTransform").finish_non_exhaustive()
    }
}

#[async_trait]
impl<I, O, F> Transform<I, O> for SyncFnTransform<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> anyhow::Result<O> + Send + Sync,
{
    async fn apply(&self, input: I, _ctx: &StageContext) -> anyhow::Result<O> {
        (self.func)(input)
    }
}

/// A transform that passes payloads through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

#[async_trait]
impl<T> Transform<T, T> for IdentityTransform
where
    T: Send + 'static,
{
    async fn apply(&self, input: T, _ctx: &StageContext) -> anyhow::Result<T> {
        Ok(input)
    }
}

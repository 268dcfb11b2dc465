//! Pipeline and stage configuration.

use crate::errors::{PipelineError, PipelineValidationError};
use crate::stages::{FnTransform, StageContext, SyncFnTransform, Transform};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::failure::{DRAIN_STAGE, INGRESS_STAGE};

/// What `submit` does when the first queue is full.
///
/// There is no default: every pipeline must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressPolicy {
    /// Suspend the caller until space is available.
    Block,
    /// Refuse the item immediately.
    Reject,
    /// Accept the item and evict the oldest queued one.
    DropOldest,
}

impl fmt::Display for IngressPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Reject => write!(f, "reject"),
            Self::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

/// How stage events reach the external event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EventDelivery {
    /// Call the sink's non-blocking `try_emit` on the runner's task.
    Inline,
    /// Queue events in a bounded buffer drained by a background worker.
    /// Events arriving while the buffer is full are dropped and counted.
    Buffered {
        /// Buffer capacity.
        capacity: usize,
    },
}

const fn default_terminal_capacity() -> usize {
    64
}

const fn default_sweep_timeout_ms() -> u64 {
    5000
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, used in events, spans, and failure reports.
    pub name: String,
    /// Behaviour of `submit` when the first queue is full.
    pub ingress_policy: IngressPolicy,
    /// Capacity of the queue between the last stage and the drain consumer.
    #[serde(default = "default_terminal_capacity")]
    pub terminal_capacity: usize,
    /// Event forwarding mode.
    pub event_delivery: EventDelivery,
    /// Upper bound on provider `release` calls during the shutdown sweep.
    #[serde(default = "default_sweep_timeout_ms")]
    pub sweep_timeout_ms: u64,
}

impl PipelineConfig {
    /// Creates a config with default capacities.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        ingress_policy: IngressPolicy,
        event_delivery: EventDelivery,
    ) -> Self {
        Self {
            name: name.into(),
            ingress_policy,
            terminal_capacity: default_terminal_capacity(),
            event_delivery,
            sweep_timeout_ms: default_sweep_timeout_ms(),
        }
    }

    /// Sets the terminal queue capacity.
    #[must_use]
    pub fn with_terminal_capacity(mut self, capacity: usize) -> Self {
        self.terminal_capacity = capacity;
        self
    }

    /// Sets the shutdown sweep timeout.
    #[must_use]
    pub fn with_sweep_timeout(mut self, timeout: Duration) -> Self {
        self.sweep_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the shutdown sweep timeout.
    #[must_use]
    pub const fn sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.sweep_timeout_ms)
    }

    /// Parses and validates a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Pipeline name must not be empty"));
        }
        if self.terminal_capacity == 0 {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has a terminal queue capacity of zero",
                self.name
            )));
        }
        if let EventDelivery::Buffered { capacity: 0 } = self.event_delivery {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has an event buffer capacity of zero",
                self.name
            )));
        }
        if self.sweep_timeout_ms == 0 {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has a sweep timeout of zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// One stage of a pipeline: a transform, the capacity of its input queue,
/// and how many items it may process at once.
pub struct StageDefinition<I, O> {
    /// Stage name, unique within the pipeline.
    pub name: String,
    /// The stage's business logic.
    pub transform: Arc<dyn Transform<I, O>>,
    /// Capacity of the stage's input queue.
    pub capacity: usize,
    /// Maximum number of items transformed concurrently.
    pub max_concurrency: usize,
}

impl<I, O> StageDefinition<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Creates a stage definition.
    pub fn new(
        name: impl Into<String>,
        transform: impl Transform<I, O> + 'static,
        capacity: usize,
        max_concurrency: usize,
    ) -> Self {
        Self {
            name: name.into(),
            transform: Arc::new(transform),
            capacity,
            max_concurrency,
        }
    }

    /// Creates a stage from an async closure.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        capacity: usize,
        max_concurrency: usize,
        func: F,
    ) -> Self
    where
        F: Fn(I, StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        Self::new(name, FnTransform::new(func), capacity, max_concurrency)
    }

    /// Creates a stage from a synchronous closure.
    pub fn from_sync_fn<F>(
        name: impl Into<String>,
        capacity: usize,
        max_concurrency: usize,
        func: F,
    ) -> Self
    where
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self::new(name, SyncFnTransform::new(func), capacity, max_concurrency)
    }

    /// Checks the stage settings.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        let stages = vec![self.name.clone()];
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name must not be empty")
                .with_stages(stages));
        }
        if self.name == INGRESS_STAGE || self.name == DRAIN_STAGE {
            return Err(PipelineValidationError::new(format!(
                "Stage name '{}' is reserved",
                self.name
            ))
            .with_stages(stages));
        }
        if self.capacity == 0 {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' has an input queue capacity of zero",
                self.name
            ))
            .with_stages(stages));
        }
        if self.max_concurrency == 0 {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' has a max concurrency of zero",
                self.name
            ))
            .with_stages(stages));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' has a max concurrency of {}, above the limit of {}",
                self.name,
                self.max_concurrency,
                Semaphore::MAX_PERMITS
            ))
            .with_stages(stages));
        }
        Ok(())
    }
}

impl<I, O> fmt::Debug for StageDefinition<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

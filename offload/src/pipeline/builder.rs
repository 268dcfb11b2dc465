//! Typed, validated pipeline construction.

use super::compositor::{Pipeline, StrandedItems, SweptQueue};
use super::config::{PipelineConfig, StageDefinition};
use super::drain::{CompletionSink, DrainConsumer};
use super::failure::{FailureHook, LoggingFailureHook};
use super::ingress::IngressGate;
use super::runtime::PipelineRuntime;
use crate::cancellation::CancellationToken;
use crate::core::StageEnvelope;
use crate::errors::PipelineValidationError;
use crate::events::{EventSink, NoOpEventSink};
use crate::observability::ObservabilityHub;
use crate::queue::BoundedQueue;
use crate::scope::{NoopScopeProvider, ScopeManager, ScopeProvider};
use crate::stages::runner::StageRunner;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Spawns a fully wired stage once the pipeline runtime exists.
type Launcher = Box<dyn FnOnce(&Arc<PipelineRuntime>) -> JoinHandle<()> + Send>;

/// The last stage added so far, waiting for its output queue.
type OpenStage<O> = Box<dyn FnOnce(Arc<BoundedQueue<StageEnvelope<O>>>) -> Launcher + Send>;

struct Collaborators {
    config: PipelineConfig,
    scope_provider: Arc<dyn ScopeProvider>,
    failure_hook: Arc<dyn FailureHook>,
    event_sink: Arc<dyn EventSink>,
    cancellation: Option<Arc<CancellationToken>>,
}

/// Starts a pipeline definition.
///
/// ```rust,ignore
/// let pipeline = PipelineBuilder::<String>::new(config)
///     .stage(StageDefinition::from_sync_fn("parse", 16, 1, |s: String| Ok(s.len())))?
///     .stage(StageDefinition::from_sync_fn("double", 16, 4, |n: usize| Ok(n * 2)))?
///     .build(Arc::new(DiscardSink))?;
/// ```
pub struct PipelineBuilder<In> {
    parts: Collaborators,
    _in: PhantomData<fn(In)>,
}

impl<In> PipelineBuilder<In>
where
    In: Send + 'static,
{
    /// Creates a builder with no-op collaborators.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            parts: Collaborators {
                config,
                scope_provider: Arc::new(NoopScopeProvider),
                failure_hook: Arc::new(LoggingFailureHook),
                event_sink: Arc::new(NoOpEventSink),
                cancellation: None,
            },
            _in: PhantomData,
        }
    }

    /// Sets the provider that populates and disposes execution scopes.
    #[must_use]
    pub fn scope_provider(mut self, provider: Arc<dyn ScopeProvider>) -> Self {
        self.parts.scope_provider = provider;
        self
    }

    /// Sets the hook that receives failed, evicted and cancelled items.
    #[must_use]
    pub fn failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.parts.failure_hook = hook;
        self
    }

    /// Sets the sink for stage events.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.parts.event_sink = sink;
        self
    }

    /// Uses an existing cancellation token instead of creating one.
    #[must_use]
    pub fn cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.parts.cancellation = Some(token);
        self
    }

    /// Adds the first stage. Its input queue is the ingress queue.
    pub fn stage<O>(self, definition: StageDefinition<In, O>) -> Result<StageChain<In, O>, PipelineValidationError>
    where
        O: Send + 'static,
    {
        definition.validate()?;
        let ingress = Arc::new(BoundedQueue::new(definition.capacity));
        let name = definition.name.clone();

        Ok(StageChain {
            parts: self.parts,
            ingress: ingress.clone(),
            stage_names: vec![name.clone()],
            launchers: Vec::new(),
            queues: vec![SweptQueue {
                stage: name,
                queue: ingress.clone(),
            }],
            open: open_stage(definition, ingress),
        })
    }
}

impl<In> fmt::Debug for PipelineBuilder<In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.parts.config)
            .finish_non_exhaustive()
    }
}

/// A pipeline definition with at least one stage, currently producing `Out`.
pub struct StageChain<In, Out> {
    parts: Collaborators,
    ingress: Arc<BoundedQueue<StageEnvelope<In>>>,
    stage_names: Vec<String>,
    launchers: Vec<Launcher>,
    queues: Vec<SweptQueue>,
    open: OpenStage<Out>,
}

impl<In, Out> StageChain<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Appends a stage consuming this chain's output.
    pub fn stage<Next>(
        mut self,
        definition: StageDefinition<Out, Next>,
    ) -> Result<StageChain<In, Next>, PipelineValidationError>
    where
        Next: Send + 'static,
    {
        definition.validate()?;
        if self.stage_names.contains(&definition.name) {
            return Err(PipelineValidationError::new(format!(
                "Duplicate stage name '{}'",
                definition.name
            ))
            .with_stages(vec![definition.name.clone()]));
        }

        let input = Arc::new(BoundedQueue::new(definition.capacity));
        self.launchers.push((self.open)(input.clone()));
        self.stage_names.push(definition.name.clone());
        self.queues.push(SweptQueue {
            stage: definition.name.clone(),
            queue: input.clone(),
        });

        Ok(StageChain {
            parts: self.parts,
            ingress: self.ingress,
            stage_names: self.stage_names,
            launchers: self.launchers,
            queues: self.queues,
            open: open_stage(definition, input),
        })
    }

    /// Returns the stage names added so far.
    #[must_use]
    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Validates the configuration and starts every stage and the drain
    /// consumer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self, sink: Arc<dyn CompletionSink<Out>>) -> Result<Pipeline<In, Out>, PipelineValidationError>
    where
        Out: Sync,
    {
        let Self {
            parts,
            ingress,
            stage_names,
            mut launchers,
            mut queues,
            open,
        } = self;
        let Collaborators {
            config,
            scope_provider,
            failure_hook,
            event_sink,
            cancellation,
        } = parts;

        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' must be built inside a tokio runtime",
                config.name
            )));
        }

        let terminal = Arc::new(BoundedQueue::new(config.terminal_capacity));
        launchers.push(open(terminal.clone()));
        queues.push(SweptQueue {
            stage: super::failure::DRAIN_STAGE.to_string(),
            queue: terminal.clone() as Arc<dyn StrandedItems>,
        });

        let runtime = Arc::new(PipelineRuntime {
            name: Arc::from(config.name.as_str()),
            hub: Arc::new(ObservabilityHub::new(
                &config.name,
                &stage_names,
                event_sink,
                config.event_delivery,
            )),
            scopes: Arc::new(ScopeManager::new(scope_provider)),
            failure_hook,
            cancellation: cancellation.unwrap_or_default(),
        });

        let runners = stage_names
            .iter()
            .cloned()
            .zip(launchers)
            .map(|(name, launch)| (name, launch(&runtime)))
            .collect();
        let drain = tokio::spawn(DrainConsumer::new(terminal, sink, runtime.clone()).run());
        let gate = IngressGate::new(ingress, config.ingress_policy, runtime.clone());

        info!(
            pipeline = %config.name,
            stages = ?stage_names,
            policy = %config.ingress_policy,
            "Pipeline started"
        );

        Ok(Pipeline::new(config, runtime, gate, stage_names, runners, drain, queues))
    }
}

impl<In, Out> fmt::Debug for StageChain<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageChain")
            .field("config", &self.parts.config)
            .field("stages", &self.stage_names)
            .finish_non_exhaustive()
    }
}

fn open_stage<I, O>(
    definition: StageDefinition<I, O>,
    input: Arc<BoundedQueue<StageEnvelope<I>>>,
) -> OpenStage<O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    Box::new(move |output| {
        Box::new(move |runtime: &Arc<PipelineRuntime>| {
            let runner = StageRunner::new(
                &definition.name,
                input,
                output,
                definition.transform,
                definition.max_concurrency,
                runtime.clone(),
            );
            tokio::spawn(runner.run())
        })
    })
}

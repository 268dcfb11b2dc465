//! End-to-end tests for pipeline execution.

use super::failure::MockFailureHook;
use super::*;
use crate::core::{CorrelationId, EventKind, FailureKind};
use crate::errors::AdmissionError;
use crate::events::CollectingEventSink;
use crate::observability::init_test_tracing;
use crate::stages::{StageContext, Transform};
use crate::testing::{
    assert_all_accounted, assert_causal_order, assert_scopes_released_once, test_config,
    CollectingCompletionSink, CollectingFailureHook, ConcurrencyProbe, DelayTransform,
    FailingScopeProvider, FailingTransform, RecordingScopeProvider, UnitOfWork,
};
use async_trait::async_trait;
use mockall::predicate::function;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Holds every item until permits are added to the gate.
struct GatedTransform {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl<T> Transform<T, T> for GatedTransform
where
    T: Send + 'static,
{
    async fn apply(&self, input: T, _ctx: &StageContext) -> anyhow::Result<T> {
        self.gate.acquire().await?.forget();
        Ok(input)
    }
}

/// Sleeps like `DelayTransform`, then applies a function.
fn slow_map(
    name: &str,
    capacity: usize,
    max_concurrency: usize,
    delay: Duration,
    probe: Arc<ConcurrencyProbe>,
    f: fn(u32) -> u32,
) -> StageDefinition<u32, u32> {
    StageDefinition::from_fn(name, capacity, max_concurrency, move |n: u32, _ctx: StageContext| {
        let probe = probe.clone();
        async move {
            let _guard = probe.enter();
            tokio::time::sleep(delay).await;
            anyhow::Ok(f(n))
        }
    })
}

const fn settle() -> Duration {
    Duration::from_millis(50)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_stage_scenario() {
    init_test_tracing();
    let events = Arc::new(CollectingEventSink::new());
    let scopes = Arc::new(RecordingScopeProvider::new());
    let sink = Arc::new(CollectingCompletionSink::<u32>::new());
    let first = Arc::new(ConcurrencyProbe::new());
    let second = Arc::new(ConcurrencyProbe::new());

    let pipeline = PipelineBuilder::<u32>::new(test_config("scenario", IngressPolicy::Block))
        .scope_provider(scopes.clone())
        .event_sink(events.clone())
        .stage(slow_map("increment", 2, 1, Duration::from_millis(10), first.clone(), |n| n + 1))
        .unwrap()
        .stage(slow_map("double", 2, 2, Duration::from_millis(60), second.clone(), |n| n * 2))
        .unwrap()
        .build(sink.clone())
        .unwrap();

    for n in [1, 2, 3, 4] {
        pipeline.submit(n).await.unwrap();
    }
    let report = pipeline.shutdown().await;

    let mut outputs = sink.payloads();
    outputs.sort_unstable();
    assert_eq!(outputs, vec![4, 6, 8, 10]);

    // Stage 1 runs items one at a time; stage 2 overlaps two of them.
    assert_eq!(first.max_observed(), 1);
    assert_eq!(second.max_observed(), 2);
    assert_eq!(second.entered(), 4);
    assert_causal_order(&events.events(), &["increment", "double"]);

    assert_eq!(report.metrics.completed, 4);
    assert_eq!(report.swept, 0);
    assert!(!report.cancelled);
    assert_all_accounted(&report.metrics);
    assert_scopes_released_once(&scopes);
    assert_eq!(sink.delivered_with_live_scope(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_policy_applies_backpressure() {
    let gate = Arc::new(Semaphore::new(0));
    let pipeline = PipelineBuilder::<u32>::new(test_config("backpressure", IngressPolicy::Block))
        .stage(StageDefinition::new("hold", GatedTransform { gate: gate.clone() }, 2, 1))
        .unwrap()
        .build(Arc::new(DiscardSink))
        .unwrap();

    // The first item is taken into the transform, the next two fill the queue.
    pipeline.submit(1).await.unwrap();
    tokio::time::sleep(settle()).await;
    pipeline.submit(2).await.unwrap();
    pipeline.submit(3).await.unwrap();

    let ingress = pipeline.ingress();
    let pending = tokio::spawn(async move { ingress.submit(4).await });
    tokio::time::sleep(settle()).await;
    assert!(!pending.is_finished());
    assert_eq!(pipeline.metrics().submitted, 3);

    gate.add_permits(16);
    pending.await.unwrap().unwrap();

    let report = pipeline.shutdown().await;
    assert_eq!(report.metrics.completed, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stage_concurrency_bound() {
    let probe = Arc::new(ConcurrencyProbe::new());
    let pipeline = PipelineBuilder::<u32>::new(test_config("bounded", IngressPolicy::Block))
        .stage(StageDefinition::new(
            "work",
            DelayTransform::new(Duration::from_millis(20)).with_probe(probe.clone()),
            32,
            3,
        ))
        .unwrap()
        .build(Arc::new(DiscardSink))
        .unwrap();

    for n in 0..20 {
        pipeline.submit(n).await.unwrap();
    }
    let report = pipeline.shutdown().await;

    assert_eq!(probe.entered(), 20);
    assert_eq!(probe.max_observed(), 3);
    assert_eq!(report.metrics.stage("work").unwrap().finished, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_loss_under_block() {
    let scopes = Arc::new(RecordingScopeProvider::new());
    let sink = Arc::new(CollectingCompletionSink::<u32>::new());
    let pipeline = PipelineBuilder::<u32>::new(
        test_config("no-loss", IngressPolicy::Block).with_terminal_capacity(2),
    )
    .scope_provider(scopes.clone())
    .stage(StageDefinition::from_sync_fn("first", 2, 4, |n: u32| anyhow::Ok(n)))
    .unwrap()
    .stage(StageDefinition::new(
        "second",
        DelayTransform::new(Duration::from_millis(1)),
        2,
        4,
    ))
    .unwrap()
    .build(sink.clone())
    .unwrap();

    let mut submitters = Vec::new();
    for worker in 0..4_u32 {
        let ingress = pipeline.ingress();
        submitters.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for n in 0..50 {
                ids.push(ingress.submit(worker * 1000 + n).await.unwrap());
            }
            ids
        }));
    }

    let mut submitted: HashSet<CorrelationId> = HashSet::new();
    for handle in submitters {
        submitted.extend(handle.await.unwrap());
    }
    let report = pipeline.shutdown().await;

    let delivered: HashSet<CorrelationId> = sink.correlation_ids().into_iter().collect();
    assert_eq!(sink.len(), 200);
    assert_eq!(delivered, submitted);

    let mut payloads = sink.payloads();
    payloads.sort_unstable();
    payloads.dedup();
    assert_eq!(payloads.len(), 200);

    assert_all_accounted(&report.metrics);
    assert_scopes_released_once(&scopes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scopes_released_once_on_success_and_failure() {
    let scopes = Arc::new(RecordingScopeProvider::new());
    let hook = Arc::new(CollectingFailureHook::new());
    let sink = Arc::new(CollectingCompletionSink::<u32>::new());
    let pipeline = PipelineBuilder::<u32>::new(test_config("release", IngressPolicy::Block))
        .scope_provider(scopes.clone())
        .failure_hook(hook.clone())
        .stage(StageDefinition::new(
            "odd-only",
            FailingTransform::when(|n: &u32| n % 2 == 0, "even payload"),
            4,
            2,
        ))
        .unwrap()
        .stage(StageDefinition::from_sync_fn("panic-on-seven", 4, 2, |n: u32| {
            assert!(n != 7, "seven is unlucky");
            anyhow::Ok(n)
        }))
        .unwrap()
        .build(sink.clone())
        .unwrap();

    for n in 0..10 {
        pipeline.submit(n).await.unwrap();
    }
    let report = pipeline.shutdown().await;

    let mut delivered = sink.payloads();
    delivered.sort_unstable();
    assert_eq!(delivered, vec![1, 3, 5, 9]);

    let failures = hook.of_kind(FailureKind::Transform);
    assert_eq!(failures.len(), 6);
    assert_eq!(failures.iter().filter(|r| r.stage == "odd-only").count(), 5);
    let panicked: Vec<_> = failures.iter().filter(|r| r.stage == "panic-on-seven").collect();
    assert_eq!(panicked.len(), 1);
    assert!(panicked[0].error.contains("seven is unlucky"));

    assert_eq!(report.metrics.failed, 6);
    assert_eq!(report.metrics.stage("odd-only").unwrap().failed, 5);
    assert_all_accounted(&report.metrics);
    assert_scopes_released_once(&scopes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_drains_cleanly() {
    init_test_tracing();
    let scopes = Arc::new(RecordingScopeProvider::new());
    let hook = Arc::new(CollectingFailureHook::new());
    let sink = Arc::new(CollectingCompletionSink::<u32>::new());
    let pipeline = PipelineBuilder::<u32>::new(test_config("cancel", IngressPolicy::Block))
        .scope_provider(scopes.clone())
        .failure_hook(hook.clone())
        .stage(StageDefinition::new(
            "slow",
            DelayTransform::new(Duration::from_millis(200)),
            10,
            2,
        ))
        .unwrap()
        .build(sink.clone())
        .unwrap();

    for n in 0..10 {
        pipeline.submit(n).await.unwrap();
    }
    tokio::time::sleep(settle()).await;
    pipeline.cancel("operator stop");

    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
        .await
        .expect("shutdown must finish once in-flight items complete");

    assert!(report.cancelled);
    assert_eq!(report.cancel_reason.as_deref(), Some("operator stop"));
    assert_eq!(report.metrics.submitted, 10);
    assert_eq!(report.metrics.completed + report.metrics.cancelled, 10);
    // The two in-flight items finish but are not forwarded.
    assert_eq!(report.metrics.stage("slow").unwrap().finished, 2);
    assert_eq!(report.swept, 8);
    assert!(sink.is_empty());

    let cancelled = hook.of_kind(FailureKind::Cancelled);
    assert_eq!(cancelled.len(), 10);
    assert!(cancelled.iter().all(|r| r.error == "operator stop"));

    assert_all_accounted(&report.metrics);
    assert_scopes_released_once(&scopes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reject_policy_refuses_without_acquiring() {
    let gate = Arc::new(Semaphore::new(0));
    let scopes = Arc::new(RecordingScopeProvider::new());
    let pipeline = PipelineBuilder::<u32>::new(test_config("reject", IngressPolicy::Reject))
        .scope_provider(scopes.clone())
        .stage(StageDefinition::new("hold", GatedTransform { gate: gate.clone() }, 1, 1))
        .unwrap()
        .build(Arc::new(DiscardSink))
        .unwrap();

    pipeline.submit(1).await.unwrap();
    tokio::time::sleep(settle()).await;
    pipeline.submit(2).await.unwrap();

    let err = pipeline.submit(3).await.unwrap_err();
    assert!(matches!(err, AdmissionError::Rejected { capacity: 1 }));
    assert!(err.is_transient());
    assert_eq!(scopes.acquired(), 2);
    assert_eq!(pipeline.metrics().rejected, 1);

    gate.add_permits(16);
    let report = pipeline.shutdown().await;
    assert_eq!(report.metrics.completed, 2);
    assert_all_accounted(&report.metrics);
    assert_scopes_released_once(&scopes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_oldest_evicts_and_releases() {
    let gate = Arc::new(Semaphore::new(0));
    let scopes = Arc::new(RecordingScopeProvider::new());
    let hook = Arc::new(CollectingFailureHook::new());
    let sink = Arc::new(CollectingCompletionSink::<&'static str>::new());
    let pipeline =
        PipelineBuilder::<&'static str>::new(test_config("evict", IngressPolicy::DropOldest))
            .scope_provider(scopes.clone())
            .failure_hook(hook.clone())
            .stage(StageDefinition::new("hold", GatedTransform { gate: gate.clone() }, 2, 1))
            .unwrap()
            .build(sink.clone())
            .unwrap();

    pipeline.submit("a").await.unwrap();
    tokio::time::sleep(settle()).await;
    let b = pipeline.submit("b").await.unwrap();
    pipeline.submit("c").await.unwrap();
    pipeline.submit("d").await.unwrap();

    let evicted = hook.of_kind(FailureKind::Evicted);
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].correlation_id, b);
    assert_eq!(evicted[0].stage, INGRESS_STAGE);

    gate.add_permits(16);
    let report = pipeline.shutdown().await;
    assert_eq!(sink.payloads(), vec!["a", "c", "d"]);
    assert_eq!(report.metrics.evicted, 1);
    assert_all_accounted(&report.metrics);
    assert_scopes_released_once(&scopes);
}

#[tokio::test]
async fn test_sink_failure_is_logged_and_draining_continues() {
    let scopes = Arc::new(RecordingScopeProvider::new());
    let hook = Arc::new(CollectingFailureHook::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let recorded = seen.clone();
    let sink = FnSink::new(move |envelope: &crate::core::StageEnvelope<u32>| {
        let n = *envelope.payload();
        if n == 2 {
            anyhow::bail!("downstream rejected {n}");
        }
        recorded.lock().push(n);
        Ok(())
    });

    let pipeline = PipelineBuilder::<u32>::new(test_config("sink", IngressPolicy::Block))
        .scope_provider(scopes.clone())
        .failure_hook(hook.clone())
        .stage(StageDefinition::from_sync_fn("pass", 4, 1, |n: u32| anyhow::Ok(n)))
        .unwrap()
        .build(Arc::new(sink))
        .unwrap();

    for n in [1, 2, 3] {
        pipeline.submit(n).await.unwrap();
    }
    let report = pipeline.shutdown().await;

    assert_eq!(*seen.lock(), vec![1, 3]);
    let sink_failures = hook.of_kind(FailureKind::Sink);
    assert_eq!(sink_failures.len(), 1);
    assert_eq!(sink_failures[0].stage, DRAIN_STAGE);
    assert!(sink_failures[0].error.contains("downstream rejected 2"));

    assert_eq!(report.metrics.completed, 2);
    assert_eq!(report.metrics.sink_errors, 1);
    assert_all_accounted(&report.metrics);
    assert_scopes_released_once(&scopes);
}

#[tokio::test]
async fn test_scope_failure_is_reported_at_ingress() {
    let provider = Arc::new(FailingScopeProvider::new("pool exhausted"));
    let hook = Arc::new(CollectingFailureHook::new());
    let pipeline = PipelineBuilder::<u32>::new(test_config("scopes", IngressPolicy::Block))
        .scope_provider(provider.clone())
        .failure_hook(hook.clone())
        .stage(StageDefinition::from_sync_fn("pass", 4, 1, |n: u32| anyhow::Ok(n)))
        .unwrap()
        .build(Arc::new(DiscardSink))
        .unwrap();

    let err = pipeline.submit(1).await.unwrap_err();
    match err {
        AdmissionError::ScopeUnavailable(scope_err) => {
            assert_eq!(scope_err.message, "pool exhausted");
        }
        other => panic!("unexpected admission error: {other}"),
    }

    let reports = hook.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, FailureKind::ScopeAcquisition);
    assert_eq!(reports[0].stage, INGRESS_STAGE);
    assert_eq!(provider.releases(), 1);

    let report = pipeline.shutdown().await;
    assert_eq!(report.metrics.submitted, 0);
    assert_eq!(report.metrics.scope_failures, 1);
}

#[tokio::test]
async fn test_submit_after_cancel_and_shutdown() {
    let pipeline = PipelineBuilder::<u32>::new(test_config("closed", IngressPolicy::Block))
        .stage(StageDefinition::from_sync_fn("pass", 4, 1, |n: u32| anyhow::Ok(n)))
        .unwrap()
        .build(Arc::new(DiscardSink))
        .unwrap();
    let ingress = pipeline.ingress();

    let report = pipeline.shutdown().await;
    assert!(ingress.is_closed());
    assert!(matches!(ingress.submit(1).await, Err(AdmissionError::Closed)));
    assert_eq!(report.metrics.submitted, 0);

    let pipeline = PipelineBuilder::<u32>::new(test_config("cancelled", IngressPolicy::Block))
        .stage(StageDefinition::from_sync_fn("pass", 4, 1, |n: u32| anyhow::Ok(n)))
        .unwrap()
        .build(Arc::new(DiscardSink))
        .unwrap();
    pipeline.cancel("maintenance");
    match pipeline.submit(1).await {
        Err(AdmissionError::Cancelled(reason)) => assert_eq!(reason, "maintenance"),
        other => panic!("unexpected submit result: {other:?}"),
    }
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_buffered_events_flushed_at_shutdown() {
    let events = Arc::new(CollectingEventSink::new());
    let mut config = test_config("buffered", IngressPolicy::Block);
    config.event_delivery = EventDelivery::Buffered { capacity: 256 };

    let pipeline = PipelineBuilder::<u32>::new(config)
        .event_sink(events.clone())
        .stage(StageDefinition::from_sync_fn("a", 8, 2, |n: u32| anyhow::Ok(n)))
        .unwrap()
        .stage(StageDefinition::from_sync_fn("b", 8, 2, |n: u32| anyhow::Ok(n)))
        .unwrap()
        .build(Arc::new(DiscardSink))
        .unwrap();

    for n in 0..5 {
        pipeline.submit(n).await.unwrap();
    }
    let report = pipeline.shutdown().await;

    assert!(report.metrics.torn_down);
    assert_eq!(events.len(), 20);
    assert_eq!(events.events_of_kind(EventKind::Finished).len(), 10);
    assert_eq!(report.metrics.events_emitted, 20);
    assert_eq!(report.metrics.events_dropped, 0);
}

#[tokio::test]
async fn test_scope_resources_follow_the_item() {
    let scopes = Arc::new(RecordingScopeProvider::new());
    let sink = Arc::new(CollectingCompletionSink::<(u64, u64)>::new());

    let pipeline = PipelineBuilder::<u32>::new(test_config("resources", IngressPolicy::Block))
        .scope_provider(scopes.clone())
        .stage(StageDefinition::from_fn("open", 4, 1, |_n: u32, ctx: StageContext| async move {
            let unit = ctx
                .resource::<UnitOfWork>()
                .ok_or_else(|| anyhow::anyhow!("missing unit of work"))?;
            anyhow::Ok(unit.scope_id)
        }))
        .unwrap()
        .stage(StageDefinition::from_fn("check", 4, 1, |first: u64, ctx: StageContext| async move {
            anyhow::Ok((first, ctx.scope().id()))
        }))
        .unwrap()
        .build(sink.clone())
        .unwrap();

    for n in 0..3 {
        pipeline.submit(n).await.unwrap();
    }
    pipeline.shutdown().await;

    let pairs = sink.payloads();
    assert_eq!(pairs.len(), 3);
    assert!(pairs.iter().all(|(first, second)| first == second));
    assert_scopes_released_once(&scopes);
}

#[tokio::test]
async fn test_mock_hook_sees_each_transform_failure() {
    let mut hook = MockFailureHook::new();
    hook.expect_on_failure()
        .with(function(|r: &FailureReport| {
            r.kind == FailureKind::Transform && r.stage == "reject-all" && r.pipeline == "mocked"
        }))
        .times(3)
        .return_const(());

    let pipeline = PipelineBuilder::<u32>::new(test_config("mocked", IngressPolicy::Block))
        .failure_hook(Arc::new(hook))
        .stage(StageDefinition::new("reject-all", FailingTransform::always("nope"), 4, 1))
        .unwrap()
        .build(Arc::new(DiscardSink))
        .unwrap();

    for n in 0..3 {
        pipeline.submit(n).await.unwrap();
    }
    let report = pipeline.shutdown().await;
    assert_eq!(report.metrics.failed, 3);
}

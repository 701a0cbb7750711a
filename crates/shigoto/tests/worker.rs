//! End-to-end worker behavior against the in-memory backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use shigoto::backend::{JobStore, ResultCache};
use shigoto::worker::{ErrorKind, WorkerConfig};
use shigoto::{
    BoxError, Client, HandlerFn, HandlerRegistry, HandlerResult, JobRecord, JobStatus, NewJob,
    ShutdownSignal, Worker,
};
use shigoto_memory::{MemoryCache, MemoryQueue, MemoryStore};

type MemoryWorker = Worker<MemoryStore, MemoryQueue, MemoryCache>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Harness {
    store: MemoryStore,
    queue: MemoryQueue,
    cache: MemoryCache,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            queue: MemoryQueue::new(),
            cache: MemoryCache::new(),
        }
    }

    fn client(&self) -> Client<MemoryStore, MemoryQueue, MemoryCache> {
        Client::new(self.store.clone(), self.queue.clone(), self.cache.clone())
    }

    fn worker(&self, registry: HandlerRegistry) -> MemoryWorker {
        Worker::builder()
            .store(self.store.clone())
            .queue(self.queue.clone())
            .cache(self.cache.clone())
            .registry(registry)
            .config(WorkerConfig {
                // Keep quiet-queue iterations fast in tests.
                pop_timeout: Duration::from_millis(20),
                ..WorkerConfig::default()
            })
            .build()
    }
}

/// Handler completing every job and counting its invocations.
fn counting_handler(invocations: Arc<AtomicUsize>) -> impl shigoto::JobHandler + 'static {
    HandlerFn(move |_job: JobRecord, _signal: ShutdownSignal| {
        let invocations = invocations.clone();
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(HandlerResult::completed("Update complete"))
        }
    })
}

fn update_registry(invocations: Arc<AtomicUsize>) -> HandlerRegistry {
    HandlerRegistry::new().register("package:update", counting_handler(invocations))
}

fn update_job() -> NewJob {
    NewJob::new("package:update", serde_json::json!({"package": "acme/widget"}))
}

#[tokio::test]
async fn queued_job_runs_to_completion() {
    init_tracing();
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let worker = harness.worker(update_registry(invocations.clone()));

    let id = harness.client().enqueue(update_job()).await.unwrap();
    let processed = worker.run(1, &ShutdownSignal::new()).await.unwrap();

    assert_eq!(processed, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let record = harness.store.snapshot(id).unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
    assert_eq!(record.result.unwrap().message, "Update complete");
}

#[tokio::test]
async fn concurrent_claims_succeed_exactly_once() {
    let store = MemoryStore::new();
    let job = JobRecord::new("package:update", serde_json::json!({}));
    store.create(&job).await.unwrap();

    let claims =
        futures::future::join_all((0..8).map(|_| store.claim(job.id))).await;
    let wins = claims.into_iter().filter(|claim| claim.unwrap()).count();
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn racing_workers_process_a_job_once() {
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let worker_a = harness.worker(update_registry(invocations.clone()));
    let worker_b = harness.worker(update_registry(invocations.clone()));

    let job = JobRecord::new("package:update", serde_json::json!({}));
    harness.store.create(&job).await.unwrap();

    let signal = ShutdownSignal::new();
    let (a, b) = tokio::join!(
        worker_a.process(job.id, &signal),
        worker_b.process(job.id, &signal)
    );
    let processed = [a.unwrap(), b.unwrap()];

    assert_eq!(processed.iter().filter(|won| **won).count(), 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.store.snapshot(job.id).unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn terminal_jobs_are_never_reclaimed() {
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let worker = harness.worker(update_registry(invocations.clone()));
    let signal = ShutdownSignal::new();

    let job = JobRecord::new("package:update", serde_json::json!({}));
    harness.store.create(&job).await.unwrap();

    assert!(worker.process(job.id, &signal).await.unwrap());
    // Terminal now; a second delivery of the same id must lose the claim.
    assert!(!worker.process(job.id, &signal).await.unwrap());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reschedule_returns_the_job_to_scheduled() {
    let harness = Harness::new();
    let registry = HandlerRegistry::new().register(
        "package:update",
        HandlerFn(|_job: JobRecord, _signal: ShutdownSignal| async {
            Ok::<_, BoxError>(HandlerResult::reschedule(Duration::from_secs(300)))
        }),
    );
    let worker = harness.worker(registry);

    let job = JobRecord::new("package:update", serde_json::json!({}));
    harness.store.create(&job).await.unwrap();
    let before = SystemTime::now();

    assert!(worker.process(job.id, &ShutdownSignal::new()).await.unwrap());

    let record = harness.store.snapshot(job.id).unwrap();
    assert_eq!(record.status, JobStatus::Scheduled);
    assert_eq!(record.started_at, None);
    assert!(record.result.is_none());

    let due = record.scheduled_at.unwrap();
    assert!(due >= before + Duration::from_secs(299));
    assert!(due <= SystemTime::now() + Duration::from_secs(301));

    // Not due yet, so neither the sweep nor a claim may pick it up.
    assert!(harness.store.due_scheduled_ids().await.unwrap().is_empty());
    assert!(!harness.store.claim(job.id).await.unwrap());
}

#[tokio::test]
async fn stuck_running_jobs_fail_on_the_next_sweep() {
    let harness = Harness {
        store: MemoryStore::with_timeout_after(Duration::ZERO),
        queue: MemoryQueue::new(),
        cache: MemoryCache::new(),
    };
    let invocations = Arc::new(AtomicUsize::new(0));
    let worker = harness.worker(update_registry(invocations.clone()));

    // Claimed but never finished, as if its worker died mid-job.
    let job = JobRecord::new("package:update", serde_json::json!({}));
    harness.store.create(&job).await.unwrap();
    assert!(harness.store.claim(job.id).await.unwrap());

    // No queue delivery needed; run() sweeps for timeouts before looping.
    let processed = worker.run(0, &ShutdownSignal::new()).await.unwrap();
    assert_eq!(processed, 0);

    let record = harness.store.snapshot(job.id).unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.result.unwrap().message, "Job timed out");
}

#[tokio::test]
async fn handler_failure_becomes_errored_and_the_worker_moves_on() {
    init_tracing();
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = HandlerRegistry::new()
        .register(
            "package:broken",
            HandlerFn(|_job: JobRecord, _signal: ShutdownSignal| async {
                Err::<HandlerResult, BoxError>("source repository exploded".into())
            }),
        )
        .register("package:update", counting_handler(invocations.clone()));
    let worker = harness.worker(registry);

    let client = harness.client();
    let broken = client
        .enqueue(NewJob::new("package:broken", serde_json::json!({})))
        .await
        .unwrap();
    let healthy = client.enqueue(update_job()).await.unwrap();

    let processed = worker.run(2, &ShutdownSignal::new()).await.unwrap();
    assert_eq!(processed, 2);

    let record = harness.store.snapshot(broken).unwrap();
    assert_eq!(record.status, JobStatus::Errored);
    let result = record.result.unwrap();
    assert_eq!(result.message, "An unexpected failure occurred");
    assert_eq!(
        result.error_message.as_deref(),
        Some("source repository exploded")
    );

    assert_eq!(
        harness.store.snapshot(healthy).unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handler_panic_becomes_errored_and_the_worker_moves_on() {
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = HandlerRegistry::new()
        .register(
            "package:panicky",
            HandlerFn(|job: JobRecord, _signal: ShutdownSignal| async move {
                if job.payload.is_object() {
                    panic!("slipped through");
                }
                Ok::<_, BoxError>(HandlerResult::completed("never"))
            }),
        )
        .register("package:update", counting_handler(invocations.clone()));
    let worker = harness.worker(registry);

    let client = harness.client();
    let panicky = client
        .enqueue(NewJob::new("package:panicky", serde_json::json!({})))
        .await
        .unwrap();
    client.enqueue(update_job()).await.unwrap();

    let processed = worker.run(2, &ShutdownSignal::new()).await.unwrap();
    assert_eq!(processed, 2);

    let record = harness.store.snapshot(panicky).unwrap();
    assert_eq!(record.status, JobStatus::Errored);
    let result = record.result.unwrap();
    assert_eq!(result.message, "An unexpected failure occurred");
    assert!(
        result
            .error_message
            .unwrap()
            .contains("slipped through")
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn max_jobs_bounds_both_delivery_paths_combined() {
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let worker = harness.worker(update_registry(invocations.clone()));
    let client = harness.client();

    // Two due scheduled jobs plus three queued ones; a budget of three covers
    // the sweep and exactly one queue delivery.
    for _ in 0..2 {
        let job = JobRecord::scheduled(
            "package:update",
            serde_json::json!({}),
            SystemTime::now() - Duration::from_secs(1),
        );
        harness.store.create(&job).await.unwrap();
    }
    for _ in 0..3 {
        client.enqueue(update_job()).await.unwrap();
    }

    let processed = worker.run(3, &ShutdownSignal::new()).await.unwrap();
    assert_eq!(processed, 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(harness.queue.len(), 2);
}

#[tokio::test]
async fn due_scheduled_job_is_processed_by_the_sweep() {
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let worker = harness.worker(update_registry(invocations.clone()));

    let job = JobRecord::scheduled(
        "package:update",
        serde_json::json!({"package": "acme/widget"}),
        SystemTime::now() - Duration::from_secs(1),
    );
    harness.store.create(&job).await.unwrap();

    let processed = worker.run(1, &ShutdownSignal::new()).await.unwrap();
    assert_eq!(processed, 1);
    assert!(harness.store.snapshot(job.id).unwrap().status.is_terminal());
}

#[tokio::test]
async fn signal_stops_the_loop_between_jobs() {
    let harness = Harness::new();
    let signal = ShutdownSignal::new();

    // Raise the signal from inside the third job; in-flight work still runs
    // to completion, only new pulls stop.
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = HandlerRegistry::new().register(
        "package:update",
        HandlerFn({
            let invocations = invocations.clone();
            let signal = signal.clone();
            move |_job: JobRecord, _signal: ShutdownSignal| {
                let invocations = invocations.clone();
                let signal = signal.clone();
                async move {
                    if invocations.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        signal.trigger();
                    }
                    Ok::<_, BoxError>(HandlerResult::completed("Update complete"))
                }
            }
        }),
    );
    let worker = harness.worker(registry);

    let client = harness.client();
    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(client.enqueue(update_job()).await.unwrap());
    }

    let processed = worker.run(10, &signal).await.unwrap();
    assert_eq!(processed, 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // Nothing may be left dangling in `running`.
    for id in ids {
        let status = harness.store.snapshot(id).unwrap().status;
        assert!(
            status == JobStatus::Completed || status == JobStatus::Queued,
            "unexpected status {status}"
        );
    }
}

#[tokio::test]
async fn unknown_job_type_aborts_the_worker() {
    let harness = Harness::new();
    let worker = harness.worker(HandlerRegistry::new());

    harness
        .client()
        .enqueue(NewJob::new("package:unwired", serde_json::json!({})))
        .await
        .unwrap();

    let error = worker.run(1, &ShutdownSignal::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::UnknownJobType);
    assert!(error.to_string().contains("package:unwired"));
}

#[tokio::test]
async fn poisoned_session_is_reacquired_before_persisting() {
    let harness = Harness::new();
    let registry = HandlerRegistry::new().register(
        "package:update",
        HandlerFn({
            let store = harness.store.clone();
            move |_job: JobRecord, _signal: ShutdownSignal| {
                let store = store.clone();
                async move {
                    store.close_session();
                    Err::<HandlerResult, BoxError>("aborted mid-transaction".into())
                }
            }
        }),
    );
    let worker = harness.worker(registry);

    let id = harness.client().enqueue(update_job()).await.unwrap();
    let processed = worker.run(1, &ShutdownSignal::new()).await.unwrap();
    assert_eq!(processed, 1);

    // The reset happened and the result still got persisted through the
    // fresh session.
    assert!(harness.store.is_open());
    assert_eq!(
        harness.store.snapshot(id).unwrap().status,
        JobStatus::Errored
    );
}

#[tokio::test]
async fn status_polling_prefers_the_result_cache() {
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let worker = harness.worker(update_registry(invocations.clone()));

    let id = harness.client().enqueue(update_job()).await.unwrap();
    worker.run(1, &ShutdownSignal::new()).await.unwrap();

    let cached = harness.cache.get(&format!("job-{id}")).await.unwrap();
    assert!(cached.is_some());

    // A client over an empty store but the same cache still resolves the
    // status, proving the fast path never touches the durable store.
    let cache_only = Client::new(MemoryStore::new(), MemoryQueue::new(), harness.cache.clone());
    let view = cache_only.status(id).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.message.as_deref(), Some("Update complete"));

    // Unknown ids read as transient "not found yet".
    let unknown = harness.client().status(uuid_like_missing()).await.unwrap();
    assert!(unknown.is_none());
}

fn uuid_like_missing() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

#[tokio::test]
async fn status_polling_survives_a_corrupt_cache_entry() {
    init_tracing();
    let harness = Harness::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let worker = harness.worker(update_registry(invocations.clone()));

    let id = harness.client().enqueue(update_job()).await.unwrap();
    worker.run(1, &ShutdownSignal::new()).await.unwrap();

    // Clobber the cached result; polling must read this as a miss and fall
    // back to the durable store instead of erroring.
    harness
        .cache
        .set_with_expiry(&format!("job-{id}"), "not json", Duration::from_secs(60))
        .await
        .unwrap();

    let view = harness.client().status(id).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.message.as_deref(), Some("Update complete"));
}

#[tokio::test]
async fn empty_terminal_message_aborts_the_worker() {
    let harness = Harness::new();
    let registry = HandlerRegistry::new().register(
        "package:update",
        HandlerFn(|_job: JobRecord, _signal: ShutdownSignal| async {
            Ok::<_, BoxError>(HandlerResult::completed(""))
        }),
    );
    let worker = harness.worker(registry);

    let id = harness.client().enqueue(update_job()).await.unwrap();

    let error = worker.run(1, &ShutdownSignal::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidResult);

    // Nothing was persisted for the offending job.
    let record = harness.store.snapshot(id).unwrap();
    assert_eq!(record.status, JobStatus::Running);
    assert!(record.result.is_none());
}

#[tokio::test]
async fn delayed_jobs_skip_the_queue_until_due() {
    let harness = Harness::new();
    let id = harness
        .client()
        .enqueue(update_job().delay(Duration::from_secs(600)))
        .await
        .unwrap();

    assert!(harness.queue.is_empty());
    let record = harness.store.snapshot(id).unwrap();
    assert_eq!(record.status, JobStatus::Scheduled);
    assert!(record.scheduled_at.unwrap() > SystemTime::now());
    assert!(harness.store.due_scheduled_ids().await.unwrap().is_empty());
}

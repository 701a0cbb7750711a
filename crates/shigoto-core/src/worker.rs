//! Worker loop and per-job processor.
//!
//! One worker occupies one logical thread of control: it alternates between
//! opportunistic maintenance sweeps (timed-out jobs, due scheduled jobs) and
//! a bounded-wait queue pop, feeding both discovery paths into the same
//! processor. The bounded pop doubles as the loop's tick, so sweep staleness
//! is capped by the pop timeout.
//!
//! Horizontal scaling is multiple independent worker processes against the
//! same store and queue; correctness under that model rests entirely on the
//! store's atomic `claim`.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, SystemTime};

use futures::FutureExt as _;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::backend::{JobStore, QueueTransport, ResultCache};
use crate::job::{JobStatus, StoredResult};
use crate::registry::HandlerRegistry;
use crate::signal::ShutdownSignal;
use crate::{HandlerResult, JobRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of failures that abort the worker.
pub enum ErrorKind {
    /// The durable store failed or its session could not be reacquired.
    Store,
    /// The queue transport failed.
    Queue,
    /// No handler is registered for a job's type: a wiring defect, not a
    /// per-job condition.
    UnknownJobType,
    /// A job vanished between a successful claim and the re-fetch.
    MissingJob,
    /// A handler returned a result that violates its contract.
    InvalidResult,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    fn store(error: impl std::error::Error + Send + 'static) -> Self {
        Error {
            kind: ErrorKind::Store,
            inner: Box::new(error),
        }
    }

    fn queue(error: impl std::error::Error + Send + 'static) -> Self {
        Error {
            kind: ErrorKind::Queue,
            inner: Box::new(error),
        }
    }

    fn unknown_job_type(job_type: &str) -> Self {
        Error {
            kind: ErrorKind::UnknownJobType,
            inner: Box::new(UnknownJobTypeError(job_type.to_string())),
        }
    }

    fn missing_job(id: Uuid) -> Self {
        Error {
            kind: ErrorKind::MissingJob,
            inner: Box::new(MissingJobError(id)),
        }
    }

    fn invalid_result(violation: &'static str) -> Self {
        Error {
            kind: ErrorKind::InvalidResult,
            inner: Box::new(InvalidResultError(violation)),
        }
    }

    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct UnknownJobTypeError(String);

impl std::fmt::Display for UnknownJobTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no handler registered for job type `{}`", self.0)
    }
}

impl std::error::Error for UnknownJobTypeError {}

#[derive(Debug)]
struct MissingJobError(Uuid);

impl std::fmt::Display for MissingJobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job {} not found after a successful claim", self.0)
    }
}

impl std::error::Error for MissingJobError {}

#[derive(Debug)]
struct InvalidResultError(&'static str);

impl std::fmt::Display for InvalidResultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler violated its result contract: {}", self.0)
    }
}

impl std::error::Error for InvalidResultError {}

/// Carrier for a caught handler panic, attached to the errored result.
#[derive(Debug)]
struct HandlerPanic(String);

impl std::fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler panicked: {}", self.0)
    }
}

impl std::error::Error for HandlerPanic {}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}

/// Loop pacing and cache policy.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bounded wait on the queue pop; also the loop's tick interval.
    pub pop_timeout: Duration,
    /// How often at most the timed-out-job sweep runs.
    pub timeout_check_interval: Duration,
    /// How often at most the due-scheduled-job sweep runs.
    pub scheduled_check_interval: Duration,
    /// Expiry for terminal results cached under `job-{id}`.
    pub result_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(2),
            timeout_check_interval: Duration::from_secs(1200),
            scheduled_check_interval: Duration::from_secs(300),
            result_ttl: Duration::from_secs(600),
        }
    }
}

/// Pulls job ids from the queue and maintenance sweeps, and drives each
/// through claim, handler dispatch and outcome persistence.
pub struct Worker<S, Q, C> {
    store: S,
    queue: Q,
    cache: C,
    registry: HandlerRegistry,
    config: WorkerConfig,
}

impl Worker<(), (), ()> {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }
}

impl<S, Q, C> Worker<S, Q, C>
where
    S: JobStore,
    Q: QueueTransport,
    C: ResultCache,
{
    /// Process up to `max_jobs` jobs (successful claims), then return the
    /// number actually processed.
    ///
    /// Counts jobs from both delivery paths. Returns early when the signal is
    /// raised; a job already started always runs to completion first. Fatal
    /// errors (backend failures, wiring defects) propagate and stop the loop.
    pub async fn run(&self, max_jobs: usize, signal: &ShutdownSignal) -> Result<usize, Error> {
        tracing::info!("Waiting for new messages");

        let mut processed = 0usize;
        let mut next_timeout_check = self.check_timed_out().await?;
        let mut next_scheduled_check = self
            .check_scheduled(signal, max_jobs, &mut processed)
            .await?;

        while processed < max_jobs {
            if signal.is_triggered() {
                tracing::debug!("Signal received, aborting");
                break;
            }

            let now = SystemTime::now();
            if next_timeout_check <= now {
                next_timeout_check = self.check_timed_out().await?;
            }
            if next_scheduled_check <= now {
                next_scheduled_check = self
                    .check_scheduled(signal, max_jobs, &mut processed)
                    .await?;
                if processed >= max_jobs {
                    break;
                }
            }

            let popped = self
                .queue
                .pop(self.config.pop_timeout)
                .await
                .map_err(Error::queue)?;
            let Some(id) = popped else {
                tracing::trace!("No message in queue");
                continue;
            };

            if self.process(id, signal).await? {
                processed += 1;
            }
        }

        Ok(processed)
    }

    /// Execute exactly one job end-to-end given its id.
    ///
    /// Returns `Ok(false)` when the claim is lost: another worker caught the
    /// job first, which is expected under horizontal scaling and not an
    /// error. Per-job handler failures are absorbed into the job's terminal
    /// result; only backend failures and wiring defects surface as `Err`.
    pub async fn process(&self, id: Uuid, signal: &ShutdownSignal) -> Result<bool, Error> {
        if !self.store.claim(id).await.map_err(Error::store)? {
            return Ok(false);
        }

        // The claim only reports a boolean; re-fetch so the handler sees the
        // latest persisted state. A miss here means the store broke the
        // never-reuse-ids invariant underneath us.
        let job = self
            .store
            .find_by_id(id)
            .await
            .map_err(Error::store)?
            .ok_or_else(|| Error::missing_job(id))?;

        // Span scoping tags every log line of this invocation with the job id
        // and is torn down on every exit path, so diagnostics from one job
        // never bleed into the next.
        let span = tracing::info_span!("job", job_id = %job.id);
        self.run_claimed(job, signal).instrument(span).await?;
        Ok(true)
    }

    async fn run_claimed(&self, job: JobRecord, signal: &ShutdownSignal) -> Result<(), Error> {
        let handler = self
            .registry
            .get(&job.job_type)
            .ok_or_else(|| Error::unknown_job_type(&job.job_type))?;

        tracing::debug!(job_type = %job.job_type, "Processing job");

        // Handler failures stop here: an Err or a panic becomes an errored
        // result instead of aborting the loop and every job behind it.
        let result = match AssertUnwindSafe(handler.process(&job, signal.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                HandlerResult::errored("An unexpected failure occurred").with_error(error)
            }
            Err(panic) => HandlerResult::errored("An unexpected failure occurred")
                .with_error(Box::new(HandlerPanic(panic_message(panic)))),
        };

        // A failing handler can leave the persistence session unusable; this
        // job's result and every later one would fail to persist through it.
        if !self.store.is_open() {
            tracing::warn!("Persistence session poisoned, reacquiring");
            self.store.reset().await.map_err(Error::store)?;
        }

        match result {
            HandlerResult::Reschedule { after } => {
                let not_before = SystemTime::now() + after;
                self.store
                    .reschedule(job.id, not_before)
                    .await
                    .map_err(Error::store)?;
                tracing::debug!(after_secs = after.as_secs(), "Job rescheduled");
                Ok(())
            }
            HandlerResult::Finish {
                outcome,
                message,
                error,
            } => {
                if message.is_empty() {
                    return Err(Error::invalid_result("terminal result without a message"));
                }

                let stored = StoredResult {
                    status: outcome.as_status(),
                    message,
                    error_message: error.as_ref().map(|error| error.to_string()),
                    error_detail: error.as_ref().map(|error| format!("{error:?}")),
                };

                self.store
                    .save_result(job.id, &stored, SystemTime::now())
                    .await
                    .map_err(Error::store)?;
                self.cache_result(job.id, &stored).await;

                match stored.status {
                    JobStatus::Failed => {
                        tracing::warn!(message = %stored.message, "Job failed");
                    }
                    JobStatus::Errored => {
                        tracing::error!(
                            message = %stored.message,
                            error = stored.error_message.as_deref().unwrap_or(""),
                            "Job errored"
                        );
                    }
                    _ => {}
                }
                Ok(())
            }
        }
    }

    /// Cache the terminal result for fast status polling. The durable store
    /// already holds it, so cache trouble is logged and swallowed.
    async fn cache_result(&self, id: Uuid, result: &StoredResult) {
        let encoded = match serde_json::to_string(result) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::error!(error = %error, "Failed to encode job result for caching");
                return;
            }
        };
        let key = format!("job-{id}");
        if let Err(error) = self
            .cache
            .set_with_expiry(&key, &encoded, self.config.result_ttl)
            .await
        {
            tracing::error!(error = %error, "Failed to cache job result");
        }
    }

    async fn check_timed_out(&self) -> Result<SystemTime, Error> {
        let marked = self
            .store
            .mark_timed_out_jobs()
            .await
            .map_err(Error::store)?;
        if marked > 0 {
            tracing::warn!(count = marked, "Marked stuck running jobs as timed out");
        }
        Ok(SystemTime::now() + self.config.timeout_check_interval)
    }

    async fn check_scheduled(
        &self,
        signal: &ShutdownSignal,
        max_jobs: usize,
        processed: &mut usize,
    ) -> Result<SystemTime, Error> {
        for id in self.store.due_scheduled_ids().await.map_err(Error::store)? {
            if *processed >= max_jobs || signal.is_triggered() {
                break;
            }
            if self.process(id, signal).await? {
                *processed += 1;
            }
        }
        Ok(SystemTime::now() + self.config.scheduled_check_interval)
    }
}

/// Builder for [`Worker`]. Backends are provided one by one; `build` is only
/// available once all three are in place.
pub struct WorkerBuilder<S = (), Q = (), C = ()> {
    store: S,
    queue: Q,
    cache: C,
    registry: HandlerRegistry,
    config: WorkerConfig,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerBuilder {
    pub fn new() -> Self {
        WorkerBuilder {
            store: (),
            queue: (),
            cache: (),
            registry: HandlerRegistry::new(),
            config: WorkerConfig::default(),
        }
    }
}

impl<S, Q, C> WorkerBuilder<S, Q, C> {
    pub fn store<S2>(self, store: S2) -> WorkerBuilder<S2, Q, C>
    where
        S2: JobStore,
    {
        let Self {
            store: _,
            queue,
            cache,
            registry,
            config,
        } = self;
        WorkerBuilder {
            store,
            queue,
            cache,
            registry,
            config,
        }
    }

    pub fn queue<Q2>(self, queue: Q2) -> WorkerBuilder<S, Q2, C>
    where
        Q2: QueueTransport,
    {
        let Self {
            store,
            queue: _,
            cache,
            registry,
            config,
        } = self;
        WorkerBuilder {
            store,
            queue,
            cache,
            registry,
            config,
        }
    }

    pub fn cache<C2>(self, cache: C2) -> WorkerBuilder<S, Q, C2>
    where
        C2: ResultCache,
    {
        let Self {
            store,
            queue,
            cache: _,
            registry,
            config,
        } = self;
        WorkerBuilder {
            store,
            queue,
            cache,
            registry,
            config,
        }
    }

    /// Provide the startup-built handler table.
    pub fn registry(self, registry: HandlerRegistry) -> Self {
        Self { registry, ..self }
    }

    pub fn config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }
}

impl<S, Q, C> WorkerBuilder<S, Q, C>
where
    S: JobStore,
    Q: QueueTransport,
    C: ResultCache,
{
    pub fn build(self) -> Worker<S, Q, C> {
        let Self {
            store,
            queue,
            cache,
            registry,
            config,
        } = self;
        Worker {
            store,
            queue,
            cache,
            registry,
            config,
        }
    }
}

//! Producer-side API: enqueue jobs and poll their status.
//!
//! Consumed by the web front end and webhook receivers; the worker side never
//! uses it. Status polling reads the short-lived result cache first so that
//! callers checking shortly after completion skip the durable store.

use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::backend::{JobStore, QueueTransport, ResultCache};
use crate::job::{JobRecord, JobStatus, StoredResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categories of errors the client can hit.
pub enum ErrorKind {
    /// The durable store failed.
    Store,
    /// The queue transport failed.
    Queue,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    fn new(kind: ErrorKind, error: impl std::error::Error + Send + 'static) -> Self {
        Error {
            kind,
            inner: Box::new(error),
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

/// Description of a job to enqueue.
///
/// A job can be deferred with [`NewJob::delay`]; deferred jobs are created as
/// `scheduled` and discovered by the worker's scheduled sweep once due,
/// instead of being pushed onto the queue.
pub struct NewJob {
    job_type: String,
    payload: serde_json::Value,
    delay: Duration,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            delay: Duration::ZERO,
        }
    }

    /// Delay the job's eligibility by the provided duration.
    pub fn delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }
}

/// What a status poll sees: never a raw internal failure, only the current
/// status plus the terminal message once one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobView {
    pub id: Uuid,
    pub status: JobStatus,
    pub message: Option<String>,
    pub result: Option<StoredResult>,
}

/// Handle for enqueuing jobs and polling their status.
#[derive(Debug, Clone)]
pub struct Client<S, Q, C> {
    store: S,
    queue: Q,
    cache: C,
}

impl<S, Q, C> Client<S, Q, C>
where
    S: JobStore,
    Q: QueueTransport,
    C: ResultCache,
{
    pub fn new(store: S, queue: Q, cache: C) -> Self {
        Self {
            store,
            queue,
            cache,
        }
    }

    /// Create the job record and, when immediately due, push its id onto the
    /// queue. Returns the assigned id for later polling.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Uuid, Error> {
        let record = if new_job.delay.is_zero() {
            JobRecord::new(new_job.job_type, new_job.payload)
        } else {
            JobRecord::scheduled(
                new_job.job_type,
                new_job.payload,
                SystemTime::now() + new_job.delay,
            )
        };
        let id = record.id;

        self.store
            .create(&record)
            .await
            .map_err(|error| Error::new(ErrorKind::Store, error))?;

        if record.status == JobStatus::Queued {
            self.queue
                .push(id)
                .await
                .map_err(|error| Error::new(ErrorKind::Queue, error))?;
        }

        Ok(id)
    }

    /// Current status of a job, or `None` if the store does not know it
    /// (yet). Checks the result cache first; cache trouble reads as a miss
    /// and falls through to the durable store.
    pub async fn status(&self, id: Uuid) -> Result<Option<JobView>, Error> {
        if let Some(result) = self.cached_result(id).await {
            return Ok(Some(JobView {
                id,
                status: result.status,
                message: Some(result.message.clone()),
                result: Some(result),
            }));
        }

        let record = self
            .store
            .find_by_id(id)
            .await
            .map_err(|error| Error::new(ErrorKind::Store, error))?;
        Ok(record.map(|record| JobView {
            id,
            status: record.status,
            message: record.result.as_ref().map(|result| result.message.clone()),
            result: record.result,
        }))
    }

    /// Cached terminal result for `id`, if any. The cache is an optimization
    /// over the durable store, so read and decode failures are logged and
    /// treated as a miss.
    async fn cached_result(&self, id: Uuid) -> Option<StoredResult> {
        let key = format!("job-{id}");
        let encoded = match self.cache.get(&key).await {
            Ok(cached) => cached?,
            Err(error) => {
                tracing::warn!(error = %error, "Failed to read cached job result");
                return None;
            }
        };
        match serde_json::from_str(&encoded) {
            Ok(result) => Some(result),
            Err(error) => {
                tracing::warn!(error = %error, "Discarding undecodable cached job result");
                None
            }
        }
    }
}

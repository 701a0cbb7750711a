//! Core contract between the worker loop and its collaborators.
//!
//! Why: keep background work boring and predictable.
//! - Handlers state an explicit outcome; no hidden retries or implicit success.
//! - The worker owns pacing (bounded queue waits, maintenance sweeps) and the
//!   job lifecycle; storage policy stays behind the trait boundary.
//! - Exactly-once claiming across worker processes rests on one primitive:
//!   the store's atomic `claim`.
pub mod backend;
pub mod client;
pub mod job;
pub mod registry;
pub mod signal;
pub mod worker;

pub use backend::{JobStore, QueueTransport, ResultCache};
pub use client::{Client, JobView, NewJob};
pub use job::{JobRecord, JobStatus, StoredResult};
pub use registry::HandlerRegistry;
pub use signal::ShutdownSignal;
pub use worker::{Worker, WorkerBuilder, WorkerConfig};

/// Failure type handlers may attach to an outcome or return outright.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Terminal outcome a handler wants to persist.
///
/// Why: force explicitness so operators and code can reason about what
/// happened. Choose the smallest honest outcome instead of masking failures.
/// - `Completed`: the work was done.
/// - `Failed`: an expected business failure (bad input, unreachable source).
/// - `Errored`: an unexpected failure worth an operator's attention.
/// - `PackageGone` / `PackageDeleted`: the subject of the job no longer
///   exists; terminal, but distinct from failure for reporting.
pub enum JobOutcome {
    Completed,
    Failed,
    Errored,
    PackageGone,
    PackageDeleted,
}

impl JobOutcome {
    /// The job status this outcome persists as.
    pub fn as_status(self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed => JobStatus::Failed,
            JobOutcome::Errored => JobStatus::Errored,
            JobOutcome::PackageGone => JobStatus::PackageGone,
            JobOutcome::PackageDeleted => JobStatus::PackageDeleted,
        }
    }
}

/// Result a handler hands back to the processor.
///
/// Either a terminal outcome with a human-readable message (and optionally
/// the failure that caused it), or a request to run again later. Rescheduling
/// is not an error: no terminal result is recorded and no failure bookkeeping
/// applies.
#[derive(Debug)]
pub enum HandlerResult {
    Finish {
        outcome: JobOutcome,
        message: String,
        error: Option<BoxError>,
    },
    Reschedule {
        after: std::time::Duration,
    },
}

impl HandlerResult {
    fn finish(outcome: JobOutcome, message: impl Into<String>) -> Self {
        HandlerResult::Finish {
            outcome,
            message: message.into(),
            error: None,
        }
    }

    /// The job was done successfully.
    pub fn completed(message: impl Into<String>) -> Self {
        Self::finish(JobOutcome::Completed, message)
    }

    /// The job failed in an expected way.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::finish(JobOutcome::Failed, message)
    }

    /// The job failed in an unexpected way.
    pub fn errored(message: impl Into<String>) -> Self {
        Self::finish(JobOutcome::Errored, message)
    }

    /// The package the job refers to has gone missing at its source.
    pub fn package_gone(message: impl Into<String>) -> Self {
        Self::finish(JobOutcome::PackageGone, message)
    }

    /// The package the job refers to was deleted locally.
    pub fn package_deleted(message: impl Into<String>) -> Self {
        Self::finish(JobOutcome::PackageDeleted, message)
    }

    /// Run the job again once `after` has elapsed.
    pub fn reschedule(after: std::time::Duration) -> Self {
        HandlerResult::Reschedule { after }
    }

    /// Attach the failure that led to this outcome, for diagnostics.
    ///
    /// No effect on a reschedule request.
    pub fn with_error(self, error: BoxError) -> Self {
        match self {
            HandlerResult::Finish {
                outcome, message, ..
            } => HandlerResult::Finish {
                outcome,
                message,
                error: Some(error),
            },
            other => other,
        }
    }
}

/// Trait implemented by job handlers.
///
/// One handler serves one job type; the registry maps type names to handlers
/// at startup. Returning `Err` means an unexpected failure the handler could
/// not classify itself; the processor records it as an errored outcome rather
/// than letting it abort the worker.
///
/// The signal is advisory: a handler doing long multi-step work may check it
/// between steps and wind down early with a reschedule.
pub trait JobHandler: Send + Sync {
    fn process<'a>(
        &'a self,
        job: &'a JobRecord,
        signal: ShutdownSignal,
    ) -> futures::future::BoxFuture<'a, Result<HandlerResult, BoxError>>;
}

/// Adapter turning a plain async function into a [`JobHandler`].
///
/// The function receives an owned copy of the record, which keeps the
/// returned future `'static` and the closure easy to write.
pub struct HandlerFn<F>(pub F);

impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(JobRecord, ShutdownSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerResult, BoxError>> + Send + 'static,
{
    fn process<'a>(
        &'a self,
        job: &'a JobRecord,
        signal: ShutdownSignal,
    ) -> futures::future::BoxFuture<'a, Result<HandlerResult, BoxError>> {
        Box::pin((self.0)(job.clone(), signal))
    }
}

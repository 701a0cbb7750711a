pub use shigoto_core::{
    BoxError, Client, HandlerFn, HandlerRegistry, HandlerResult, JobHandler, JobOutcome,
    JobRecord, JobStatus, JobView, NewJob, ShutdownSignal, StoredResult, Worker, WorkerBuilder,
    WorkerConfig,
};
pub use shigoto_core::{backend, client, job, registry, signal, worker};

#[cfg(feature = "memory")]
pub use shigoto_memory::{MemoryCache, MemoryQueue, MemoryStore};

//! Backend-facing contracts: durable store, queue transport, result cache.
//!
//! Small surface, strong separation: the worker drives; the backends store.
//!
//! Why:
//! - The store owns claim semantics; `claim` is the sole concurrency-safety
//!   primitive and must be a single atomic conditional update, never a
//!   read-then-write.
//! - The queue is a dumb FIFO of job ids with a bounded-wait pop; the wait
//!   doubles as the worker loop's tick.
//! - The cache is an optimization for status polling, nothing correctness
//!   depends on it.
mod tmp {
    use std::time::{Duration, SystemTime};

    use uuid::Uuid;

    use crate::job::{JobRecord, StoredResult};

    /// Persistence gateway owning all mutation of job lifecycle state.
    ///
    /// Workers and the enqueue client hold only transient copies of records;
    /// every transition goes through these operations.
    #[trait_variant::make(JobStore: Send)]
    pub trait LocalJobStore {
        type Error: std::error::Error + Send + 'static;

        /// Persist a freshly created record.
        #[allow(unused)]
        async fn create(&self, job: &JobRecord) -> Result<(), Self::Error>;

        /// Atomically transition a claimable, due job into `running`,
        /// stamping `started_at`. Returns false if the job was already
        /// claimed, already terminal, not yet due, or unknown.
        #[allow(unused)]
        async fn claim(&self, id: Uuid) -> Result<bool, Self::Error>;

        #[allow(unused)]
        async fn find_by_id(&self, id: Uuid) -> Result<Option<JobRecord>, Self::Error>;

        /// Ids of `scheduled` jobs whose due time has passed, soonest first.
        #[allow(unused)]
        async fn due_scheduled_ids(&self) -> Result<Vec<Uuid>, Self::Error>;

        /// Bulk-fail jobs stuck in `running` past the store's timeout
        /// threshold. Returns how many were transitioned.
        #[allow(unused)]
        async fn mark_timed_out_jobs(&self) -> Result<u64, Self::Error>;

        /// Persist a terminal result.
        #[allow(unused)]
        async fn save_result(
            &self,
            id: Uuid,
            result: &StoredResult,
            completed_at: SystemTime,
        ) -> Result<(), Self::Error>;

        /// Return a job to `scheduled` with a new due time, clearing
        /// `started_at`.
        #[allow(unused)]
        async fn reschedule(&self, id: Uuid, not_before: SystemTime) -> Result<(), Self::Error>;

        /// Whether the persistence session is still usable. A failing handler
        /// can leave it poisoned (e.g. an aborted transaction).
        #[allow(unused)]
        fn is_open(&self) -> bool;

        /// Drop the poisoned session and acquire a fresh one.
        #[allow(unused)]
        async fn reset(&self) -> Result<(), Self::Error>;
    }

    /// External FIFO of job ids.
    #[trait_variant::make(QueueTransport: Send)]
    pub trait LocalQueueTransport {
        type Error: std::error::Error + Send + 'static;

        #[allow(unused)]
        async fn push(&self, id: Uuid) -> Result<(), Self::Error>;

        /// Wait up to `timeout` for the next id; `None` on a quiet queue.
        #[allow(unused)]
        async fn pop(&self, timeout: Duration) -> Result<Option<Uuid>, Self::Error>;
    }

    /// Expiring key-value store for the status-polling fast path.
    #[trait_variant::make(ResultCache: Send)]
    pub trait LocalResultCache {
        type Error: std::error::Error + Send + 'static;

        #[allow(unused)]
        async fn set_with_expiry(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<(), Self::Error>;

        #[allow(unused)]
        async fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;
    }
}

pub use tmp::{JobStore, QueueTransport, ResultCache};

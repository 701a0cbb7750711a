//! Mutex-guarded job store.
//!
//! The claim is a compare-and-set on the record under the store lock, which
//! gives the same exactly-once guarantee a SQL store provides with a
//! conditional UPDATE: of N workers claiming one id, exactly one sees true.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use shigoto_core::backend::JobStore;
use shigoto_core::{JobRecord, JobStatus, StoredResult};
use uuid::Uuid;

use crate::lock;

#[derive(Debug)]
struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    session_open: bool,
}

/// In-memory [`JobStore`]. Clones share the same state.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    timeout_after: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Default threshold after which a `running` job counts as stuck.
    pub const DEFAULT_TIMEOUT_AFTER: Duration = Duration::from_secs(30 * 60);

    pub fn new() -> Self {
        Self::with_timeout_after(Self::DEFAULT_TIMEOUT_AFTER)
    }

    /// Store whose timeout sweep fails `running` jobs whose `started_at` is
    /// older than `timeout_after`.
    pub fn with_timeout_after(timeout_after: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                jobs: HashMap::new(),
                session_open: true,
            })),
            timeout_after,
        }
    }

    /// Current copy of a record, bypassing the async contract. Test helper.
    pub fn snapshot(&self, id: Uuid) -> Option<JobRecord> {
        lock(&self.inner).jobs.get(&id).cloned()
    }

    /// Number of stored records. Test helper.
    pub fn len(&self) -> usize {
        lock(&self.inner).jobs.len()
    }

    /// Whether no records are stored. Test helper.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).jobs.is_empty()
    }

    /// Simulate a handler poisoning the persistence session, as an aborted
    /// transaction would. Until [`JobStore::reset`] runs, `is_open` reports
    /// false.
    pub fn close_session(&self) {
        lock(&self.inner).session_open = false;
    }
}

impl JobStore for MemoryStore {
    type Error = Infallible;

    async fn create(&self, job: &JobRecord) -> Result<(), Self::Error> {
        lock(&self.inner).jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim(&self, id: Uuid) -> Result<bool, Self::Error> {
        let now = SystemTime::now();
        let mut inner = lock(&self.inner);
        Ok(inner
            .jobs
            .get_mut(&id)
            .is_some_and(|job| job.try_claim(now)))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobRecord>, Self::Error> {
        Ok(lock(&self.inner).jobs.get(&id).cloned())
    }

    async fn due_scheduled_ids(&self) -> Result<Vec<Uuid>, Self::Error> {
        let now = SystemTime::now();
        let inner = lock(&self.inner);
        let mut due: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Scheduled && job.is_due(now))
            .map(|job| (job.scheduled_at, job.id))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn mark_timed_out_jobs(&self) -> Result<u64, Self::Error> {
        let now = SystemTime::now();
        let mut inner = lock(&self.inner);
        let mut marked = 0;
        for job in inner.jobs.values_mut() {
            if job.status != JobStatus::Running {
                continue;
            }
            let stuck = job
                .started_at
                .is_some_and(|started| started + self.timeout_after <= now);
            if stuck {
                job.time_out(now);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn save_result(
        &self,
        id: Uuid,
        result: &StoredResult,
        completed_at: SystemTime,
    ) -> Result<(), Self::Error> {
        if let Some(job) = lock(&self.inner).jobs.get_mut(&id) {
            job.complete(result.clone(), completed_at);
        }
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, not_before: SystemTime) -> Result<(), Self::Error> {
        if let Some(job) = lock(&self.inner).jobs.get_mut(&id) {
            job.reschedule(not_before);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.inner).session_open
    }

    async fn reset(&self) -> Result<(), Self::Error> {
        lock(&self.inner).session_open = true;
        Ok(())
    }
}

//! Job records and their lifecycle state machine.
//!
//! All status transitions live here so stores only have to decide *when* to
//! apply them, never *how*. The allowed edges:
//!
//! ```text
//! queued ----------> running --> completed | failed | errored
//! scheduled (due) -> running --> package-gone | package-deleted
//! running --> scheduled        (reschedule)
//! running --> failed           (timeout sweep)
//! ```
//!
//! Terminal statuses admit no further transition.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Scheduled,
    Running,
    Completed,
    Failed,
    Errored,
    PackageGone,
    PackageDeleted,
}

impl JobStatus {
    /// Whether no further transition is possible from this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Errored
                | JobStatus::PackageGone
                | JobStatus::PackageDeleted
        )
    }

    /// Whether a worker may try to claim a job in this status.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Scheduled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Errored => "errored",
            JobStatus::PackageGone => "package-gone",
            JobStatus::PackageDeleted => "package-deleted",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded when a job reaches a terminal status.
///
/// This is what status-polling consumers see, so it carries only the terminal
/// status, a human-readable message and, for failures, a rendering of the
/// causing error. It is also the value cached under `job-{id}` after
/// completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResult {
    pub status: JobStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl StoredResult {
    pub fn new(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error_message: None,
            error_detail: None,
        }
    }
}

/// Durable representation of one unit of work.
///
/// `id`, `job_type` and `payload` are immutable after creation; everything
/// else is lifecycle state owned by the store. Workers hold only transient
/// copies during one processing cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub scheduled_at: Option<SystemTime>,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub result: Option<StoredResult>,
}

impl JobRecord {
    /// A job eligible for immediate queue delivery.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Queued,
            scheduled_at: None,
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    /// A job that only becomes eligible once `scheduled_at` has passed.
    pub fn scheduled(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        scheduled_at: SystemTime,
    ) -> Self {
        Self {
            status: JobStatus::Scheduled,
            scheduled_at: Some(scheduled_at),
            ..Self::new(job_type, payload)
        }
    }

    /// Whether the job's due time (if any) has passed.
    pub fn is_due(&self, now: SystemTime) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Compare-and-set body of the store's atomic `claim`.
    ///
    /// Stores must call this under whatever exclusivity they provide (a row
    /// lock, a mutex); the method itself only encodes the conditions: the job
    /// must be claimable and due. Returns false without mutating otherwise.
    pub fn try_claim(&mut self, now: SystemTime) -> bool {
        if !self.status.is_claimable() || !self.is_due(now) {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        true
    }

    /// Record a terminal result.
    pub fn complete(&mut self, result: StoredResult, completed_at: SystemTime) {
        self.status = result.status;
        self.completed_at = Some(completed_at);
        self.result = Some(result);
    }

    /// Return the job to `scheduled` with a new due time.
    ///
    /// Clears `started_at`: the previous run no longer counts towards the
    /// timeout sweep.
    pub fn reschedule(&mut self, not_before: SystemTime) {
        self.status = JobStatus::Scheduled;
        self.scheduled_at = Some(not_before);
        self.started_at = None;
    }

    /// Fail a job the timeout sweep found stuck in `running`.
    pub fn time_out(&mut self, now: SystemTime) {
        self.complete(StoredResult::new(JobStatus::Failed, "Job timed out"), now);
    }
}

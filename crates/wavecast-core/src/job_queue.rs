use std::fmt;
use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::item::{ContentItem, NewItem};
use crate::job::{CompletionResult, EnqueueRequest, JobFilter, JobStatus, ProcessingJob, StageOutcome};

/// Persistent, priority-ordered queue of stage executions.
///
/// Implementations must make every mutation atomic in the shared store
/// (row locks with `SELECT FOR UPDATE SKIP LOCKED` or an equivalent
/// conditional update) so that no two workers lease the same job and at most
/// one job per (item, stage, channel) key is ever active.
pub trait JobQueue: Send + Sync + Clone {
    /// Register a discovered item and queue its Discovery job in one atomic
    /// step; neither exists if either insert fails.
    fn submit(
        &self,
        item: NewItem,
        priority: i32,
    ) -> impl Future<Output = Result<(ContentItem, ProcessingJob), AppError>> + Send;

    /// Insert a `queued` job.
    ///
    /// Fails with [`AppError::DuplicateActiveJob`] if a queued, retrying or
    /// running job already exists for the same key.
    fn enqueue(
        &self,
        request: EnqueueRequest,
    ) -> impl Future<Output = Result<ProcessingJob, AppError>> + Send;

    /// Atomically lease the best eligible job.
    ///
    /// Returns `None` when nothing is ready or the orchestrator is paused.
    /// Publication jobs are skipped (left queued) while their channel is
    /// ineligible or its quota reservation is denied.
    fn lease_next(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<ProcessingJob>, AppError>> + Send;

    /// Record the outcome of a leased job, chaining the next stage on success
    /// and applying the retry policy on failure.
    fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: StageOutcome,
    ) -> impl Future<Output = Result<CompletionResult, AppError>> + Send;

    /// Return every running job whose lease expired to `queued`, without
    /// counting an attempt.
    fn reclaim_expired_leases(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Push the lease expiry of a running job forward. `false` if the worker
    /// no longer owns it.
    fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Release all jobs held by a specific worker (for graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Operator action: put a dead job, or one discarded when its item was
    /// failed, back in the queue with a fresh attempt budget. A failed item
    /// is restored to its last successful stage.
    fn retry_dead_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<ProcessingJob, AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<ProcessingJob>, AppError>> + Send;

    fn list_jobs(
        &self,
        filter: JobFilter,
    ) -> impl Future<Output = Result<Vec<ProcessingJob>, AppError>> + Send;

    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;

    /// Delete terminal jobs completed before `older_than`. The only way a
    /// job is ever removed.
    fn archive_jobs(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Global run state shared by every worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Running,
    Paused,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorState::Running => "running",
            OrchestratorState::Paused => "paused",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestratorState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(OrchestratorState::Running),
            "paused" => Ok(OrchestratorState::Paused),
            _ => Err(format!("Unknown orchestrator state: {s}")),
        }
    }
}

/// Persisted pause switch consulted by `lease_next`.
pub trait OrchestratorControl: Send + Sync + Clone {
    fn state(&self) -> impl Future<Output = Result<OrchestratorState, AppError>> + Send;

    fn set_state(
        &self,
        state: OrchestratorState,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

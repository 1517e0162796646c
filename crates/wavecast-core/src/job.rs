use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::Stage;
use crate::retry::ErrorClass;

/// Status of a processing job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    /// Discarded: its item was failed by an operator.
    Failed,
    /// Waiting for its backoff to elapse after a transient failure.
    Retrying,
    /// Exhausted its retry budget or failed permanently.
    Dead,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Queued, JobStatus::Retrying, JobStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead
        )
    }

    /// Queued, retrying or running: the job holds its single-flight key.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Dead or discarded: an operator may put the job back in the queue.
    pub fn is_retryable_by_operator(&self) -> bool {
        matches!(self, JobStatus::Dead | JobStatus::Failed)
    }

    /// Eligible to be picked up by `lease_next` once `not_before` has passed.
    pub fn is_leasable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retrying)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "dead" => Ok(JobStatus::Dead),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Single-flight key: at most one active job per (item, stage, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub item_id: Uuid,
    pub stage: Stage,
    pub channel_id: Option<Uuid>,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel_id {
            Some(channel) => write!(f, "{}/{}/{}", self.item_id, self.stage, channel),
            None => write!(f, "{}/{}", self.item_id, self.stage),
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub item_id: Uuid,
    pub stage: Stage,
    pub channel_id: Option<Uuid>,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub not_before: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error_class: Option<ErrorClass>,
    pub last_error: Option<String>,
    pub artifact_ref: Option<String>,
    pub wave_id: Option<Uuid>,
    /// Quota units reserved at lease time, returned if the attempt does not succeed.
    pub quota_reserved: i64,
    /// Start of the bucket window the reservation was charged to.
    pub quota_window_started_at: Option<DateTime<Utc>>,
    /// Monotonic insertion order, used as the final FIFO tie-break.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    pub fn key(&self) -> JobKey {
        JobKey {
            item_id: self.item_id,
            stage: self.stage,
            channel_id: self.channel_id,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.lease_owner.as_deref() == Some(worker_id)
    }

    /// Sort key for leasing: priority descending, then `not_before`
    /// ascending, then creation order ascending.
    pub fn lease_order(&self) -> (std::cmp::Reverse<i32>, DateTime<Utc>, i64) {
        (std::cmp::Reverse(self.priority), self.not_before, self.seq)
    }
}

/// Request to enqueue a new job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub item_id: Uuid,
    pub stage: Stage,
    pub channel_id: Option<Uuid>,
    pub priority: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(item_id: Uuid, stage: Stage) -> Self {
        Self {
            item_id,
            stage,
            channel_id: None,
            priority: 0,
            not_before: None,
            max_attempts: None,
        }
    }

    pub fn with_channel(mut self, channel_id: Uuid) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            item_id: self.item_id,
            stage: self.stage,
            channel_id: self.channel_id,
        }
    }

    /// Publication jobs need a channel; every other stage must not have one.
    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        match (self.stage.requires_channel(), self.channel_id) {
            (true, None) => Err(crate::error::AppError::InvalidInput(
                "publication jobs require a channel".into(),
            )),
            (false, Some(_)) => Err(crate::error::AppError::InvalidInput(format!(
                "{} jobs cannot target a channel",
                self.stage
            ))),
            _ => Ok(()),
        }
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub stage: Option<Stage>,
    pub item_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub limit: usize,
}

impl JobFilter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_item(mut self, item_id: Uuid) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn matches(&self, job: &ProcessingJob) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.stage.is_none_or(|s| s == job.stage)
            && self.item_id.is_none_or(|id| id == job.item_id)
            && self.channel_id.is_none_or(|id| Some(id) == job.channel_id)
    }
}

/// A classified stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub class: ErrorClass,
    pub message: String,
    /// The failure came from an external rate limit.
    #[serde(default)]
    pub rate_limited: bool,
}

impl StageFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
            rate_limited: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
            rate_limited: false,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
            rate_limited: true,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.class, self.message)
    }
}

impl From<crate::error::AppError> for StageFailure {
    fn from(err: crate::error::AppError) -> Self {
        let rate_limited = matches!(err, crate::error::AppError::RateLimitExceeded);
        Self {
            class: err.error_class(),
            message: err.to_string(),
            rate_limited,
        }
    }
}

/// Result of executing one stage for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success { artifact_ref: String },
    Failure(StageFailure),
}

impl StageOutcome {
    pub fn success(artifact_ref: impl Into<String>) -> Self {
        StageOutcome::Success {
            artifact_ref: artifact_ref.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success { .. })
    }
}

/// What `complete` did with a reported outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    Succeeded { enqueued: Vec<Uuid> },
    Retrying { not_before: DateTime<Utc> },
    Dead,
    /// The item was failed externally; the result was dropped.
    Discarded,
    /// The job is no longer running under this worker (lease reclaimed).
    Stale,
}

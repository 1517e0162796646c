use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wavecast_core::{
    Channel, ContentItem, Eligibility, PostingSchedule, ProcessingJob, RateBudget, Wave,
    WaveMember, WaveMemberRequest, WaveStatus,
};

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SubmitItemRequest {
    /// Where the content was discovered (URL or upstream id)
    pub source_ref: String,
    /// Channels the item should be published to
    #[serde(default)]
    pub channel_ids: Vec<Uuid>,
    /// Priority of the Discovery job (default: 0)
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SubmitItemResponse {
    pub item: ItemResponse,
    pub job: JobResponse,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct FailItemRequest {
    pub reason: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ItemResponse {
    pub id: Uuid,
    pub source_ref: String,
    pub stage: String,
    /// Artifact reference per completed stage
    pub artifacts: BTreeMap<String, String>,
    pub channel_ids: Vec<Uuid>,
    pub failure_reason: Option<String>,
    pub discovered_at: Option<DateTime<Utc>>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub transformed_at: Option<DateTime<Utc>>,
    pub publishing_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ContentItem> for ItemResponse {
    fn from(item: ContentItem) -> Self {
        Self {
            id: item.id,
            source_ref: item.source_ref,
            stage: item.stage.to_string(),
            artifacts: item
                .artifacts
                .into_iter()
                .map(|(stage, artifact)| (stage.to_string(), artifact))
                .collect(),
            channel_ids: item.channel_ids,
            failure_reason: item.failure_reason,
            discovered_at: item.timestamps.discovered_at,
            acquired_at: item.timestamps.acquired_at,
            transformed_at: item.timestamps.transformed_at,
            publishing_at: item.timestamps.publishing_at,
            published_at: item.timestamps.published_at,
            failed_at: item.timestamps.failed_at,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ItemDetailResponse {
    pub item: ItemResponse,
    pub jobs: Vec<JobResponse>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: Uuid,
    pub item_id: Uuid,
    pub stage: String,
    pub channel_id: Option<Uuid>,
    pub priority: i32,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub not_before: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error_class: Option<String>,
    pub last_error: Option<String>,
    pub artifact_ref: Option<String>,
    pub wave_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<ProcessingJob> for JobResponse {
    fn from(job: ProcessingJob) -> Self {
        Self {
            id: job.id,
            item_id: job.item_id,
            stage: job.stage.to_string(),
            channel_id: job.channel_id,
            priority: job.priority,
            status: job.status.to_string(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            not_before: job.not_before,
            lease_owner: job.lease_owner,
            lease_expires_at: job.lease_expires_at,
            last_error_class: job.last_error_class.map(|c| c.to_string()),
            last_error: job.last_error,
            artifact_ref: job.artifact_ref,
            wave_id: job.wave_id,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsQuery {
    /// queued, retrying, running, succeeded, failed or dead
    pub status: Option<String>,
    /// discovery, acquisition, transformation or publication
    pub stage: Option<String>,
    pub item_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Waves
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WaveMemberDto {
    pub item_id: Uuid,
    pub channel_id: Uuid,
}

impl From<WaveMemberDto> for WaveMemberRequest {
    fn from(m: WaveMemberDto) -> Self {
        WaveMemberRequest::new(m.item_id, m.channel_id)
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ScheduleWaveRequest {
    /// Instant every member should go live (must be in the future)
    pub target_time: DateTime<Utc>,
    pub label: Option<String>,
    pub members: Vec<WaveMemberDto>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct AddWaveMembersRequest {
    pub members: Vec<WaveMemberDto>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WaveMemberResponse {
    pub item_id: Uuid,
    pub channel_id: Uuid,
    /// Publication job bound to this member, once the item is ready
    pub job_id: Option<Uuid>,
}

impl From<WaveMember> for WaveMemberResponse {
    fn from(m: WaveMember) -> Self {
        Self {
            item_id: m.item_id,
            channel_id: m.channel_id,
            job_id: m.job_id,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WaveStatusResponse {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub settled: bool,
}

impl From<WaveStatus> for WaveStatusResponse {
    fn from(s: WaveStatus) -> Self {
        Self {
            total: s.total,
            succeeded: s.succeeded,
            failed: s.failed,
            pending: s.pending,
            settled: s.is_settled(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WaveResponse {
    pub id: Uuid,
    pub label: Option<String>,
    pub target_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub members: Vec<WaveMemberResponse>,
    pub status: WaveStatusResponse,
}

impl WaveResponse {
    pub fn new(wave: Wave, status: WaveStatus) -> Self {
        Self {
            id: wave.id,
            label: wave.label,
            target_time: wave.target_time,
            created_at: wave.created_at,
            members: wave.members.into_iter().map(Into::into).collect(),
            status: status.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RateBudgetDto {
    /// Publications allowed per window
    pub capacity: i64,
    pub window_secs: i64,
    /// Units consumed by one publication
    pub publish_cost: i64,
}

impl From<RateBudget> for RateBudgetDto {
    fn from(b: RateBudget) -> Self {
        Self {
            capacity: b.capacity,
            window_secs: b.window_secs,
            publish_cost: b.publish_cost,
        }
    }
}

impl From<RateBudgetDto> for RateBudget {
    fn from(b: RateBudgetDto) -> Self {
        Self {
            capacity: b.capacity,
            window_secs: b.window_secs,
            publish_cost: b.publish_cost,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateChannelRequest {
    pub name: String,
    /// Opaque credential handle publications run under
    pub credential_scope: String,
    /// Posting schedule: `{"timezone", "windows": [{"start", "end", "days"}], "min_interval_secs"}`
    #[serde(default)]
    #[schema(value_type = Object)]
    pub schedule: PostingSchedule,
    /// Defaults to 6 publications per 24h
    pub rate_budget: Option<RateBudgetDto>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateScheduleRequest {
    #[schema(value_type = Object)]
    pub schedule: PostingSchedule,
    pub rate_budget: RateBudgetDto,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ChannelResponse {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub credential_scope: String,
    #[schema(value_type = Object)]
    pub schedule: PostingSchedule,
    pub rate_budget: RateBudgetDto,
    pub last_published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Channel> for ChannelResponse {
    fn from(c: Channel) -> Self {
        Self {
            id: c.id,
            name: c.name,
            active: c.active,
            credential_scope: c.credential_scope.as_str().to_string(),
            schedule: c.schedule,
            rate_budget: c.rate_budget.into(),
            last_published_at: c.last_published_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ChannelListResponse {
    pub channels: Vec<ChannelResponse>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EligibilityResponse {
    pub channel_id: Uuid,
    pub eligible: bool,
    /// Human-readable reason, "eligible" when the channel may publish now
    pub reason: String,
    /// Earliest next slot when the channel published too recently
    pub until: Option<DateTime<Utc>>,
}

impl EligibilityResponse {
    pub fn new(channel_id: Uuid, eligibility: Eligibility) -> Self {
        let until = match eligibility {
            Eligibility::TooSoon { until } => Some(until),
            _ => None,
        };
        Self {
            channel_id,
            eligible: eligibility.is_eligible(),
            reason: eligibility.to_string(),
            until,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct OrchestratorStateResponse {
    /// running or paused
    pub state: String,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

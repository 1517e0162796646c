use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::channel::{Channel, CredentialScope, NewChannel, PostingSchedule, RateBudget};
use crate::error::AppError;
use crate::item::{ContentItem, ItemStage, NewItem, Stage};
use crate::job::StageFailure;
use crate::wave::{Wave, WaveMemberRequest, WaveStatus};

/// Everything a stage executor gets to work with.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub job_id: Uuid,
    pub item_id: Uuid,
    pub stage: Stage,
    pub source_ref: String,
    /// Artifacts produced by the stages the item already completed.
    pub artifacts: BTreeMap<Stage, String>,
    pub channel_id: Option<Uuid>,
    /// Resolved for publication jobs only.
    pub credential: Option<CredentialScope>,
    pub attempt: u32,
}

/// Executes one pipeline stage for one item.
///
/// Implementations classify their own failures; the orchestrator applies the
/// retry policy to whatever class they report.
pub trait StageExecutor: Send + Sync + Clone {
    /// Returns the artifact reference produced by the stage.
    fn execute(
        &self,
        input: &StageInput,
    ) -> impl Future<Output = Result<String, StageFailure>> + Send;
}

/// Resolves the opaque credential handle a publication runs under.
pub trait CredentialScopeResolver: Send + Sync + Clone {
    fn resolve(
        &self,
        channel_id: Uuid,
    ) -> impl Future<Output = Result<CredentialScope, AppError>> + Send;
}

/// Channel records.
pub trait ChannelStore: Send + Sync + Clone {
    /// Create an inactive channel and configure its quota bucket.
    fn create_channel(
        &self,
        channel: NewChannel,
    ) -> impl Future<Output = Result<Channel, AppError>> + Send;

    fn get_channel(
        &self,
        channel_id: Uuid,
    ) -> impl Future<Output = Result<Option<Channel>, AppError>> + Send;

    fn list_channels(&self) -> impl Future<Output = Result<Vec<Channel>, AppError>> + Send;

    /// Activate or deactivate. Never touches jobs already running.
    fn set_active(
        &self,
        channel_id: Uuid,
        active: bool,
    ) -> impl Future<Output = Result<Channel, AppError>> + Send;

    fn update_schedule(
        &self,
        channel_id: Uuid,
        schedule: PostingSchedule,
        rate_budget: RateBudget,
    ) -> impl Future<Output = Result<Channel, AppError>> + Send;
}

/// Content item records.
pub trait ItemStore: Send + Sync + Clone {
    fn create_item(
        &self,
        item: NewItem,
    ) -> impl Future<Output = Result<ContentItem, AppError>> + Send;

    fn get_item(
        &self,
        item_id: Uuid,
    ) -> impl Future<Output = Result<Option<ContentItem>, AppError>> + Send;

    fn list_items(
        &self,
        stage: Option<ItemStage>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ContentItem>, AppError>> + Send;

    /// Operator cancellation: fail the item and discard its queued jobs.
    /// Running jobs are left alone; their completion will be discarded.
    fn mark_item_failed(
        &self,
        item_id: Uuid,
        reason: &str,
    ) -> impl Future<Output = Result<ContentItem, AppError>> + Send;
}

/// Wave coordination.
pub trait WaveStore: Send + Sync + Clone {
    fn schedule_wave(
        &self,
        members: Vec<WaveMemberRequest>,
        target_time: DateTime<Utc>,
        label: Option<String>,
    ) -> impl Future<Output = Result<Wave, AppError>> + Send;

    fn add_wave_members(
        &self,
        wave_id: Uuid,
        members: Vec<WaveMemberRequest>,
    ) -> impl Future<Output = Result<Wave, AppError>> + Send;

    fn get_wave(
        &self,
        wave_id: Uuid,
    ) -> impl Future<Output = Result<Option<Wave>, AppError>> + Send;

    /// Aggregate member job statuses; read-only.
    fn wave_status(
        &self,
        wave_id: Uuid,
    ) -> impl Future<Output = Result<WaveStatus, AppError>> + Send;
}

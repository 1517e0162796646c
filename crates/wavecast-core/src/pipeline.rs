//! Operator-facing pipeline actions.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::item::{ContentItem, NewItem};
use crate::job::{JobFilter, JobStatus, ProcessingJob};
use crate::job_queue::{JobQueue, OrchestratorControl, OrchestratorState};
use crate::traits::{ItemStore, WaveStore};
use crate::wave::{Wave, WaveMemberRequest, WaveStatus};

/// An item together with every job it has spawned.
#[derive(Debug, Clone)]
pub struct ItemDetail {
    pub item: ContentItem,
    pub jobs: Vec<ProcessingJob>,
}

/// Operator actions over the queue, items and waves.
#[derive(Clone)]
pub struct OperatorService<Q, I, W, O>
where
    Q: JobQueue,
    I: ItemStore,
    W: WaveStore,
    O: OrchestratorControl,
{
    queue: Q,
    items: I,
    waves: W,
    control: O,
}

impl<Q, I, W, O> OperatorService<Q, I, W, O>
where
    Q: JobQueue,
    I: ItemStore,
    W: WaveStore,
    O: OrchestratorControl,
{
    pub fn new(queue: Q, items: I, waves: W, control: O) -> Self {
        Self {
            queue,
            items,
            waves,
            control,
        }
    }

    /// Register a discovered item and queue its Discovery job.
    pub async fn submit_item(
        &self,
        item: NewItem,
        priority: i32,
    ) -> Result<(ContentItem, ProcessingJob), AppError> {
        let (item, job) = self.queue.submit(item, priority).await?;
        tracing::info!(item_id = %item.id, job_id = %job.id, source = %item.source_ref, "Item submitted");
        Ok((item, job))
    }

    pub async fn item_detail(&self, item_id: Uuid) -> Result<ItemDetail, AppError> {
        let item = self
            .items
            .get_item(item_id)
            .await?
            .ok_or_else(|| AppError::not_found("item", item_id))?;
        let jobs = self
            .queue
            .list_jobs(JobFilter::new(1000).with_item(item_id))
            .await?;
        Ok(ItemDetail { item, jobs })
    }

    pub async fn mark_item_failed(&self, item_id: Uuid, reason: &str) -> Result<ContentItem, AppError> {
        let item = self.items.mark_item_failed(item_id, reason).await?;
        tracing::warn!(%item_id, %reason, "Item marked failed by operator");
        Ok(item)
    }

    pub async fn retry_dead_job(&self, job_id: Uuid) -> Result<ProcessingJob, AppError> {
        let job = self.queue.retry_dead_job(job_id).await?;
        tracing::info!(%job_id, item_id = %job.item_id, stage = %job.stage, "Job re-enqueued by operator");
        Ok(job)
    }

    pub async fn list_dead_jobs(&self, limit: usize) -> Result<Vec<ProcessingJob>, AppError> {
        self.queue
            .list_jobs(JobFilter::new(limit).with_status(JobStatus::Dead))
            .await
    }

    pub async fn schedule_wave(
        &self,
        members: Vec<WaveMemberRequest>,
        target_time: DateTime<Utc>,
        label: Option<String>,
    ) -> Result<Wave, AppError> {
        let wave = self.waves.schedule_wave(members, target_time, label).await?;
        tracing::info!(
            wave_id = %wave.id,
            members = wave.members.len(),
            target = %wave.target_time,
            "Wave scheduled"
        );
        Ok(wave)
    }

    pub async fn add_wave_members(
        &self,
        wave_id: Uuid,
        members: Vec<WaveMemberRequest>,
    ) -> Result<Wave, AppError> {
        self.waves.add_wave_members(wave_id, members).await
    }

    pub async fn wave(&self, wave_id: Uuid) -> Result<(Wave, WaveStatus), AppError> {
        let wave = self
            .waves
            .get_wave(wave_id)
            .await?
            .ok_or_else(|| AppError::not_found("wave", wave_id))?;
        let status = self.waves.wave_status(wave_id).await?;
        Ok((wave, status))
    }

    pub async fn pause(&self) -> Result<(), AppError> {
        self.control.set_state(OrchestratorState::Paused).await?;
        tracing::warn!("Orchestrator paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), AppError> {
        self.control.set_state(OrchestratorState::Running).await?;
        tracing::info!("Orchestrator resumed");
        Ok(())
    }

    pub async fn state(&self) -> Result<OrchestratorState, AppError> {
        self.control.state().await
    }

    pub async fn archive(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let removed = self.queue.archive_jobs(older_than).await?;
        tracing::info!(removed, %older_than, "Archived terminal jobs");
        Ok(removed)
    }
}

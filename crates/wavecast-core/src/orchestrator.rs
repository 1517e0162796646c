//! Channel orchestration: eligibility and channel lifecycle.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::channel::{Channel, Eligibility, NewChannel, PostingSchedule, RateBudget};
use crate::error::AppError;
use crate::quota::QuotaTracker;
use crate::traits::ChannelStore;

/// Decides whether a channel may take a publication right now, and fronts
/// the operator's channel management.
///
/// Ineligibility is never an error: publication jobs simply stay queued
/// until the channel opens up again.
#[derive(Clone)]
pub struct ChannelOrchestrator<C, Q>
where
    C: ChannelStore,
    Q: QuotaTracker,
{
    channels: C,
    quota: Q,
}

impl<C, Q> ChannelOrchestrator<C, Q>
where
    C: ChannelStore,
    Q: QuotaTracker,
{
    pub fn new(channels: C, quota: Q) -> Self {
        Self { channels, quota }
    }

    /// Full eligibility check, including remaining quota.
    pub async fn eligibility(
        &self,
        channel_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Eligibility, AppError> {
        let Some(channel) = self.channels.get_channel(channel_id).await? else {
            return Ok(Eligibility::UnknownChannel);
        };
        let schedule = channel.schedule_eligibility(now);
        if !schedule.is_eligible() {
            return Ok(schedule);
        }
        match self.quota.remaining(&channel.quota_key()).await? {
            Some(remaining) if remaining < channel.rate_budget.publish_cost => {
                Ok(Eligibility::QuotaExhausted)
            }
            _ => Ok(Eligibility::Eligible),
        }
    }

    pub async fn is_eligible(&self, channel_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let eligibility = self.eligibility(channel_id, now).await?;
        if !eligibility.is_eligible() {
            tracing::debug!(%channel_id, reason = %eligibility, "Channel not eligible");
        }
        Ok(eligibility.is_eligible())
    }

    pub async fn create_channel(&self, channel: NewChannel) -> Result<Channel, AppError> {
        channel.validate()?;
        let created = self.channels.create_channel(channel).await?;
        tracing::info!(channel_id = %created.id, name = %created.name, "Channel created");
        Ok(created)
    }

    /// Activation takes effect at the next lease; running jobs are untouched.
    pub async fn activate(&self, channel_id: Uuid) -> Result<Channel, AppError> {
        let channel = self.channels.set_active(channel_id, true).await?;
        tracing::info!(%channel_id, "Channel activated");
        Ok(channel)
    }

    pub async fn deactivate(&self, channel_id: Uuid) -> Result<Channel, AppError> {
        let channel = self.channels.set_active(channel_id, false).await?;
        tracing::info!(%channel_id, "Channel deactivated");
        Ok(channel)
    }

    pub async fn get_channel(&self, channel_id: Uuid) -> Result<Channel, AppError> {
        self.channels
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| AppError::not_found("channel", channel_id))
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>, AppError> {
        self.channels.list_channels().await
    }

    pub async fn update_schedule(
        &self,
        channel_id: Uuid,
        schedule: PostingSchedule,
        rate_budget: RateBudget,
    ) -> Result<Channel, AppError> {
        schedule.validate()?;
        rate_budget.validate()?;
        self.channels
            .update_schedule(channel_id, schedule, rate_budget)
            .await
    }
}

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::JobStatus;

/// One (item, channel) publication assignment inside a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaveMemberRequest {
    pub item_id: Uuid,
    pub channel_id: Uuid,
}

impl WaveMemberRequest {
    pub fn new(item_id: Uuid, channel_id: Uuid) -> Self {
        Self {
            item_id,
            channel_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveMember {
    pub wave_id: Uuid,
    pub item_id: Uuid,
    pub channel_id: Uuid,
    /// `None` while the item has not finished Transformation yet.
    pub job_id: Option<Uuid>,
}

/// A set of publication assignments bound to one target time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    pub id: Uuid,
    pub label: Option<String>,
    pub target_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub members: Vec<WaveMember>,
}

impl Wave {
    /// Members can only be added while the target time is still ahead.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.target_time > now
    }
}

/// Aggregated member outcome of a wave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveStatus {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
}

/// What a wave member's outcome is folded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberState {
    /// Status of the bound publication job, if one exists yet.
    pub job_status: Option<JobStatus>,
    /// The member's item failed (upstream or by an operator).
    pub item_failed: bool,
}

impl MemberState {
    pub fn new(job_status: Option<JobStatus>, item_failed: bool) -> Self {
        Self {
            job_status,
            item_failed,
        }
    }
}

impl WaveStatus {
    /// Fold member states. A member without a job is pending unless its item
    /// has failed before reaching Publication.
    pub fn from_members(members: impl IntoIterator<Item = MemberState>) -> Self {
        members
            .into_iter()
            .fold(WaveStatus::default(), |mut acc, member| {
                acc.total += 1;
                match member.job_status {
                    Some(JobStatus::Succeeded) => acc.succeeded += 1,
                    Some(JobStatus::Dead | JobStatus::Failed) => acc.failed += 1,
                    None if member.item_failed => acc.failed += 1,
                    _ => acc.pending += 1,
                }
                acc
            })
    }

    pub fn is_settled(&self) -> bool {
        self.pending == 0
    }
}

/// Check a target and member list before a wave is created.
pub fn validate_wave_request(
    members: &[WaveMemberRequest],
    target_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if target_time <= now {
        return Err(AppError::InvalidTarget(format!(
            "target time {target_time} is not in the future"
        )));
    }
    validate_members(members)
}

pub fn validate_members(members: &[WaveMemberRequest]) -> Result<(), AppError> {
    if members.is_empty() {
        return Err(AppError::InvalidInput(
            "a wave needs at least one member".into(),
        ));
    }
    let mut seen = HashSet::with_capacity(members.len());
    for member in members {
        if !seen.insert(member) {
            return Err(AppError::InvalidInput(format!(
                "duplicate wave member: item {} on channel {}",
                member.item_id, member.channel_id
            )));
        }
    }
    Ok(())
}

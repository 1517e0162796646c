//! Completion planning.
//!
//! Turns a reported [`StageOutcome`] into the set of writes a store must apply
//! atomically: the job's new status, the item's stage/artifact change, and
//! the next stage's jobs. Stores load the rows under lock, call
//! [`plan_completion`], then apply the plan inside the same transaction.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::item::{ContentItem, ItemStage, Stage};
use crate::job::{CompletionResult, JobStatus, ProcessingJob, StageOutcome};
use crate::retry::{ErrorClass, RetryDecision, RetryPolicy};

/// A wave assignment of the item being completed, keyed by channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveBinding {
    pub wave_id: Uuid,
    pub channel_id: Uuid,
    pub target_time: DateTime<Utc>,
}

/// Knobs the planner needs from the queue configuration.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub retry: RetryPolicy,
    /// Priority floor for publication jobs bound to a wave.
    pub wave_priority: i32,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            wave_priority: 100,
        }
    }
}

/// Rows the planner reads.
#[derive(Debug)]
pub struct CompletionContext<'a> {
    pub job: &'a ProcessingJob,
    pub item: &'a ContentItem,
    /// Other publication jobs of the same item (excluding `job`).
    pub sibling_publications: &'a [ProcessingJob],
    /// Wave assignments of the item; only consulted after Transformation.
    pub wave_bindings: &'a [WaveBinding],
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Succeed {
        artifact_ref: String,
        attempts: u32,
    },
    Retry {
        attempts: u32,
        not_before: DateTime<Utc>,
        class: ErrorClass,
        message: String,
    },
    Dead {
        attempts: u32,
        class: ErrorClass,
        message: String,
    },
    /// Item was failed externally; the job ends as `failed`.
    Discard {
        reason: String,
    },
}

impl JobUpdate {
    pub fn status(&self) -> JobStatus {
        match self {
            JobUpdate::Succeed { .. } => JobStatus::Succeeded,
            JobUpdate::Retry { .. } => JobStatus::Retrying,
            JobUpdate::Dead { .. } => JobStatus::Dead,
            JobUpdate::Discard { .. } => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub stage: Option<ItemStage>,
    pub artifact: Option<(Stage, String)>,
    /// Set together with `stage == Some(Failed)`.
    pub failure_reason: Option<String>,
}

impl ItemUpdate {
    pub fn is_empty(&self) -> bool {
        self.stage.is_none() && self.artifact.is_none()
    }
}

/// A job to create as part of the completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextJob {
    pub item_id: Uuid,
    pub stage: Stage,
    pub channel_id: Option<Uuid>,
    pub priority: i32,
    pub not_before: DateTime<Utc>,
    pub max_attempts: u32,
    pub wave_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionPlan {
    pub job: JobUpdate,
    pub item: ItemUpdate,
    pub next_jobs: Vec<NextJob>,
    /// Give the lease-time quota reservation back.
    pub release_quota: bool,
    /// Channel whose `last_published_at` moves to `now`.
    pub published_channel: Option<Uuid>,
}

impl CompletionPlan {
    /// Result reported to the worker once the plan is applied.
    pub fn result(&self, enqueued: Vec<Uuid>) -> CompletionResult {
        match &self.job {
            JobUpdate::Succeed { .. } => CompletionResult::Succeeded { enqueued },
            JobUpdate::Retry { not_before, .. } => CompletionResult::Retrying {
                not_before: *not_before,
            },
            JobUpdate::Dead { .. } => CompletionResult::Dead,
            JobUpdate::Discard { .. } => CompletionResult::Discarded,
        }
    }
}

/// Decide every effect of completing `ctx.job` with `outcome`.
///
/// The job must be `running`; callers check lease ownership first and report
/// [`CompletionResult::Stale`] themselves.
pub fn plan_completion(
    ctx: &CompletionContext<'_>,
    outcome: &StageOutcome,
    settings: &ChainSettings,
) -> Result<CompletionPlan, AppError> {
    let job = ctx.job;
    if job.status != JobStatus::Running {
        return Err(AppError::InvalidTransition(format!(
            "job {} is {}, not running",
            job.id, job.status
        )));
    }

    if ctx.item.stage == ItemStage::Failed {
        return Ok(CompletionPlan {
            job: JobUpdate::Discard {
                reason: "item was failed while the job was running".into(),
            },
            item: ItemUpdate::default(),
            next_jobs: Vec::new(),
            release_quota: job.quota_reserved > 0,
            published_channel: None,
        });
    }

    let attempts = job.attempts + 1;
    match outcome {
        StageOutcome::Success { artifact_ref } => {
            let target = match job.stage {
                Stage::Publication if siblings_active(ctx) => ItemStage::Publishing,
                stage => stage.completes_to(),
            };
            Ok(CompletionPlan {
                job: JobUpdate::Succeed {
                    artifact_ref: artifact_ref.clone(),
                    attempts,
                },
                item: ItemUpdate {
                    stage: advance(ctx.item.stage, target),
                    artifact: Some((job.stage, artifact_ref.clone())),
                    failure_reason: None,
                },
                next_jobs: next_jobs(ctx, settings),
                release_quota: false,
                published_channel: job.channel_id.filter(|_| job.stage == Stage::Publication),
            })
        }
        StageOutcome::Failure(failure) => {
            let decision = settings
                .retry
                .decide(failure.class, attempts, job.max_attempts);
            match decision {
                RetryDecision::Retry(delay) => Ok(CompletionPlan {
                    job: JobUpdate::Retry {
                        attempts,
                        not_before: ctx.now + delay,
                        class: failure.class,
                        message: failure.message.clone(),
                    },
                    item: ItemUpdate::default(),
                    next_jobs: Vec::new(),
                    release_quota: job.quota_reserved > 0,
                    published_channel: None,
                }),
                RetryDecision::Exhausted => Ok(CompletionPlan {
                    job: JobUpdate::Dead {
                        attempts,
                        class: failure.class,
                        message: failure.message.clone(),
                    },
                    item: item_after_dead_job(ctx, &failure.message),
                    next_jobs: Vec::new(),
                    release_quota: job.quota_reserved > 0,
                    published_channel: None,
                }),
            }
        }
    }
}

fn advance(current: ItemStage, target: ItemStage) -> Option<ItemStage> {
    current.can_advance_to(target).then_some(target)
}

fn siblings_active(ctx: &CompletionContext<'_>) -> bool {
    ctx.sibling_publications
        .iter()
        .any(|j| j.id != ctx.job.id && j.status.is_active())
}

/// A dead upstream job fails the item. A dead publication only settles the
/// item once no other publication is still in flight: published if any
/// channel succeeded, failed otherwise.
fn item_after_dead_job(ctx: &CompletionContext<'_>, message: &str) -> ItemUpdate {
    let reason = format!("{} failed: {message}", ctx.job.stage);
    if ctx.job.stage != Stage::Publication {
        return ItemUpdate {
            stage: advance(ctx.item.stage, ItemStage::Failed),
            artifact: None,
            failure_reason: Some(reason),
        };
    }
    if siblings_active(ctx) {
        return ItemUpdate::default();
    }
    let any_published = ctx.item.artifacts.contains_key(&Stage::Publication)
        || ctx
            .sibling_publications
            .iter()
            .any(|j| j.status == JobStatus::Succeeded);
    if any_published {
        ItemUpdate {
            stage: advance(ctx.item.stage, ItemStage::Published),
            ..Default::default()
        }
    } else {
        ItemUpdate {
            stage: advance(ctx.item.stage, ItemStage::Failed),
            artifact: None,
            failure_reason: Some(reason),
        }
    }
}

/// Jobs chained after a successful stage.
fn next_jobs(ctx: &CompletionContext<'_>, settings: &ChainSettings) -> Vec<NextJob> {
    let job = ctx.job;
    let max_attempts = settings.retry.max_attempts;
    match job.stage.next() {
        None => Vec::new(),
        Some(Stage::Publication) => ctx
            .item
            .channel_ids
            .iter()
            .map(|&channel_id| {
                let binding = ctx
                    .wave_bindings
                    .iter()
                    .filter(|b| b.channel_id == channel_id)
                    .max_by_key(|b| b.target_time);
                match binding {
                    // Late members publish as soon as they are ready.
                    Some(b) => NextJob {
                        item_id: job.item_id,
                        stage: Stage::Publication,
                        channel_id: Some(channel_id),
                        priority: job.priority.max(settings.wave_priority),
                        not_before: b.target_time.max(ctx.now),
                        max_attempts,
                        wave_id: Some(b.wave_id),
                    },
                    None => NextJob {
                        item_id: job.item_id,
                        stage: Stage::Publication,
                        channel_id: Some(channel_id),
                        priority: job.priority,
                        not_before: ctx.now,
                        max_attempts,
                        wave_id: None,
                    },
                }
            })
            .collect(),
        Some(stage) => vec![NextJob {
            item_id: job.item_id,
            stage,
            channel_id: None,
            priority: job.priority,
            not_before: ctx.now,
            max_attempts,
            wave_id: None,
        }],
    }
}

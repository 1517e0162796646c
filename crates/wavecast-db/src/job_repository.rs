use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{PgConnection, PgPool, Pool, Postgres};
use uuid::Uuid;

use wavecast_core::channel::quota_key_for;
use wavecast_core::completion::{
    ChainSettings, CompletionContext, JobUpdate, NextJob, WaveBinding, plan_completion,
};
use wavecast_core::error::AppError;
use wavecast_core::item::{ContentItem, ItemStage, NewItem, Stage};
use wavecast_core::job::{
    CompletionResult, EnqueueRequest, JobFilter, JobKey, JobStatus, ProcessingJob, StageOutcome,
};
use wavecast_core::job_queue::{JobQueue, OrchestratorState};
use wavecast_core::quota::Reservation;
use wavecast_core::SharedClock;

use crate::channel_repository::fetch_channel;
use crate::database::db_error;
use crate::item_repository::{apply_item_update, insert_item, require_item};
use crate::quota_repository::{release_in, reserve_in};
use crate::state_repository::current_state;

/// Candidates locked per round while looking for a leasable job.
const LEASE_BATCH: i64 = 16;

/// Quota units taken at lease time and the window they were charged to.
#[derive(Debug, Clone, Copy, Default)]
struct Reserved {
    cost: i64,
    window_started_at: Option<DateTime<Utc>>,
}

/// Take the item row lock for a publication lease without waiting.
///
/// Operator and wave paths lock the item before its jobs; the lease path
/// already holds the job lock, so it backs off instead of queueing behind
/// them.
async fn try_lock_item(conn: &mut PgConnection, item_id: Uuid) -> Result<bool, AppError> {
    let locked: Option<(Uuid,)> =
        sqlx::query_as(r#"SELECT id FROM content_items WHERE id = $1 FOR UPDATE SKIP LOCKED"#)
            .bind(item_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;
    Ok(locked.is_some())
}

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
///
/// Every operation is one short transaction; completion applies the plan from
/// [`plan_completion`] under row locks on the job and its item.
#[derive(Clone)]
pub struct JobRepository {
    pool: Pool<Postgres>,
    clock: SharedClock,
    settings: Arc<ChainSettings>,
    lease_ttl: TimeDelta,
}

impl JobRepository {
    pub fn new(
        pool: PgPool,
        clock: SharedClock,
        settings: Arc<ChainSettings>,
        lease_ttl: TimeDelta,
    ) -> Self {
        Self {
            pool,
            clock,
            settings,
            lease_ttl,
        }
    }

    /// Quota charged for `job`, or `None` when it cannot be leased now.
    ///
    /// Candidates reaching this point already passed the active and spacing
    /// checks in the lease query; the window and quota are checked per row.
    async fn reserve_for(
        &self,
        conn: &mut PgConnection,
        job: &ProcessingJob,
        now: DateTime<Utc>,
    ) -> Result<Option<Reserved>, AppError> {
        let Some(channel_id) = job.channel_id else {
            return Ok(Some(Reserved::default()));
        };
        let Some(channel) = fetch_channel(conn, channel_id).await? else {
            return Ok(None);
        };
        let eligibility = channel.schedule_eligibility(now);
        if !eligibility.is_eligible() {
            tracing::trace!(job_id = %job.id, %channel_id, %eligibility, "Publication held back");
            return Ok(None);
        }
        let cost = channel.rate_budget.publish_cost;
        match reserve_in(conn, &channel.quota_key(), cost, now).await? {
            (Reservation::Granted, window_started_at) => Ok(Some(Reserved {
                cost,
                window_started_at,
            })),
            (Reservation::Denied, _) => {
                tracing::debug!(job_id = %job.id, %channel_id, "Quota reservation denied");
                Ok(None)
            }
        }
    }

    async fn mark_running(
        &self,
        conn: &mut PgConnection,
        job: &ProcessingJob,
        worker_id: &str,
        reserved: Reserved,
        now: DateTime<Utc>,
    ) -> Result<ProcessingJob, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE processing_jobs
            SET status = 'running', lease_owner = $2, lease_expires_at = $3,
                started_at = $4, updated_at = $4, quota_reserved = $5,
                quota_window_started_at = $6
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(now + self.lease_ttl)
        .bind(now)
        .bind(reserved.cost)
        .bind(reserved.window_started_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)?;

        if job.stage == Stage::Publication {
            sqlx::query(
                r#"
                UPDATE content_items
                SET stage = 'publishing', publishing_at = $2, updated_at = $2
                WHERE id = $1 AND stage = 'transformed'
                "#,
            )
            .bind(job.item_id)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        }

        row.try_into()
    }

    async fn requeue_where(
        &self,
        candidates: &str,
        bind: Option<&str>,
    ) -> Result<u64, AppError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut query = sqlx::query_as::<_, JobRow>(candidates);
        query = match bind {
            Some(worker_id) => query.bind(worker_id.to_string()),
            None => query.bind(now),
        };
        let rows = query.fetch_all(&mut *tx).await.map_err(db_error)?;

        let count = rows.len() as u64;
        for row in rows {
            let job = ProcessingJob::try_from(row)?;
            requeue(&mut tx, &job, now).await?;
        }
        tx.commit().await.map_err(db_error)?;
        Ok(count)
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
pub(crate) struct JobRow {
    id: Uuid,
    seq: i64,
    item_id: Uuid,
    stage: String,
    channel_id: Option<Uuid>,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    not_before: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error_class: Option<String>,
    last_error: Option<String>,
    artifact_ref: Option<String>,
    wave_id: Option<Uuid>,
    quota_reserved: i64,
    quota_window_started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for ProcessingJob {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, AppError> {
        Ok(ProcessingJob {
            id: row.id,
            item_id: row.item_id,
            stage: row.stage.parse().map_err(AppError::DatabaseError)?,
            channel_id: row.channel_id,
            priority: row.priority,
            status: row.status.parse().map_err(AppError::DatabaseError)?,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            not_before: row.not_before,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            last_error_class: row
                .last_error_class
                .map(|c| c.parse())
                .transpose()
                .map_err(AppError::DatabaseError)?,
            last_error: row.last_error,
            artifact_ref: row.artifact_ref,
            wave_id: row.wave_id,
            quota_reserved: row.quota_reserved,
            quota_window_started_at: row.quota_window_started_at,
            seq: row.seq,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn collect_jobs(rows: Vec<JobRow>) -> Result<Vec<ProcessingJob>, AppError> {
    rows.into_iter().map(ProcessingJob::try_from).collect()
}

pub(crate) async fn fetch_job(
    conn: &mut PgConnection,
    job_id: Uuid,
    for_update: bool,
) -> Result<Option<ProcessingJob>, AppError> {
    let sql = if for_update {
        "SELECT * FROM processing_jobs WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT * FROM processing_jobs WHERE id = $1"
    };
    sqlx::query_as::<_, JobRow>(sql)
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .map(ProcessingJob::try_from)
        .transpose()
}

/// The queued, retrying or running job holding `key`, if any.
pub(crate) async fn active_job(
    conn: &mut PgConnection,
    key: JobKey,
) -> Result<Option<ProcessingJob>, AppError> {
    sqlx::query_as::<_, JobRow>(
        r#"
        SELECT * FROM processing_jobs
        WHERE item_id = $1 AND stage = $2 AND channel_id IS NOT DISTINCT FROM $3
          AND status IN ('queued', 'retrying', 'running')
        LIMIT 1
        "#,
    )
    .bind(key.item_id)
    .bind(key.stage.as_str())
    .bind(key.channel_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .map(ProcessingJob::try_from)
    .transpose()
}

/// Insert a queued job. `None` when its key already has an active job.
pub(crate) async fn insert_job(
    conn: &mut PgConnection,
    job: &NextJob,
    now: DateTime<Utc>,
) -> Result<Option<ProcessingJob>, AppError> {
    sqlx::query_as::<_, JobRow>(
        r#"
        INSERT INTO processing_jobs (item_id, stage, channel_id, priority, not_before,
                                     max_attempts, wave_id, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
        ON CONFLICT DO NOTHING
        RETURNING *
        "#,
    )
    .bind(job.item_id)
    .bind(job.stage.as_str())
    .bind(job.channel_id)
    .bind(job.priority)
    .bind(job.not_before)
    .bind(job.max_attempts as i32)
    .bind(job.wave_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .map(ProcessingJob::try_from)
    .transpose()
}

/// Point every wave member for (item, channel) at `job_id`.
pub(crate) async fn link_wave_members(
    conn: &mut PgConnection,
    item_id: Uuid,
    channel_id: Uuid,
    job_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query(r#"UPDATE wave_members SET job_id = $3 WHERE item_id = $1 AND channel_id = $2"#)
        .bind(item_id)
        .bind(channel_id)
        .bind(job_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

async fn wave_bindings(conn: &mut PgConnection, item_id: Uuid) -> Result<Vec<WaveBinding>, AppError> {
    let rows: Vec<(Uuid, Uuid, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT w.id, wm.channel_id, w.target_time
        FROM wave_members wm
        JOIN waves w ON w.id = wm.wave_id
        WHERE wm.item_id = $1
        "#,
    )
    .bind(item_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;

    Ok(rows
        .into_iter()
        .map(|(wave_id, channel_id, target_time)| WaveBinding {
            wave_id,
            channel_id,
            target_time,
        })
        .collect())
}

/// Give a job's lease-time quota reservation back.
async fn release_reservation(conn: &mut PgConnection, job: &ProcessingJob) -> Result<(), AppError> {
    if job.quota_reserved <= 0 {
        return Ok(());
    }
    if let Some(channel_id) = job.channel_id {
        release_in(
            conn,
            &quota_key_for(channel_id),
            job.quota_reserved,
            job.quota_window_started_at,
        )
        .await?;
    }
    sqlx::query(
        r#"
        UPDATE processing_jobs SET quota_reserved = 0, quota_window_started_at = NULL
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// Running job back to queued without spending an attempt.
async fn requeue(conn: &mut PgConnection, job: &ProcessingJob, now: DateTime<Utc>) -> Result<(), AppError> {
    release_reservation(conn, job).await?;
    sqlx::query(
        r#"
        UPDATE processing_jobs
        SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL, updated_at = $2
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(job.id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn apply_job_update(
    conn: &mut PgConnection,
    job_id: Uuid,
    update: &JobUpdate,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let query = match update {
        JobUpdate::Succeed {
            artifact_ref,
            attempts,
        } => sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'succeeded', attempts = $2, artifact_ref = $3, last_error = NULL,
                lease_owner = NULL, lease_expires_at = NULL, completed_at = $4, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(*attempts as i32)
        .bind(artifact_ref.clone())
        .bind(now),
        JobUpdate::Retry {
            attempts,
            not_before,
            class,
            message,
        } => sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'retrying', attempts = $2, not_before = $3, last_error_class = $4,
                last_error = $5, lease_owner = NULL, lease_expires_at = NULL, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(*attempts as i32)
        .bind(*not_before)
        .bind(class.as_str())
        .bind(message.clone())
        .bind(now),
        JobUpdate::Dead {
            attempts,
            class,
            message,
        } => sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'dead', attempts = $2, last_error_class = $3, last_error = $4,
                lease_owner = NULL, lease_expires_at = NULL, completed_at = $5, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(*attempts as i32)
        .bind(class.as_str())
        .bind(message.clone())
        .bind(now),
        JobUpdate::Discard { reason } => sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'failed', last_error = $2,
                lease_owner = NULL, lease_expires_at = NULL, completed_at = $3, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(reason.clone())
        .bind(now),
    };
    query.execute(&mut *conn).await.map_err(db_error)?;
    Ok(())
}

impl JobQueue for JobRepository {
    async fn submit(
        &self,
        item: NewItem,
        priority: i32,
    ) -> Result<(ContentItem, ProcessingJob), AppError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let item = insert_item(&mut tx, &item, now).await?;
        let next = NextJob {
            item_id: item.id,
            stage: Stage::Discovery,
            channel_id: None,
            priority,
            not_before: now,
            max_attempts: self.settings.retry.max_attempts,
            wave_id: None,
        };
        let job = insert_job(&mut tx, &next, now)
            .await?
            .ok_or_else(|| AppError::DuplicateActiveJob {
                item_id: item.id,
                stage: Stage::Discovery.to_string(),
            })?;
        tx.commit().await.map_err(db_error)?;

        tracing::debug!(item_id = %item.id, job_id = %job.id, "Item submitted");
        Ok((item, job))
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<ProcessingJob, AppError> {
        request.validate()?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let item = require_item(&mut tx, request.item_id, false).await?;
        if item.stage == ItemStage::Failed {
            return Err(AppError::InvalidTransition(format!(
                "item {} has failed; retry its dead or discarded job instead",
                item.id
            )));
        }
        if let Some(channel_id) = request.channel_id
            && fetch_channel(&mut tx, channel_id).await?.is_none()
        {
            return Err(AppError::not_found("channel", channel_id));
        }

        let next = NextJob {
            item_id: request.item_id,
            stage: request.stage,
            channel_id: request.channel_id,
            priority: request.priority,
            not_before: request.not_before.unwrap_or(now),
            max_attempts: request
                .max_attempts
                .unwrap_or(self.settings.retry.max_attempts),
            wave_id: None,
        };
        let job = insert_job(&mut tx, &next, now)
            .await?
            .ok_or_else(|| AppError::DuplicateActiveJob {
                item_id: request.item_id,
                stage: request.stage.to_string(),
            })?;
        tx.commit().await.map_err(db_error)?;

        tracing::debug!(job_id = %job.id, key = %job.key(), "Job enqueued");
        Ok(job)
    }

    async fn lease_next(&self, worker_id: &str) -> Result<Option<ProcessingJob>, AppError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        if current_state(&mut tx).await? == OrchestratorState::Paused {
            return Ok(None);
        }

        // Rejected candidates stay locked by this transaction, so they are
        // excluded explicitly while paging. A channel held back once stays
        // held back for the rest of this call.
        let mut skipped: Vec<Uuid> = Vec::new();
        let mut held_channels: Vec<Uuid> = Vec::new();
        loop {
            let batch = sqlx::query_as::<_, JobRow>(
                r#"
                SELECT j.* FROM processing_jobs j
                LEFT JOIN channels c ON c.id = j.channel_id
                WHERE j.status IN ('queued', 'retrying')
                  AND j.not_before <= $1
                  AND NOT (j.id = ANY($2))
                  AND (
                    j.channel_id IS NULL
                    OR (
                      c.active
                      AND NOT (c.id = ANY($3))
                      AND (
                        c.last_published_at IS NULL
                        OR (c.schedule ->> 'min_interval_secs') IS NULL
                        OR c.last_published_at
                           + (c.schedule ->> 'min_interval_secs')::bigint * INTERVAL '1 second'
                           <= $1
                      )
                    )
                  )
                ORDER BY j.priority DESC, j.not_before ASC, j.seq ASC
                LIMIT $4
                FOR UPDATE OF j SKIP LOCKED
                "#,
            )
            .bind(now)
            .bind(skipped.as_slice())
            .bind(held_channels.as_slice())
            .bind(LEASE_BATCH)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;

            if batch.is_empty() {
                tx.commit().await.map_err(db_error)?;
                return Ok(None);
            }

            for row in batch {
                let job = ProcessingJob::try_from(row)?;
                if job.channel_id.is_some_and(|c| held_channels.contains(&c)) {
                    skipped.push(job.id);
                    continue;
                }
                if job.stage == Stage::Publication && !try_lock_item(&mut tx, job.item_id).await? {
                    tracing::trace!(job_id = %job.id, item_id = %job.item_id, "Item busy, publication skipped");
                    skipped.push(job.id);
                    continue;
                }
                match self.reserve_for(&mut tx, &job, now).await? {
                    Some(reserved) => {
                        let leased = self
                            .mark_running(&mut tx, &job, worker_id, reserved, now)
                            .await?;
                        tx.commit().await.map_err(db_error)?;
                        return Ok(Some(leased));
                    }
                    None => {
                        skipped.push(job.id);
                        if let Some(channel_id) = job.channel_id {
                            held_channels.push(channel_id);
                        }
                    }
                }
            }
        }
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: StageOutcome,
    ) -> Result<CompletionResult, AppError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let job = fetch_job(&mut tx, job_id, true)
            .await?
            .ok_or_else(|| AppError::not_found("job", job_id))?;
        if job.status != JobStatus::Running || !job.is_owned_by(worker_id) {
            tracing::debug!(%job_id, %worker_id, status = %job.status, "Stale completion ignored");
            return Ok(CompletionResult::Stale);
        }
        let item = require_item(&mut tx, job.item_id, true).await?;

        let siblings = if job.stage == Stage::Publication {
            let rows = sqlx::query_as::<_, JobRow>(
                r#"
                SELECT * FROM processing_jobs
                WHERE item_id = $1 AND stage = 'publication' AND id <> $2
                "#,
            )
            .bind(job.item_id)
            .bind(job.id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;
            collect_jobs(rows)?
        } else {
            Vec::new()
        };
        let bindings = if job.stage.next() == Some(Stage::Publication) {
            wave_bindings(&mut tx, job.item_id).await?
        } else {
            Vec::new()
        };

        let plan = plan_completion(
            &CompletionContext {
                job: &job,
                item: &item,
                sibling_publications: &siblings,
                wave_bindings: &bindings,
                now,
            },
            &outcome,
            &self.settings,
        )?;

        if plan.release_quota {
            release_reservation(&mut tx, &job).await?;
        }
        apply_job_update(&mut tx, job.id, &plan.job, now).await?;
        apply_item_update(&mut tx, job.item_id, &plan.item, now).await?;

        if let Some(channel_id) = plan.published_channel {
            sqlx::query(
                r#"UPDATE channels SET last_published_at = $2, updated_at = $2 WHERE id = $1"#,
            )
            .bind(channel_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        let mut enqueued = Vec::with_capacity(plan.next_jobs.len());
        for next in &plan.next_jobs {
            let Some(created) = insert_job(&mut tx, next, now).await? else {
                continue;
            };
            if let (Some(channel_id), Some(_)) = (created.channel_id, created.wave_id) {
                link_wave_members(&mut tx, created.item_id, channel_id, created.id).await?;
            }
            enqueued.push(created.id);
        }

        tx.commit().await.map_err(db_error)?;
        Ok(plan.result(enqueued))
    }

    async fn reclaim_expired_leases(&self) -> Result<u64, AppError> {
        self.requeue_where(
            r#"
            SELECT * FROM processing_jobs
            WHERE status = 'running' AND lease_expires_at <= $1
            FOR UPDATE SKIP LOCKED
            "#,
            None,
        )
        .await
    }

    async fn renew_lease(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'running' AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now + self.lease_ttl)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        self.requeue_where(
            r#"
            SELECT * FROM processing_jobs
            WHERE status = 'running' AND lease_owner = $1
            FOR UPDATE
            "#,
            Some(worker_id),
        )
        .await
    }

    async fn retry_dead_job(&self, job_id: Uuid) -> Result<ProcessingJob, AppError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let job = fetch_job(&mut tx, job_id, true)
            .await?
            .ok_or_else(|| AppError::not_found("job", job_id))?;
        if !job.status.is_retryable_by_operator() {
            return Err(AppError::InvalidTransition(format!(
                "job {job_id} is {}, only dead or discarded jobs can be retried",
                job.status
            )));
        }
        if active_job(&mut tx, job.key()).await?.is_some() {
            return Err(AppError::DuplicateActiveJob {
                item_id: job.item_id,
                stage: job.stage.to_string(),
            });
        }

        let item = require_item(&mut tx, job.item_id, true).await?;
        if item.stage == ItemStage::Failed {
            sqlx::query(
                r#"
                UPDATE content_items
                SET stage = $2, failure_reason = NULL, failed_at = NULL, updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(item.id)
            .bind(item.last_successful_stage().as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE processing_jobs
            SET status = 'queued', attempts = 0, not_before = $2, completed_at = NULL,
                updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;

        row.try_into()
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>, AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        fetch_job(&mut conn, job_id, false).await
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<ProcessingJob>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM processing_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR stage = $2)
              AND ($3::uuid IS NULL OR item_id = $3)
              AND ($4::uuid IS NULL OR channel_id = $4)
            ORDER BY seq DESC
            LIMIT $5
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.stage.map(|s| s.as_str()))
        .bind(filter.item_id)
        .bind(filter.channel_id)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        collect_jobs(rows)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM processing_jobs WHERE status = $1"#)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;

        Ok(count)
    }

    async fn archive_jobs(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM processing_jobs j
            WHERE j.status IN ('succeeded', 'failed', 'dead')
              AND j.completed_at < $1
              AND NOT EXISTS (SELECT 1 FROM wave_members wm WHERE wm.job_id = j.id)
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

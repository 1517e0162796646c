use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Pool, Postgres};
use uuid::Uuid;

use wavecast_core::completion::{ChainSettings, NextJob};
use wavecast_core::error::AppError;
use wavecast_core::item::{ItemStage, Stage};
use wavecast_core::job::{JobKey, JobStatus};
use wavecast_core::traits::WaveStore;
use wavecast_core::wave::{
    MemberState, Wave, WaveMember, WaveMemberRequest, WaveStatus, validate_members,
    validate_wave_request,
};
use wavecast_core::SharedClock;

use crate::channel_repository::ensure_channels_exist;
use crate::database::db_error;
use crate::item_repository::require_item;
use crate::job_repository::{active_job, insert_job};

/// PostgreSQL-backed wave coordination.
///
/// Scheduling locks every member item, then creates or re-binds the
/// publication job of each ready member so that it becomes leasable at the
/// wave's target time.
#[derive(Clone)]
pub struct WaveRepository {
    pool: Pool<Postgres>,
    clock: SharedClock,
    settings: Arc<ChainSettings>,
}

impl WaveRepository {
    pub fn new(pool: PgPool, clock: SharedClock, settings: Arc<ChainSettings>) -> Self {
        Self {
            pool,
            clock,
            settings,
        }
    }

    /// Reject the whole request before anything is written.
    async fn check_members(
        &self,
        conn: &mut PgConnection,
        members: &[WaveMemberRequest],
    ) -> Result<(), AppError> {
        let channel_ids: Vec<Uuid> = members.iter().map(|m| m.channel_id).collect();
        for member in members {
            let item = require_item(conn, member.item_id, true).await?;
            if item.stage == ItemStage::Failed {
                return Err(AppError::InvalidTransition(format!(
                    "item {} has failed",
                    item.id
                )));
            }
        }
        ensure_channels_exist(conn, &channel_ids).await?;

        for member in members {
            let key = publication_key(member);
            if active_job(conn, key)
                .await?
                .is_some_and(|j| j.status == JobStatus::Running)
            {
                return Err(AppError::DuplicateActiveJob {
                    item_id: member.item_id,
                    stage: Stage::Publication.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn attach_member(
        &self,
        conn: &mut PgConnection,
        wave_id: Uuid,
        target_time: DateTime<Utc>,
        member: &WaveMemberRequest,
        now: DateTime<Utc>,
    ) -> Result<WaveMember, AppError> {
        sqlx::query(
            r#"
            UPDATE content_items
            SET channel_ids = array_append(channel_ids, $2), updated_at = $3
            WHERE id = $1 AND NOT ($2 = ANY(channel_ids))
            "#,
        )
        .bind(member.item_id)
        .bind(member.channel_id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

        let item = require_item(conn, member.item_id, false).await?;
        let job_id = if item.stage.ready_for_publication() {
            let key = publication_key(member);
            match active_job(conn, key).await? {
                Some(job) => {
                    sqlx::query(
                        r#"
                        UPDATE processing_jobs
                        SET not_before = $2, priority = GREATEST(priority, $3), wave_id = $4,
                            updated_at = $5
                        WHERE id = $1
                        "#,
                    )
                    .bind(job.id)
                    .bind(target_time)
                    .bind(self.settings.wave_priority)
                    .bind(wave_id)
                    .bind(now)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_error)?;
                    Some(job.id)
                }
                None => {
                    let next = NextJob {
                        item_id: member.item_id,
                        stage: Stage::Publication,
                        channel_id: Some(member.channel_id),
                        priority: self.settings.wave_priority,
                        not_before: target_time,
                        max_attempts: self.settings.retry.max_attempts,
                        wave_id: Some(wave_id),
                    };
                    let created = insert_job(conn, &next, now).await?.ok_or_else(|| {
                        AppError::DuplicateActiveJob {
                            item_id: member.item_id,
                            stage: Stage::Publication.to_string(),
                        }
                    })?;
                    Some(created.id)
                }
            }
        } else {
            None
        };

        sqlx::query(
            r#"
            INSERT INTO wave_members (wave_id, item_id, channel_id, job_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(wave_id)
        .bind(member.item_id)
        .bind(member.channel_id)
        .bind(job_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

        Ok(WaveMember {
            wave_id,
            item_id: member.item_id,
            channel_id: member.channel_id,
            job_id,
        })
    }
}

fn publication_key(member: &WaveMemberRequest) -> JobKey {
    JobKey {
        item_id: member.item_id,
        stage: Stage::Publication,
        channel_id: Some(member.channel_id),
    }
}

#[derive(sqlx::FromRow)]
struct WaveRow {
    id: Uuid,
    label: Option<String>,
    target_time: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct WaveMemberRow {
    wave_id: Uuid,
    item_id: Uuid,
    channel_id: Uuid,
    job_id: Option<Uuid>,
}

impl From<WaveMemberRow> for WaveMember {
    fn from(row: WaveMemberRow) -> Self {
        WaveMember {
            wave_id: row.wave_id,
            item_id: row.item_id,
            channel_id: row.channel_id,
            job_id: row.job_id,
        }
    }
}

async fn fetch_wave(
    conn: &mut PgConnection,
    wave_id: Uuid,
    for_update: bool,
) -> Result<Option<Wave>, AppError> {
    let sql = if for_update {
        "SELECT * FROM waves WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT * FROM waves WHERE id = $1"
    };
    let Some(row) = sqlx::query_as::<_, WaveRow>(sql)
        .bind(wave_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
    else {
        return Ok(None);
    };

    let members = sqlx::query_as::<_, WaveMemberRow>(
        r#"
        SELECT wave_id, item_id, channel_id, job_id FROM wave_members
        WHERE wave_id = $1
        ORDER BY seq
        "#,
    )
    .bind(wave_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;

    Ok(Some(Wave {
        id: row.id,
        label: row.label,
        target_time: row.target_time,
        created_at: row.created_at,
        members: members.into_iter().map(Into::into).collect(),
    }))
}

impl WaveStore for WaveRepository {
    async fn schedule_wave(
        &self,
        members: Vec<WaveMemberRequest>,
        target_time: DateTime<Utc>,
        label: Option<String>,
    ) -> Result<Wave, AppError> {
        let now = self.clock.now();
        validate_wave_request(&members, target_time, now)?;
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        self.check_members(&mut tx, &members).await?;

        let row = sqlx::query_as::<_, WaveRow>(
            r#"
            INSERT INTO waves (label, target_time, created_at)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(&label)
        .bind(target_time)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let mut attached = Vec::with_capacity(members.len());
        for member in &members {
            attached.push(
                self.attach_member(&mut tx, row.id, target_time, member, now)
                    .await?,
            );
        }
        tx.commit().await.map_err(db_error)?;

        tracing::info!(wave_id = %row.id, %target_time, members = attached.len(), "Wave scheduled");
        Ok(Wave {
            id: row.id,
            label: row.label,
            target_time: row.target_time,
            created_at: row.created_at,
            members: attached,
        })
    }

    async fn add_wave_members(
        &self,
        wave_id: Uuid,
        members: Vec<WaveMemberRequest>,
    ) -> Result<Wave, AppError> {
        let now = self.clock.now();
        validate_members(&members)?;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let wave = fetch_wave(&mut tx, wave_id, true)
            .await?
            .ok_or_else(|| AppError::not_found("wave", wave_id))?;
        if !wave.is_open(now) {
            return Err(AppError::WaveClosed(wave_id));
        }
        if let Some(dup) = members.iter().find(|m| {
            wave.members
                .iter()
                .any(|e| e.item_id == m.item_id && e.channel_id == m.channel_id)
        }) {
            return Err(AppError::InvalidInput(format!(
                "item {} on channel {} is already in wave {wave_id}",
                dup.item_id, dup.channel_id
            )));
        }
        self.check_members(&mut tx, &members).await?;

        let mut updated = wave;
        for member in &members {
            let attached = self
                .attach_member(&mut tx, wave_id, updated.target_time, member, now)
                .await?;
            updated.members.push(attached);
        }
        tx.commit().await.map_err(db_error)?;

        tracing::debug!(%wave_id, added = members.len(), "Wave members added");
        Ok(updated)
    }

    async fn get_wave(&self, wave_id: Uuid) -> Result<Option<Wave>, AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        fetch_wave(&mut conn, wave_id, false).await
    }

    async fn wave_status(&self, wave_id: Uuid) -> Result<WaveStatus, AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        let exists: Option<(Uuid,)> = sqlx::query_as(r#"SELECT id FROM waves WHERE id = $1"#)
            .bind(wave_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;
        if exists.is_none() {
            return Err(AppError::not_found("wave", wave_id));
        }

        let rows: Vec<(Option<String>, bool)> = sqlx::query_as(
            r#"
            SELECT j.status, (i.stage = 'failed') AS item_failed
            FROM wave_members wm
            JOIN content_items i ON i.id = wm.item_id
            LEFT JOIN processing_jobs j ON j.id = wm.job_id
            WHERE wm.wave_id = $1
            "#,
        )
        .bind(wave_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;

        let members = rows
            .into_iter()
            .map(|(status, item_failed)| -> Result<MemberState, String> {
                let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
                Ok(MemberState::new(status, item_failed))
            })
            .collect::<Result<Vec<_>, String>>()
            .map_err(AppError::DatabaseError)?;
        Ok(WaveStatus::from_members(members))
    }
}

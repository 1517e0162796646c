use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Pool, Postgres};
use uuid::Uuid;

use wavecast_core::channel::{Channel, CredentialScope, NewChannel, PostingSchedule, RateBudget};
use wavecast_core::error::AppError;
use wavecast_core::traits::ChannelStore;
use wavecast_core::SharedClock;

use crate::database::{db_error, violates};
use crate::quota_repository::configure_in;

/// PostgreSQL-backed channel store. Creating or rescheduling a channel also
/// configures its quota bucket in the same transaction.
#[derive(Clone)]
pub struct ChannelRepository {
    pool: Pool<Postgres>,
    clock: SharedClock,
}

impl ChannelRepository {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ChannelRow {
    id: Uuid,
    name: String,
    active: bool,
    credential_scope: String,
    schedule: Json<PostingSchedule>,
    rate_capacity: i64,
    rate_window_secs: i64,
    publish_cost: i64,
    last_published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ChannelRow> for Channel {
    fn from(row: ChannelRow) -> Self {
        Channel {
            id: row.id,
            name: row.name,
            active: row.active,
            credential_scope: CredentialScope::new(row.credential_scope),
            schedule: row.schedule.0,
            rate_budget: RateBudget {
                capacity: row.rate_capacity,
                window_secs: row.rate_window_secs,
                publish_cost: row.publish_cost,
            },
            last_published_at: row.last_published_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub(crate) async fn fetch_channel(
    conn: &mut PgConnection,
    channel_id: Uuid,
) -> Result<Option<Channel>, AppError> {
    let row = sqlx::query_as::<_, ChannelRow>(r#"SELECT * FROM channels WHERE id = $1"#)
        .bind(channel_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;

    Ok(row.map(Into::into))
}

/// `NotFound` for the first id in `channel_ids` with no channel row.
pub(crate) async fn ensure_channels_exist(
    conn: &mut PgConnection,
    channel_ids: &[Uuid],
) -> Result<(), AppError> {
    if channel_ids.is_empty() {
        return Ok(());
    }
    let found: Vec<(Uuid,)> = sqlx::query_as(r#"SELECT id FROM channels WHERE id = ANY($1)"#)
        .bind(channel_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;

    match channel_ids
        .iter()
        .find(|id| !found.iter().any(|(f,)| f == *id))
    {
        Some(missing) => Err(AppError::not_found("channel", *missing)),
        None => Ok(()),
    }
}

impl ChannelStore for ChannelRepository {
    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, AppError> {
        channel.validate()?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query_as::<_, ChannelRow>(
            r#"
            INSERT INTO channels (name, credential_scope, schedule, rate_capacity, rate_window_secs,
                                  publish_cost, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING *
            "#,
        )
        .bind(&channel.name)
        .bind(channel.credential_scope.as_str())
        .bind(Json(&channel.schedule))
        .bind(channel.rate_budget.capacity)
        .bind(channel.rate_budget.window_secs)
        .bind(channel.rate_budget.publish_cost)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if violates(&e, "uq_channels_credential_scope") {
                AppError::InvalidInput(format!(
                    "credential scope '{}' is already bound to a channel",
                    channel.credential_scope
                ))
            } else {
                db_error(e)
            }
        })?;
        let created = Channel::from(row);

        configure_in(
            &mut tx,
            &created.quota_key(),
            created.rate_budget.capacity,
            created.rate_budget.window_secs,
            now,
        )
        .await?;
        tx.commit().await.map_err(db_error)?;

        tracing::info!(channel_id = %created.id, name = %created.name, "Channel created");
        Ok(created)
    }

    async fn get_channel(&self, channel_id: Uuid) -> Result<Option<Channel>, AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        fetch_channel(&mut conn, channel_id).await
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, AppError> {
        let rows = sqlx::query_as::<_, ChannelRow>(r#"SELECT * FROM channels ORDER BY name, created_at"#)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_active(&self, channel_id: Uuid, active: bool) -> Result<Channel, AppError> {
        let row = sqlx::query_as::<_, ChannelRow>(
            r#"
            UPDATE channels SET active = $2, updated_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(channel_id)
        .bind(active)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(Into::into)
            .ok_or_else(|| AppError::not_found("channel", channel_id))
    }

    async fn update_schedule(
        &self,
        channel_id: Uuid,
        schedule: PostingSchedule,
        rate_budget: RateBudget,
    ) -> Result<Channel, AppError> {
        schedule.validate()?;
        rate_budget.validate()?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query_as::<_, ChannelRow>(
            r#"
            UPDATE channels
            SET schedule = $2, rate_capacity = $3, rate_window_secs = $4, publish_cost = $5,
                updated_at = $6
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(channel_id)
        .bind(Json(&schedule))
        .bind(rate_budget.capacity)
        .bind(rate_budget.window_secs)
        .bind(rate_budget.publish_cost)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or_else(|| AppError::not_found("channel", channel_id))?;
        let updated = Channel::from(row);

        configure_in(
            &mut tx,
            &updated.quota_key(),
            rate_budget.capacity,
            rate_budget.window_secs,
            now,
        )
        .await?;
        tx.commit().await.map_err(db_error)?;
        Ok(updated)
    }
}

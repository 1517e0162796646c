use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Pool, Postgres};
use uuid::Uuid;

use wavecast_core::completion::ItemUpdate;
use wavecast_core::error::AppError;
use wavecast_core::item::{ContentItem, ItemStage, NewItem, Stage, StageTimestamps};
use wavecast_core::traits::ItemStore;
use wavecast_core::SharedClock;

use crate::channel_repository::ensure_channels_exist;
use crate::database::db_error;

/// PostgreSQL-backed content item store.
#[derive(Clone)]
pub struct ItemRepository {
    pool: Pool<Postgres>,
    clock: SharedClock,
}

impl ItemRepository {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
pub(crate) struct ItemRow {
    id: Uuid,
    source_ref: String,
    stage: String,
    artifacts: Json<BTreeMap<Stage, String>>,
    channel_ids: Vec<Uuid>,
    failure_reason: Option<String>,
    discovered_at: Option<DateTime<Utc>>,
    acquired_at: Option<DateTime<Utc>>,
    transformed_at: Option<DateTime<Utc>>,
    publishing_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ItemRow> for ContentItem {
    type Error = AppError;

    fn try_from(row: ItemRow) -> Result<Self, AppError> {
        Ok(ContentItem {
            id: row.id,
            source_ref: row.source_ref,
            stage: row.stage.parse().map_err(AppError::DatabaseError)?,
            artifacts: row.artifacts.0,
            channel_ids: row.channel_ids,
            failure_reason: row.failure_reason,
            timestamps: StageTimestamps {
                discovered_at: row.discovered_at,
                acquired_at: row.acquired_at,
                transformed_at: row.transformed_at,
                publishing_at: row.publishing_at,
                published_at: row.published_at,
                failed_at: row.failed_at,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) async fn fetch_item(
    conn: &mut PgConnection,
    item_id: Uuid,
    for_update: bool,
) -> Result<Option<ContentItem>, AppError> {
    let sql = if for_update {
        "SELECT * FROM content_items WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT * FROM content_items WHERE id = $1"
    };
    sqlx::query_as::<_, ItemRow>(sql)
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .map(ContentItem::try_from)
        .transpose()
}

pub(crate) async fn require_item(
    conn: &mut PgConnection,
    item_id: Uuid,
    for_update: bool,
) -> Result<ContentItem, AppError> {
    fetch_item(conn, item_id, for_update)
        .await?
        .ok_or_else(|| AppError::not_found("item", item_id))
}

pub(crate) async fn insert_item(
    conn: &mut PgConnection,
    item: &NewItem,
    now: DateTime<Utc>,
) -> Result<ContentItem, AppError> {
    if item.source_ref.trim().is_empty() {
        return Err(AppError::InvalidInput("source_ref is required".into()));
    }
    ensure_channels_exist(conn, &item.channel_ids).await?;

    let row = sqlx::query_as::<_, ItemRow>(
        r#"
        INSERT INTO content_items (source_ref, channel_ids, discovered_at, created_at, updated_at)
        VALUES ($1, $2, $3, $3, $3)
        RETURNING *
        "#,
    )
    .bind(&item.source_ref)
    .bind(item.channel_ids.as_slice())
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)?;

    row.try_into()
}

/// Move an item to `stage` and stamp the matching timestamp column.
pub(crate) async fn set_item_stage(
    conn: &mut PgConnection,
    item_id: Uuid,
    stage: ItemStage,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    // The column name comes from a fixed set of identifiers, never from input.
    let sql = format!(
        "UPDATE content_items SET stage = $2, {} = $3, updated_at = $3 WHERE id = $1",
        stage.timestamp_column()
    );
    sqlx::query(&sql)
        .bind(item_id)
        .bind(stage.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

pub(crate) async fn apply_item_update(
    conn: &mut PgConnection,
    item_id: Uuid,
    update: &ItemUpdate,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if let Some((stage, artifact)) = &update.artifact {
        sqlx::query(
            r#"
            UPDATE content_items
            SET artifacts = artifacts || jsonb_build_object($2::text, $3::text), updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(stage.as_str())
        .bind(artifact)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    }
    if let Some(reason) = &update.failure_reason {
        sqlx::query(r#"UPDATE content_items SET failure_reason = $2, updated_at = $3 WHERE id = $1"#)
            .bind(item_id)
            .bind(reason)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }
    if let Some(stage) = update.stage {
        set_item_stage(conn, item_id, stage, now).await?;
    }
    Ok(())
}

impl ItemStore for ItemRepository {
    async fn create_item(&self, item: NewItem) -> Result<ContentItem, AppError> {
        let now = self.clock.now();
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        insert_item(&mut conn, &item, now).await
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<ContentItem>, AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        fetch_item(&mut conn, item_id, false).await
    }

    async fn list_items(
        &self,
        stage: Option<ItemStage>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, AppError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT * FROM content_items
            WHERE ($1::text IS NULL OR stage = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(stage.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(ContentItem::try_from).collect()
    }

    async fn mark_item_failed(&self, item_id: Uuid, reason: &str) -> Result<ContentItem, AppError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let item = require_item(&mut tx, item_id, true).await?;
        if item.stage.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "item {item_id} is already {}",
                item.stage
            )));
        }

        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            UPDATE content_items
            SET stage = 'failed', failure_reason = $2, failed_at = $3, updated_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(item_id)
        .bind(reason)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        // Running jobs keep going; their completion is discarded.
        let discarded = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'failed', last_error = $2, completed_at = $3, updated_at = $3
            WHERE item_id = $1 AND status IN ('queued', 'retrying')
            "#,
        )
        .bind(item_id)
        .bind(format!("item failed: {reason}"))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        tracing::debug!(%item_id, discarded = discarded.rows_affected(), "Queued jobs discarded");
        row.try_into()
    }
}

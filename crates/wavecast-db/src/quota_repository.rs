use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Pool, Postgres};

use wavecast_core::error::AppError;
use wavecast_core::quota::{QuotaBucket, QuotaTracker, Reservation};
use wavecast_core::SharedClock;

use crate::database::db_error;

/// Quota buckets kept in `quota_buckets`. Every reservation is one
/// conditional `UPDATE`, so concurrent workers in different processes never
/// overspend a bucket.
#[derive(Clone)]
pub struct QuotaRepository {
    pool: Pool<Postgres>,
    clock: SharedClock,
}

impl QuotaRepository {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    pub async fn get_bucket(&self, resource_key: &str) -> Result<Option<QuotaBucket>, AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        fetch_bucket(&mut conn, resource_key).await
    }
}

#[derive(sqlx::FromRow)]
struct QuotaBucketRow {
    resource_key: String,
    capacity: i64,
    used: i64,
    window_secs: i64,
    window_started_at: DateTime<Utc>,
}

impl From<QuotaBucketRow> for QuotaBucket {
    fn from(row: QuotaBucketRow) -> Self {
        QuotaBucket {
            resource_key: row.resource_key,
            capacity: row.capacity,
            used: row.used,
            window_secs: row.window_secs,
            window_started_at: row.window_started_at,
        }
    }
}

pub(crate) async fn fetch_bucket(
    conn: &mut PgConnection,
    resource_key: &str,
) -> Result<Option<QuotaBucket>, AppError> {
    let row = sqlx::query_as::<_, QuotaBucketRow>(
        r#"SELECT * FROM quota_buckets WHERE resource_key = $1"#,
    )
    .bind(resource_key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?;

    Ok(row.map(Into::into))
}

pub(crate) async fn configure_in(
    conn: &mut PgConnection,
    resource_key: &str,
    capacity: i64,
    window_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO quota_buckets (resource_key, capacity, used, window_secs, window_started_at)
        VALUES ($1, $2, 0, $3, $4)
        ON CONFLICT (resource_key)
        DO UPDATE SET capacity = EXCLUDED.capacity, window_secs = EXCLUDED.window_secs
        "#,
    )
    .bind(resource_key)
    .bind(capacity)
    .bind(window_secs)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// Take `cost` units, rolling an elapsed window over first. Keys without a
/// bucket are unlimited.
///
/// A granted reservation comes with the start of the window it was charged
/// to (`None` for unlimited keys), which a later refund must match.
pub(crate) async fn reserve_in(
    conn: &mut PgConnection,
    resource_key: &str,
    cost: i64,
    now: DateTime<Utc>,
) -> Result<(Reservation, Option<DateTime<Utc>>), AppError> {
    let charged: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        UPDATE quota_buckets
        SET used = CASE
                WHEN window_started_at + window_secs * INTERVAL '1 second' <= $3 THEN $2
                ELSE used + $2
            END,
            window_started_at = CASE
                WHEN window_started_at + window_secs * INTERVAL '1 second' <= $3 THEN $3
                ELSE window_started_at
            END
        WHERE resource_key = $1
          AND $2 + CASE
                WHEN window_started_at + window_secs * INTERVAL '1 second' <= $3 THEN 0
                ELSE used
            END <= capacity
        RETURNING window_started_at
        "#,
    )
    .bind(resource_key)
    .bind(cost)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?;

    if let Some((window_started_at,)) = charged {
        return Ok((Reservation::Granted, Some(window_started_at)));
    }

    let (exists,): (bool,) =
        sqlx::query_as(r#"SELECT EXISTS (SELECT 1 FROM quota_buckets WHERE resource_key = $1)"#)
            .bind(resource_key)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error)?;

    Ok(if exists {
        (Reservation::Denied, None)
    } else {
        (Reservation::Granted, None)
    })
}

/// Return `cost` units. With `window_started_at` set, the refund only
/// applies while the bucket is still in that window.
pub(crate) async fn release_in(
    conn: &mut PgConnection,
    resource_key: &str,
    cost: i64,
    window_started_at: Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    let released = sqlx::query(
        r#"
        UPDATE quota_buckets SET used = GREATEST(used - $2, 0)
        WHERE resource_key = $1
          AND ($3::timestamptz IS NULL OR window_started_at = $3)
        "#,
    )
    .bind(resource_key)
    .bind(cost)
    .bind(window_started_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    if released.rows_affected() == 0 {
        tracing::debug!(%resource_key, cost, "Quota refund dropped, window has rolled over");
    }
    Ok(())
}

impl QuotaTracker for QuotaRepository {
    async fn configure(
        &self,
        resource_key: &str,
        capacity: i64,
        window_secs: i64,
    ) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        configure_in(&mut conn, resource_key, capacity, window_secs, self.clock.now()).await
    }

    async fn reserve(&self, resource_key: &str, cost: i64) -> Result<Reservation, AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        let (reservation, _) = reserve_in(&mut conn, resource_key, cost, self.clock.now()).await?;
        Ok(reservation)
    }

    async fn release(&self, resource_key: &str, cost: i64) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        release_in(&mut conn, resource_key, cost, None).await
    }

    async fn remaining(&self, resource_key: &str) -> Result<Option<i64>, AppError> {
        let now = self.clock.now();
        Ok(self
            .get_bucket(resource_key)
            .await?
            .map(|bucket| bucket.remaining_at(now)))
    }
}

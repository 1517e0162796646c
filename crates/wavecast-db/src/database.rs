use std::sync::Arc;

use chrono::TimeDelta;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use wavecast_core::completion::ChainSettings;
use wavecast_core::{AppError, SharedClock, system_clock};

use crate::channel_repository::ChannelRepository;
use crate::config::DatabaseConfig;
use crate::item_repository::ItemRepository;
use crate::job_repository::JobRepository;
use crate::quota_repository::QuotaRepository;
use crate::state_repository::StateRepository;
use crate::wave_repository::WaveRepository;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends repository instances sharing one clock and one set of chain
/// settings.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    clock: SharedClock,
    settings: Arc<ChainSettings>,
    lease_ttl: TimeDelta,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self::from_pool(pool))
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: system_clock(),
            settings: Arc::new(ChainSettings::default()),
            lease_ttl: TimeDelta::minutes(5),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_chain_settings(mut self, settings: ChainSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: TimeDelta) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`JobRepository`] backed by this pool.
    pub fn job_repo(&self) -> JobRepository {
        JobRepository::new(
            self.pool.clone(),
            self.clock.clone(),
            self.settings.clone(),
            self.lease_ttl,
        )
    }

    pub fn item_repo(&self) -> ItemRepository {
        ItemRepository::new(self.pool.clone(), self.clock.clone())
    }

    pub fn channel_repo(&self) -> ChannelRepository {
        ChannelRepository::new(self.pool.clone(), self.clock.clone())
    }

    pub fn wave_repo(&self) -> WaveRepository {
        WaveRepository::new(self.pool.clone(), self.clock.clone(), self.settings.clone())
    }

    pub fn quota_repo(&self) -> QuotaRepository {
        QuotaRepository::new(self.pool.clone(), self.clock.clone())
    }

    pub fn state_repo(&self) -> StateRepository {
        StateRepository::new(self.pool.clone(), self.clock.clone())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query to confirm the pool can reach PostgreSQL.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

pub(crate) fn db_error(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

/// True when `e` violates the named unique constraint or index.
pub(crate) fn violates(e: &sqlx::Error, constraint: &str) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation() && db.constraint() == Some(constraint),
        _ => false,
    }
}

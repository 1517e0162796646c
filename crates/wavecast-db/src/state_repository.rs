use sqlx::{PgConnection, PgPool, Pool, Postgres};

use wavecast_core::error::AppError;
use wavecast_core::job_queue::{OrchestratorControl, OrchestratorState};
use wavecast_core::SharedClock;

use crate::database::db_error;

/// The persisted pause switch (single row in `orchestrator_state`).
#[derive(Clone)]
pub struct StateRepository {
    pool: Pool<Postgres>,
    clock: SharedClock,
}

impl StateRepository {
    pub fn new(pool: PgPool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }
}

pub(crate) async fn current_state(conn: &mut PgConnection) -> Result<OrchestratorState, AppError> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT state FROM orchestrator_state WHERE id"#)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?;

    match row {
        Some((state,)) => state.parse().map_err(AppError::DatabaseError),
        None => Ok(OrchestratorState::Running),
    }
}

impl OrchestratorControl for StateRepository {
    async fn state(&self) -> Result<OrchestratorState, AppError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        current_state(&mut conn).await
    }

    async fn set_state(&self, state: OrchestratorState) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_state (id, state, updated_at)
            VALUES (TRUE, $1, $2)
            ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.as_str())
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        tracing::info!(%state, "Orchestrator state changed");
        Ok(())
    }
}

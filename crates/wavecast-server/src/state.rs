use wavecast_core::{ChannelOrchestrator, OperatorService};
use wavecast_db::{
    ChannelRepository, Database, ItemRepository, JobRepository, QuotaRepository, StateRepository,
    WaveRepository,
};

pub type Operator = OperatorService<JobRepository, ItemRepository, WaveRepository, StateRepository>;
pub type Channels = ChannelOrchestrator<ChannelRepository, QuotaRepository>;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Database,
    /// Bearer token guarding `/v1` (None = operator endpoints disabled).
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(db: Database, admin_token: Option<String>) -> Self {
        Self { db, admin_token }
    }

    pub fn operator(&self) -> Operator {
        OperatorService::new(
            self.db.job_repo(),
            self.db.item_repo(),
            self.db.wave_repo(),
            self.db.state_repo(),
        )
    }

    pub fn channels(&self) -> Channels {
        ChannelOrchestrator::new(self.db.channel_repo(), self.db.quota_repo())
    }
}

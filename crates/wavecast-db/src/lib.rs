pub mod channel_repository;
pub mod config;
pub mod database;
pub mod item_repository;
pub mod job_repository;
pub mod quota_repository;
pub mod state_repository;
pub mod wave_repository;

pub use channel_repository::ChannelRepository;
pub use config::DatabaseConfig;
pub use database::Database;
pub use item_repository::ItemRepository;
pub use job_repository::JobRepository;
pub use quota_repository::QuotaRepository;
pub use state_repository::StateRepository;
pub use wave_repository::WaveRepository;

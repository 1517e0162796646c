use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::completion::ChainSettings;
use crate::error::AppError;
use crate::retry::RetryPolicy;

/// Queue and worker pool tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub retry: RetryPolicy,
    pub wave_priority: i32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(1000),
            lease_ttl: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            wave_priority: 100,
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// - `WAVECAST_WORKERS` (default 4)
    /// - `WAVECAST_POLL_INTERVAL_MS` (default 1000)
    /// - `WAVECAST_LEASE_TTL_SECS` (default 300)
    /// - `WAVECAST_RETRY_BASE_SECS` (default 30)
    /// - `WAVECAST_RETRY_MAX_DELAY_SECS` (default 3600)
    /// - `WAVECAST_MAX_ATTEMPTS` (default 3)
    /// - `WAVECAST_WAVE_PRIORITY` (default 100)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let workers: usize = env_or("WAVECAST_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(AppError::ConfigError(
                "WAVECAST_WORKERS must be at least 1".into(),
            ));
        }
        let poll_ms: u64 = env_or("WAVECAST_POLL_INTERVAL_MS", 1000)?;
        let lease_ttl_secs: u64 = env_or("WAVECAST_LEASE_TTL_SECS", 300)?;
        if lease_ttl_secs == 0 {
            return Err(AppError::ConfigError(
                "WAVECAST_LEASE_TTL_SECS must be at least 1".into(),
            ));
        }
        let base_secs: i64 = env_or("WAVECAST_RETRY_BASE_SECS", 30)?;
        let max_delay_secs: i64 = env_or("WAVECAST_RETRY_MAX_DELAY_SECS", 3600)?;
        let max_attempts: u32 = env_or("WAVECAST_MAX_ATTEMPTS", defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(AppError::ConfigError(
                "WAVECAST_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }

        Ok(Self {
            workers,
            poll_interval: Duration::from_millis(poll_ms),
            lease_ttl: Duration::from_secs(lease_ttl_secs),
            retry: RetryPolicy::new(
                seconds(base_secs, "WAVECAST_RETRY_BASE_SECS")?,
                seconds(max_delay_secs, "WAVECAST_RETRY_MAX_DELAY_SECS")?,
                max_attempts,
            ),
            wave_priority: env_or("WAVECAST_WAVE_PRIORITY", defaults.wave_priority)?,
        })
    }

    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            retry: self.retry.clone(),
            wave_priority: self.wave_priority,
        }
    }

    pub fn lease_ttl_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.lease_ttl).unwrap_or(TimeDelta::minutes(5))
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::ConfigError(format!("Invalid {key} '{raw}'"))),
    }
}

fn seconds(value: i64, key: &str) -> Result<TimeDelta, AppError> {
    if value < 0 {
        return Err(AppError::ConfigError(format!("{key} must not be negative")));
    }
    TimeDelta::try_seconds(value)
        .ok_or_else(|| AppError::ConfigError(format!("{key} is out of range")))
}

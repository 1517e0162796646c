//! Fixed-size worker pool plus lease reaper.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::job_queue::JobQueue;
use crate::runner::WorkflowRunner;
use crate::worker::{WorkerConfig, WorkerReporter, WorkerService};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Worker ids are `{prefix}-{n}`.
    pub worker_prefix: String,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    /// How often expired leases are swept back into the queue.
    pub reap_interval: Duration,
}

impl PoolConfig {
    pub fn new(workers: usize, lease_ttl: Duration) -> Self {
        Self {
            workers,
            worker_prefix: default_prefix(),
            poll_interval: Duration::from_secs(1),
            lease_ttl,
            reap_interval: (lease_ttl / 2).max(Duration::from_secs(1)),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id(format!("{}-{index}", self.worker_prefix))
            .with_poll_interval(self.poll_interval)
            .with_lease_ttl(self.lease_ttl)
    }
}

fn default_prefix() -> String {
    format!("wavecast-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

/// Run `config.workers` workers and one reaper until `cancel_token` fires.
pub async fn run_pool<Q, R, WR>(
    queue: Q,
    runner: R,
    config: PoolConfig,
    cancel_token: CancellationToken,
    reporter: Arc<WR>,
) -> Result<(), AppError>
where
    Q: JobQueue + 'static,
    R: WorkflowRunner + 'static,
    WR: WorkerReporter + 'static,
{
    let mut tasks = JoinSet::new();

    for index in 0..config.workers {
        let worker = WorkerService::new(queue.clone(), runner.clone(), config.worker_config(index));
        let token = cancel_token.clone();
        let reporter = reporter.clone();
        tasks.spawn(async move { worker.run(token, reporter.as_ref()).await });
    }

    tasks.spawn(reap_expired_leases(
        queue,
        config.reap_interval,
        cancel_token.clone(),
    ));

    tracing::info!(workers = config.workers, "Worker pool started");

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Pool task failed");
                cancel_token.cancel();
                first_error.get_or_insert(e);
            }
            Err(e) => {
                tracing::error!(error = %e, "Pool task panicked");
                cancel_token.cancel();
                first_error.get_or_insert(AppError::Generic(format!("pool task panicked: {e}")));
            }
        }
    }

    tracing::info!("Worker pool stopped");
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Periodically return expired leases to the queue.
pub async fn reap_expired_leases<Q: JobQueue>(
    queue: Q,
    interval: Duration,
    cancel_token: CancellationToken,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue.reclaim_expired_leases().await {
                    Ok(0) => {}
                    Ok(n) => tracing::warn!(reclaimed = n, "Reclaimed expired leases"),
                    Err(e) => tracing::error!(error = %e, "Lease reclaim failed"),
                }
            }
            () = cancel_token.cancelled() => return Ok(()),
        }
    }
}

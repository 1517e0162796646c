use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CompletionResult, ProcessingJob, StageOutcome};
use crate::job_queue::JobQueue;
use crate::runner::WorkflowRunner;

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    JobLeased {
        job: &'a ProcessingJob,
    },
    JobSucceeded {
        job_id: Uuid,
        artifact_ref: &'a str,
        enqueued: usize,
    },
    JobRetrying {
        job_id: Uuid,
        error: &'a str,
        not_before: DateTime<Utc>,
    },
    JobDead {
        job_id: Uuid,
        error: &'a str,
    },
    /// The item was failed while the job ran; its result was dropped.
    JobDiscarded {
        job_id: Uuid,
    },
    LeaseLost {
        job_id: Uuid,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::trace!("Polling for jobs");
            }
            WorkerEvent::JobLeased { job } => {
                tracing::info!(
                    job_id = %job.id,
                    item_id = %job.item_id,
                    stage = %job.stage,
                    channel_id = ?job.channel_id,
                    attempt = job.attempts + 1,
                    "Job leased"
                );
            }
            WorkerEvent::JobSucceeded {
                job_id,
                artifact_ref,
                enqueued,
            } => {
                tracing::info!(%job_id, %artifact_ref, %enqueued, "Job succeeded");
            }
            WorkerEvent::JobRetrying {
                job_id,
                error,
                not_before,
            } => {
                tracing::warn!(%job_id, %error, %not_before, "Job failed, will retry");
            }
            WorkerEvent::JobDead { job_id, error } => {
                tracing::error!(%job_id, %error, "Job dead");
            }
            WorkerEvent::JobDiscarded { job_id } => {
                tracing::info!(%job_id, "Job result discarded, item was failed");
            }
            WorkerEvent::LeaseLost { job_id } => {
                tracing::warn!(%job_id, "Lease lost, result dropped");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    /// How often a running job's lease is pushed forward. Keep well below
    /// the queue's lease TTL.
    pub lease_renew_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(1),
            lease_renew_interval: Duration::from_secs(100),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Renew at a third of the lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_renew_interval = (ttl / 3).max(Duration::from_millis(10));
        self
    }
}

/// Worker that leases jobs from the queue and runs them.
pub struct WorkerService<Q, R>
where
    Q: JobQueue,
    R: WorkflowRunner,
{
    queue: Q,
    runner: R,
    config: WorkerConfig,
}

impl<Q, R> WorkerService<Q, R>
where
    Q: JobQueue,
    R: WorkflowRunner,
{
    pub fn new(queue: Q, runner: R, config: WorkerConfig) -> Self {
        Self {
            queue,
            runner,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker loop until cancellation.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.queue.lease_next(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    reporter.report(WorkerEvent::JobLeased { job: &job });
                    self.process_job(&job, &cancel_token, reporter).await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to lease job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Anything still leased goes back to the queue without losing an attempt.
        let released = match self.queue.release_worker_jobs(&self.config.worker_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Failed to release leased jobs");
                0
            }
        };

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Lease and process at most one job. Returns what the queue did with
    /// the outcome, or `None` when nothing was leasable.
    pub async fn run_once<WR: WorkerReporter>(
        &self,
        reporter: &WR,
    ) -> Result<Option<CompletionResult>, AppError> {
        let Some(job) = self.queue.lease_next(&self.config.worker_id).await? else {
            return Ok(None);
        };
        reporter.report(WorkerEvent::JobLeased { job: &job });
        Ok(self
            .process_job(&job, &CancellationToken::new(), reporter)
            .await)
    }

    async fn process_job<WR: WorkerReporter>(
        &self,
        job: &ProcessingJob,
        cancel_token: &CancellationToken,
        reporter: &WR,
    ) -> Option<CompletionResult> {
        let outcome = self.execute_with_renewal(job, cancel_token, reporter).await?;

        let result = match self
            .queue
            .complete(job.id, &self.config.worker_id, outcome.clone())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record job outcome");
                return None;
            }
        };

        match (&result, &outcome) {
            (CompletionResult::Succeeded { enqueued }, StageOutcome::Success { artifact_ref }) => {
                reporter.report(WorkerEvent::JobSucceeded {
                    job_id: job.id,
                    artifact_ref,
                    enqueued: enqueued.len(),
                });
            }
            (CompletionResult::Retrying { not_before }, StageOutcome::Failure(failure)) => {
                reporter.report(WorkerEvent::JobRetrying {
                    job_id: job.id,
                    error: &failure.message,
                    not_before: *not_before,
                });
            }
            (CompletionResult::Dead, StageOutcome::Failure(failure)) => {
                reporter.report(WorkerEvent::JobDead {
                    job_id: job.id,
                    error: &failure.message,
                });
            }
            (CompletionResult::Discarded, _) => {
                reporter.report(WorkerEvent::JobDiscarded { job_id: job.id });
            }
            (CompletionResult::Stale, _) => {
                reporter.report(WorkerEvent::LeaseLost { job_id: job.id });
            }
            _ => {}
        }
        Some(result)
    }

    /// Run the job while renewing its lease. `None` if cancelled mid-run;
    /// the lease is then released by the shutdown path.
    async fn execute_with_renewal<WR: WorkerReporter>(
        &self,
        job: &ProcessingJob,
        cancel_token: &CancellationToken,
        reporter: &WR,
    ) -> Option<StageOutcome> {
        let run = self.runner.run(job);
        tokio::pin!(run);

        let mut renew = tokio::time::interval(self.config.lease_renew_interval);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        renew.tick().await;

        let mut lease_held = true;
        loop {
            tokio::select! {
                outcome = &mut run => return Some(outcome),
                () = cancel_token.cancelled() => {
                    tracing::info!(job_id = %job.id, "Cancelled while running job");
                    return None;
                }
                _ = renew.tick(), if lease_held => {
                    match self.queue.renew_lease(job.id, &self.config.worker_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            reporter.report(WorkerEvent::LeaseLost { job_id: job.id });
                            lease_held = false;
                        }
                        Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Lease renewal failed"),
                    }
                }
            }
        }
    }
}

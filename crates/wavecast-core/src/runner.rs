//! Workflow runners turn a leased job into a [`StageOutcome`].

use std::future::Future;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::AppError;
use crate::item::Stage;
use crate::job::{ProcessingJob, StageFailure, StageOutcome};
use crate::traits::{CredentialScopeResolver, ItemStore, StageExecutor, StageInput};

/// Executes a leased job somewhere and reports how it went.
///
/// The queue never cares where a stage actually runs; this is the seam for
/// swapping an in-process executor for an external workflow backend.
pub trait WorkflowRunner: Send + Sync + Clone {
    fn run(&self, job: &ProcessingJob) -> impl Future<Output = StageOutcome> + Send;
}

#[derive(Clone, Debug)]
struct StageBreakers {
    discovery: CircuitBreaker,
    acquisition: CircuitBreaker,
    transformation: CircuitBreaker,
    publication: CircuitBreaker,
}

impl StageBreakers {
    fn new(config: &CircuitBreakerConfig) -> Self {
        let make = |stage: Stage| CircuitBreaker::new(stage.as_str(), config.clone());
        Self {
            discovery: make(Stage::Discovery),
            acquisition: make(Stage::Acquisition),
            transformation: make(Stage::Transformation),
            publication: make(Stage::Publication),
        }
    }

    fn get(&self, stage: Stage) -> &CircuitBreaker {
        match stage {
            Stage::Discovery => &self.discovery,
            Stage::Acquisition => &self.acquisition,
            Stage::Transformation => &self.transformation,
            Stage::Publication => &self.publication,
        }
    }
}

/// Runs stages in-process through a [`StageExecutor`], one circuit breaker
/// per stage.
#[derive(Clone)]
pub struct ExecutorRunner<E, I, R>
where
    E: StageExecutor,
    I: ItemStore,
    R: CredentialScopeResolver,
{
    executor: E,
    items: I,
    resolver: R,
    breakers: StageBreakers,
}

impl<E, I, R> ExecutorRunner<E, I, R>
where
    E: StageExecutor,
    I: ItemStore,
    R: CredentialScopeResolver,
{
    pub fn new(executor: E, items: I, resolver: R, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            executor,
            items,
            resolver,
            breakers: StageBreakers::new(&breaker_config),
        }
    }

    pub fn breaker(&self, stage: Stage) -> &CircuitBreaker {
        self.breakers.get(stage)
    }

    async fn prepare(&self, job: &ProcessingJob) -> Result<StageInput, AppError> {
        let item = self
            .items
            .get_item(job.item_id)
            .await?
            .ok_or_else(|| AppError::not_found("item", job.item_id))?;

        let credential = match job.channel_id {
            Some(channel_id) => Some(self.resolver.resolve(channel_id).await?),
            None => None,
        };

        Ok(StageInput {
            job_id: job.id,
            item_id: item.id,
            stage: job.stage,
            source_ref: item.source_ref,
            artifacts: item.artifacts,
            channel_id: job.channel_id,
            credential,
            attempt: job.attempts + 1,
        })
    }
}

impl<E, I, R> WorkflowRunner for ExecutorRunner<E, I, R>
where
    E: StageExecutor,
    I: ItemStore,
    R: CredentialScopeResolver,
{
    async fn run(&self, job: &ProcessingJob) -> StageOutcome {
        let input = match self.prepare(job).await {
            Ok(input) => input,
            Err(e) => return StageOutcome::Failure(StageFailure::from(e)),
        };

        let result = self
            .breakers
            .get(job.stage)
            .call(|| self.executor.execute(&input))
            .await;

        match result {
            Ok(artifact_ref) => StageOutcome::Success { artifact_ref },
            Err(failure) => StageOutcome::Failure(failure),
        }
    }
}

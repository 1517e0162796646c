pub mod channel;
pub mod circuit_breaker;
pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod item;
pub mod job;
pub mod job_queue;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod quota;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod traits;
pub mod wave;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

#[cfg(test)]
mod scenarios;

pub use channel::{
    Channel, CredentialScope, Eligibility, NewChannel, PostingSchedule, PostingWindow, RateBudget,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, SharedClock, SystemClock, system_clock};
pub use completion::{ChainSettings, CompletionPlan, plan_completion};
pub use config::OrchestratorConfig;
pub use error::AppError;
pub use item::{ContentItem, ItemStage, NewItem, Stage};
pub use job::{
    CompletionResult, EnqueueRequest, JobFilter, JobKey, JobStatus, ProcessingJob, StageFailure,
    StageOutcome,
};
pub use job_queue::{JobQueue, OrchestratorControl, OrchestratorState};
pub use orchestrator::ChannelOrchestrator;
pub use pipeline::{ItemDetail, OperatorService};
pub use pool::{PoolConfig, run_pool};
pub use quota::{QuotaBucket, QuotaTracker, Reservation};
pub use resolver::{CachedScopeResolver, StaticScopeResolver};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use runner::{ExecutorRunner, WorkflowRunner};
pub use traits::{
    ChannelStore, CredentialScopeResolver, ItemStore, StageExecutor, StageInput, WaveStore,
};
pub use wave::{MemberState, Wave, WaveMember, WaveMemberRequest, WaveStatus};
pub use worker::{TracingWorkerReporter, WorkerConfig, WorkerEvent, WorkerReporter, WorkerService};

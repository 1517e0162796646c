//! End-to-end pipeline behaviour against the in-memory store.

use std::collections::HashSet;

use chrono::{NaiveTime, TimeDelta, TimeZone, Utc};
use uuid::Uuid;

use crate::channel::{Channel, Eligibility, NewChannel, PostingSchedule, PostingWindow, RateBudget};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::completion::ChainSettings;
use crate::item::{ItemStage, NewItem, Stage};
use crate::job::{CompletionResult, EnqueueRequest, JobFilter, JobStatus, StageFailure, StageOutcome};
use crate::job_queue::JobQueue;
use crate::orchestrator::ChannelOrchestrator;
use crate::pipeline::OperatorService;
use crate::resolver::StaticScopeResolver;
use crate::retry::RetryPolicy;
use crate::runner::ExecutorRunner;
use crate::testutil::{ManualClock, MemoryStore, MockExecutor};
use crate::traits::{ChannelStore, ItemStore, WaveStore};
use crate::wave::{WaveMemberRequest, WaveStatus};
use crate::worker::{TracingWorkerReporter, WorkerConfig, WorkerService};
use crate::AppError;

type Runner = ExecutorRunner<MockExecutor, MemoryStore, StaticScopeResolver<MemoryStore>>;

struct Harness {
    clock: ManualClock,
    store: MemoryStore,
    ops: OperatorService<MemoryStore, MemoryStore, MemoryStore, MemoryStore>,
    channels: ChannelOrchestrator<MemoryStore, MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        // A Wednesday, mid-day UTC.
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap());
        let store = MemoryStore::new(clock.shared()).with_chain_settings(ChainSettings {
            retry: RetryPolicy::new(TimeDelta::seconds(30), TimeDelta::hours(1), 3),
            wave_priority: 100,
        });
        Self {
            ops: OperatorService::new(store.clone(), store.clone(), store.clone(), store.clone()),
            channels: ChannelOrchestrator::new(store.clone(), store.clone()),
            clock,
            store,
        }
    }

    async fn channel(&self, name: &str) -> Channel {
        let channel = self
            .channels
            .create_channel(NewChannel::new(name, format!("scope/{name}")))
            .await
            .unwrap();
        self.channels.activate(channel.id).await.unwrap()
    }

    fn worker(&self, id: &str, executor: MockExecutor) -> WorkerService<MemoryStore, Runner> {
        let runner = ExecutorRunner::new(
            executor,
            self.store.clone(),
            StaticScopeResolver::new(self.store.clone()),
            CircuitBreakerConfig::default(),
        );
        WorkerService::new(
            self.store.clone(),
            runner,
            WorkerConfig::default().with_worker_id(id),
        )
    }

    /// Process until nothing is leasable at the current instant.
    async fn drain(&self, executor: &MockExecutor) -> Vec<CompletionResult> {
        let worker = self.worker("worker-1", executor.clone());
        let mut results = Vec::new();
        while let Some(result) = worker.run_once(&TracingWorkerReporter).await.unwrap() {
            results.push(result);
        }
        results
    }

    async fn submit(&self, channels: &[Uuid]) -> Uuid {
        let (item, _) = self
            .ops
            .submit_item(
                NewItem::new(format!("https://videos.example/v/{}", Uuid::new_v4()))
                    .with_channels(channels.iter().copied()),
                0,
            )
            .await
            .unwrap();
        item.id
    }

    async fn stage_of(&self, item_id: Uuid) -> ItemStage {
        self.store.get_item(item_id).await.unwrap().unwrap().stage
    }

    /// An item that already finished Transformation. Assumes nothing else
    /// is leasable.
    async fn transformed_item(&self, channels: &[Uuid]) -> Uuid {
        let item = self.submit(channels).await;
        let worker = self.worker("prep", MockExecutor::succeeding());
        for _ in 0..3 {
            worker.run_once(&TracingWorkerReporter).await.unwrap();
        }
        assert_eq!(self.stage_of(item).await, ItemStage::Transformed);
        item
    }
}

#[tokio::test]
async fn item_flows_through_every_stage_to_published() {
    let h = Harness::new();
    let c1 = h.channel("clips-en").await;
    let (item, _) = h
        .ops
        .submit_item(NewItem::new("https://videos.example/v/a").with_channels([c1.id]), 0)
        .await
        .unwrap();

    let executor = MockExecutor::succeeding();
    let results = h.drain(&executor).await;

    assert_eq!(results.len(), 4);
    assert_eq!(h.stage_of(item.id).await, ItemStage::Published);

    let item = h.store.get_item(item.id).await.unwrap().unwrap();
    for stage in Stage::ALL {
        assert!(item.artifacts.contains_key(&stage), "missing {stage} artifact");
    }
    assert!(item.timestamps.published_at.is_some());

    let queued = h
        .store
        .list_jobs(JobFilter::new(100).with_item(item.id).with_status(JobStatus::Queued))
        .await
        .unwrap();
    assert!(queued.is_empty());

    let stages: Vec<Stage> = executor.calls().iter().map(|c| c.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());

    let channel = h.store.get_channel(c1.id).await.unwrap().unwrap();
    assert_eq!(channel.last_published_at, Some(h.clock.now()));
}

#[tokio::test]
async fn transient_failure_backs_off_then_becomes_eligible() {
    let h = Harness::new();
    let (item, _) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let executor = MockExecutor::succeeding().script(
        Stage::Acquisition,
        [Err(StageFailure::transient("connection reset by peer"))],
    );

    // Discovery succeeds, Acquisition fails once.
    let results = h.drain(&executor).await;
    assert_eq!(results.len(), 2);
    let start = h.clock.now();

    let job = h
        .store
        .list_jobs(JobFilter::new(10).with_item(item.id).with_stage(Stage::Acquisition))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.not_before, start + TimeDelta::seconds(60));

    h.clock.advance(TimeDelta::seconds(59));
    assert!(h.store.lease_next("w").await.unwrap().is_none());

    h.clock.advance(TimeDelta::seconds(1));
    let leased = h.store.lease_next("w").await.unwrap().unwrap();
    assert_eq!(leased.id, job.id);
    assert_eq!(leased.attempts, 1);
}

#[tokio::test]
async fn transient_delays_grow_until_exhaustion() {
    let h = Harness::new();
    let (item, _) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let executor = MockExecutor::succeeding().script(
        Stage::Acquisition,
        std::iter::repeat_with(|| Err(StageFailure::transient("timeout"))).take(3),
    );
    h.drain(&executor).await;

    let mut delays = Vec::new();
    loop {
        let job = h
            .store
            .list_jobs(JobFilter::new(10).with_item(item.id).with_stage(Stage::Acquisition))
            .await
            .unwrap()
            .remove(0);
        if job.status == JobStatus::Dead {
            assert_eq!(job.attempts, 3);
            break;
        }
        delays.push(job.not_before - h.clock.now());
        h.clock.set(job.not_before);
        h.drain(&executor).await;
    }

    assert_eq!(delays, vec![TimeDelta::seconds(60), TimeDelta::seconds(120)]);
    assert_eq!(h.stage_of(item.id).await, ItemStage::Failed);
    let item = h.store.get_item(item.id).await.unwrap().unwrap();
    assert!(item.failure_reason.unwrap().contains("timeout"));
}

#[tokio::test]
async fn permanent_failure_is_dead_on_first_attempt() {
    let h = Harness::new();
    let (item, _) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let executor = MockExecutor::succeeding().script(
        Stage::Acquisition,
        [Err(StageFailure::permanent("source removed"))],
    );
    let results = h.drain(&executor).await;

    assert_eq!(results.last(), Some(&CompletionResult::Dead));
    assert_eq!(h.stage_of(item.id).await, ItemStage::Failed);
    let dead = h.ops.list_dead_jobs(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
}

#[tokio::test]
async fn wave_members_settle_independently() {
    let h = Harness::new();
    let (c1, c2, c3) = (
        h.channel("c1").await,
        h.channel("c2").await,
        h.channel("c3").await,
    );
    let items = [
        h.transformed_item(&[]).await,
        h.transformed_item(&[]).await,
        h.transformed_item(&[]).await,
    ];
    let target = h.clock.now() + TimeDelta::hours(1);
    let wave = h
        .ops
        .schedule_wave(
            vec![
                WaveMemberRequest::new(items[0], c1.id),
                WaveMemberRequest::new(items[1], c2.id),
                WaveMemberRequest::new(items[2], c3.id),
            ],
            target,
            Some("launch".into()),
        )
        .await
        .unwrap();
    assert!(wave.members.iter().all(|m| m.job_id.is_some()));

    h.clock.set(target - TimeDelta::seconds(1));
    let executor = MockExecutor::succeeding()
        .failing_channel(c2.id, StageFailure::permanent("credentials revoked"));
    assert!(h.drain(&executor).await.is_empty());
    assert_eq!(
        h.store.wave_status(wave.id).await.unwrap(),
        WaveStatus {
            total: 3,
            succeeded: 0,
            failed: 0,
            pending: 3
        }
    );

    h.clock.set(target);
    assert_eq!(h.drain(&executor).await.len(), 3);
    let status = h.store.wave_status(wave.id).await.unwrap();
    assert_eq!(
        status,
        WaveStatus {
            total: 3,
            succeeded: 2,
            failed: 1,
            pending: 0
        }
    );
    assert_eq!(h.stage_of(items[0]).await, ItemStage::Published);
    assert_eq!(h.stage_of(items[1]).await, ItemStage::Failed);
    assert_eq!(h.stage_of(items[2]).await, ItemStage::Published);
}

#[tokio::test]
async fn wave_member_upstream_gets_job_after_transformation() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    let (item, _) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let target = h.clock.now() + TimeDelta::hours(2);

    let wave = h
        .ops
        .schedule_wave(vec![WaveMemberRequest::new(item.id, c1.id)], target, None)
        .await
        .unwrap();
    assert_eq!(wave.members[0].job_id, None);
    let item_now = h.store.get_item(item.id).await.unwrap().unwrap();
    assert!(item_now.is_assigned_to(c1.id));

    let executor = MockExecutor::succeeding();
    assert_eq!(h.drain(&executor).await.len(), 3);
    let (wave, status) = h.ops.wave(wave.id).await.unwrap();
    let job_id = wave.members[0].job_id.unwrap();
    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.not_before, target);
    assert_eq!(job.priority, 100);
    assert_eq!(job.wave_id, Some(wave.id));
    assert_eq!(status.pending, 1);

    h.clock.set(target);
    assert_eq!(h.drain(&executor).await.len(), 1);
    assert_eq!(h.ops.wave(wave.id).await.unwrap().1.succeeded, 1);
}

#[tokio::test]
async fn wave_member_failing_upstream_settles_the_wave() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    let (item, _) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let target = h.clock.now() + TimeDelta::hours(1);
    let wave = h
        .ops
        .schedule_wave(vec![WaveMemberRequest::new(item.id, c1.id)], target, None)
        .await
        .unwrap();

    let executor = MockExecutor::succeeding().script(
        Stage::Acquisition,
        [Err(StageFailure::permanent("source removed"))],
    );
    h.drain(&executor).await;
    assert_eq!(h.stage_of(item.id).await, ItemStage::Failed);

    let status = h.store.wave_status(wave.id).await.unwrap();
    assert_eq!(
        status,
        WaveStatus {
            total: 1,
            succeeded: 0,
            failed: 1,
            pending: 0
        }
    );
    assert!(status.is_settled());
}

#[tokio::test]
async fn late_wave_member_publishes_on_readiness() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    let (item, _) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let target = h.clock.now() + TimeDelta::minutes(10);
    let wave = h
        .ops
        .schedule_wave(vec![WaveMemberRequest::new(item.id, c1.id)], target, None)
        .await
        .unwrap();

    // Upstream work only happens after the target has passed.
    h.clock.set(target + TimeDelta::hours(1));
    let results = h.drain(&MockExecutor::succeeding()).await;
    assert_eq!(results.len(), 4);
    assert_eq!(h.stage_of(item.id).await, ItemStage::Published);
    assert_eq!(h.store.wave_status(wave.id).await.unwrap().succeeded, 1);
}

#[tokio::test]
async fn wave_rejects_past_targets_and_closes() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    let item = h.transformed_item(&[]).await;
    let member = WaveMemberRequest::new(item, c1.id);

    let err = h
        .store
        .schedule_wave(vec![member], h.clock.now(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTarget(_)));

    let err = h
        .store
        .schedule_wave(
            vec![WaveMemberRequest::new(Uuid::new_v4(), c1.id)],
            h.clock.now() + TimeDelta::hours(1),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { kind: "item", .. }));

    let target = h.clock.now() + TimeDelta::minutes(5);
    let wave = h.store.schedule_wave(vec![member], target, None).await.unwrap();

    let c2 = h.channel("c2").await;
    let wave = h
        .store
        .add_wave_members(wave.id, vec![WaveMemberRequest::new(item, c2.id)])
        .await
        .unwrap();
    assert_eq!(wave.members.len(), 2);

    h.clock.set(target);
    let c3 = h.channel("c3").await;
    let err = h
        .store
        .add_wave_members(wave.id, vec![WaveMemberRequest::new(item, c3.id)])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::WaveClosed(id) if id == wave.id));
}

#[tokio::test]
async fn scheduling_a_wave_rebinds_a_queued_publication() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    h.channels.deactivate(c1.id).await.unwrap();
    let item = h.transformed_item(&[c1.id]).await;
    let queued = h
        .store
        .list_jobs(JobFilter::new(10).with_item(item).with_stage(Stage::Publication))
        .await
        .unwrap()
        .remove(0);

    let target = h.clock.now() + TimeDelta::hours(3);
    let wave = h
        .ops
        .schedule_wave(vec![WaveMemberRequest::new(item, c1.id)], target, None)
        .await
        .unwrap();
    assert_eq!(wave.members[0].job_id, Some(queued.id));

    let rebound = h.store.get_job(queued.id).await.unwrap().unwrap();
    assert_eq!(rebound.not_before, target);
    assert_eq!(rebound.priority, 100);
    assert_eq!(rebound.status, JobStatus::Queued);
}

#[tokio::test]
async fn deactivated_channel_holds_publication_until_reactivated() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    let c2 = h.channel("c2").await;
    let item = h.transformed_item(&[c1.id, c2.id]).await;
    h.channels.deactivate(c2.id).await.unwrap();
    assert!(!h.channels.is_eligible(c2.id, h.clock.now()).await.unwrap());

    let executor = MockExecutor::succeeding();
    assert_eq!(h.drain(&executor).await.len(), 1);
    for _ in 0..3 {
        h.clock.advance(TimeDelta::days(1));
        assert!(h.drain(&executor).await.is_empty());
    }

    let c2_jobs = h
        .store
        .list_jobs(JobFilter {
            channel_id: Some(c2.id),
            ..JobFilter::new(10)
        })
        .await
        .unwrap();
    assert_eq!(c2_jobs.len(), 1);
    assert_eq!(c2_jobs[0].status, JobStatus::Queued);
    assert_eq!(c2_jobs[0].attempts, 0);
    assert_eq!(h.stage_of(item).await, ItemStage::Publishing);

    h.channels.activate(c2.id).await.unwrap();
    assert_eq!(h.drain(&executor).await.len(), 1);
    assert_eq!(h.stage_of(item).await, ItemStage::Published);
}

#[tokio::test]
async fn deactivation_does_not_abort_running_job() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    h.transformed_item(&[c1.id]).await;

    let leased = h.store.lease_next("w1").await.unwrap().unwrap();
    assert_eq!(leased.stage, Stage::Publication);
    h.channels.deactivate(c1.id).await.unwrap();

    let result = h
        .store
        .complete(leased.id, "w1", StageOutcome::success("https://host.example/p/1"))
        .await
        .unwrap();
    assert_eq!(result, CompletionResult::Succeeded { enqueued: vec![] });
}

#[tokio::test]
async fn posting_window_defers_publication() {
    let h = Harness::new();
    // 12:00 UTC on a Wednesday is 07:00 in New York; window opens at 09:00 local.
    let schedule = PostingSchedule::default()
        .with_timezone("America/New_York")
        .with_window(PostingWindow::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
        ));
    let channel = h
        .channels
        .create_channel(NewChannel::new("ny", "scope/ny").with_schedule(schedule))
        .await
        .unwrap();
    h.channels.activate(channel.id).await.unwrap();
    let item = h.transformed_item(&[channel.id]).await;

    let executor = MockExecutor::succeeding();
    assert!(h.drain(&executor).await.is_empty());
    h.clock.advance(TimeDelta::hours(2));
    assert_eq!(h.drain(&executor).await.len(), 1);
    assert_eq!(h.stage_of(item).await, ItemStage::Published);
}

#[tokio::test]
async fn min_interval_spaces_publications() {
    let h = Harness::new();
    let channel = h
        .channels
        .create_channel(
            NewChannel::new("spaced", "scope/spaced")
                .with_schedule(PostingSchedule::default().with_min_interval(3600)),
        )
        .await
        .unwrap();
    let first = h.submit(&[channel.id]).await;
    let second = h.submit(&[channel.id]).await;

    // Channel starts inactive: upstream work runs, publications wait.
    let executor = MockExecutor::succeeding();
    assert_eq!(h.drain(&executor).await.len(), 6);
    h.channels.activate(channel.id).await.unwrap();

    assert_eq!(h.drain(&executor).await.len(), 1);
    assert_eq!(h.stage_of(first).await, ItemStage::Published);
    assert_eq!(h.stage_of(second).await, ItemStage::Transformed);
    assert!(matches!(
        h.channels.eligibility(channel.id, h.clock.now()).await.unwrap(),
        Eligibility::TooSoon { .. }
    ));

    h.clock.advance(TimeDelta::hours(1));
    assert_eq!(h.drain(&executor).await.len(), 1);
    assert_eq!(h.stage_of(second).await, ItemStage::Published);
}

#[tokio::test]
async fn quota_denial_keeps_job_queued_and_failure_releases_it() {
    let h = Harness::new();
    let channel = h
        .channels
        .create_channel(NewChannel::new("budget", "scope/budget").with_rate_budget(RateBudget {
            capacity: 1,
            window_secs: 86_400,
            publish_cost: 1,
        }))
        .await
        .unwrap();
    let first = h.submit(&[channel.id]).await;
    let second = h.submit(&[channel.id]).await;

    // First publication fails transiently: its reservation comes back.
    let executor = MockExecutor::succeeding()
        .script(Stage::Publication, [Err(StageFailure::rate_limited("429"))]);
    assert_eq!(h.drain(&executor).await.len(), 6);
    h.channels.activate(channel.id).await.unwrap();
    assert_eq!(h.drain(&executor).await.len(), 2);
    assert_eq!(h.stage_of(first).await, ItemStage::Publishing);
    assert_eq!(h.stage_of(second).await, ItemStage::Published);

    let bucket = h.store.bucket(&channel.quota_key()).unwrap();
    assert_eq!(bucket.used, 1);

    h.clock.advance(TimeDelta::minutes(5));
    assert!(h.drain(&executor).await.is_empty());
    assert_eq!(
        h.channels.eligibility(channel.id, h.clock.now()).await.unwrap(),
        Eligibility::QuotaExhausted
    );
    let held = h
        .store
        .list_jobs(JobFilter::new(10).with_item(first).with_stage(Stage::Publication))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(held.status, JobStatus::Retrying);
    assert_eq!(held.quota_reserved, 0);

    h.clock.advance(TimeDelta::days(1));
    assert_eq!(h.drain(&executor).await.len(), 1);
    assert_eq!(h.stage_of(first).await, ItemStage::Published);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_without_spending_an_attempt() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    h.transformed_item(&[c1.id]).await;

    let leased = h.store.lease_next("crashed").await.unwrap().unwrap();
    assert_eq!(h.store.bucket(&c1.quota_key()).unwrap().used, 1);
    h.clock.advance(TimeDelta::minutes(6));

    assert_eq!(h.store.reclaim_expired_leases().await.unwrap(), 1);
    let job = h.store.get_job(leased.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 0);
    assert_eq!(h.store.bucket(&c1.quota_key()).unwrap().used, 0);

    let late = h
        .store
        .complete(leased.id, "crashed", StageOutcome::success("late"))
        .await
        .unwrap();
    assert_eq!(late, CompletionResult::Stale);
}

#[tokio::test]
async fn renewed_lease_survives_reaping() {
    let h = Harness::new();
    h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let leased = h.store.lease_next("w1").await.unwrap().unwrap();

    h.clock.advance(TimeDelta::minutes(4));
    assert!(h.store.renew_lease(leased.id, "w1").await.unwrap());
    assert!(!h.store.renew_lease(leased.id, "w2").await.unwrap());
    h.clock.advance(TimeDelta::minutes(4));
    assert_eq!(h.store.reclaim_expired_leases().await.unwrap(), 0);
}

#[tokio::test]
async fn completion_after_operator_failure_is_discarded() {
    let h = Harness::new();
    let (item, _) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let leased = h.store.lease_next("w1").await.unwrap().unwrap();

    h.ops.mark_item_failed(item.id, "takedown request").await.unwrap();
    let result = h
        .store
        .complete(leased.id, "w1", StageOutcome::success("found"))
        .await
        .unwrap();
    assert_eq!(result, CompletionResult::Discarded);

    let job = h.store.get_job(leased.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let item = h.store.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(item.stage, ItemStage::Failed);
    assert_eq!(item.failure_reason.as_deref(), Some("takedown request"));
    assert!(
        h.store
            .list_jobs(JobFilter::new(10).with_item(item.id).with_status(JobStatus::Queued))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(matches!(
        h.ops.mark_item_failed(item.id, "again").await,
        Err(AppError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn marking_failed_discards_queued_jobs() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    let c2 = h.channel("c2").await;
    let item = h.transformed_item(&[c1.id, c2.id]).await;

    h.ops.mark_item_failed(item, "rights expired").await.unwrap();
    let jobs = h.store.jobs_for_item(item);
    let publications: Vec<_> = jobs.iter().filter(|j| j.stage == Stage::Publication).collect();
    assert_eq!(publications.len(), 2);
    assert!(publications.iter().all(|j| j.status == JobStatus::Failed));
    assert!(h.drain(&MockExecutor::succeeding()).await.is_empty());

    let err = h
        .store
        .enqueue(EnqueueRequest::new(item, Stage::Publication).with_channel(c1.id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn operator_failed_item_resumes_from_a_discarded_job() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    let item = h.transformed_item(&[c1.id]).await;

    h.ops.mark_item_failed(item, "rights check pending").await.unwrap();
    let discarded = h.store.jobs_for_item(item);
    let publication = discarded
        .iter()
        .find(|j| j.stage == Stage::Publication)
        .unwrap();
    assert_eq!(publication.status, JobStatus::Failed);

    let retried = h.ops.retry_dead_job(publication.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempts, 0);
    let restored = h.store.get_item(item).await.unwrap().unwrap();
    assert_eq!(restored.stage, ItemStage::Transformed);
    assert_eq!(restored.failure_reason, None);

    assert_eq!(h.drain(&MockExecutor::succeeding()).await.len(), 1);
    assert_eq!(h.stage_of(item).await, ItemStage::Published);
}

#[tokio::test]
async fn retrying_a_dead_job_restores_the_item() {
    let h = Harness::new();
    let (item, _) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let executor = MockExecutor::succeeding().script(
        Stage::Transformation,
        [Err(StageFailure::permanent("unsupported codec"))],
    );
    h.drain(&executor).await;
    assert_eq!(h.stage_of(item.id).await, ItemStage::Failed);

    let dead = h.ops.list_dead_jobs(10).await.unwrap().remove(0);
    let err = h.ops.retry_dead_job(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));

    let retried = h.ops.retry_dead_job(dead.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempts, 0);
    assert_eq!(h.stage_of(item.id).await, ItemStage::Acquired);

    let err = h.ops.retry_dead_job(dead.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    h.drain(&executor).await;
    assert_eq!(h.stage_of(item.id).await, ItemStage::Transformed);
}

#[tokio::test]
async fn duplicate_active_job_is_rejected() {
    let h = Harness::new();
    let (item, job) = h.ops.submit_item(NewItem::new("src"), 0).await.unwrap();
    let err = h
        .store
        .enqueue(EnqueueRequest::new(item.id, Stage::Discovery))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateActiveJob { .. }));

    h.store.lease_next("w1").await.unwrap();
    let err = h
        .store
        .enqueue(EnqueueRequest::new(item.id, Stage::Discovery))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateActiveJob { .. }));

    h.store
        .complete(job.id, "w1", StageOutcome::success("found"))
        .await
        .unwrap();
    assert!(
        h.store
            .enqueue(EnqueueRequest::new(item.id, Stage::Discovery))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn lease_order_is_priority_then_not_before_then_fifo() {
    let h = Harness::new();
    let now = h.clock.now();
    let mut ids = Vec::new();
    for n in 0..4 {
        let item = h.store.create_item(NewItem::new(format!("src-{n}"))).await.unwrap();
        ids.push(item.id);
    }
    let low = h
        .store
        .enqueue(EnqueueRequest::new(ids[0], Stage::Acquisition))
        .await
        .unwrap();
    let older = h
        .store
        .enqueue(
            EnqueueRequest::new(ids[1], Stage::Acquisition)
                .with_priority(5)
                .not_before(now - TimeDelta::minutes(1)),
        )
        .await
        .unwrap();
    let high = h
        .store
        .enqueue(EnqueueRequest::new(ids[2], Stage::Acquisition).with_priority(9))
        .await
        .unwrap();
    let newer = h
        .store
        .enqueue(EnqueueRequest::new(ids[3], Stage::Acquisition).with_priority(5))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = h.store.lease_next("w").await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![high.id, older.id, newer.id, low.id]);
}

#[tokio::test]
async fn concurrent_leases_never_share_a_job() {
    let h = Harness::new();
    for n in 0..50 {
        h.ops
            .submit_item(NewItem::new(format!("https://videos.example/v/{n}")), 0)
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..8 {
        let store = h.store.clone();
        tasks.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(job) = store.lease_next(&format!("w{w}")).await.unwrap() {
                mine.push(job.key());
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for task in tasks {
        for key in task.await.unwrap() {
            total += 1;
            assert!(seen.insert(key), "key {key} leased twice");
        }
    }
    assert_eq!(total, 50);
    assert_eq!(h.store.count_by_status(JobStatus::Running).await.unwrap(), 50);
}

#[tokio::test]
async fn one_failed_channel_does_not_fail_a_published_item() {
    let h = Harness::new();
    let c1 = h.channel("c1").await;
    let c2 = h.channel("c2").await;
    let item = h.transformed_item(&[c1.id, c2.id]).await;

    let executor = MockExecutor::succeeding()
        .failing_channel(c2.id, StageFailure::permanent("account suspended"));
    assert_eq!(h.drain(&executor).await.len(), 2);
    assert_eq!(h.stage_of(item).await, ItemStage::Published);

    let c2_job = h
        .store
        .list_jobs(JobFilter {
            channel_id: Some(c2.id),
            ..JobFilter::new(10)
        })
        .await
        .unwrap()
        .remove(0);
    assert_eq!(c2_job.status, JobStatus::Dead);
}

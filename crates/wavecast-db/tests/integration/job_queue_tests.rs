use std::collections::HashSet;

use chrono::TimeDelta;

use wavecast_core::AppError;
use wavecast_core::item::{ItemStage, Stage};
use wavecast_core::job::{
    CompletionResult, EnqueueRequest, JobFilter, JobStatus, StageFailure, StageOutcome,
};
use wavecast_core::job_queue::{JobQueue, OrchestratorControl, OrchestratorState};
use wavecast_core::traits::ItemStore;

use crate::integration::common::{active_channel, new_item, setup_test_db, test_database};

#[tokio::test]
async fn enqueue_sets_defaults() {
    let (pool, _container) = setup_test_db().await;
    let (db, clock) = test_database(pool);
    let item = new_item(&db, &[]).await;

    let job = db
        .job_repo()
        .enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.not_before, clock.now());
    assert!(job.lease_owner.is_none());
    assert!(job.channel_id.is_none());
}

#[tokio::test]
async fn enqueue_rejects_second_active_job_for_same_key() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;

    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();
    let err = repo
        .enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::DuplicateActiveJob { .. }));
}

#[tokio::test]
async fn enqueue_publication_requires_existing_channel() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let item = new_item(&db, &[]).await;

    let err = db
        .job_repo()
        .enqueue(EnqueueRequest::new(item, Stage::Publication).with_channel(uuid::Uuid::new_v4()))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound { kind: "channel", .. }));
}

#[tokio::test]
async fn enqueue_for_missing_item_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);

    let err = db
        .job_repo()
        .enqueue(EnqueueRequest::new(uuid::Uuid::new_v4(), Stage::Discovery))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound { kind: "item", .. }));
}

#[tokio::test]
async fn lease_next_orders_by_priority_then_readiness() {
    let (pool, _container) = setup_test_db().await;
    let (db, clock) = test_database(pool);
    let repo = db.job_repo();

    let low = new_item(&db, &[]).await;
    let high = new_item(&db, &[]).await;
    let early = new_item(&db, &[]).await;

    repo.enqueue(EnqueueRequest::new(low, Stage::Discovery))
        .await
        .unwrap();
    repo.enqueue(EnqueueRequest::new(high, Stage::Discovery).with_priority(10))
        .await
        .unwrap();
    repo.enqueue(
        EnqueueRequest::new(early, Stage::Discovery).not_before(clock.now() - TimeDelta::minutes(5)),
    )
    .await
    .unwrap();

    let order: Vec<_> = [
        repo.lease_next("w").await.unwrap().unwrap().item_id,
        repo.lease_next("w").await.unwrap().unwrap().item_id,
        repo.lease_next("w").await.unwrap().unwrap().item_id,
    ]
    .into();

    assert_eq!(order, vec![high, early, low]);
    assert!(repo.lease_next("w").await.unwrap().is_none());
}

#[tokio::test]
async fn lease_next_skips_jobs_not_yet_due() {
    let (pool, _container) = setup_test_db().await;
    let (db, clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;

    repo.enqueue(
        EnqueueRequest::new(item, Stage::Discovery).not_before(clock.now() + TimeDelta::minutes(10)),
    )
    .await
    .unwrap();

    assert!(repo.lease_next("w").await.unwrap().is_none());
    clock.advance(TimeDelta::minutes(10));
    assert!(repo.lease_next("w").await.unwrap().is_some());
}

#[tokio::test]
async fn lease_marks_running_with_owner_and_expiry() {
    let (pool, _container) = setup_test_db().await;
    let (db, clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    let job = repo.lease_next("worker-1").await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.lease_owner.as_deref(), Some("worker-1"));
    assert_eq!(job.lease_expires_at, Some(clock.now() + TimeDelta::minutes(5)));
    assert_eq!(job.started_at, Some(clock.now()));
}

#[tokio::test]
async fn paused_orchestrator_leases_nothing() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let state = db.state_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    state.set_state(OrchestratorState::Paused).await.unwrap();
    assert_eq!(state.state().await.unwrap(), OrchestratorState::Paused);
    assert!(repo.lease_next("w").await.unwrap().is_none());

    state.set_state(OrchestratorState::Running).await.unwrap();
    assert!(repo.lease_next("w").await.unwrap().is_some());
}

#[tokio::test]
async fn successful_discovery_chains_acquisition() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery).with_priority(7))
        .await
        .unwrap();

    let job = repo.lease_next("w").await.unwrap().unwrap();
    let result = repo
        .complete(job.id, "w", StageOutcome::success("meta://a"))
        .await
        .unwrap();

    let CompletionResult::Succeeded { enqueued } = result else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(enqueued.len(), 1);
    let next = repo.get_job(enqueued[0]).await.unwrap().unwrap();
    assert_eq!(next.stage, Stage::Acquisition);
    assert_eq!(next.priority, 7);
    assert_eq!(next.status, JobStatus::Queued);

    let done = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 1);
    assert_eq!(done.artifact_ref.as_deref(), Some("meta://a"));
    assert!(done.lease_owner.is_none());

    let stored = db.item_repo().get_item(item).await.unwrap().unwrap();
    assert_eq!(stored.stage, ItemStage::Discovered);
    assert_eq!(
        stored.artifacts.get(&Stage::Discovery).map(String::as_str),
        Some("meta://a")
    );
}

#[tokio::test]
async fn transient_failures_back_off_then_die() {
    let (pool, _container) = setup_test_db().await;
    let (db, clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    let job = repo.lease_next("w").await.unwrap().unwrap();
    let first = repo
        .complete(job.id, "w", StageOutcome::Failure(StageFailure::transient("503")))
        .await
        .unwrap();
    assert_eq!(
        first,
        CompletionResult::Retrying {
            not_before: clock.now() + TimeDelta::seconds(60)
        }
    );
    assert!(repo.lease_next("w").await.unwrap().is_none());

    clock.advance(TimeDelta::seconds(60));
    let job = repo.lease_next("w").await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    let second = repo
        .complete(job.id, "w", StageOutcome::Failure(StageFailure::transient("503")))
        .await
        .unwrap();
    assert_eq!(
        second,
        CompletionResult::Retrying {
            not_before: clock.now() + TimeDelta::seconds(120)
        }
    );

    clock.advance(TimeDelta::seconds(120));
    let job = repo.lease_next("w").await.unwrap().unwrap();
    let third = repo
        .complete(job.id, "w", StageOutcome::Failure(StageFailure::transient("503")))
        .await
        .unwrap();
    assert_eq!(third, CompletionResult::Dead);

    let dead = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.last_error.as_deref(), Some("503"));
    let stored = db.item_repo().get_item(item).await.unwrap().unwrap();
    assert_eq!(stored.stage, ItemStage::Failed);
}

#[tokio::test]
async fn permanent_failure_is_dead_immediately() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    let job = repo.lease_next("w").await.unwrap().unwrap();
    let result = repo
        .complete(job.id, "w", StageOutcome::Failure(StageFailure::permanent("gone")))
        .await
        .unwrap();

    assert_eq!(result, CompletionResult::Dead);
    assert_eq!(repo.count_by_status(JobStatus::Dead).await.unwrap(), 1);
}

#[tokio::test]
async fn completion_from_wrong_worker_is_stale() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    let job = repo.lease_next("owner").await.unwrap().unwrap();
    let result = repo
        .complete(job.id, "intruder", StageOutcome::success("x"))
        .await
        .unwrap();

    assert_eq!(result, CompletionResult::Stale);
    let still = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(still.status, JobStatus::Running);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_without_spending_an_attempt() {
    let (pool, _container) = setup_test_db().await;
    let (db, clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    let job = repo.lease_next("crashed").await.unwrap().unwrap();
    assert_eq!(repo.reclaim_expired_leases().await.unwrap(), 0);

    clock.advance(TimeDelta::minutes(6));
    assert_eq!(repo.reclaim_expired_leases().await.unwrap(), 1);

    let requeued = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.attempts, 0);
    assert!(requeued.lease_owner.is_none());

    let late = repo
        .complete(job.id, "crashed", StageOutcome::success("late"))
        .await
        .unwrap();
    assert_eq!(late, CompletionResult::Stale);
}

#[tokio::test]
async fn renewed_lease_survives_reaping() {
    let (pool, _container) = setup_test_db().await;
    let (db, clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    let job = repo.lease_next("w").await.unwrap().unwrap();
    clock.advance(TimeDelta::minutes(4));
    assert!(repo.renew_lease(job.id, "w").await.unwrap());
    assert!(!repo.renew_lease(job.id, "someone-else").await.unwrap());

    clock.advance(TimeDelta::minutes(4));
    assert_eq!(repo.reclaim_expired_leases().await.unwrap(), 0);
}

#[tokio::test]
async fn release_worker_jobs_only_touches_that_worker() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    for _ in 0..3 {
        let item = new_item(&db, &[]).await;
        repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
            .await
            .unwrap();
    }

    repo.lease_next("a").await.unwrap().unwrap();
    repo.lease_next("a").await.unwrap().unwrap();
    let kept = repo.lease_next("b").await.unwrap().unwrap();

    assert_eq!(repo.release_worker_jobs("a").await.unwrap(), 2);
    assert_eq!(repo.count_by_status(JobStatus::Queued).await.unwrap(), 2);
    let running = repo.get_job(kept.id).await.unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Running);
}

#[tokio::test]
async fn retry_dead_job_restores_failed_item() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    let job = repo.lease_next("w").await.unwrap().unwrap();
    repo.complete(job.id, "w", StageOutcome::success("meta"))
        .await
        .unwrap();
    let acq = repo.lease_next("w").await.unwrap().unwrap();
    repo.complete(acq.id, "w", StageOutcome::Failure(StageFailure::permanent("404")))
        .await
        .unwrap();
    assert_eq!(
        db.item_repo().get_item(item).await.unwrap().unwrap().stage,
        ItemStage::Failed
    );

    let retried = repo.retry_dead_job(acq.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.attempts, 0);

    let restored = db.item_repo().get_item(item).await.unwrap().unwrap();
    assert_eq!(restored.stage, ItemStage::Discovered);
    assert!(restored.failure_reason.is_none());

    let err = repo.retry_dead_job(acq.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn mark_item_failed_discards_queued_jobs_and_running_results() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let items = db.item_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();
    let running = repo.lease_next("w").await.unwrap().unwrap();

    items.mark_item_failed(item, "takedown").await.unwrap();
    let result = repo
        .complete(running.id, "w", StageOutcome::success("meta"))
        .await
        .unwrap();
    assert_eq!(result, CompletionResult::Discarded);
    assert_eq!(
        repo.get_job(running.id).await.unwrap().unwrap().status,
        JobStatus::Failed
    );

    let err = repo
        .enqueue(EnqueueRequest::new(item, Stage::Acquisition))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let again = items.mark_item_failed(item, "twice").await.unwrap_err();
    assert!(matches!(again, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn operator_failed_item_resumes_through_its_discarded_job() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let items = db.item_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();
    let discovery = repo.lease_next("w").await.unwrap().unwrap();
    repo.complete(discovery.id, "w", StageOutcome::success("meta"))
        .await
        .unwrap();

    items.mark_item_failed(item, "rights check").await.unwrap();
    let discarded = repo
        .list_jobs(
            JobFilter::new(10)
                .with_item(item)
                .with_stage(Stage::Acquisition),
        )
        .await
        .unwrap()
        .remove(0);
    assert_eq!(discarded.status, JobStatus::Failed);

    let retried = repo.retry_dead_job(discarded.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    let restored = items.get_item(item).await.unwrap().unwrap();
    assert_eq!(restored.stage, ItemStage::Discovered);
    assert!(restored.failure_reason.is_none());

    let leased = repo.lease_next("w").await.unwrap().unwrap();
    assert_eq!(leased.id, discarded.id);
}

#[tokio::test]
async fn list_jobs_filters_by_status_and_item() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let a = new_item(&db, &[]).await;
    let b = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(a, Stage::Discovery))
        .await
        .unwrap();
    repo.enqueue(EnqueueRequest::new(b, Stage::Discovery))
        .await
        .unwrap();
    repo.lease_next("w").await.unwrap().unwrap();

    let running = repo
        .list_jobs(JobFilter::new(10).with_status(JobStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.len(), 1);

    let for_b = repo.list_jobs(JobFilter::new(10).with_item(b)).await.unwrap();
    assert_eq!(for_b.len(), 1);
    assert_eq!(for_b[0].item_id, b);
}

#[tokio::test]
async fn archive_removes_only_old_terminal_jobs() {
    let (pool, _container) = setup_test_db().await;
    let (db, clock) = test_database(pool);
    let repo = db.job_repo();
    let item = new_item(&db, &[]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();
    let job = repo.lease_next("w").await.unwrap().unwrap();
    repo.complete(job.id, "w", StageOutcome::success("meta"))
        .await
        .unwrap();

    assert_eq!(repo.archive_jobs(clock.now()).await.unwrap(), 0);
    clock.advance(TimeDelta::days(8));
    assert_eq!(
        repo.archive_jobs(clock.now() - TimeDelta::days(7)).await.unwrap(),
        1
    );
    assert!(repo.get_job(job.id).await.unwrap().is_none());
    // The queued acquisition job is not terminal.
    assert_eq!(repo.count_by_status(JobStatus::Queued).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_leases_never_share_a_job() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    for _ in 0..40 {
        let item = new_item(&db, &[]).await;
        repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..6 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{w}");
            let mut leased = Vec::new();
            while let Some(job) = repo.lease_next(&worker).await.unwrap() {
                leased.push(job.id);
            }
            leased
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} leased twice");
        }
    }
    assert_eq!(seen.len(), 40);
}

#[tokio::test]
async fn publication_lease_moves_item_to_publishing() {
    let (pool, _container) = setup_test_db().await;
    let (db, _clock) = test_database(pool);
    let repo = db.job_repo();
    let channel = active_channel(&db, "clips").await;
    let item = new_item(&db, &[channel.id]).await;
    repo.enqueue(EnqueueRequest::new(item, Stage::Discovery))
        .await
        .unwrap();

    for artifact in ["meta", "file", "cut"] {
        let job = repo.lease_next("w").await.unwrap().unwrap();
        repo.complete(job.id, "w", StageOutcome::success(artifact))
            .await
            .unwrap();
    }
    let publication = repo.lease_next("w").await.unwrap().unwrap();
    assert_eq!(publication.stage, Stage::Publication);
    assert_eq!(publication.channel_id, Some(channel.id));
    assert_eq!(publication.quota_reserved, 1);
    assert_eq!(
        db.item_repo().get_item(item).await.unwrap().unwrap().stage,
        ItemStage::Publishing
    );

    repo.complete(publication.id, "w", StageOutcome::success("post://1"))
        .await
        .unwrap();
    assert_eq!(
        db.item_repo().get_item(item).await.unwrap().unwrap().stage,
        ItemStage::Published
    );
}

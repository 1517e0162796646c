//! Test utilities: an in-memory store implementing every storage trait, a
//! manually driven clock, and a scriptable stage executor.
//!
//! `MemoryStore` keeps all state behind one mutex, so each trait method is
//! trivially atomic. It applies the same [`plan_completion`] rules as the
//! PostgreSQL repositories, which makes it suitable for scenario tests of
//! the whole pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::channel::{Channel, NewChannel, PostingSchedule, RateBudget};
use crate::clock::{Clock, SharedClock};
use crate::completion::{ChainSettings, CompletionContext, JobUpdate, NextJob, WaveBinding, plan_completion};
use crate::error::AppError;
use crate::item::{ContentItem, ItemStage, NewItem, Stage, StageTimestamps};
use crate::job::{
    CompletionResult, EnqueueRequest, JobFilter, JobKey, JobStatus, ProcessingJob, StageFailure,
    StageOutcome,
};
use crate::job_queue::{JobQueue, OrchestratorControl, OrchestratorState};
use crate::quota::{QuotaBucket, QuotaTracker, Reservation};
use crate::traits::{ChannelStore, ItemStore, StageExecutor, StageInput, WaveStore};
use crate::wave::{
    MemberState, Wave, WaveMember, WaveMemberRequest, WaveStatus, validate_members,
    validate_wave_request,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = lock(&self.now);
        *now += by;
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        ManualClock::now(self)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct State {
    channels: HashMap<Uuid, Channel>,
    items: HashMap<Uuid, ContentItem>,
    jobs: HashMap<Uuid, ProcessingJob>,
    waves: HashMap<Uuid, Wave>,
    buckets: HashMap<String, QuotaBucket>,
    orchestrator: OrchestratorState,
    next_seq: i64,
}

impl State {
    fn new() -> Self {
        Self {
            channels: HashMap::new(),
            items: HashMap::new(),
            jobs: HashMap::new(),
            waves: HashMap::new(),
            buckets: HashMap::new(),
            orchestrator: OrchestratorState::Running,
            next_seq: 1,
        }
    }

    fn active_job(&self, key: JobKey) -> Option<&ProcessingJob> {
        self.jobs
            .values()
            .find(|j| j.key() == key && j.status.is_active())
    }

    fn insert_item(&mut self, item: NewItem, now: DateTime<Utc>) -> Result<ContentItem, AppError> {
        if item.source_ref.trim().is_empty() {
            return Err(AppError::InvalidInput("source_ref is required".into()));
        }
        if let Some(missing) = item
            .channel_ids
            .iter()
            .find(|id| !self.channels.contains_key(*id))
        {
            return Err(AppError::not_found("channel", *missing));
        }
        let mut timestamps = StageTimestamps::default();
        timestamps.set(ItemStage::Discovered, now);
        let record = ContentItem {
            id: Uuid::new_v4(),
            source_ref: item.source_ref,
            stage: ItemStage::Discovered,
            artifacts: Default::default(),
            channel_ids: item.channel_ids,
            failure_reason: None,
            timestamps,
            created_at: now,
            updated_at: now,
        };
        self.items.insert(record.id, record.clone());
        Ok(record)
    }

    fn insert_job(&mut self, job: NewJob, now: DateTime<Utc>) -> Result<ProcessingJob, AppError> {
        if self.active_job(job.key).is_some() {
            return Err(AppError::DuplicateActiveJob {
                item_id: job.key.item_id,
                stage: job.key.stage.to_string(),
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let record = ProcessingJob {
            id: Uuid::new_v4(),
            item_id: job.key.item_id,
            stage: job.key.stage,
            channel_id: job.key.channel_id,
            priority: job.priority,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: job.max_attempts,
            not_before: job.not_before,
            lease_owner: None,
            lease_expires_at: None,
            last_error_class: None,
            last_error: None,
            artifact_ref: None,
            wave_id: job.wave_id,
            quota_reserved: 0,
            quota_window_started_at: None,
            seq,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    fn release_quota(&mut self, job_id: Uuid) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.quota_reserved > 0
            && let Some(channel_id) = job.channel_id
            && let Some(bucket) = self.buckets.get_mut(&crate::channel::quota_key_for(channel_id))
        {
            match job.quota_window_started_at {
                Some(window) => bucket.release_from(job.quota_reserved, window),
                None => bucket.release(job.quota_reserved),
            }
        }
        job.quota_reserved = 0;
        job.quota_window_started_at = None;
    }

    /// Running job back to queued without spending an attempt.
    fn requeue(&mut self, job_id: Uuid, now: DateTime<Utc>) {
        self.release_quota(job_id);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.status = JobStatus::Queued;
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;
        }
    }

    fn set_item_stage(&mut self, item_id: Uuid, stage: ItemStage, now: DateTime<Utc>) {
        if let Some(item) = self.items.get_mut(&item_id) {
            item.stage = stage;
            item.timestamps.set(stage, now);
            item.updated_at = now;
        }
    }

    fn link_wave_members(&mut self, item_id: Uuid, channel_id: Uuid, job_id: Uuid) {
        for wave in self.waves.values_mut() {
            for member in wave
                .members
                .iter_mut()
                .filter(|m| m.item_id == item_id && m.channel_id == channel_id)
            {
                member.job_id = Some(job_id);
            }
        }
    }

    fn wave_bindings(&self, item_id: Uuid) -> Vec<WaveBinding> {
        self.waves
            .values()
            .flat_map(|wave| {
                wave.members
                    .iter()
                    .filter(move |m| m.item_id == item_id)
                    .map(move |m| WaveBinding {
                        wave_id: wave.id,
                        channel_id: m.channel_id,
                        target_time: wave.target_time,
                    })
            })
            .collect()
    }

    /// Attach one member to a wave, creating or re-binding its publication
    /// job when the item is ready. Checks must already have passed.
    fn attach_member(
        &mut self,
        wave_id: Uuid,
        target_time: DateTime<Utc>,
        member: WaveMemberRequest,
        settings: &ChainSettings,
        now: DateTime<Utc>,
    ) -> Result<WaveMember, AppError> {
        let ready = match self.items.get_mut(&member.item_id) {
            Some(item) => {
                if !item.channel_ids.contains(&member.channel_id) {
                    item.channel_ids.push(member.channel_id);
                    item.updated_at = now;
                }
                item.stage.ready_for_publication()
            }
            None => return Err(AppError::not_found("item", member.item_id)),
        };

        let job_id = if ready {
            let key = JobKey {
                item_id: member.item_id,
                stage: Stage::Publication,
                channel_id: Some(member.channel_id),
            };
            let existing = self.active_job(key).map(|j| j.id);
            match existing.and_then(|id| self.jobs.get_mut(&id)) {
                Some(job) => {
                    job.not_before = target_time;
                    job.priority = job.priority.max(settings.wave_priority);
                    job.wave_id = Some(wave_id);
                    job.updated_at = now;
                    Some(job.id)
                }
                None => {
                    let job = self.insert_job(
                        NewJob {
                            key,
                            priority: settings.wave_priority,
                            not_before: target_time,
                            max_attempts: settings.retry.max_attempts,
                            wave_id: Some(wave_id),
                        },
                        now,
                    )?;
                    Some(job.id)
                }
            }
        } else {
            None
        };

        Ok(WaveMember {
            wave_id,
            item_id: member.item_id,
            channel_id: member.channel_id,
            job_id,
        })
    }

    /// Everything that can reject a member, checked before any mutation.
    fn check_members(&self, members: &[WaveMemberRequest]) -> Result<(), AppError> {
        for member in members {
            let item = self
                .items
                .get(&member.item_id)
                .ok_or_else(|| AppError::not_found("item", member.item_id))?;
            if item.stage == ItemStage::Failed {
                return Err(AppError::InvalidTransition(format!(
                    "item {} has failed",
                    item.id
                )));
            }
            if !self.channels.contains_key(&member.channel_id) {
                return Err(AppError::not_found("channel", member.channel_id));
            }
            let key = JobKey {
                item_id: member.item_id,
                stage: Stage::Publication,
                channel_id: Some(member.channel_id),
            };
            if self
                .active_job(key)
                .is_some_and(|j| j.status == JobStatus::Running)
            {
                return Err(AppError::DuplicateActiveJob {
                    item_id: member.item_id,
                    stage: Stage::Publication.to_string(),
                });
            }
        }
        Ok(())
    }
}

struct NewJob {
    key: JobKey,
    priority: i32,
    not_before: DateTime<Utc>,
    max_attempts: u32,
    wave_id: Option<Uuid>,
}

impl NewJob {
    fn from_next(next: &NextJob) -> Self {
        Self {
            key: JobKey {
                item_id: next.item_id,
                stage: next.stage,
                channel_id: next.channel_id,
            },
            priority: next.priority,
            not_before: next.not_before,
            max_attempts: next.max_attempts,
            wave_id: next.wave_id,
        }
    }
}

/// In-memory implementation of every storage trait.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: SharedClock,
    settings: Arc<ChainSettings>,
    lease_ttl: TimeDelta,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
            clock,
            settings: Arc::new(ChainSettings::default()),
            lease_ttl: TimeDelta::minutes(5),
        }
    }

    pub fn with_chain_settings(mut self, settings: ChainSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: TimeDelta) -> Self {
        self.lease_ttl = ttl;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Drop an item without touching its jobs.
    pub fn forget_item(&self, item_id: Uuid) {
        self.lock_state().items.remove(&item_id);
    }

    pub fn bucket(&self, resource_key: &str) -> Option<QuotaBucket> {
        self.lock_state().buckets.get(resource_key).cloned()
    }

    pub fn jobs_for_item(&self, item_id: Uuid) -> Vec<ProcessingJob> {
        let mut jobs: Vec<_> = self
            .lock_state()
            .jobs
            .values()
            .filter(|j| j.item_id == item_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }
}

impl JobQueue for MemoryStore {
    async fn submit(
        &self,
        item: NewItem,
        priority: i32,
    ) -> Result<(ContentItem, ProcessingJob), AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        let item = state.insert_item(item, now)?;
        let job = state.insert_job(
            NewJob {
                key: JobKey {
                    item_id: item.id,
                    stage: Stage::Discovery,
                    channel_id: None,
                },
                priority,
                not_before: now,
                max_attempts: self.settings.retry.max_attempts,
                wave_id: None,
            },
            now,
        )?;
        Ok((item, job))
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<ProcessingJob, AppError> {
        request.validate()?;
        let now = self.now();
        let mut state = self.lock_state();
        let item = state
            .items
            .get(&request.item_id)
            .ok_or_else(|| AppError::not_found("item", request.item_id))?;
        if item.stage == ItemStage::Failed {
            return Err(AppError::InvalidTransition(format!(
                "item {} has failed; retry its dead or discarded job instead",
                item.id
            )));
        }
        if let Some(channel_id) = request.channel_id
            && !state.channels.contains_key(&channel_id)
        {
            return Err(AppError::not_found("channel", channel_id));
        }
        state.insert_job(
            NewJob {
                key: request.key(),
                priority: request.priority,
                not_before: request.not_before.unwrap_or(now),
                max_attempts: request
                    .max_attempts
                    .unwrap_or(self.settings.retry.max_attempts),
                wave_id: None,
            },
            now,
        )
    }

    async fn lease_next(&self, worker_id: &str) -> Result<Option<ProcessingJob>, AppError> {
        let now = self.now();
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.orchestrator == OrchestratorState::Paused {
            return Ok(None);
        }

        let mut candidates: Vec<&ProcessingJob> = state
            .jobs
            .values()
            .filter(|j| j.status.is_leasable() && j.not_before <= now)
            .collect();
        candidates.sort_by_key(|j| j.lease_order());
        let candidates: Vec<(Uuid, Option<Uuid>)> =
            candidates.iter().map(|j| (j.id, j.channel_id)).collect();

        for (job_id, channel_id) in candidates {
            let mut reserved = 0;
            let mut charged_window = None;
            if let Some(channel_id) = channel_id {
                let Some(channel) = state.channels.get(&channel_id) else {
                    continue;
                };
                if !channel.schedule_eligibility(now).is_eligible() {
                    continue;
                }
                let cost = channel.rate_budget.publish_cost;
                if let Some(bucket) = state.buckets.get_mut(&channel.quota_key()) {
                    if bucket.try_reserve(cost, now) == Reservation::Denied {
                        continue;
                    }
                    reserved = cost;
                    charged_window = Some(bucket.window_started_at);
                }
            }

            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            job.status = JobStatus::Running;
            job.lease_owner = Some(worker_id.to_string());
            job.lease_expires_at = Some(now + self.lease_ttl);
            job.started_at = Some(now);
            job.updated_at = now;
            job.quota_reserved = reserved;
            job.quota_window_started_at = charged_window;
            let leased = job.clone();

            if leased.stage == Stage::Publication
                && state
                    .items
                    .get(&leased.item_id)
                    .is_some_and(|i| i.stage == ItemStage::Transformed)
            {
                state.set_item_stage(leased.item_id, ItemStage::Publishing, now);
            }
            return Ok(Some(leased));
        }
        Ok(None)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: StageOutcome,
    ) -> Result<CompletionResult, AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        let job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("job", job_id))?;
        if job.status != JobStatus::Running || !job.is_owned_by(worker_id) {
            return Ok(CompletionResult::Stale);
        }
        let item = state
            .items
            .get(&job.item_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("item", job.item_id))?;
        let siblings: Vec<ProcessingJob> = if job.stage == Stage::Publication {
            state
                .jobs
                .values()
                .filter(|j| j.item_id == job.item_id && j.stage == Stage::Publication && j.id != job.id)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let bindings = state.wave_bindings(job.item_id);

        let plan = plan_completion(
            &CompletionContext {
                job: &job,
                item: &item,
                sibling_publications: &siblings,
                wave_bindings: &bindings,
                now,
            },
            &outcome,
            &self.settings,
        )?;

        if plan.release_quota {
            state.release_quota(job_id);
        }

        if let Some(record) = state.jobs.get_mut(&job_id) {
            record.status = plan.job.status();
            record.lease_owner = None;
            record.lease_expires_at = None;
            record.updated_at = now;
            match &plan.job {
                JobUpdate::Succeed {
                    artifact_ref,
                    attempts,
                } => {
                    record.attempts = *attempts;
                    record.artifact_ref = Some(artifact_ref.clone());
                    record.completed_at = Some(now);
                }
                JobUpdate::Retry {
                    attempts,
                    not_before,
                    class,
                    message,
                } => {
                    record.attempts = *attempts;
                    record.not_before = *not_before;
                    record.last_error_class = Some(*class);
                    record.last_error = Some(message.clone());
                }
                JobUpdate::Dead {
                    attempts,
                    class,
                    message,
                } => {
                    record.attempts = *attempts;
                    record.last_error_class = Some(*class);
                    record.last_error = Some(message.clone());
                    record.completed_at = Some(now);
                }
                JobUpdate::Discard { reason } => {
                    record.last_error = Some(reason.clone());
                    record.completed_at = Some(now);
                }
            }
        }

        if let Some(item) = state.items.get_mut(&job.item_id) {
            if let Some((stage, artifact)) = &plan.item.artifact {
                item.artifacts.insert(*stage, artifact.clone());
                item.updated_at = now;
            }
            if let Some(reason) = &plan.item.failure_reason {
                item.failure_reason = Some(reason.clone());
            }
        }
        if let Some(stage) = plan.item.stage {
            state.set_item_stage(job.item_id, stage, now);
        }

        if let Some(channel_id) = plan.published_channel
            && let Some(channel) = state.channels.get_mut(&channel_id)
        {
            channel.last_published_at = Some(now);
            channel.updated_at = now;
        }

        let mut enqueued = Vec::new();
        for next in &plan.next_jobs {
            let new_job = NewJob::from_next(next);
            if state.active_job(new_job.key).is_some() {
                continue;
            }
            let created = state.insert_job(new_job, now)?;
            if let Some(channel_id) = created.channel_id
                && created.wave_id.is_some()
            {
                state.link_wave_members(created.item_id, channel_id, created.id);
            }
            enqueued.push(created.id);
        }

        Ok(plan.result(enqueued))
    }

    async fn reclaim_expired_leases(&self) -> Result<u64, AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .map(|j| j.id)
            .collect();
        for id in &expired {
            state.requeue(*id, now);
        }
        Ok(expired.len() as u64)
    }

    async fn renew_lease(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running && job.is_owned_by(worker_id) => {
                job.lease_expires_at = Some(now + self.lease_ttl);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        let held: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.is_owned_by(worker_id))
            .map(|j| j.id)
            .collect();
        for id in &held {
            state.requeue(*id, now);
        }
        Ok(held.len() as u64)
    }

    async fn retry_dead_job(&self, job_id: Uuid) -> Result<ProcessingJob, AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        let job = state
            .jobs
            .get(&job_id)
            .ok_or_else(|| AppError::not_found("job", job_id))?;
        if !job.status.is_retryable_by_operator() {
            return Err(AppError::InvalidTransition(format!(
                "job {job_id} is {}, only dead or discarded jobs can be retried",
                job.status
            )));
        }
        let key = job.key();
        if state.active_job(key).is_some() {
            return Err(AppError::DuplicateActiveJob {
                item_id: key.item_id,
                stage: key.stage.to_string(),
            });
        }

        if let Some(item) = state.items.get_mut(&key.item_id)
            && item.stage == ItemStage::Failed
        {
            let restored = item.last_successful_stage();
            item.stage = restored;
            item.failure_reason = None;
            item.timestamps.failed_at = None;
            item.updated_at = now;
        }

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::not_found("job", job_id))?;
        job.status = JobStatus::Queued;
        job.attempts = 0;
        job.not_before = now;
        job.completed_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ProcessingJob>, AppError> {
        Ok(self.lock_state().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<ProcessingJob>, AppError> {
        let state = self.lock_state();
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.seq));
        jobs.truncate(filter.limit);
        Ok(jobs)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        Ok(self
            .lock_state()
            .jobs
            .values()
            .filter(|j| j.status == status)
            .count() as i64)
    }

    async fn archive_jobs(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.lock_state();
        let referenced: Vec<Uuid> = state
            .waves
            .values()
            .flat_map(|w| w.members.iter().filter_map(|m| m.job_id))
            .collect();
        let before = state.jobs.len();
        state.jobs.retain(|id, j| {
            !(j.status.is_terminal()
                && j.completed_at.is_some_and(|at| at < older_than)
                && !referenced.contains(id))
        });
        Ok((before - state.jobs.len()) as u64)
    }
}

impl OrchestratorControl for MemoryStore {
    async fn state(&self) -> Result<OrchestratorState, AppError> {
        Ok(self.lock_state().orchestrator)
    }

    async fn set_state(&self, state: OrchestratorState) -> Result<(), AppError> {
        self.lock_state().orchestrator = state;
        Ok(())
    }
}

impl QuotaTracker for MemoryStore {
    async fn configure(
        &self,
        resource_key: &str,
        capacity: i64,
        window_secs: i64,
    ) -> Result<(), AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        state
            .buckets
            .entry(resource_key.to_string())
            .and_modify(|b| {
                b.capacity = capacity;
                b.window_secs = window_secs;
            })
            .or_insert_with(|| QuotaBucket::new(resource_key, capacity, window_secs, now));
        Ok(())
    }

    async fn reserve(&self, resource_key: &str, cost: i64) -> Result<Reservation, AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        Ok(match state.buckets.get_mut(resource_key) {
            Some(bucket) => bucket.try_reserve(cost, now),
            None => Reservation::Granted,
        })
    }

    async fn release(&self, resource_key: &str, cost: i64) -> Result<(), AppError> {
        if let Some(bucket) = self.lock_state().buckets.get_mut(resource_key) {
            bucket.release(cost);
        }
        Ok(())
    }

    async fn remaining(&self, resource_key: &str) -> Result<Option<i64>, AppError> {
        let now = self.now();
        Ok(self
            .lock_state()
            .buckets
            .get(resource_key)
            .map(|b| b.remaining_at(now)))
    }
}

impl ChannelStore for MemoryStore {
    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, AppError> {
        channel.validate()?;
        let now = self.now();
        let mut state = self.lock_state();
        if state
            .channels
            .values()
            .any(|c| c.credential_scope == channel.credential_scope)
        {
            return Err(AppError::InvalidInput(format!(
                "credential scope '{}' is already bound to a channel",
                channel.credential_scope
            )));
        }
        let record = Channel {
            id: Uuid::new_v4(),
            name: channel.name,
            active: false,
            credential_scope: channel.credential_scope,
            schedule: channel.schedule,
            rate_budget: channel.rate_budget,
            last_published_at: None,
            created_at: now,
            updated_at: now,
        };
        state.buckets.insert(
            record.quota_key(),
            QuotaBucket::new(
                record.quota_key(),
                record.rate_budget.capacity,
                record.rate_budget.window_secs,
                now,
            ),
        );
        state.channels.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_channel(&self, channel_id: Uuid) -> Result<Option<Channel>, AppError> {
        Ok(self.lock_state().channels.get(&channel_id).cloned())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, AppError> {
        let mut channels: Vec<_> = self.lock_state().channels.values().cloned().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }

    async fn set_active(&self, channel_id: Uuid, active: bool) -> Result<Channel, AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| AppError::not_found("channel", channel_id))?;
        channel.active = active;
        channel.updated_at = now;
        Ok(channel.clone())
    }

    async fn update_schedule(
        &self,
        channel_id: Uuid,
        schedule: PostingSchedule,
        rate_budget: RateBudget,
    ) -> Result<Channel, AppError> {
        schedule.validate()?;
        rate_budget.validate()?;
        let now = self.now();
        let mut state = self.lock_state();
        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| AppError::not_found("channel", channel_id))?;
        channel.schedule = schedule;
        channel.rate_budget = rate_budget;
        channel.updated_at = now;
        let updated = channel.clone();
        state
            .buckets
            .entry(updated.quota_key())
            .and_modify(|b| {
                b.capacity = rate_budget.capacity;
                b.window_secs = rate_budget.window_secs;
            })
            .or_insert_with(|| {
                QuotaBucket::new(
                    updated.quota_key(),
                    rate_budget.capacity,
                    rate_budget.window_secs,
                    now,
                )
            });
        Ok(updated)
    }
}

impl ItemStore for MemoryStore {
    async fn create_item(&self, item: NewItem) -> Result<ContentItem, AppError> {
        let now = self.now();
        self.lock_state().insert_item(item, now)
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<ContentItem>, AppError> {
        Ok(self.lock_state().items.get(&item_id).cloned())
    }

    async fn list_items(
        &self,
        stage: Option<ItemStage>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, AppError> {
        let mut items: Vec<_> = self
            .lock_state()
            .items
            .values()
            .filter(|i| stage.is_none_or(|s| s == i.stage))
            .cloned()
            .collect();
        items.sort_by_key(|i| std::cmp::Reverse(i.created_at));
        items.truncate(limit);
        Ok(items)
    }

    async fn mark_item_failed(&self, item_id: Uuid, reason: &str) -> Result<ContentItem, AppError> {
        let now = self.now();
        let mut state = self.lock_state();
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| AppError::not_found("item", item_id))?;
        if item.stage.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "item {item_id} is already {}",
                item.stage
            )));
        }
        item.stage = ItemStage::Failed;
        item.failure_reason = Some(reason.to_string());
        item.timestamps.set(ItemStage::Failed, now);
        item.updated_at = now;
        let failed = item.clone();

        for job in state
            .jobs
            .values_mut()
            .filter(|j| j.item_id == item_id && j.status.is_leasable())
        {
            job.status = JobStatus::Failed;
            job.last_error = Some(format!("item failed: {reason}"));
            job.completed_at = Some(now);
            job.updated_at = now;
        }
        Ok(failed)
    }
}

impl WaveStore for MemoryStore {
    async fn schedule_wave(
        &self,
        members: Vec<WaveMemberRequest>,
        target_time: DateTime<Utc>,
        label: Option<String>,
    ) -> Result<Wave, AppError> {
        let now = self.now();
        validate_wave_request(&members, target_time, now)?;
        let mut state = self.lock_state();
        state.check_members(&members)?;

        let wave_id = Uuid::new_v4();
        let mut attached = Vec::with_capacity(members.len());
        for member in members {
            attached.push(state.attach_member(wave_id, target_time, member, &self.settings, now)?);
        }
        let wave = Wave {
            id: wave_id,
            label,
            target_time,
            created_at: now,
            members: attached,
        };
        state.waves.insert(wave.id, wave.clone());
        Ok(wave)
    }

    async fn add_wave_members(
        &self,
        wave_id: Uuid,
        members: Vec<WaveMemberRequest>,
    ) -> Result<Wave, AppError> {
        let now = self.now();
        validate_members(&members)?;
        let mut state = self.lock_state();
        let wave = state
            .waves
            .get(&wave_id)
            .ok_or_else(|| AppError::not_found("wave", wave_id))?;
        if !wave.is_open(now) {
            return Err(AppError::WaveClosed(wave_id));
        }
        if let Some(dup) = members.iter().find(|m| {
            wave.members
                .iter()
                .any(|e| e.item_id == m.item_id && e.channel_id == m.channel_id)
        }) {
            return Err(AppError::InvalidInput(format!(
                "item {} on channel {} is already in wave {wave_id}",
                dup.item_id, dup.channel_id
            )));
        }
        let target_time = wave.target_time;
        state.check_members(&members)?;

        let mut attached = Vec::with_capacity(members.len());
        for member in members {
            attached.push(state.attach_member(wave_id, target_time, member, &self.settings, now)?);
        }
        let wave = state
            .waves
            .get_mut(&wave_id)
            .ok_or_else(|| AppError::not_found("wave", wave_id))?;
        wave.members.extend(attached);
        Ok(wave.clone())
    }

    async fn get_wave(&self, wave_id: Uuid) -> Result<Option<Wave>, AppError> {
        Ok(self.lock_state().waves.get(&wave_id).cloned())
    }

    async fn wave_status(&self, wave_id: Uuid) -> Result<WaveStatus, AppError> {
        let state = self.lock_state();
        let wave = state
            .waves
            .get(&wave_id)
            .ok_or_else(|| AppError::not_found("wave", wave_id))?;
        Ok(WaveStatus::from_members(wave.members.iter().map(|m| {
            MemberState::new(
                m.job_id
                    .and_then(|id| state.jobs.get(&id))
                    .map(|j| j.status),
                state
                    .items
                    .get(&m.item_id)
                    .is_some_and(|item| item.stage == ItemStage::Failed),
            )
        })))
    }
}

// ---------------------------------------------------------------------------
// MockExecutor
// ---------------------------------------------------------------------------

/// Scriptable stage executor that records every input it receives.
///
/// Scripted results for a stage are consumed first; after that the executor
/// falls back to its default (success unless built with [`failing`]).
///
/// [`failing`]: MockExecutor::failing
#[derive(Clone, Default)]
pub struct MockExecutor {
    calls: Arc<Mutex<Vec<StageInput>>>,
    scripts: Arc<Mutex<HashMap<Stage, VecDeque<Result<String, StageFailure>>>>>,
    channel_failures: Arc<Mutex<HashMap<Uuid, StageFailure>>>,
    default_failure: Option<StageFailure>,
    delay: Option<Duration>,
}

impl MockExecutor {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(failure: StageFailure) -> Self {
        Self {
            default_failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue results for the next executions of `stage`.
    pub fn script(
        self,
        stage: Stage,
        results: impl IntoIterator<Item = Result<String, StageFailure>>,
    ) -> Self {
        lock(&self.scripts)
            .entry(stage)
            .or_default()
            .extend(results);
        self
    }

    /// Every publication to `channel_id` fails with `failure`.
    pub fn failing_channel(self, channel_id: Uuid, failure: StageFailure) -> Self {
        lock(&self.channel_failures).insert(channel_id, failure);
        self
    }

    pub fn calls(&self) -> Vec<StageInput> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, stage: Stage) -> Vec<StageInput> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.stage == stage)
            .cloned()
            .collect()
    }

    fn next_result(&self, input: &StageInput) -> Result<String, StageFailure> {
        if let Some(channel_id) = input.channel_id
            && let Some(failure) = lock(&self.channel_failures).get(&channel_id)
        {
            return Err(failure.clone());
        }
        if let Some(result) = lock(&self.scripts)
            .get_mut(&input.stage)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        match &self.default_failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(match input.channel_id {
                Some(channel_id) => format!("{}://{}/{}", input.stage, input.item_id, channel_id),
                None => format!("{}://{}", input.stage, input.item_id),
            }),
        }
    }
}

impl StageExecutor for MockExecutor {
    async fn execute(&self, input: &StageInput) -> Result<String, StageFailure> {
        lock(&self.calls).push(input.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_result(input)
    }
}

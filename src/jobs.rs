//! # Background Sync Jobs
//!
//! A [`RetryableJob`] reconciles one pending record (or performs a fetch)
//! against the remote service:
//!
//! ```text
//! Scheduled -> Running -> Succeeded
//!                      -> Retrying -> Scheduled (attempt_count + 1)
//!                      -> Abandoned
//! ```
//!
//! Jobs read their input from the store at the start of every attempt. A job
//! whose pending record is already gone ends as `Succeeded` without touching
//! the network, so scheduling the same work twice is harmless.
//!
//! [`JobScheduler`] runs jobs on the ambient tokio runtime. It keeps the
//! attempt counter for the lifetime of one scheduled job, deduplicates live
//! jobs by `(kind, id)` and serialises attempts for the same run id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{DataError, Disposition, Result};
use crate::gateway::RemoteRunGateway;
use crate::persistence::{CreateOutcome, RunStore};
use crate::types::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Create,
    Delete,
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Running,
    Retrying,
    Succeeded,
    Abandoned,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Abandoned)
    }
}

/// Runtime-held retry state of one scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAttempt {
    pub kind: JobKind,
    pub target_id: Option<RunId>,
    /// Retries so far (0 on the first attempt)
    pub attempt_count: u32,
}

/// Next state after a failed attempt.
///
/// Non-retryable errors abandon immediately. Retryable ones retry until the
/// attempt that just failed was the last one allowed.
pub fn state_after_failure(attempt: &SyncAttempt, error: &DataError, max_attempts: u32) -> JobState {
    match error.disposition() {
        Disposition::Fail => JobState::Abandoned,
        Disposition::Retry if attempt.attempt_count + 1 >= max_attempts => JobState::Abandoned,
        Disposition::Retry => JobState::Retrying,
    }
}

/// A unit of background reconciliation work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RetryableJob {
    /// Push a PendingCreate to the remote.
    Create(RunId),
    /// Push a PendingDelete to the remote.
    Delete(RunId),
    /// Pull the remote run list into the local cache.
    Fetch,
}

impl RetryableJob {
    pub fn kind(&self) -> JobKind {
        match self {
            RetryableJob::Create(_) => JobKind::Create,
            RetryableJob::Delete(_) => JobKind::Delete,
            RetryableJob::Fetch => JobKind::Fetch,
        }
    }

    pub fn target_id(&self) -> Option<&RunId> {
        match self {
            RetryableJob::Create(id) | RetryableJob::Delete(id) => Some(id),
            RetryableJob::Fetch => None,
        }
    }

    /// Execute one attempt.
    async fn run_once(&self, ctx: &JobContext) -> Result<()> {
        match self {
            RetryableJob::Create(id) => {
                let Some(pending) = ctx.store.begin_create_attempt(id)? else {
                    debug!("[JobScheduler] Create {}: pending record gone", id);
                    return Ok(());
                };
                match ctx.gateway.post_run(&pending.run, &pending.map_image).await {
                    Ok(remote) => {
                        ctx.store
                            .finish_create_attempt(id, CreateOutcome::Acknowledged(&remote))?;
                        Ok(())
                    }
                    Err(e) => {
                        let outcome = if e.may_have_landed() {
                            CreateOutcome::Uncertain
                        } else {
                            CreateOutcome::NotDelivered
                        };
                        if let Err(local) = ctx.store.finish_create_attempt(id, outcome) {
                            warn!(
                                "[JobScheduler] Create {}: failed to record attempt: {}",
                                id, local
                            );
                        }
                        Err(e.into())
                    }
                }
            }
            RetryableJob::Delete(id) => {
                if !ctx.store.has_pending_delete(id)? {
                    debug!("[JobScheduler] Delete {}: pending record gone", id);
                    return Ok(());
                }
                ctx.gateway.delete_run(id).await?;
                ctx.store.complete_pending_delete(id)?;
                Ok(())
            }
            RetryableJob::Fetch => {
                let runs = ctx.gateway.fetch_runs().await?;
                ctx.store.merge_remote_runs(&runs)?;
                Ok(())
            }
        }
    }
}

/// Caller-side view of a scheduled job.
#[derive(Clone)]
pub struct JobHandle {
    job: RetryableJob,
    state: watch::Receiver<JobState>,
    attempt_count: Arc<AtomicU32>,
}

impl JobHandle {
    pub fn job(&self) -> &RetryableJob {
        &self.job
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Retries so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::Relaxed)
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    /// Resolve once the job reaches a terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(JobState::is_terminal).await {
            return *state;
        }
        // Sender dropped: the task is gone, report what it last published
        let state = *rx.borrow();
        state
    }
}

struct JobContext {
    store: Arc<RunStore>,
    gateway: Arc<dyn RemoteRunGateway>,
    config: SyncConfig,
}

struct LiveJob {
    seq: u64,
    handle: JobHandle,
}

struct SchedulerInner {
    ctx: JobContext,
    live: Mutex<HashMap<RetryableJob, LiveJob>>,
    id_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
    next_seq: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Runs [`RetryableJob`]s with bounded, classified retries.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(store: Arc<RunStore>, gateway: Arc<dyn RemoteRunGateway>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                ctx: JobContext {
                    store,
                    gateway,
                    config,
                },
                live: Mutex::new(HashMap::new()),
                id_locks: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule a job. If an identical job is still live, its handle is
    /// returned instead of starting a second one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, job: RetryableJob) -> JobHandle {
        let mut live = lock(&self.inner.live);
        if let Some(existing) = live.get(&job) {
            if !existing.handle.state().is_terminal() {
                debug!("[JobScheduler] {:?} already live", job);
                return existing.handle.clone();
            }
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(JobState::Scheduled);
        let handle = JobHandle {
            job: job.clone(),
            state: state_rx,
            attempt_count: Arc::new(AtomicU32::new(0)),
        };
        live.insert(
            job.clone(),
            LiveJob {
                seq,
                handle: handle.clone(),
            },
        );
        drop(live);

        let id_lock = job.target_id().map(|id| self.id_lock(id));
        let inner = Arc::clone(&self.inner);
        let attempt_count = Arc::clone(&handle.attempt_count);
        tokio::spawn(async move {
            let final_state = drive(&inner.ctx, &job, &state_tx, &attempt_count, id_lock).await;
            state_tx.send_replace(final_state);
            inner.retire(&job, seq);
        });

        debug!("[JobScheduler] Scheduled {:?}", handle.job);
        handle
    }

    fn id_lock(&self, id: &RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.inner.id_locks);
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    /// Run a Fetch job every `interval` until the returned task is aborted.
    pub fn schedule_periodic_fetch(&self, interval: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let state = scheduler.schedule(RetryableJob::Fetch).wait().await;
                debug!("[JobScheduler] Periodic fetch ended {:?}", state);
            }
        })
    }

    /// Handles of all jobs that have not reached a terminal state.
    pub fn live_jobs(&self) -> Vec<JobHandle> {
        lock(&self.inner.live)
            .values()
            .map(|live| live.handle.clone())
            .filter(|handle| !handle.state().is_terminal())
            .collect()
    }

    /// Wait until no job is live, including jobs scheduled while waiting.
    pub async fn wait_all(&self) {
        loop {
            let handles = self.live_jobs();
            if handles.is_empty() {
                return;
            }
            join_all(handles.iter().map(JobHandle::wait)).await;
        }
    }
}

impl SchedulerInner {
    /// Forget a finished job, unless a newer job already replaced it.
    fn retire(&self, job: &RetryableJob, seq: u64) {
        let mut live = lock(&self.live);
        if live.get(job).is_some_and(|entry| entry.seq == seq) {
            live.remove(job);
        }
        drop(live);

        if let Some(id) = job.target_id() {
            let mut locks = lock(&self.id_locks);
            if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(id);
            }
        }
    }
}

/// Attempt loop of one scheduled job. Returns the terminal state.
async fn drive(
    ctx: &JobContext,
    job: &RetryableJob,
    state_tx: &watch::Sender<JobState>,
    attempt_count: &AtomicU32,
    id_lock: Option<Arc<tokio::sync::Mutex<()>>>,
) -> JobState {
    let mut attempt = SyncAttempt {
        kind: job.kind(),
        target_id: job.target_id().cloned(),
        attempt_count: 0,
    };

    loop {
        if attempt.attempt_count >= ctx.config.max_attempts {
            warn!("[JobScheduler] {:?} abandoned: attempt ceiling reached", job);
            return JobState::Abandoned;
        }

        let started = Instant::now();
        let result = {
            // Held per attempt, not across the backoff sleep
            let _guard = match &id_lock {
                Some(l) => Some(l.lock().await),
                None => None,
            };
            state_tx.send_replace(JobState::Running);
            job.run_once(ctx).await
        };

        let error = match result {
            Ok(()) => {
                info!(
                    "[JobScheduler] {:?} succeeded after {} retries ({} ms)",
                    job,
                    attempt.attempt_count,
                    started.elapsed().as_millis()
                );
                return JobState::Succeeded;
            }
            Err(e) => e,
        };

        match state_after_failure(&attempt, &error, ctx.config.max_attempts) {
            JobState::Retrying => {
                let delay = ctx.config.retry_delay(attempt.attempt_count);
                debug!(
                    "[JobScheduler] {:?} attempt {} failed ({}), retrying in {:?}",
                    job, attempt.attempt_count, error, delay
                );
                state_tx.send_replace(JobState::Retrying);
                tokio::time::sleep(delay).await;
                attempt.attempt_count += 1;
                attempt_count.store(attempt.attempt_count, Ordering::Relaxed);
                state_tx.send_replace(JobState::Scheduled);
            }
            state => {
                warn!(
                    "[JobScheduler] {:?} abandoned on attempt {}: {}",
                    job, attempt.attempt_count, error
                );
                return state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LocalError, NetworkError};
    use crate::persistence::DeleteOutcome;
    use crate::types::{GpsPoint, Run};
    use async_trait::async_trait;
    use chrono::Utc;

    #[derive(Default)]
    struct FakeGateway {
        fail_with: Mutex<Option<NetworkError>>,
        post_calls: AtomicU32,
        delete_calls: AtomicU32,
        remote: Mutex<Vec<Run>>,
    }

    impl FakeGateway {
        fn failing(error: NetworkError) -> Self {
            Self {
                fail_with: Mutex::new(Some(error)),
                ..Self::default()
            }
        }

        fn check(&self) -> std::result::Result<(), NetworkError> {
            match *self.fail_with.lock().unwrap() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl RemoteRunGateway for FakeGateway {
        async fn post_run(&self, run: &Run, _map_image: &[u8]) -> std::result::Result<Run, NetworkError> {
            self.post_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.remote.lock().unwrap().push(run.clone());
            Ok(run.clone())
        }

        async fn delete_run(&self, id: &RunId) -> std::result::Result<(), NetworkError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.remote
                .lock()
                .unwrap()
                .retain(|r| r.id.as_ref() != Some(id));
            Ok(())
        }

        async fn fetch_runs(&self) -> std::result::Result<Vec<Run>, NetworkError> {
            self.check()?;
            Ok(self.remote.lock().unwrap().clone())
        }

        async fn logout(&self) -> std::result::Result<(), NetworkError> {
            self.check()
        }
    }

    fn run(id: &str) -> Run {
        Run {
            id: Some(RunId::from(id)),
            duration: Duration::from_secs(600),
            start_time_utc: Utc::now(),
            distance_meters: 2_000.0,
            last_known_location: GpsPoint::new(51.5, -0.1),
            max_speed_kmh: 13.0,
            total_elevation_gain_meters: 4.0,
            map_image_ref: None,
        }
    }

    fn setup(gateway: FakeGateway) -> (Arc<RunStore>, Arc<FakeGateway>, JobScheduler) {
        let store = Arc::new(RunStore::in_memory().unwrap());
        let gateway = Arc::new(gateway);
        let scheduler = JobScheduler::new(store.clone(), gateway.clone(), SyncConfig::default());
        (store, gateway, scheduler)
    }

    #[test]
    fn test_state_after_failure() {
        let attempt = |n| SyncAttempt {
            kind: JobKind::Create,
            target_id: None,
            attempt_count: n,
        };
        let offline = DataError::Network(NetworkError::NoInternet);
        let too_large = DataError::Network(NetworkError::PayloadTooLarge);
        let disk_full = DataError::Local(LocalError::DiskFull);

        assert_eq!(state_after_failure(&attempt(0), &offline, 5), JobState::Retrying);
        assert_eq!(state_after_failure(&attempt(3), &offline, 5), JobState::Retrying);
        assert_eq!(state_after_failure(&attempt(4), &offline, 5), JobState::Abandoned);
        assert_eq!(state_after_failure(&attempt(0), &too_large, 5), JobState::Abandoned);
        assert_eq!(state_after_failure(&attempt(0), &disk_full, 5), JobState::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_success_clears_pending() {
        let (store, gateway, scheduler) = setup(FakeGateway::default());
        store.upsert_run_with_pending(&run("r1"), b"map").unwrap();

        let state = scheduler.schedule(RetryableJob::Create(RunId::from("r1"))).wait().await;
        assert_eq!(state, JobState::Succeeded);
        assert!(store.pending_create(&RunId::from("r1")).unwrap().is_none());
        assert_eq!(gateway.post_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_abandons_on_fifth_attempt() {
        let (store, gateway, scheduler) = setup(FakeGateway::failing(NetworkError::NoInternet));
        store.upsert_run_with_pending(&run("r1"), b"map").unwrap();

        let handle = scheduler.schedule(RetryableJob::Create(RunId::from("r1")));
        assert_eq!(handle.wait().await, JobState::Abandoned);
        assert_eq!(gateway.post_calls.load(Ordering::SeqCst), 5);
        assert_eq!(handle.attempt_count(), 4);
        assert!(store.pending_create(&RunId::from("r1")).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_after_post_keeps_network_error() {
        let (store, gateway, scheduler) = setup(FakeGateway::failing(NetworkError::RequestTimeout));
        store.upsert_run_with_pending(&run("r1"), b"map").unwrap();
        // Recording a timed-out create now fails locally
        store.execute_batch("ALTER TABLE runs RENAME TO runs_moved;").unwrap();

        let handle = scheduler.schedule(RetryableJob::Create(RunId::from("r1")));
        assert_eq!(handle.wait().await, JobState::Abandoned);
        // A local error would have abandoned after the first post
        assert_eq!(gateway.post_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_create_marks_run_known_remotely() {
        let (store, _gateway, scheduler) = setup(FakeGateway::failing(NetworkError::RequestTimeout));
        store.upsert_run_with_pending(&run("r1"), b"map").unwrap();

        let handle = scheduler.schedule(RetryableJob::Create(RunId::from("r1")));
        assert_eq!(handle.wait().await, JobState::Abandoned);
        assert_eq!(
            store.delete_run_with_pending(&RunId::from("r1")).unwrap(),
            DeleteOutcome::RemoteDeleteRequired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_abandons_immediately() {
        let (store, gateway, scheduler) = setup(FakeGateway::failing(NetworkError::Serialization));
        store.upsert_run_with_pending(&run("r1"), &[]).unwrap();

        let state = scheduler.schedule(RetryableJob::Create(RunId::from("r1"))).wait().await;
        assert_eq!(state, JobState::Abandoned);
        assert_eq!(gateway.post_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pending_record_is_a_no_op() {
        let (_store, gateway, scheduler) = setup(FakeGateway::failing(NetworkError::ServerError));

        let create = scheduler.schedule(RetryableJob::Create(RunId::from("gone")));
        let delete = scheduler.schedule(RetryableJob::Delete(RunId::from("gone")));
        assert_eq!(create.wait().await, JobState::Succeeded);
        assert_eq!(delete.wait().await, JobState::Succeeded);
        assert_eq!(gateway.post_calls.load(Ordering::SeqCst), 0);
        assert_eq!(gateway.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_schedule_shares_live_job() {
        let (store, gateway, scheduler) = setup(FakeGateway::failing(NetworkError::TooManyRequests));
        store.upsert_run_with_pending(&run("r1"), &[]).unwrap();

        let first = scheduler.schedule(RetryableJob::Create(RunId::from("r1")));
        let second = scheduler.schedule(RetryableJob::Create(RunId::from("r1")));
        scheduler.wait_all().await;

        assert_eq!(first.state(), JobState::Abandoned);
        assert_eq!(second.state(), JobState::Abandoned);
        assert_eq!(gateway.post_calls.load(Ordering::SeqCst), 5);
        assert!(scheduler.live_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_merges_remote_runs() {
        let gateway = FakeGateway::default();
        gateway.remote.lock().unwrap().push(run("remote"));
        let (store, _gateway, scheduler) = setup(gateway);

        let state = scheduler.schedule(RetryableJob::Fetch).wait().await;
        assert_eq!(state, JobState::Succeeded);
        assert!(store.get_run(&RunId::from("remote")).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_fetch_repeats() {
        let (store, gateway, scheduler) = setup(FakeGateway::default());
        let task = scheduler.schedule_periodic_fetch(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.runs().unwrap().is_empty());

        gateway.remote.lock().unwrap().push(run("later"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.runs().unwrap().len(), 1);
        task.abort();
    }
}

//! Worker pool scheduler.
//!
//! One polling loop per process. Every tick refills the token bucket, then
//! fills each job type's free slots from the store. Lanes are independent: an
//! empty queue or a full lane for one type never holds back another.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use docflow_core::WorkerId;

use super::rate_limit::TokenBucket;
use super::store::SharedJobStore;
use super::types::{JobType, QueueJob};
use crate::metrics::ActivityGauge;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub max_workers: HashMap<JobType, usize>,
    /// Job types whose claims consume a token.
    pub rate_limited: HashSet<JobType>,
    pub requests_per_minute: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            max_workers: JobType::ALL.into_iter().map(|t| (t, 2)).collect(),
            rate_limited: [JobType::Analysis, JobType::EmbeddingGeneration]
                .into_iter()
                .collect(),
            requests_per_minute: 60,
        }
    }
}

/// Runs a claimed job to its final queue transition.
///
/// Failures are routed inside `process`; the pool only tracks the slot.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: QueueJob);
}

#[derive(Debug)]
struct Lane {
    max: usize,
    active: AtomicUsize,
    rate_limited: bool,
}

struct PoolInner {
    store: SharedJobStore,
    processor: Arc<dyn JobProcessor>,
    worker: WorkerId,
    tick_interval: Duration,
    lanes: HashMap<JobType, Lane>,
    bucket: Mutex<TokenBucket>,
    paused: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
    idle: Notify,
}

/// Holds one lane slot for the lifetime of a dispatched job.
struct SlotGuard {
    inner: Arc<PoolInner>,
    job_type: JobType,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(lane) = self.inner.lanes.get(&self.job_type) {
            lane.active.fetch_sub(1, Ordering::AcqRel);
        }
        self.inner.idle.notify_waiters();
    }
}

/// Bounded per-type worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker", &self.inner.worker)
            .field("lanes", &self.inner.lanes)
            .field("paused", &self.is_paused())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        config: SchedulerConfig,
        store: SharedJobStore,
        processor: Arc<dyn JobProcessor>,
        worker: WorkerId,
    ) -> Self {
        let lanes = config
            .max_workers
            .iter()
            .map(|(job_type, max)| {
                let lane = Lane {
                    max: *max,
                    active: AtomicUsize::new(0),
                    rate_limited: config.rate_limited.contains(job_type),
                };
                (*job_type, lane)
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                store,
                processor,
                worker,
                tick_interval: config.tick_interval,
                lanes,
                bucket: Mutex::new(TokenBucket::per_minute(config.requests_per_minute)),
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                wake: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.worker
    }

    /// Stop claiming new work. In-flight jobs keep running.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::AcqRel) {
            info!(worker = %self.inner.worker, "worker pool paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            info!(worker = %self.inner.worker, "worker pool resumed");
            self.inner.wake.notify_one();
        }
    }

    /// Disable the scheduling loop. Not reversible.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            info!(worker = %self.inner.worker, "worker pool stopping");
            self.inner.wake.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Jobs of `job_type` currently dispatched.
    pub fn active(&self, job_type: JobType) -> usize {
        self.inner
            .lanes
            .get(&job_type)
            .map_or(0, |lane| lane.active.load(Ordering::Acquire))
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .lanes
            .values()
            .map(|lane| lane.active.load(Ordering::Acquire))
            .sum()
    }

    fn with_bucket<R>(&self, f: impl FnOnce(&mut TokenBucket) -> R) -> R {
        let mut bucket = self.inner.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut bucket)
    }

    fn reserve_slot(&self, job_type: JobType) -> Option<SlotGuard> {
        let lane = self.inner.lanes.get(&job_type)?;
        lane.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < lane.max).then_some(n + 1)
            })
            .ok()?;
        Some(SlotGuard {
            inner: self.inner.clone(),
            job_type,
        })
    }

    /// Run one scheduling pass. Returns the number of jobs dispatched.
    pub async fn tick(&self) -> usize {
        if self.is_paused() || self.is_stopped() {
            return 0;
        }

        self.with_bucket(TokenBucket::refill);
        let mut dispatched = 0;

        for job_type in JobType::ALL {
            let rate_limited = self
                .inner
                .lanes
                .get(&job_type)
                .is_some_and(|lane| lane.rate_limited);

            loop {
                // A drain may start while this pass is still claiming.
                if self.is_paused() || self.is_stopped() {
                    return dispatched;
                }
                if rate_limited && !self.with_bucket(|b| b.has_token()) {
                    debug!(%job_type, "rate limit reached; skipping lane this tick");
                    break;
                }
                let Some(slot) = self.reserve_slot(job_type) else {
                    break;
                };

                let job = match self.inner.store.claim_next(job_type, &self.inner.worker).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%job_type, error = %e, "claim failed");
                        break;
                    }
                };

                if rate_limited {
                    self.with_bucket(TokenBucket::try_acquire);
                }
                debug!(
                    job_id = %job.id,
                    %job_type,
                    attempt = job.attempt_count,
                    worker = %self.inner.worker,
                    "job claimed"
                );

                let processor = self.inner.processor.clone();
                tokio::spawn(async move {
                    let _slot = slot;
                    processor.process(job).await;
                });
                dispatched += 1;
            }
        }

        dispatched
    }

    /// Start the scheduling loop.
    pub fn spawn(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = pool.inner.wake.notified() => {}
                }
                if pool.is_stopped() {
                    break;
                }
                pool.tick().await;
            }
            info!(worker = %pool.inner.worker, "worker pool scheduler stopped");
        })
    }

    /// Wait until no job is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

impl ActivityGauge for WorkerPool {
    fn active_workers(&self) -> usize {
        self.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::OnceLock;

    use chrono::{DateTime, Utc};
    use docflow_core::{DocumentId, JobId, TenantId};
    use tokio::sync::Semaphore;

    use crate::jobs::store::{InMemoryJobStore, JobStore, JobStoreError};
    use crate::jobs::types::{NewJob, QueueDepth};

    /// Holds every job until released.
    struct Gate {
        started: AtomicUsize,
        release: Semaphore,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
                release: Semaphore::new(0),
            })
        }
    }

    #[async_trait]
    impl JobProcessor for Gate {
        async fn process(&self, _job: QueueJob) {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _ = self.release.acquire().await;
        }
    }

    /// Stops the pool right after the first successful claim, as if a drain
    /// started in the middle of a scheduling pass.
    #[derive(Default)]
    struct DrainOnClaim {
        inner: InMemoryJobStore,
        pool: OnceLock<WorkerPool>,
    }

    #[async_trait]
    impl JobStore for DrainOnClaim {
        async fn enqueue(&self, job: NewJob) -> Result<QueueJob, JobStoreError> {
            self.inner.enqueue(job).await
        }

        async fn claim_next(
            &self,
            job_type: JobType,
            worker: &WorkerId,
        ) -> Result<Option<QueueJob>, JobStoreError> {
            let claimed = self.inner.claim_next(job_type, worker).await?;
            if claimed.is_some() {
                if let Some(pool) = self.pool.get() {
                    pool.pause();
                    pool.stop();
                }
            }
            Ok(claimed)
        }

        async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<(), JobStoreError> {
            self.inner.complete(job_id, worker).await
        }

        async fn schedule_retry(
            &self,
            job_id: JobId,
            next_attempt: u32,
            error: &str,
            next_retry_at: DateTime<Utc>,
            worker: &WorkerId,
        ) -> Result<(), JobStoreError> {
            self.inner
                .schedule_retry(job_id, next_attempt, error, next_retry_at, worker)
                .await
        }

        async fn move_to_dlq(
            &self,
            job_id: JobId,
            reason: &str,
            worker: &WorkerId,
        ) -> Result<(), JobStoreError> {
            self.inner.move_to_dlq(job_id, reason, worker).await
        }

        async fn replay(&self, job_id: JobId) -> Result<QueueJob, JobStoreError> {
            self.inner.replay(job_id).await
        }

        async fn discard(&self, job_id: JobId) -> Result<(), JobStoreError> {
            self.inner.discard(job_id).await
        }

        async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, JobStoreError> {
            self.inner.get(job_id).await
        }

        async fn list_dlq(
            &self,
            tenant_id: Option<TenantId>,
            limit: usize,
        ) -> Result<Vec<QueueJob>, JobStoreError> {
            self.inner.list_dlq(tenant_id, limit).await
        }

        async fn depth(&self) -> Result<QueueDepth, JobStoreError> {
            self.inner.depth().await
        }

        async fn reclaim_stale(
            &self,
            older_than: DateTime<Utc>,
        ) -> Result<Vec<QueueJob>, JobStoreError> {
            self.inner.reclaim_stale(older_than).await
        }
    }

    fn config(max: usize, rpm: u32, rate_limited: &[JobType]) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            max_workers: JobType::ALL.into_iter().map(|t| (t, max)).collect(),
            rate_limited: rate_limited.iter().copied().collect(),
            requests_per_minute: rpm,
        }
    }

    async fn enqueue(store: &InMemoryJobStore, job_type: JobType, n: usize) {
        for _ in 0..n {
            store
                .enqueue(NewJob::new(TenantId::new(), DocumentId::new(), job_type))
                .await
                .unwrap();
        }
    }

    fn pool(cfg: SchedulerConfig, store: Arc<InMemoryJobStore>, gate: Arc<Gate>) -> WorkerPool {
        WorkerPool::new(cfg, store, gate, WorkerId::new("pool-test").unwrap())
    }

    #[tokio::test]
    async fn fills_each_lane_up_to_its_cap() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, JobType::ContentExtraction, 5).await;
        enqueue(&store, JobType::EmbeddingGeneration, 1).await;
        let gate = Gate::new();
        let pool = pool(config(2, 60, &[]), store.clone(), gate.clone());

        assert_eq!(pool.tick().await, 3);
        assert_eq!(pool.active(JobType::ContentExtraction), 2);
        assert_eq!(pool.active(JobType::Analysis), 0);
        assert_eq!(pool.active(JobType::EmbeddingGeneration), 1);

        // Full lanes dispatch nothing more.
        assert_eq!(pool.tick().await, 0);

        gate.release.add_permits(100);
        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(gate.started.load(Ordering::SeqCst), 3);

        assert_eq!(pool.tick().await, 2);
    }

    #[tokio::test]
    async fn token_bucket_limits_rate_limited_lanes_only() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, JobType::Analysis, 3).await;
        enqueue(&store, JobType::ContentExtraction, 3).await;
        let gate = Gate::new();
        let pool = pool(config(3, 1, &[JobType::Analysis]), store, gate);

        assert_eq!(pool.tick().await, 4);
        assert_eq!(pool.active(JobType::Analysis), 1);
        assert_eq!(pool.active(JobType::ContentExtraction), 3);
        assert_eq!(pool.tick().await, 0);
    }

    #[tokio::test]
    async fn drain_started_mid_pass_stops_further_claims() {
        let store = Arc::new(DrainOnClaim::default());
        for _ in 0..3 {
            store
                .enqueue(NewJob::new(TenantId::new(), DocumentId::new(), JobType::Analysis))
                .await
                .unwrap();
        }
        let gate = Gate::new();
        let pool = WorkerPool::new(
            config(3, 60, &[]),
            store.clone(),
            gate.clone(),
            WorkerId::new("pool-test").unwrap(),
        );
        assert!(store.pool.set(pool.clone()).is_ok());

        assert_eq!(pool.tick().await, 1);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(store.depth().await.unwrap().pending, 2);
        gate.release.add_permits(1);
    }

    #[tokio::test]
    async fn paused_pool_claims_nothing() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, JobType::Analysis, 1).await;
        let gate = Gate::new();
        let pool = pool(config(1, 60, &[]), store.clone(), gate.clone());

        pool.pause();
        assert!(pool.is_paused());
        assert_eq!(pool.tick().await, 0);
        assert_eq!(store.depth().await.unwrap().pending, 1);

        pool.resume();
        assert_eq!(pool.tick().await, 1);
        gate.release.add_permits(1);
    }

    #[tokio::test]
    async fn wait_idle_times_out_while_work_is_in_flight() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, JobType::Analysis, 1).await;
        let gate = Gate::new();
        let pool = pool(config(1, 60, &[]), store, gate.clone());

        assert_eq!(pool.tick().await, 1);
        assert!(!pool.wait_idle(Duration::from_millis(50)).await);
        assert_eq!(pool.active_workers(), 1);

        gate.release.add_permits(1);
        assert!(pool.wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn spawned_loop_processes_and_stops() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, JobType::ContentExtraction, 2).await;
        let gate = Gate::new();
        gate.release.add_permits(100);
        let pool = pool(config(1, 60, &[]), store.clone(), gate.clone());

        let handle = pool.spawn();
        tokio::time::timeout(Duration::from_secs(5), async {
            while gate.started.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pool.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(pool.is_stopped());
        assert_eq!(pool.tick().await, 0);
    }
}

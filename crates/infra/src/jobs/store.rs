//! Job store abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docflow_core::{DocumentId, JobId, TenantId, WorkerId};

use super::types::{JobStatus, JobType, NewJob, QueueDepth, QueueJob};

/// Persisted queue of document jobs.
///
/// Every state transition that a worker performs (`complete`, `schedule_retry`,
/// `move_to_dlq`) only applies to a job that worker currently holds in
/// `processing`. Implementations must make `claim_next` atomic across processes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job.
    ///
    /// Fails with `DuplicateActiveJob` while another pending/processing job exists
    /// for the same `(document_id, job_type)`.
    async fn enqueue(&self, job: NewJob) -> Result<QueueJob, JobStoreError>;

    /// Claim the most urgent eligible job of `job_type`.
    ///
    /// Ordered by priority, then by the time the job became available. The claim
    /// marks the job `processing`, records the worker and lock time, and
    /// increments `attempt_count`.
    async fn claim_next(
        &self,
        job_type: JobType,
        worker: &WorkerId,
    ) -> Result<Option<QueueJob>, JobStoreError>;

    /// Mark a held job completed. Completing an already completed job is a no-op.
    async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<(), JobStoreError>;

    /// Return a held job to `pending`, eligible again at `next_retry_at`.
    async fn schedule_retry(
        &self,
        job_id: JobId,
        next_attempt: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError>;

    /// Quarantine a held job.
    async fn move_to_dlq(
        &self,
        job_id: JobId,
        reason: &str,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError>;

    /// Move a dead-lettered job back to `pending` with a fresh attempt budget.
    async fn replay(&self, job_id: JobId) -> Result<QueueJob, JobStoreError>;

    /// Permanently abandon a dead-lettered job (`dlq` -> `failed`).
    async fn discard(&self, job_id: JobId) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, JobStoreError>;

    /// Dead-lettered jobs, most recent first.
    async fn list_dlq(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<QueueJob>, JobStoreError>;

    async fn depth(&self) -> Result<QueueDepth, JobStoreError>;

    /// Return jobs locked before `older_than` to `pending`.
    ///
    /// The attempt count is preserved so a job that keeps killing its worker
    /// still runs out of attempts.
    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, JobStoreError>;
}

pub type SharedJobStore = Arc<dyn JobStore>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("an active {job_type} job already exists for document {document_id}")]
    DuplicateActiveJob {
        document_id: DocumentId,
        job_type: JobType,
    },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, job: NewJob) -> Result<QueueJob, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn claim_next(
        &self,
        job_type: JobType,
        worker: &WorkerId,
    ) -> Result<Option<QueueJob>, JobStoreError> {
        (**self).claim_next(job_type, worker).await
    }

    async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<(), JobStoreError> {
        (**self).complete(job_id, worker).await
    }

    async fn schedule_retry(
        &self,
        job_id: JobId,
        next_attempt: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError> {
        (**self)
            .schedule_retry(job_id, next_attempt, error, next_retry_at, worker)
            .await
    }

    async fn move_to_dlq(
        &self,
        job_id: JobId,
        reason: &str,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError> {
        (**self).move_to_dlq(job_id, reason, worker).await
    }

    async fn replay(&self, job_id: JobId) -> Result<QueueJob, JobStoreError> {
        (**self).replay(job_id).await
    }

    async fn discard(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).discard(job_id).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_dlq(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<QueueJob>, JobStoreError> {
        (**self).list_dlq(tenant_id, limit).await
    }

    async fn depth(&self) -> Result<QueueDepth, JobStoreError> {
        (**self).depth().await
    }

    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, JobStoreError> {
        (**self).reclaim_stale(older_than).await
    }
}

/// In-memory job store for tests/dev.
///
/// A single write lock around the job map makes every operation atomic, which
/// gives the same claim exclusivity the Postgres store gets from row locks.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, QueueJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, QueueJob>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, QueueJob>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    /// Make a job waiting on a retry delay claimable immediately.
    #[cfg(any(test, feature = "test-util"))]
    pub fn release_retry_delay(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        let now = Utc::now();
        job.next_retry_at = job.next_retry_at.map(|_| now);
        job.scheduled_at = job.scheduled_at.min(now);
        Ok(())
    }

    /// Backdate a processing job's lock time, simulating a long-dead worker.
    #[cfg(any(test, feature = "test-util"))]
    pub fn backdate_lock(&self, job_id: JobId, locked_at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.locked_at = Some(locked_at);
        Ok(())
    }
}

fn has_active_duplicate(
    jobs: &HashMap<JobId, QueueJob>,
    except: JobId,
    document_id: DocumentId,
    job_type: JobType,
) -> bool {
    jobs.values().any(|j| {
        j.id != except
            && j.document_id == document_id
            && j.job_type == job_type
            && j.status.is_active()
    })
}

fn held_job<'a>(
    jobs: &'a mut HashMap<JobId, QueueJob>,
    job_id: JobId,
    worker: &WorkerId,
    to: JobStatus,
) -> Result<&'a mut QueueJob, JobStoreError> {
    let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
    if !job.is_held_by(worker.as_str()) {
        return Err(JobStoreError::InvalidTransition {
            job_id,
            from: job.status,
            to,
        });
    }
    Ok(job)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, request: NewJob) -> Result<QueueJob, JobStoreError> {
        request.validate()?;
        let mut jobs = self.write()?;

        let job = request.into_job(Utc::now());
        if has_active_duplicate(&jobs, job.id, job.document_id, job.job_type) {
            return Err(JobStoreError::DuplicateActiveJob {
                document_id: job.document_id,
                job_type: job.job_type,
            });
        }

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(
        &self,
        job_type: JobType,
        worker: &WorkerId,
    ) -> Result<Option<QueueJob>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.job_type == job_type && j.is_eligible(now))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.available_at().cmp(&b.available_at()))
                    .then(a.requested_at.cmp(&b.requested_at))
            })
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.status = JobStatus::Processing;
        job.attempt_count += 1;
        job.worker_instance = Some(worker.as_str().to_string());
        job.locked_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if jobs
            .get(&job_id)
            .is_some_and(|j| j.status == JobStatus::Completed)
        {
            return Ok(());
        }

        let job = held_job(&mut jobs, job_id, worker, JobStatus::Completed)?;
        job.status = JobStatus::Completed;
        job.processed_at = Some(Utc::now());
        job.locked_at = None;
        job.last_error = None;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        job_id: JobId,
        next_attempt: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = held_job(&mut jobs, job_id, worker, JobStatus::Pending)?;
        job.status = JobStatus::Pending;
        job.attempt_count = next_attempt;
        job.last_error = Some(error.to_string());
        job.next_retry_at = Some(next_retry_at);
        job.worker_instance = None;
        job.locked_at = None;
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        job_id: JobId,
        reason: &str,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = held_job(&mut jobs, job_id, worker, JobStatus::Dlq)?;
        let now = Utc::now();
        job.status = JobStatus::Dlq;
        job.dlq_reason = Some(reason.to_string());
        job.dlq_at = Some(now);
        job.processed_at = Some(now);
        job.locked_at = None;
        Ok(())
    }

    async fn replay(&self, job_id: JobId) -> Result<QueueJob, JobStoreError> {
        let mut jobs = self.write()?;
        let (document_id, job_type, status) = {
            let job = jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
            (job.document_id, job.job_type, job.status)
        };

        if status != JobStatus::Dlq {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                from: status,
                to: JobStatus::Pending,
            });
        }
        if has_active_duplicate(&jobs, job_id, document_id, job_type) {
            return Err(JobStoreError::DuplicateActiveJob {
                document_id,
                job_type,
            });
        }

        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.status = JobStatus::Pending;
        job.attempt_count = 0;
        job.scheduled_at = Utc::now();
        job.next_retry_at = None;
        job.dlq_reason = None;
        job.dlq_at = None;
        job.worker_instance = None;
        job.locked_at = None;
        job.processed_at = None;
        Ok(job.clone())
    }

    async fn discard(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Dlq {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Failed,
            });
        }
        job.status = JobStatus::Failed;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn list_dlq(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<QueueJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Dlq && tenant_id.is_none_or(|t| j.tenant_id == t))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.dlq_at.cmp(&a.dlq_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn depth(&self) -> Result<QueueDepth, JobStoreError> {
        let jobs = self.read()?;
        let mut depth = QueueDepth::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => depth.pending += 1,
                JobStatus::Processing => depth.processing += 1,
                JobStatus::Dlq => depth.dlq += 1,
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }
        Ok(depth)
    }

    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, JobStoreError> {
        let mut jobs = self.write()?;
        let mut reclaimed = Vec::new();

        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.locked_at.is_none_or(|at| at < older_than);
            if !stale {
                continue;
            }

            let worker = job.worker_instance.take().unwrap_or_default();
            job.status = JobStatus::Pending;
            job.last_error = Some(format!("Lease expired on worker {worker}"));
            job.locked_at = None;
            reclaimed.push(job.clone());
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    fn analysis(doc: DocumentId) -> NewJob {
        NewJob::new(TenantId::new(), doc, JobType::Analysis)
    }

    #[tokio::test]
    async fn rejects_second_active_job_for_same_document_and_type() {
        let store = InMemoryJobStore::new();
        let doc = DocumentId::new();

        store.enqueue(analysis(doc)).await.unwrap();
        let err = store.enqueue(analysis(doc)).await.unwrap_err();
        assert_eq!(
            err,
            JobStoreError::DuplicateActiveJob {
                document_id: doc,
                job_type: JobType::Analysis
            }
        );

        // A different job type for the same document is independent.
        store
            .enqueue(NewJob::new(TenantId::new(), doc, JobType::EmbeddingGeneration))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn completed_jobs_free_the_slot() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");
        let doc = DocumentId::new();

        let job = store.enqueue(analysis(doc)).await.unwrap();
        store.claim_next(JobType::Analysis, &w).await.unwrap().unwrap();
        store.complete(job.id, &w).await.unwrap();

        store.enqueue(analysis(doc)).await.unwrap();
    }

    #[tokio::test]
    async fn claims_by_priority_and_increments_attempts() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");

        let low = store.enqueue(analysis(DocumentId::new()).with_priority(5)).await.unwrap();
        let urgent = store.enqueue(analysis(DocumentId::new()).with_priority(1)).await.unwrap();

        let first = store.claim_next(JobType::Analysis, &w).await.unwrap().unwrap();
        assert_eq!(first.id, urgent.id);
        assert_eq!(first.status, JobStatus::Processing);
        assert_eq!(first.attempt_count, 1);
        assert_eq!(first.worker_instance.as_deref(), Some("w1"));
        assert!(first.locked_at.is_some());

        let second = store.claim_next(JobType::Analysis, &w).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
        assert!(store.claim_next(JobType::Analysis, &w).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_only_returns_requested_type() {
        let store = InMemoryJobStore::new();
        store.enqueue(analysis(DocumentId::new())).await.unwrap();

        let claimed = store
            .claim_next(JobType::ContentExtraction, &worker("w1"))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimable() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(analysis(DocumentId::new()).scheduled_at(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        assert!(store.claim_next(JobType::Analysis, &worker("w1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let store = InMemoryJobStore::arc();
        for _ in 0..20 {
            store.enqueue(analysis(DocumentId::new())).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let w = WorkerId::new(format!("w{i}")).unwrap();
                let mut ids = Vec::new();
                while let Some(job) = store.claim_next(JobType::Analysis, &w).await.unwrap() {
                    ids.push(job.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn complete_is_idempotent_and_worker_checked() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");
        let job = store.enqueue(analysis(DocumentId::new())).await.unwrap();

        let err = store.complete(job.id, &w).await.unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));

        store.claim_next(JobType::Analysis, &w).await.unwrap();
        let other = store.complete(job.id, &worker("w2")).await.unwrap_err();
        assert!(matches!(other, JobStoreError::InvalidTransition { .. }));

        store.complete(job.id, &w).await.unwrap();
        store.complete(job.id, &w).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn schedule_retry_returns_job_to_pending_with_delay() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");
        let job = store.enqueue(analysis(DocumentId::new())).await.unwrap();
        store.claim_next(JobType::Analysis, &w).await.unwrap();

        let retry_at = Utc::now() + Duration::seconds(5);
        store
            .schedule_retry(job.id, 1, "engine unavailable", retry_at, &w)
            .await
            .unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.next_retry_at, Some(retry_at));
        assert_eq!(stored.last_error.as_deref(), Some("engine unavailable"));
        assert!(stored.worker_instance.is_none());

        assert!(store.claim_next(JobType::Analysis, &w).await.unwrap().is_none());

        store.release_retry_delay(job.id).unwrap();
        let again = store.claim_next(JobType::Analysis, &w).await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 2);
    }

    #[tokio::test]
    async fn replay_resets_dead_lettered_job() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");
        let job = store.enqueue(analysis(DocumentId::new())).await.unwrap();
        store.claim_next(JobType::Analysis, &w).await.unwrap();
        store.move_to_dlq(job.id, "Poison pill detected", &w).await.unwrap();

        let depth = store.depth().await.unwrap();
        assert_eq!(depth.dlq, 1);
        assert_eq!(store.list_dlq(None, 10).await.unwrap().len(), 1);

        let replayed = store.replay(job.id).await.unwrap();
        assert_eq!(replayed.status, JobStatus::Pending);
        assert_eq!(replayed.attempt_count, 0);
        assert_eq!(replayed.idempotency_key, job.idempotency_key);
        assert!(replayed.dlq_reason.is_none());
        assert!(replayed.dlq_at.is_none());

        let err = store.replay(job.id).await.unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn replay_refuses_when_document_already_has_active_job() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");
        let doc = DocumentId::new();
        let job = store.enqueue(analysis(doc)).await.unwrap();
        store.claim_next(JobType::Analysis, &w).await.unwrap();
        store.move_to_dlq(job.id, "bad", &w).await.unwrap();

        store.enqueue(analysis(doc)).await.unwrap();
        let err = store.replay(job.id).await.unwrap_err();
        assert!(matches!(err, JobStoreError::DuplicateActiveJob { .. }));
    }

    #[tokio::test]
    async fn discard_only_applies_to_dlq() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");
        let job = store.enqueue(analysis(DocumentId::new())).await.unwrap();
        assert!(store.discard(job.id).await.is_err());

        store.claim_next(JobType::Analysis, &w).await.unwrap();
        store.move_to_dlq(job.id, "bad", &w).await.unwrap();
        store.discard(job.id).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(store.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn reclaims_only_expired_leases() {
        let store = InMemoryJobStore::new();
        let w = worker("w1");
        let stale = store.enqueue(analysis(DocumentId::new())).await.unwrap();
        let fresh = store.enqueue(analysis(DocumentId::new())).await.unwrap();
        store.claim_next(JobType::Analysis, &w).await.unwrap();
        store.claim_next(JobType::Analysis, &w).await.unwrap();

        store
            .backdate_lock(stale.id, Utc::now() - Duration::minutes(30))
            .unwrap();

        let reclaimed = store
            .reclaim_stale(Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, stale.id);
        assert_eq!(reclaimed[0].status, JobStatus::Pending);
        assert_eq!(reclaimed[0].attempt_count, 1);
        assert_eq!(
            reclaimed[0].last_error.as_deref(),
            Some("Lease expired on worker w1")
        );

        let fresh = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Processing);
    }
}

//! Dead letter queue manager.

use docflow_core::{JobId, TenantId, WorkerId};
use tracing::{error, info, warn};

use super::store::{JobStoreError, SharedJobStore};
use super::types::QueueJob;

/// Quarantine and operator controls for permanently failing jobs.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: SharedJobStore,
}

impl core::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeadLetterQueue").finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    pub fn new(store: SharedJobStore) -> Self {
        Self { store }
    }

    /// Move a job held by `worker` to the DLQ.
    pub async fn quarantine(
        &self,
        job: &QueueJob,
        reason: &str,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError> {
        self.store.move_to_dlq(job.id, reason, worker).await?;
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            document_id = %job.document_id,
            attempt = job.attempt_count,
            worker = %worker,
            reason,
            "job moved to dead letter queue"
        );
        Ok(())
    }

    /// Put a dead-lettered job back in the queue.
    ///
    /// The idempotency key is kept, so work that already committed is replayed
    /// from its record instead of running again.
    pub async fn replay(&self, job_id: JobId) -> Result<QueueJob, JobStoreError> {
        let job = self.store.replay(job_id).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            idempotency_key = %job.idempotency_key,
            "dead-lettered job replayed"
        );
        Ok(job)
    }

    pub async fn discard(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.store.discard(job_id).await?;
        warn!(job_id = %job_id, "dead-lettered job discarded");
        Ok(())
    }

    pub async fn list(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<QueueJob>, JobStoreError> {
        self.store.list_dlq(tenant_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use docflow_core::DocumentId;

    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::{JobStatus, JobType, NewJob};

    #[tokio::test]
    async fn quarantine_then_replay_round_trip() {
        let store = InMemoryJobStore::arc();
        let dlq = DeadLetterQueue::new(store.clone());
        let worker = WorkerId::new("w1").unwrap();
        let tenant = TenantId::new();

        let job = store
            .enqueue(NewJob::new(tenant, DocumentId::new(), JobType::EmbeddingGeneration))
            .await
            .unwrap();
        let claimed = store
            .claim_next(JobType::EmbeddingGeneration, &worker)
            .await
            .unwrap()
            .unwrap();

        dlq.quarantine(&claimed, "Max attempts (3) reached: timeout", &worker)
            .await
            .unwrap();

        let listed = dlq.list(Some(tenant), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].dlq_reason.as_deref(),
            Some("Max attempts (3) reached: timeout")
        );
        assert_eq!(listed[0].worker_instance.as_deref(), Some("w1"));
        assert!(dlq.list(Some(TenantId::new()), 10).await.unwrap().is_empty());

        let replayed = dlq.replay(job.id).await.unwrap();
        assert_eq!(replayed.status, JobStatus::Pending);
        assert!(dlq.list(None, 10).await.unwrap().is_empty());

        let store_dyn: Arc<dyn JobStore> = store;
        assert!(store_dyn.claim_next(JobType::EmbeddingGeneration, &worker).await.unwrap().is_some());
    }
}

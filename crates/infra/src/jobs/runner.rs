//! Executes one claimed job and routes the result.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tracing::{error, info, warn};

use docflow_core::WorkerId;

use super::dlq::DeadLetterQueue;
use super::handlers::{JobHandler, JobReceipt};
use super::retry::{DeadLetterCause, FailureDecision, RetryController};
use super::scheduler::JobProcessor;
use super::store::SharedJobStore;
use super::types::{JobType, QueueJob};
use crate::metrics::QueueCounters;
use crate::transaction::{
    Database, OperationContext, OperationError, TransactionCore, TransactionError,
    TransactionalOperation, UnitOfWork,
};

/// A job body bound to the job it runs for.
struct JobOperation<'a, Tx: UnitOfWork> {
    handler: &'a dyn JobHandler<Tx>,
    job: &'a QueueJob,
}

#[async_trait]
impl<Tx: UnitOfWork> TransactionalOperation<Tx> for JobOperation<'_, Tx> {
    type Output = JobReceipt;

    async fn execute(
        &self,
        tx: &mut Tx,
        ctx: &mut OperationContext,
    ) -> Result<JobReceipt, OperationError> {
        self.handler.handle(self.job, tx, ctx).await
    }

    fn result_refs(&self, _output: &JobReceipt) -> Vec<String> {
        vec![format!("{}/{}", self.job.job_type, self.job.document_id)]
    }
}

/// How a run ended, from the queue's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { replayed: bool },
    Retrying { next_attempt: u32, retry_at: DateTime<Utc> },
    DeadLettered { cause: DeadLetterCause, reason: String },
    /// The job could not be transitioned (lease lost or store failure); the
    /// lease reaper will return it to the queue.
    Abandoned,
}

pub type HandlerMap<Tx> = HashMap<JobType, Arc<dyn JobHandler<Tx>>>;

pub struct JobRunner<D: Database> {
    store: SharedJobStore,
    core: TransactionCore<D>,
    handlers: HandlerMap<D::Tx>,
    retry: Arc<RetryController>,
    dlq: DeadLetterQueue,
    counters: Arc<QueueCounters>,
    worker: WorkerId,
}

impl<D: Database> JobRunner<D> {
    pub fn new(
        store: SharedJobStore,
        core: TransactionCore<D>,
        handlers: HandlerMap<D::Tx>,
        retry: Arc<RetryController>,
        counters: Arc<QueueCounters>,
        worker: WorkerId,
    ) -> Self {
        Self {
            dlq: DeadLetterQueue::new(store.clone()),
            store,
            core,
            handlers,
            retry,
            counters,
            worker,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker
    }

    pub fn counters(&self) -> &Arc<QueueCounters> {
        &self.counters
    }

    /// Run a job claimed by this worker through the transaction core.
    ///
    /// A panicking job body counts as a transient failure of that job. Its
    /// transaction is dropped uncommitted.
    pub async fn run(&self, job: QueueJob) -> JobOutcome {
        let started = Instant::now();

        let result = match AssertUnwindSafe(self.execute(&job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    panic = %message,
                    "job body panicked"
                );
                Err(OperationError::transient(format!("job panicked: {message}")).into())
            }
        };

        match result {
            Ok(replayed) => self.succeed(&job, replayed, started).await,
            Err(err) => self.fail(&job, &err, started).await,
        }
    }

    async fn execute(&self, job: &QueueJob) -> Result<bool, TransactionError> {
        let handler = self.handlers.get(&job.job_type).ok_or_else(|| {
            OperationError::validation(format!("no handler registered for {}", job.job_type))
        })?;

        let operation = JobOperation {
            handler: handler.as_ref(),
            job,
        };
        let ctx = OperationContext::new(job.tenant_id, job.job_type.as_str())
            .with_idempotency_key(job.idempotency_key.clone());
        let payload = json!({
            "documentId": job.document_id,
            "jobType": job.job_type,
        });

        let outcome = self
            .core
            .execute_with_idempotency(ctx, &operation, &payload)
            .await?;
        Ok(outcome.replayed)
    }

    async fn succeed(&self, job: &QueueJob, replayed: bool, started: Instant) -> JobOutcome {
        if let Err(e) = self.store.complete(job.id, &self.worker).await {
            warn!(
                job_id = %job.id,
                worker = %self.worker,
                error = %e,
                "job finished but could not be marked completed"
            );
            return JobOutcome::Abandoned;
        }

        self.retry.on_success(job.document_id);
        self.counters.record_success(started.elapsed());
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt_count,
            replayed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job completed"
        );
        JobOutcome::Completed { replayed }
    }

    async fn fail(&self, job: &QueueJob, err: &TransactionError, started: Instant) -> JobOutcome {
        let message = err.to_string();
        let decision = self
            .retry
            .on_failure(job, &message, err.is_retryable(), Utc::now());

        match decision {
            FailureDecision::Retry {
                next_attempt,
                delay,
                retry_at,
            } => {
                if let Err(e) = self
                    .store
                    .schedule_retry(job.id, next_attempt, &message, retry_at, &self.worker)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "failed to schedule retry");
                    return JobOutcome::Abandoned;
                }
                self.counters.record_retry(started.elapsed());
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "job failed; retry scheduled"
                );
                JobOutcome::Retrying {
                    next_attempt,
                    retry_at,
                }
            }
            FailureDecision::DeadLetter { cause, reason } => {
                if let Err(e) = self.dlq.quarantine(job, &reason, &self.worker).await {
                    error!(job_id = %job.id, error = %e, "failed to move job to dead letter queue");
                    return JobOutcome::Abandoned;
                }
                self.counters.record_dead_letter(cause, started.elapsed());
                JobOutcome::DeadLettered { cause, reason }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl<D: Database> JobProcessor for JobRunner<D> {
    async fn process(&self, job: QueueJob) {
        self.run(job).await;
    }
}

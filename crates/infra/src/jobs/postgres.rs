//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` is a single statement:
//!
//! ```sql
//! UPDATE queue_jobs SET status = 'processing', ...
//! WHERE id = (SELECT id ... FOR UPDATE SKIP LOCKED LIMIT 1)
//! RETURNING ...
//! ```
//!
//! Concurrent workers (in this process or another) skip rows that are already
//! locked, so a row is handed to at most one claimant.
//!
//! ## Error mapping
//!
//! | SQLx error | Code | JobStoreError |
//! |------------|------|---------------|
//! | Database (unique violation on the active-job index) | `23505` | `DuplicateActiveJob` |
//! | Database (check violation) | `23514` | `Validation` |
//! | anything else | | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use docflow_core::{DocumentId, JobId, TenantId, WorkerId};

use super::store::{JobStore, JobStoreError};
use super::types::{JobStatus, JobType, NewJob, QueueDepth, QueueJob};

const JOB_COLUMNS: &str = "id, document_id, tenant_id, job_type, priority, idempotency_key, \
     status, attempt_count, max_attempts, last_error, scheduled_at, next_retry_at, \
     dlq_reason, dlq_at, worker_instance, locked_at, requested_at, processed_at";

const ACTIVE_JOB_INDEX: &str = "queue_jobs_one_active_per_document";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_status(&self, job_id: JobId) -> Result<Option<JobStatus>, JobStoreError> {
        let row = sqlx::query("SELECT status FROM queue_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_status", e))?;

        row.map(|r| {
            let status: String = r
                .try_get("status")
                .map_err(|e| map_sqlx_error("fetch_status", e))?;
            parse_status(&status)
        })
        .transpose()
    }

    /// Explain why a guarded update touched no rows.
    async fn rejected(&self, job_id: JobId, to: JobStatus) -> JobStoreError {
        match self.fetch_status(job_id).await {
            Ok(Some(from)) => JobStoreError::InvalidTransition { job_id, from, to },
            Ok(None) => JobStoreError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, request),
        fields(document_id = %request.document_id, job_type = %request.job_type),
        err
    )]
    async fn enqueue(&self, request: NewJob) -> Result<QueueJob, JobStoreError> {
        request.validate()?;
        let job = request.into_job(Utc::now());

        let sql = format!(
            r#"
            INSERT INTO queue_jobs (
                id, document_id, tenant_id, job_type, priority, idempotency_key,
                status, attempt_count, max_attempts, scheduled_at, requested_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8, $9)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.document_id.as_uuid())
            .bind(job.tenant_id.as_uuid())
            .bind(job.job_type.as_str())
            .bind(job.priority)
            .bind(&job.idempotency_key)
            .bind(to_i32(job.max_attempts))
            .bind(job.scheduled_at)
            .bind(job.requested_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e, ACTIVE_JOB_INDEX) {
                    JobStoreError::DuplicateActiveJob {
                        document_id: job.document_id,
                        job_type: job.job_type,
                    }
                } else {
                    map_sqlx_error("enqueue", e)
                }
            })?;

        job_from_row(&row)
    }

    #[instrument(skip(self, worker), fields(job_type = %job_type, worker = %worker), err)]
    async fn claim_next(
        &self,
        job_type: JobType,
        worker: &WorkerId,
    ) -> Result<Option<QueueJob>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                worker_instance = $2,
                locked_at = NOW()
            WHERE status = 'pending'
              AND id = (
                SELECT id FROM queue_jobs
                WHERE job_type = $1
                  AND status = 'pending'
                  AND scheduled_at <= NOW()
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY priority ASC,
                         GREATEST(scheduled_at, COALESCE(next_retry_at, scheduled_at)) ASC,
                         requested_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
              )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(job_type.as_str())
            .bind(worker.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, worker), fields(job_id = %job_id, worker = %worker), err)]
    async fn complete(&self, job_id: JobId, worker: &WorkerId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'completed', processed_at = NOW(), locked_at = NULL, last_error = NULL
            WHERE id = $1 AND status = 'processing' AND worker_instance = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.rejected(job_id, JobStatus::Completed).await {
            JobStoreError::InvalidTransition {
                from: JobStatus::Completed,
                ..
            } => Ok(()),
            other => Err(other),
        }
    }

    #[instrument(skip(self, error, worker), fields(job_id = %job_id, worker = %worker), err)]
    async fn schedule_retry(
        &self,
        job_id: JobId,
        next_attempt: u32,
        error: &str,
        next_retry_at: DateTime<Utc>,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                attempt_count = $3,
                last_error = $4,
                next_retry_at = $5,
                worker_instance = NULL,
                locked_at = NULL
            WHERE id = $1 AND status = 'processing' AND worker_instance = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker.as_str())
        .bind(to_i32(next_attempt))
        .bind(error)
        .bind(next_retry_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_retry", e))?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.rejected(job_id, JobStatus::Pending).await)
        }
    }

    #[instrument(skip(self, worker), fields(job_id = %job_id, worker = %worker), err)]
    async fn move_to_dlq(
        &self,
        job_id: JobId,
        reason: &str,
        worker: &WorkerId,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'dlq', dlq_reason = $3, dlq_at = NOW(), processed_at = NOW(), locked_at = NULL
            WHERE id = $1 AND status = 'processing' AND worker_instance = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker.as_str())
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("move_to_dlq", e))?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.rejected(job_id, JobStatus::Dlq).await)
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn replay(&self, job_id: JobId) -> Result<QueueJob, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                attempt_count = 0,
                scheduled_at = NOW(),
                next_retry_at = NULL,
                dlq_reason = NULL,
                dlq_at = NULL,
                worker_instance = NULL,
                locked_at = NULL,
                processed_at = NULL
            WHERE id = $1 AND status = 'dlq'
            RETURNING {JOB_COLUMNS}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await;

        match result {
            Ok(Some(row)) => job_from_row(&row),
            Ok(None) => Err(self.rejected(job_id, JobStatus::Pending).await),
            Err(e) if is_unique_violation(&e, ACTIVE_JOB_INDEX) => {
                let job = self.get(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
                Err(JobStoreError::DuplicateActiveJob {
                    document_id: job.document_id,
                    job_type: job.job_type,
                })
            }
            Err(e) => Err(map_sqlx_error("replay", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn discard(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("UPDATE queue_jobs SET status = 'failed' WHERE id = $1 AND status = 'dlq'")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("discard", e))?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self.rejected(job_id, JobStatus::Failed).await)
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<QueueJob>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_dlq(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<QueueJob>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM queue_jobs
            WHERE status = 'dlq' AND ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY dlq_at DESC
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(tenant_id.map(Uuid::from))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dlq", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn depth(&self) -> Result<QueueDepth, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'dlq') AS dlq
            FROM queue_jobs
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("depth", e))?;

        let count = |column: &str| -> Result<u64, JobStoreError> {
            let value: i64 = row.try_get(column).map_err(|e| map_sqlx_error("depth", e))?;
            Ok(value.max(0) as u64)
        };

        Ok(QueueDepth {
            pending: count("pending")?,
            processing: count("processing")?,
            dlq: count("dlq")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                last_error = 'Lease expired on worker ' || COALESCE(worker_instance, ''),
                worker_instance = NULL,
                locked_at = NULL
            WHERE status = 'processing' AND (locked_at IS NULL OR locked_at < $1)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(older_than)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &PgRow) -> Result<QueueJob, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(decode)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(decode)?;

    Ok(QueueJob {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        document_id: DocumentId::from_uuid(row.try_get("document_id").map_err(decode)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        job_type: job_type
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("{e}")))?,
        priority: row.try_get("priority").map_err(decode)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode)?,
        status: parse_status(&status)?,
        attempt_count: attempt_count.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        scheduled_at: row.try_get("scheduled_at").map_err(decode)?,
        next_retry_at: row.try_get("next_retry_at").map_err(decode)?,
        dlq_reason: row.try_get("dlq_reason").map_err(decode)?,
        dlq_at: row.try_get("dlq_at").map_err(decode)?,
        worker_instance: row.try_get("worker_instance").map_err(decode)?,
        locked_at: row.try_get("locked_at").map_err(decode)?,
        requested_at: row.try_get("requested_at").map_err(decode)?,
        processed_at: row.try_get("processed_at").map_err(decode)?,
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|e| JobStoreError::Storage(format!("{e}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Whether `err` is a unique violation on `constraint`.
pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::Validation(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

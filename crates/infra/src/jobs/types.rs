//! Queue job model and state machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docflow_ai::DocumentRef;
use docflow_core::{DocumentId, DomainError, JobId, TenantId};

use super::store::JobStoreError;

/// Attempts allowed when an enqueue request does not specify a budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Kind of document-analysis work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ContentExtraction,
    Analysis,
    EmbeddingGeneration,
}

impl JobType {
    pub const ALL: [JobType; 3] = [
        JobType::ContentExtraction,
        JobType::Analysis,
        JobType::EmbeddingGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ContentExtraction => "content_extraction",
            JobType::Analysis => "analysis",
            JobType::EmbeddingGeneration => "embedding_generation",
        }
    }

    /// The job that consumes this job's output, if any.
    pub fn follow_up(&self) -> Option<JobType> {
        match self {
            JobType::ContentExtraction => Some(JobType::Analysis),
            JobType::Analysis => Some(JobType::EmbeddingGeneration),
            JobType::EmbeddingGeneration => None,
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content_extraction" => Ok(JobType::ContentExtraction),
            "analysis" => Ok(JobType::Analysis),
            "embedding_generation" => Ok(JobType::EmbeddingGeneration),
            other => Err(DomainError::validation(format!("unknown job type: {other}"))),
        }
    }
}

/// Job status.
///
/// ```text
/// pending --claim--> processing --success--> completed
/// processing --failure, attempts remain--> pending (scheduled)
/// processing --attempts exhausted | poison pill | permanent error--> dlq
/// dlq --replay--> pending
/// dlq --discard--> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dlq,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dlq => "dlq",
        }
    }

    /// Counts toward the one-active-job-per-(document, type) invariant.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Dlq)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dlq" => Ok(JobStatus::Dlq),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A persisted queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: JobId,
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub job_type: JobType,
    /// Lower is more urgent.
    pub priority: i32,
    pub idempotency_key: String,
    pub status: JobStatus,
    /// Incremented by every claim, so it equals the number of the attempt in flight.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub dlq_reason: Option<String>,
    pub dlq_at: Option<DateTime<Utc>>,
    pub worker_instance: Option<String>,
    /// When the current worker claimed the job; drives lease expiry.
    pub locked_at: Option<DateTime<Utc>>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// Pending and past both its schedule and its retry delay.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_at <= now
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Time from which the job may be claimed.
    pub fn available_at(&self) -> DateTime<Utc> {
        match self.next_retry_at {
            Some(at) if at > self.scheduled_at => at,
            _ => self.scheduled_at,
        }
    }

    pub fn document_ref(&self) -> DocumentRef {
        DocumentRef::new(self.tenant_id, self.document_id)
    }

    pub fn is_held_by(&self, worker: &str) -> bool {
        self.status == JobStatus::Processing && self.worker_instance.as_deref() == Some(worker)
    }
}

/// Enqueue request from the surrounding application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub job_type: JobType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl NewJob {
    pub fn new(tenant_id: TenantId, document_id: DocumentId, job_type: JobType) -> Self {
        Self {
            document_id,
            tenant_id,
            job_type,
            priority: 0,
            idempotency_key: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Key used when the caller supplies none: `"{jobType}:{documentId}"`.
    pub fn effective_idempotency_key(&self) -> String {
        match &self.idempotency_key {
            Some(key) => key.clone(),
            None => format!("{}:{}", self.job_type, self.document_id),
        }
    }

    pub fn validate(&self) -> Result<(), JobStoreError> {
        if self.max_attempts == 0 {
            return Err(JobStoreError::Validation(
                "max_attempts must be at least 1".into(),
            ));
        }
        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(JobStoreError::Validation(
                    "idempotency key must not be blank".into(),
                ));
            }
            if key.len() > 255 {
                return Err(JobStoreError::Validation(
                    "idempotency key must be at most 255 characters".into(),
                ));
            }
        }
        Ok(())
    }

    /// Build the pending row this request inserts.
    pub fn into_job(self, now: DateTime<Utc>) -> QueueJob {
        let idempotency_key = self.effective_idempotency_key();
        QueueJob {
            id: JobId::new(),
            document_id: self.document_id,
            tenant_id: self.tenant_id,
            job_type: self.job_type,
            priority: self.priority,
            idempotency_key,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            next_retry_at: None,
            dlq_reason: None,
            dlq_at: None,
            worker_instance: None,
            locked_at: None,
            requested_at: now,
            processed_at: None,
        }
    }
}

/// Row counts by state, read by the metrics collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub processing: u64,
    pub dlq: u64,
}

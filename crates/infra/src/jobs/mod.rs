//! Durable document job queue.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped, typed, and unique while active per (document, type)
//! - Claims are atomic; a job is held by at most one worker
//! - Failures retry with exponential backoff until the attempt budget is spent
//! - Poison pills skip the remaining budget and go straight to the DLQ
//! - Job bodies run through the transaction core with the job's idempotency key
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `WorkerPool`: per-type bounded concurrency with a shared token bucket
//! - `JobRunner`: executes one claimed job and routes the outcome
//! - `RetryController`: backoff and poison-pill decisions
//! - `DeadLetterQueue`: quarantine, replay, discard
//! - `LeaseReaper`: returns abandoned `processing` jobs to the queue

pub mod dlq;
pub mod handlers;
pub mod postgres;
pub mod rate_limit;
pub mod reaper;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod types;

pub use dlq::DeadLetterQueue;
pub use handlers::{
    AnalysisHandler, EmbeddingHandler, ExtractionHandler, FollowUp, JobHandler, JobReceipt,
    document_handlers,
};
pub use postgres::PostgresJobStore;
pub use rate_limit::TokenBucket;
pub use reaper::LeaseReaper;
pub use retry::{
    DeadLetterCause, FailureDecision, POISON_PILL_REASON, PoisonPillPolicy, RetryController,
    RetryPolicy,
};
pub use runner::{HandlerMap, JobOutcome, JobRunner};
pub use scheduler::{JobProcessor, SchedulerConfig, WorkerPool};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, SharedJobStore};
pub use types::{DEFAULT_MAX_ATTEMPTS, JobStatus, JobType, NewJob, QueueDepth, QueueJob};

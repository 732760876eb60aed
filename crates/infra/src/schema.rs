//! Postgres schema for the queue, idempotency and document tables.
//!
//! Applied at start-up; every statement is idempotent.

use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_jobs (
        id UUID PRIMARY KEY,
        document_id UUID NOT NULL,
        tenant_id UUID NOT NULL,
        job_type TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        idempotency_key TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts >= 1),
        last_error TEXT,
        scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        next_retry_at TIMESTAMPTZ,
        dlq_reason TEXT,
        dlq_at TIMESTAMPTZ,
        worker_instance TEXT,
        locked_at TIMESTAMPTZ,
        requested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at TIMESTAMPTZ,
        CONSTRAINT queue_jobs_status_check
            CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'dlq'))
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS queue_jobs_one_active_per_document
        ON queue_jobs (document_id, job_type)
        WHERE status IN ('pending', 'processing')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_jobs_claim
        ON queue_jobs (job_type, status, priority, scheduled_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_jobs_lease
        ON queue_jobs (locked_at)
        WHERE status = 'processing'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_records (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        operation_type TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        request_payload JSONB NOT NULL,
        response_payload JSONB,
        status TEXT NOT NULL,
        result_refs TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT idempotency_records_scope_key
            UNIQUE (tenant_id, operation_type, idempotency_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idempotency_records_expiry
        ON idempotency_records (expires_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        tenant_id UUID NOT NULL,
        document_id UUID NOT NULL,
        title TEXT NOT NULL,
        source_uri TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, document_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_contents (
        tenant_id UUID NOT NULL,
        document_id UUID NOT NULL,
        content TEXT NOT NULL,
        extracted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, document_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_analyses (
        tenant_id UUID NOT NULL,
        document_id UUID NOT NULL,
        summary TEXT NOT NULL,
        key_topics TEXT[] NOT NULL,
        document_type TEXT NOT NULL,
        sentiment TEXT NOT NULL,
        word_count INTEGER NOT NULL,
        analyzed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, document_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_embeddings (
        tenant_id UUID NOT NULL,
        document_id UUID NOT NULL,
        embedding REAL[] NOT NULL,
        dimensions INTEGER NOT NULL,
        embedded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, document_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_metrics_snapshots (
        id UUID PRIMARY KEY,
        captured_at TIMESTAMPTZ NOT NULL,
        queue_depth BIGINT NOT NULL,
        processing_depth BIGINT NOT NULL,
        dlq_depth BIGINT NOT NULL,
        processed BIGINT NOT NULL,
        succeeded BIGINT NOT NULL,
        failed BIGINT NOT NULL,
        retried BIGINT NOT NULL,
        poison_pills BIGINT NOT NULL,
        avg_processing_time_ms DOUBLE PRECISION NOT NULL,
        active_workers INTEGER NOT NULL
    )
    "#,
];

/// Create tables and indexes that do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = STATEMENTS.len(), "database schema ensured");
    Ok(())
}

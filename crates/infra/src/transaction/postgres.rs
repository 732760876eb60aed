//! Postgres-backed transactional store.
//!
//! `PgUnitOfWork` wraps a `sqlx::Transaction`; dropping it without `commit`
//! rolls the transaction back.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use docflow_ai::DocumentAnalysis;
use docflow_core::{DocumentId, TenantId};

use super::idempotency::{IdempotencyRecord, IdempotencyScope, IdempotencyStatus, SCOPE_CONSTRAINT};
use super::store::{Database, NewDocument, StoreError, UnitOfWork};

const RECORD_COLUMNS: &str = "id, tenant_id, operation_type, idempotency_key, request_payload, \
     response_payload, status, result_refs, created_at, expires_at";

#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: Arc<PgPool>,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Tx = PgUnitOfWork;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PgUnitOfWork { tx })
    }

    #[instrument(
        skip(self, scope),
        fields(operation_type = %scope.operation_type),
        err
    )]
    async fn find_idempotency_record(
        &self,
        scope: &IdempotencyScope,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM idempotency_records
            WHERE tenant_id = $1 AND operation_type = $2 AND idempotency_key = $3
              AND expires_at > $4
            "#
        );

        let row = sqlx::query(&sql)
            .bind(scope.tenant_id.as_uuid())
            .bind(&scope.operation_type)
            .bind(&scope.idempotency_key)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_idempotency_record", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired_idempotency", e))?;
        Ok(result.rows_affected())
    }

    async fn count_documents(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        count(&self.pool, "SELECT COUNT(*) FROM documents WHERE tenant_id = $1", tenant_id).await
    }

    async fn count_idempotency_records(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        count(
            &self.pool,
            "SELECT COUNT(*) FROM idempotency_records WHERE tenant_id = $1",
            tenant_id,
        )
        .await
    }
}

async fn count(pool: &PgPool, sql: &str, tenant_id: TenantId) -> Result<u64, StoreError> {
    let value: i64 = sqlx::query_scalar(sql)
        .bind(tenant_id.as_uuid())
        .fetch_one(pool)
        .await
        .map_err(|e| map_sqlx_error("count", e))?;
    Ok(value.max(0) as u64)
}

#[derive(Debug)]
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<IdempotencyRecord, StoreError> {
        // Takes over a failed or expired row; a live row yields no RETURNING row.
        let sql = format!(
            r#"
            INSERT INTO idempotency_records (
                id, tenant_id, operation_type, idempotency_key, request_payload,
                response_payload, status, result_refs, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, NULL, 'pending', '{{}}', $6, $7)
            ON CONFLICT ON CONSTRAINT {SCOPE_CONSTRAINT} DO UPDATE
            SET id = EXCLUDED.id,
                request_payload = EXCLUDED.request_payload,
                response_payload = NULL,
                status = 'pending',
                result_refs = '{{}}',
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_records.status = 'failed'
               OR idempotency_records.expires_at <= NOW()
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(record.id)
            .bind(record.tenant_id.as_uuid())
            .bind(&record.operation_type)
            .bind(&record.idempotency_key)
            .bind(&record.request_payload)
            .bind(record.created_at)
            .bind(record.expires_at)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_idempotency_record", e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::UniqueViolation(SCOPE_CONSTRAINT.to_string())),
        }
    }

    async fn finish_idempotency_record(
        &mut self,
        record_id: Uuid,
        status: IdempotencyStatus,
        response_payload: Option<&Value>,
        result_refs: &[String],
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = $2, response_payload = $3, result_refs = $4
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(status.as_str())
        .bind(response_payload)
        .bind(result_refs)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("finish_idempotency_record", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("idempotency record {record_id}")));
        }
        Ok(())
    }

    async fn insert_document(&mut self, document: &NewDocument) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents (tenant_id, document_id, title, source_uri)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(document.tenant_id.as_uuid())
        .bind(document.document_id.as_uuid())
        .bind(&document.title)
        .bind(&document.source_uri)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_document", e))?;
        Ok(())
    }

    async fn save_extracted_content(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        content: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO document_contents (tenant_id, document_id, content)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, document_id)
            DO UPDATE SET content = EXCLUDED.content, extracted_at = NOW()
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(document_id.as_uuid())
        .bind(content)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_extracted_content", e))?;
        Ok(())
    }

    async fn load_extracted_content(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar(
            "SELECT content FROM document_contents WHERE tenant_id = $1 AND document_id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(document_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_extracted_content", e))
    }

    async fn save_analysis(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        analysis: &DocumentAnalysis,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO document_analyses (
                tenant_id, document_id, summary, key_topics, document_type, sentiment, word_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, document_id) DO UPDATE
            SET summary = EXCLUDED.summary,
                key_topics = EXCLUDED.key_topics,
                document_type = EXCLUDED.document_type,
                sentiment = EXCLUDED.sentiment,
                word_count = EXCLUDED.word_count,
                analyzed_at = NOW()
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(document_id.as_uuid())
        .bind(&analysis.summary)
        .bind(&analysis.key_topics)
        .bind(&analysis.document_type)
        .bind(analysis.sentiment.as_str())
        .bind(i32::try_from(analysis.word_count).unwrap_or(i32::MAX))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_analysis", e))?;
        Ok(())
    }

    async fn save_embedding(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO document_embeddings (tenant_id, document_id, embedding, dimensions)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, document_id) DO UPDATE
            SET embedding = EXCLUDED.embedding,
                dimensions = EXCLUDED.dimensions,
                embedded_at = NOW()
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(document_id.as_uuid())
        .bind(embedding)
        .bind(i32::try_from(embedding.len()).unwrap_or(i32::MAX))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_embedding", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(format!("failed to decode idempotency row: {e}"));
    let status: String = row.try_get("status").map_err(decode)?;

    Ok(IdempotencyRecord {
        id: row.try_get("id").map_err(decode)?,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        operation_type: row.try_get("operation_type").map_err(decode)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode)?,
        request_payload: row.try_get("request_payload").map_err(decode)?,
        response_payload: row.try_get("response_payload").map_err(decode)?,
        status: status.parse()?,
        result_refs: row.try_get("result_refs").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                return StoreError::UniqueViolation(constraint);
            }
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

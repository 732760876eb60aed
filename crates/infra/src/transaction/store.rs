//! Transactional storage seams.
//!
//! `Database` hands out units of work; everything an operation writes goes
//! through its `UnitOfWork` and becomes visible only on `commit`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use docflow_ai::DocumentAnalysis;
use docflow_core::{DocumentId, TenantId};

use super::idempotency::{IdempotencyRecord, IdempotencyScope, IdempotencyStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Unique constraint violated; carries the constraint name.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Document metadata row written by the document-create operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDocument {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub title: String,
    #[serde(default)]
    pub source_uri: Option<String>,
}

/// One open database transaction.
#[async_trait]
pub trait UnitOfWork: Send + Sized + 'static {
    /// Insert a pending idempotency record.
    ///
    /// An existing row with the same scope is replaced only if it is `failed` or
    /// expired; otherwise this fails with `UniqueViolation(SCOPE_CONSTRAINT)`.
    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<IdempotencyRecord, StoreError>;

    async fn finish_idempotency_record(
        &mut self,
        record_id: Uuid,
        status: IdempotencyStatus,
        response_payload: Option<&Value>,
        result_refs: &[String],
    ) -> Result<(), StoreError>;

    async fn insert_document(&mut self, document: &NewDocument) -> Result<(), StoreError>;

    async fn save_extracted_content(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn load_extracted_content(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<String>, StoreError>;

    async fn save_analysis(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        analysis: &DocumentAnalysis,
    ) -> Result<(), StoreError>;

    async fn save_embedding(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        embedding: &[f32],
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Database: Send + Sync + 'static {
    type Tx: UnitOfWork;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Committed, unexpired record for `scope`.
    async fn find_idempotency_record(
        &self,
        scope: &IdempotencyScope,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete records that expired before `now`. Returns how many were removed.
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn count_documents(&self, tenant_id: TenantId) -> Result<u64, StoreError>;

    async fn count_idempotency_records(&self, tenant_id: TenantId) -> Result<u64, StoreError>;
}

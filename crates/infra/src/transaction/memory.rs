//! In-memory transactional store for tests/dev.
//!
//! Each unit of work stages its writes privately. `commit` re-checks unique
//! constraints against committed state and applies everything under one lock;
//! `rollback` (or dropping the unit of work) discards the staged writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use docflow_ai::DocumentAnalysis;
use docflow_core::{DocumentId, TenantId};

use super::idempotency::{IdempotencyRecord, IdempotencyScope, IdempotencyStatus, SCOPE_CONSTRAINT};
use super::store::{Database, NewDocument, StoreError, UnitOfWork};

const DOCUMENTS_KEY: &str = "documents_pkey";

type DocKey = (TenantId, DocumentId);

#[derive(Debug, Default, Clone)]
struct Tables {
    idempotency: HashMap<IdempotencyScope, IdempotencyRecord>,
    documents: HashMap<DocKey, NewDocument>,
    contents: HashMap<DocKey, String>,
    analyses: HashMap<DocKey, DocumentAnalysis>,
    embeddings: HashMap<DocKey, Vec<f32>>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<Tables>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store extracted text directly, outside any transaction.
    pub fn seed_extracted_content(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        content: impl Into<String>,
    ) {
        self.tables()
            .contents
            .insert((tenant_id, document_id), content.into());
    }

    pub fn extracted_content(&self, tenant_id: TenantId, document_id: DocumentId) -> Option<String> {
        self.tables().contents.get(&(tenant_id, document_id)).cloned()
    }

    pub fn analysis(&self, tenant_id: TenantId, document_id: DocumentId) -> Option<DocumentAnalysis> {
        self.tables().analyses.get(&(tenant_id, document_id)).cloned()
    }

    pub fn embedding(&self, tenant_id: TenantId, document_id: DocumentId) -> Option<Vec<f32>> {
        self.tables().embeddings.get(&(tenant_id, document_id)).cloned()
    }

    pub fn document(&self, tenant_id: TenantId, document_id: DocumentId) -> Option<NewDocument> {
        self.tables().documents.get(&(tenant_id, document_id)).cloned()
    }

    /// Committed record for `scope`, expired or not.
    pub fn idempotency_record(&self, scope: &IdempotencyScope) -> Option<IdempotencyRecord> {
        self.tables().idempotency.get(scope).cloned()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    type Tx = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryUnitOfWork {
            shared: self.state.clone(),
            staged: Tables::default(),
            new_documents: Vec::new(),
        })
    }

    async fn find_idempotency_record(
        &self,
        scope: &IdempotencyScope,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self
            .tables()
            .idempotency
            .get(scope)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let before = tables.idempotency.len();
        tables.idempotency.retain(|_, r| !r.is_expired(now));
        Ok((before - tables.idempotency.len()) as u64)
    }

    async fn count_documents(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        Ok(self
            .tables()
            .documents
            .keys()
            .filter(|(t, _)| *t == tenant_id)
            .count() as u64)
    }

    async fn count_idempotency_records(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        Ok(self
            .tables()
            .idempotency
            .keys()
            .filter(|s| s.tenant_id == tenant_id)
            .count() as u64)
    }
}

#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    shared: Arc<Mutex<Tables>>,
    staged: Tables,
    new_documents: Vec<DocKey>,
}

impl InMemoryUnitOfWork {
    fn committed(&self) -> MutexGuard<'_, Tables> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_scope_free(
        committed: &Tables,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match committed.idempotency.get(&record.scope()) {
            Some(existing) if existing.id != record.id && !existing.can_be_taken_over(now) => {
                Err(StoreError::UniqueViolation(SCOPE_CONSTRAINT.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<IdempotencyRecord, StoreError> {
        let now = Utc::now();
        let scope = record.scope();

        if self.staged.idempotency.contains_key(&scope) {
            return Err(StoreError::UniqueViolation(SCOPE_CONSTRAINT.to_string()));
        }
        Self::check_scope_free(&self.committed(), record, now)?;

        self.staged.idempotency.insert(scope, record.clone());
        Ok(record.clone())
    }

    async fn finish_idempotency_record(
        &mut self,
        record_id: Uuid,
        status: IdempotencyStatus,
        response_payload: Option<&Value>,
        result_refs: &[String],
    ) -> Result<(), StoreError> {
        let in_stage = self.staged.idempotency.values().any(|r| r.id == record_id);
        if !in_stage {
            let committed = self
                .committed()
                .idempotency
                .values()
                .find(|r| r.id == record_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("idempotency record {record_id}")))?;
            self.staged.idempotency.insert(committed.scope(), committed);
        }

        let record = self
            .staged
            .idempotency
            .values_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| StoreError::NotFound(format!("idempotency record {record_id}")))?;

        record.status = status;
        record.response_payload = response_payload.cloned();
        record.result_refs = result_refs.to_vec();
        Ok(())
    }

    async fn insert_document(&mut self, document: &NewDocument) -> Result<(), StoreError> {
        let key = (document.tenant_id, document.document_id);
        if self.staged.documents.contains_key(&key) || self.committed().documents.contains_key(&key) {
            return Err(StoreError::UniqueViolation(DOCUMENTS_KEY.to_string()));
        }
        self.staged.documents.insert(key, document.clone());
        self.new_documents.push(key);
        Ok(())
    }

    async fn save_extracted_content(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        content: &str,
    ) -> Result<(), StoreError> {
        self.staged
            .contents
            .insert((tenant_id, document_id), content.to_string());
        Ok(())
    }

    async fn load_extracted_content(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<String>, StoreError> {
        let key = (tenant_id, document_id);
        if let Some(content) = self.staged.contents.get(&key) {
            return Ok(Some(content.clone()));
        }
        Ok(self.committed().contents.get(&key).cloned())
    }

    async fn save_analysis(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        analysis: &DocumentAnalysis,
    ) -> Result<(), StoreError> {
        self.staged
            .analyses
            .insert((tenant_id, document_id), analysis.clone());
        Ok(())
    }

    async fn save_embedding(
        &mut self,
        tenant_id: TenantId,
        document_id: DocumentId,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        self.staged
            .embeddings
            .insert((tenant_id, document_id), embedding.to_vec());
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut committed = self.shared.lock().unwrap_or_else(PoisonError::into_inner);

        for record in self.staged.idempotency.values() {
            Self::check_scope_free(&committed, record, now)?;
        }
        for key in &self.new_documents {
            if committed.documents.contains_key(key) {
                return Err(StoreError::UniqueViolation(DOCUMENTS_KEY.to_string()));
            }
        }

        let Tables {
            idempotency,
            documents,
            contents,
            analyses,
            embeddings,
        } = self.staged;
        committed.idempotency.extend(idempotency);
        committed.documents.extend(documents);
        committed.contents.extend(contents);
        committed.analyses.extend(analyses);
        committed.embeddings.extend(embeddings);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

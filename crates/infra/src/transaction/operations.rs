//! Transactional operations offered to the surrounding application.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use docflow_core::{DocumentId, TenantId};

use super::context::OperationContext;
use super::error::OperationError;
use super::store::{NewDocument, UnitOfWork};
use super::TransactionalOperation;

/// Operation type recorded for document creation.
pub const CREATE_DOCUMENT: &str = "document_create";

/// Insert a document metadata row.
#[derive(Debug, Clone)]
pub struct CreateDocument {
    pub document: NewDocument,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCreated {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
}

impl CreateDocument {
    pub fn new(document: NewDocument) -> Self {
        Self { document }
    }

    pub fn context(&self, idempotency_key: Option<String>) -> OperationContext {
        let ctx = OperationContext::new(self.document.tenant_id, CREATE_DOCUMENT);
        match idempotency_key {
            Some(key) => ctx.with_idempotency_key(key),
            None => ctx,
        }
    }

    /// Payload compared on idempotent replays.
    pub fn request_payload(&self) -> Value {
        json!({
            "documentId": self.document.document_id,
            "title": self.document.title,
            "sourceUri": self.document.source_uri,
        })
    }
}

#[async_trait]
impl<Tx: UnitOfWork> TransactionalOperation<Tx> for CreateDocument {
    type Output = DocumentCreated;

    async fn execute(
        &self,
        tx: &mut Tx,
        _ctx: &mut OperationContext,
    ) -> Result<DocumentCreated, OperationError> {
        let title = self.document.title.trim();
        if title.is_empty() {
            return Err(OperationError::validation("document title must not be empty"));
        }

        tx.insert_document(&self.document).await?;
        Ok(DocumentCreated {
            tenant_id: self.document.tenant_id,
            document_id: self.document.document_id,
        })
    }

    fn result_refs(&self, output: &DocumentCreated) -> Vec<String> {
        vec![format!("documents/{}", output.document_id)]
    }
}

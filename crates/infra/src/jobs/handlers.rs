//! Job bodies for the document-analysis pipeline.
//!
//! Each handler runs inside the transaction core: its writes commit together
//! with the job's idempotency record, and follow-up jobs are enqueued from
//! post-commit hooks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use docflow_ai::{AiError, AnalysisEngine};

use super::store::{JobStoreError, SharedJobStore};
use super::types::{JobType, NewJob, QueueJob};
use crate::transaction::{OperationContext, OperationError, UnitOfWork};

/// Result stored in the idempotency record of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobReceipt {
    Extracted { characters: usize },
    Analyzed { document_type: String, word_count: u32 },
    Embedded { dimensions: usize },
}

#[async_trait]
pub trait JobHandler<Tx: UnitOfWork>: Send + Sync {
    async fn handle(
        &self,
        job: &QueueJob,
        tx: &mut Tx,
        ctx: &mut OperationContext,
    ) -> Result<JobReceipt, OperationError>;
}

/// Enqueues the next stage of the pipeline once a job's transaction commits.
#[derive(Clone)]
pub struct FollowUp {
    store: SharedJobStore,
    max_attempts: u32,
}

impl core::fmt::Debug for FollowUp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FollowUp")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl FollowUp {
    pub fn new(store: SharedJobStore, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }

    fn schedule(&self, ctx: &mut OperationContext, job: &QueueJob) {
        let Some(next) = job.job_type.follow_up() else {
            return;
        };

        let store = self.store.clone();
        let request = NewJob::new(job.tenant_id, job.document_id, next)
            .with_priority(job.priority)
            .with_max_attempts(self.max_attempts);

        ctx.after_commit(format!("enqueue {next}"), async move {
            match store.enqueue(request).await {
                Ok(queued) => {
                    info!(
                        job_id = %queued.id,
                        job_type = %queued.job_type,
                        document_id = %queued.document_id,
                        "follow-up job enqueued"
                    );
                    Ok(())
                }
                Err(JobStoreError::DuplicateActiveJob {
                    document_id,
                    job_type,
                }) => {
                    debug!(%document_id, %job_type, "follow-up job already active");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        });
    }
}

async fn load_text<Tx: UnitOfWork>(tx: &mut Tx, job: &QueueJob) -> Result<String, OperationError> {
    tx.load_extracted_content(job.tenant_id, job.document_id)
        .await?
        .ok_or_else(|| {
            OperationError::transient(format!(
                "no extracted content for document {}",
                job.document_id
            ))
        })
}

/// `content_extraction`: pull text out of the stored document.
#[derive(Clone)]
pub struct ExtractionHandler {
    engine: Arc<dyn AnalysisEngine>,
    follow_up: Option<FollowUp>,
}

impl ExtractionHandler {
    pub fn new(engine: Arc<dyn AnalysisEngine>, follow_up: Option<FollowUp>) -> Self {
        Self { engine, follow_up }
    }
}

#[async_trait]
impl<Tx: UnitOfWork> JobHandler<Tx> for ExtractionHandler {
    async fn handle(
        &self,
        job: &QueueJob,
        tx: &mut Tx,
        ctx: &mut OperationContext,
    ) -> Result<JobReceipt, OperationError> {
        let text = self.engine.extract_content(&job.document_ref()).await?;
        if text.trim().is_empty() {
            return Err(OperationError::validation(format!(
                "document {} has no extractable text",
                job.document_id
            )));
        }

        tx.save_extracted_content(job.tenant_id, job.document_id, &text)
            .await?;
        if let Some(follow_up) = &self.follow_up {
            follow_up.schedule(ctx, job);
        }

        Ok(JobReceipt::Extracted {
            characters: text.chars().count(),
        })
    }
}

/// `analysis`: summarise and classify the extracted text.
#[derive(Clone)]
pub struct AnalysisHandler {
    engine: Arc<dyn AnalysisEngine>,
    follow_up: Option<FollowUp>,
}

impl AnalysisHandler {
    pub fn new(engine: Arc<dyn AnalysisEngine>, follow_up: Option<FollowUp>) -> Self {
        Self { engine, follow_up }
    }
}

#[async_trait]
impl<Tx: UnitOfWork> JobHandler<Tx> for AnalysisHandler {
    async fn handle(
        &self,
        job: &QueueJob,
        tx: &mut Tx,
        ctx: &mut OperationContext,
    ) -> Result<JobReceipt, OperationError> {
        let text = load_text(tx, job).await?;
        let analysis = self.engine.analyze(&text).await?;

        tx.save_analysis(job.tenant_id, job.document_id, &analysis)
            .await?;
        if let Some(follow_up) = &self.follow_up {
            follow_up.schedule(ctx, job);
        }

        Ok(JobReceipt::Analyzed {
            document_type: analysis.document_type,
            word_count: analysis.word_count,
        })
    }
}

/// `embedding_generation`: embed the extracted text.
#[derive(Clone)]
pub struct EmbeddingHandler {
    engine: Arc<dyn AnalysisEngine>,
}

impl EmbeddingHandler {
    pub fn new(engine: Arc<dyn AnalysisEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<Tx: UnitOfWork> JobHandler<Tx> for EmbeddingHandler {
    async fn handle(
        &self,
        job: &QueueJob,
        tx: &mut Tx,
        _ctx: &mut OperationContext,
    ) -> Result<JobReceipt, OperationError> {
        let text = load_text(tx, job).await?;
        let embedding = self.engine.embed(&text).await?;
        if embedding.is_empty() {
            return Err(AiError::MalformedResponse("empty embedding".into()).into());
        }

        tx.save_embedding(job.tenant_id, job.document_id, &embedding)
            .await?;
        Ok(JobReceipt::Embedded {
            dimensions: embedding.len(),
        })
    }
}

/// The three pipeline handlers, keyed by the job type they serve.
pub fn document_handlers<Tx: UnitOfWork>(
    engine: Arc<dyn AnalysisEngine>,
    follow_up: Option<FollowUp>,
) -> HashMap<JobType, Arc<dyn JobHandler<Tx>>> {
    let mut handlers: HashMap<JobType, Arc<dyn JobHandler<Tx>>> = HashMap::new();
    handlers.insert(
        JobType::ContentExtraction,
        Arc::new(ExtractionHandler::new(engine.clone(), follow_up.clone())),
    );
    handlers.insert(
        JobType::Analysis,
        Arc::new(AnalysisHandler::new(engine.clone(), follow_up)),
    );
    handlers.insert(
        JobType::EmbeddingGeneration,
        Arc::new(EmbeddingHandler::new(engine)),
    );
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use docflow_ai::{DocumentRef, LocalAnalysisEngine};
    use docflow_core::{DocumentId, TenantId};

    use crate::jobs::store::InMemoryJobStore;
    use crate::transaction::{Database, InMemoryDatabase};

    fn job(job_type: JobType) -> QueueJob {
        NewJob::new(TenantId::new(), DocumentId::new(), job_type).into_job(Utc::now())
    }

    #[tokio::test]
    async fn extraction_saves_text_and_schedules_analysis() {
        let engine = Arc::new(LocalAnalysisEngine::new());
        let job = job(JobType::ContentExtraction);
        engine.register_document(
            DocumentRef::new(job.tenant_id, job.document_id),
            "Dear customer, thank you.",
        );
        let handler = ExtractionHandler::new(engine, Some(FollowUp::new(InMemoryJobStore::arc(), 3)));

        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let mut ctx = OperationContext::new(job.tenant_id, job.job_type.as_str());

        let receipt = handler.handle(&job, &mut tx, &mut ctx).await.unwrap();
        assert_eq!(receipt, JobReceipt::Extracted { characters: 25 });
        assert_eq!(ctx.pending_hooks(), 1);

        // Staged only; visible after commit.
        assert!(db.extracted_content(job.tenant_id, job.document_id).is_none());
        tx.commit().await.unwrap();
        assert!(db.extracted_content(job.tenant_id, job.document_id).is_some());
    }

    #[tokio::test]
    async fn unknown_document_is_not_retryable() {
        let handler = ExtractionHandler::new(Arc::new(LocalAnalysisEngine::new()), None);
        let job = job(JobType::ContentExtraction);
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let mut ctx = OperationContext::new(job.tenant_id, job.job_type.as_str());

        let err = handler.handle(&job, &mut tx, &mut ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(ctx.pending_hooks(), 0);
    }

    #[tokio::test]
    async fn analysis_without_extracted_text_is_transient() {
        let handler = AnalysisHandler::new(Arc::new(LocalAnalysisEngine::new()), None);
        let job = job(JobType::Analysis);
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let mut ctx = OperationContext::new(job.tenant_id, job.job_type.as_str());

        let err = handler.handle(&job, &mut tx, &mut ctx).await.unwrap_err();
        assert!(matches!(err, OperationError::Transient(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn embedding_receipt_reports_dimensions() {
        let handler = EmbeddingHandler::new(Arc::new(LocalAnalysisEngine::new().with_dimensions(8)));
        let job = job(JobType::EmbeddingGeneration);
        let db = InMemoryDatabase::new();
        db.seed_extracted_content(job.tenant_id, job.document_id, "vectors for everyone");
        let mut tx = db.begin().await.unwrap();
        let mut ctx = OperationContext::new(job.tenant_id, job.job_type.as_str());

        let receipt = handler.handle(&job, &mut tx, &mut ctx).await.unwrap();
        assert_eq!(
            serde_json::to_value(&receipt).unwrap(),
            serde_json::json!({ "kind": "embedded", "dimensions": 8 })
        );
    }

    #[test]
    fn every_job_type_has_a_handler() {
        let handlers = document_handlers::<crate::transaction::memory::InMemoryUnitOfWork>(
            Arc::new(LocalAnalysisEngine::new()),
            None,
        );
        for job_type in JobType::ALL {
            assert!(handlers.contains_key(&job_type));
        }
    }
}

//! The analysis engine contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use docflow_core::{DocumentId, TenantId};

use crate::error::AiError;

/// Reference to a stored document.
///
/// File storage belongs to the surrounding application; the engine resolves the
/// reference on its side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
}

impl DocumentRef {
    pub fn new(tenant_id: TenantId, document_id: DocumentId) -> Self {
        Self {
            tenant_id,
            document_id,
        }
    }
}

/// Overall tone reported by the analysis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
            Sentiment::Mixed => "mixed",
        }
    }
}

impl core::str::FromStr for Sentiment {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Sentiment::Positive),
            "neutral" => Ok(Sentiment::Neutral),
            "negative" => Ok(Sentiment::Negative),
            "mixed" => Ok(Sentiment::Mixed),
            other => Err(AiError::MalformedResponse(format!("unknown sentiment: {other}"))),
        }
    }
}

/// Result of `analyze(text)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAnalysis {
    pub summary: String,
    pub key_topics: Vec<String>,
    pub document_type: String,
    pub sentiment: Sentiment,
    pub word_count: u32,
}

/// Remote, rate-limited document analysis service.
///
/// Calls are not cancellable once dispatched; callers bound concurrency and rate
/// instead of interrupting in-flight requests.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Extract plain text from a stored document.
    async fn extract_content(&self, document: &DocumentRef) -> Result<String, AiError>;

    /// Summarise and classify extracted text.
    async fn analyze(&self, text: &str) -> Result<DocumentAnalysis, AiError>;

    /// Produce an embedding vector for extracted text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError>;
}

#[async_trait]
impl<E> AnalysisEngine for std::sync::Arc<E>
where
    E: AnalysisEngine + ?Sized,
{
    async fn extract_content(&self, document: &DocumentRef) -> Result<String, AiError> {
        (**self).extract_content(document).await
    }

    async fn analyze(&self, text: &str) -> Result<DocumentAnalysis, AiError> {
        (**self).analyze(text).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        (**self).embed(text).await
    }
}

//! HTTP client for the remote analysis service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, instrument, warn};

use crate::engine::{AnalysisEngine, DocumentAnalysis, DocumentRef};
use crate::error::AiError;

#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub api_key: Option<String>,
}

impl HttpEngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            api_key: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExtractRequest {
    tenant_id: String,
    document_id: String,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// `AnalysisEngine` backed by the analysis service's JSON API.
///
/// Endpoints: `POST /v1/extract`, `POST /v1/analyze`, `POST /v1/embed`.
#[derive(Debug, Clone)]
pub struct HttpAnalysisEngine {
    client: Client,
    config: HttpEngineConfig,
}

impl HttpAnalysisEngine {
    pub fn new(config: HttpEngineConfig) -> Result<Self, AiError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AiError::Unavailable(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, AiError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            warn!(path, error = %e, "analysis service request failed");
            AiError::Unavailable(e.to_string())
        })?;

        let response = check_status(response).await?;
        response
            .json::<R>()
            .await
            .map_err(|e| AiError::MalformedResponse(e.to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, AiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(retry_after_ms);
        return Err(AiError::RateLimited { retry_after_ms });
    }

    let body = response.text().await.unwrap_or_default();
    debug!(%status, body, "analysis service returned error status");

    Err(classify_status(status, body))
}

/// `Retry-After` in delay-seconds form, as milliseconds.
fn retry_after_ms(value: &str) -> Option<u64> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| secs.saturating_mul(1000))
}

fn classify_status(status: StatusCode, body: String) -> AiError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    if status == StatusCode::UNPROCESSABLE_ENTITY {
        AiError::InferenceFailed(detail)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        AiError::Unavailable(detail)
    } else {
        AiError::InvalidInput(detail)
    }
}

#[async_trait]
impl AnalysisEngine for HttpAnalysisEngine {
    #[instrument(skip(self), fields(document_id = %document.document_id), err)]
    async fn extract_content(&self, document: &DocumentRef) -> Result<String, AiError> {
        let body = ExtractRequest {
            tenant_id: document.tenant_id.to_string(),
            document_id: document.document_id.to_string(),
        };
        let response: ExtractResponse = self.post("v1/extract", &body).await?;
        Ok(response.text)
    }

    #[instrument(skip(self, text), fields(text_len = text.len()), err)]
    async fn analyze(&self, text: &str) -> Result<DocumentAnalysis, AiError> {
        self.post("v1/analyze", &TextRequest { text }).await
    }

    #[instrument(skip(self, text), fields(text_len = text.len()), err)]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let response: EmbedResponse = self.post("v1/embed", &TextRequest { text }).await?;
        if response.embedding.is_empty() {
            return Err(AiError::MalformedResponse("empty embedding".into()));
        }
        Ok(response.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_urls_without_double_slashes() {
        let engine = HttpAnalysisEngine::new(HttpEngineConfig::new("http://ai.local/")).unwrap();
        assert_eq!(engine.url("v1/embed"), "http://ai.local/v1/embed");
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(classify_status(StatusCode::UNPROCESSABLE_ENTITY, "model".into()).is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "bad".into()).is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, String::new()).is_transient());
    }

    #[test]
    fn retry_after_saturates_on_huge_values() {
        assert_eq!(retry_after_ms(" 30 "), Some(30_000));
        assert_eq!(retry_after_ms(&u64::MAX.to_string()), Some(u64::MAX));
        assert_eq!(retry_after_ms("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }
}

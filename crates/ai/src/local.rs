use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::engine::{AnalysisEngine, DocumentAnalysis, DocumentRef, Sentiment};
use crate::error::AiError;

const DEFAULT_DIMENSIONS: usize = 64;
const SUMMARY_MAX_CHARS: usize = 240;
const MAX_TOPICS: usize = 5;

const STOP_WORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "will", "were", "been", "their", "there", "which",
    "about", "would", "could", "should", "these", "those", "into", "than", "then", "they", "your",
    "also", "such", "only", "other", "some", "what", "when", "where",
];

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "approved", "success", "successful", "benefit", "improved",
    "positive", "pleased", "growth", "profit",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "poor", "failure", "failed", "loss", "risk", "overdue", "penalty", "breach", "negative",
    "complaint", "decline",
];

/// Deterministic in-process analysis engine.
///
/// Used for development and tests. Document contents are registered up front
/// (there is no file storage here), and every call is a pure function of its
/// input:
/// - summary: leading sentences, clipped to a fixed length
/// - key topics: most frequent non-trivial words
/// - document type: keyword classification
/// - sentiment: lexicon balance
/// - embedding: L2-normalised hashed bag of words
#[derive(Debug)]
pub struct LocalAnalysisEngine {
    documents: RwLock<HashMap<DocumentRef, String>>,
    dimensions: usize,
}

impl Default for LocalAnalysisEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAnalysisEngine {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            dimensions: DEFAULT_DIMENSIONS,
        }
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions.max(1);
        self
    }

    /// Register the text that `extract_content` returns for `document`.
    pub fn register_document(&self, document: DocumentRef, text: impl Into<String>) {
        let mut docs = self.documents.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(document, text.into());
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[async_trait]
impl AnalysisEngine for LocalAnalysisEngine {
    async fn extract_content(&self, document: &DocumentRef) -> Result<String, AiError> {
        let docs = self.documents.read().unwrap_or_else(|e| e.into_inner());
        let text = docs.get(document).ok_or_else(|| {
            AiError::invalid_input(format!("document {} not found", document.document_id))
        })?;

        if text.trim().is_empty() {
            return Err(AiError::invalid_input(format!(
                "document {} has no extractable text",
                document.document_id
            )));
        }
        Ok(text.clone())
    }

    async fn analyze(&self, text: &str) -> Result<DocumentAnalysis, AiError> {
        let words = tokenize(text);
        if words.is_empty() {
            return Err(AiError::invalid_input("cannot analyze empty text"));
        }

        Ok(DocumentAnalysis {
            summary: summarize(text),
            key_topics: key_topics(&words),
            document_type: classify(&words).to_string(),
            sentiment: sentiment(&words),
            word_count: text.split_whitespace().count() as u32,
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let words = tokenize(text);
        if words.is_empty() {
            return Err(AiError::invalid_input("cannot embed empty text"));
        }

        let mut vector = vec![0f32; self.dimensions];
        for word in &words {
            let slot = (fnv1a(word.as_bytes()) % self.dimensions as u64) as usize;
            vector[slot] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn summarize(text: &str) -> String {
    let mut summary = String::new();
    for sentence in text.split_inclusive(['.', '!', '?']) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        if !summary.is_empty() && summary.len() + sentence.len() + 1 > SUMMARY_MAX_CHARS {
            break;
        }
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(sentence);
    }

    if summary.chars().count() > SUMMARY_MAX_CHARS {
        summary = summary.chars().take(SUMMARY_MAX_CHARS).collect();
        summary.push_str("...");
    }
    summary
}

fn key_topics(words: &[String]) -> Vec<String> {
    // BTreeMap keeps ties in alphabetical order.
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for word in words {
        if word.len() < 4 || STOP_WORDS.contains(&word.as_str()) || word.chars().all(char::is_numeric) {
            continue;
        }
        *counts.entry(word.as_str()).or_default() += 1;
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
        .into_iter()
        .take(MAX_TOPICS)
        .map(|(w, _)| w.to_string())
        .collect()
}

fn classify(words: &[String]) -> &'static str {
    let has = |needle: &str| words.iter().any(|w| w == needle);

    if has("invoice") || (has("amount") && has("due")) {
        "invoice"
    } else if has("agreement") || has("contract") || has("parties") {
        "contract"
    } else if has("dear") || has("sincerely") {
        "letter"
    } else if has("abstract") || has("findings") || has("report") {
        "report"
    } else {
        "other"
    }
}

fn sentiment(words: &[String]) -> Sentiment {
    let positive = words.iter().filter(|w| POSITIVE_WORDS.contains(&w.as_str())).count();
    let negative = words.iter().filter(|w| NEGATIVE_WORDS.contains(&w.as_str())).count();

    match (positive, negative) {
        (0, 0) => Sentiment::Neutral,
        (p, n) if p > 0 && n > 0 && p.abs_diff(n) <= 1 => Sentiment::Mixed,
        (p, n) if p > n => Sentiment::Positive,
        _ => Sentiment::Negative,
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::{DocumentId, TenantId};

    fn doc() -> DocumentRef {
        DocumentRef::new(TenantId::new(), DocumentId::new())
    }

    #[tokio::test]
    async fn extracts_registered_documents_only() {
        let engine = LocalAnalysisEngine::new();
        let known = doc();
        engine.register_document(known.clone(), "Quarterly report.");

        assert_eq!(engine.extract_content(&known).await.unwrap(), "Quarterly report.");

        let err = engine.extract_content(&doc()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn blank_documents_are_invalid_input() {
        let engine = LocalAnalysisEngine::new();
        let blank = doc();
        engine.register_document(blank.clone(), "   ");

        assert!(matches!(
            engine.extract_content(&blank).await,
            Err(AiError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn analysis_is_deterministic() {
        let engine = LocalAnalysisEngine::new();
        let text = "Invoice 42. The amount is due next month. Payment terms are good. \
                    Payment must reference the invoice number.";

        let first = engine.analyze(text).await.unwrap();
        let second = engine.analyze(text).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.document_type, "invoice");
        assert_eq!(first.word_count, 18);
        assert_eq!(first.key_topics[0], "invoice");
        assert!(first.key_topics.contains(&"payment".to_string()));
        assert_eq!(first.sentiment, Sentiment::Positive);
        assert!(first.summary.starts_with("Invoice 42."));
    }

    #[tokio::test]
    async fn mixed_sentiment_when_lexicons_balance() {
        let engine = LocalAnalysisEngine::new();
        let result = engine
            .analyze("Growth was good but the overdue penalty is a risk.")
            .await
            .unwrap();
        // positive: growth, good (2) / negative: overdue, penalty, risk (3)
        assert_eq!(result.sentiment, Sentiment::Mixed);
    }

    #[tokio::test]
    async fn summary_is_clipped() {
        let engine = LocalAnalysisEngine::new();
        let long_sentence = "word ".repeat(200);
        let result = engine.analyze(&long_sentence).await.unwrap();
        assert!(result.summary.chars().count() <= SUMMARY_MAX_CHARS + 3);
    }

    #[tokio::test]
    async fn embeddings_are_normalised_and_sized() {
        let engine = LocalAnalysisEngine::new().with_dimensions(16);
        let v = engine.embed("alpha beta gamma alpha").await.unwrap();

        assert_eq!(v.len(), 16);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        assert_eq!(v, engine.embed("alpha beta gamma alpha").await.unwrap());
        assert!(engine.embed("  ").await.is_err());
    }
}

//! `docflow-ai`
//!
//! **Responsibility:** boundary to the external, rate-limited analysis service.
//!
//! This crate does not know about queues or transactions:
//! - It turns a document reference into text, an analysis, or an embedding.
//! - It classifies failures as transient or permanent so callers can decide on retries.
//! - It never persists anything.

pub mod engine;
pub mod error;
pub mod http;
pub mod local;

pub use engine::{AnalysisEngine, DocumentAnalysis, DocumentRef, Sentiment};
pub use error::AiError;
pub use http::{HttpAnalysisEngine, HttpEngineConfig};
pub use local::LocalAnalysisEngine;

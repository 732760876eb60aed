//! `docflow-core`: shared building blocks for the document job-processing core.
//!
//! This crate contains identifiers and validation errors only (no I/O).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{DocumentId, JobId, TenantId, WorkerId};

//! Idempotent transactional execution.
//!
//! `TransactionCore::execute_with_idempotency` runs a unit of work inside one
//! database transaction:
//! 1. With an idempotency key, an existing record short-circuits the call:
//!    a different payload is a conflict, a completed record is replayed, a
//!    pending one is reported as in progress.
//! 2. Otherwise a pending record is written in the same transaction as the
//!    operation's own writes.
//! 3. On success the record is completed, the transaction commits, and only then
//!    do the post-commit hooks run.
//! 4. On failure the record is marked failed and the whole transaction rolls
//!    back, so nothing persists and no hooks fire.

pub mod context;
pub mod error;
pub mod failpoint;
pub mod idempotency;
pub mod memory;
pub mod operations;
pub mod postgres;
pub mod store;
pub mod sweeper;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use docflow_observability::redact::{mask_tenant, sanitize_identifier};

pub use context::{OperationContext, PostCommitHooks};
pub use error::{OperationError, TransactionError};
#[cfg(any(test, feature = "test-util"))]
pub use failpoint::FailPoints;
pub use failpoint::{FailPoint, FaultInjector, NoFaults};
pub use idempotency::{IdempotencyRecord, IdempotencyScope, IdempotencyStatus, SCOPE_CONSTRAINT};
pub use memory::InMemoryDatabase;
pub use operations::CreateDocument;
pub use postgres::PgDatabase;
pub use store::{Database, NewDocument, StoreError, UnitOfWork};
pub use sweeper::IdempotencySweeper;

/// A unit of work executed by the transaction core.
#[async_trait]
pub trait TransactionalOperation<Tx: UnitOfWork>: Send + Sync {
    /// Stored as the idempotency response and returned again on replay.
    type Output: Serialize + DeserializeOwned + Send + Sync;

    async fn execute(
        &self,
        tx: &mut Tx,
        ctx: &mut OperationContext,
    ) -> Result<Self::Output, OperationError>;

    /// Identifiers of the rows `output` refers to.
    fn result_refs(&self, _output: &Self::Output) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome<T> {
    pub value: T,
    /// Served from a completed idempotency record without running the operation.
    pub replayed: bool,
    pub record_id: Option<Uuid>,
}

pub struct TransactionCore<D: Database> {
    db: Arc<D>,
    faults: Arc<dyn FaultInjector>,
    idempotency_ttl: Duration,
}

impl<D: Database> Clone for TransactionCore<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            faults: self.faults.clone(),
            idempotency_ttl: self.idempotency_ttl,
        }
    }
}

impl<D: Database> core::fmt::Debug for TransactionCore<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransactionCore")
            .field("faults", &self.faults)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .finish_non_exhaustive()
    }
}

impl<D: Database> TransactionCore<D> {
    pub fn new(db: Arc<D>, idempotency_ttl: Duration) -> Self {
        Self {
            db,
            faults: Arc::new(NoFaults),
            idempotency_ttl,
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    pub async fn execute_with_idempotency<O>(
        &self,
        mut ctx: OperationContext,
        operation: &O,
        request_payload: &Value,
    ) -> Result<ExecutionOutcome<O::Output>, TransactionError>
    where
        O: TransactionalOperation<D::Tx> + ?Sized,
    {
        let started = Instant::now();
        let scope = ctx.scope();

        if let Some(scope) = &scope {
            let existing = self.db.find_idempotency_record(scope, Utc::now()).await?;
            if let Some(record) = existing {
                if record.request_payload != *request_payload {
                    return Err(TransactionError::IdempotencyConflict {
                        key: scope.idempotency_key.clone(),
                    });
                }
                match record.status {
                    IdempotencyStatus::Completed => {
                        let response = record.response_payload.unwrap_or(Value::Null);
                        let value = serde_json::from_value(response)
                            .map_err(|e| TransactionError::Serialization(e.to_string()))?;
                        emit_boundary("replay", &ctx, started);
                        return Ok(ExecutionOutcome {
                            value,
                            replayed: true,
                            record_id: Some(record.id),
                        });
                    }
                    IdempotencyStatus::Pending => {
                        return Err(TransactionError::OperationInProgress {
                            key: scope.idempotency_key.clone(),
                        });
                    }
                    IdempotencyStatus::Failed => {}
                }
            }
        }

        let mut tx = self.db.begin().await?;
        emit_boundary("begin", &ctx, started);

        let record_id = match &scope {
            Some(scope) => {
                let pending = IdempotencyRecord::pending(
                    scope,
                    request_payload.clone(),
                    Utc::now(),
                    self.idempotency_ttl,
                );
                match tx.insert_idempotency_record(&pending).await {
                    Ok(record) => Some(record.id),
                    Err(e) => {
                        self.abort(tx, &ctx, started).await;
                        return Err(match e {
                            StoreError::UniqueViolation(_) => TransactionError::OperationInProgress {
                                key: scope.idempotency_key.clone(),
                            },
                            other => TransactionError::Store(other),
                        });
                    }
                }
            }
            None => None,
        };

        match self.run(&mut tx, &mut ctx, operation, record_id).await {
            Ok(value) => {
                if let Err(e) = tx.commit().await {
                    emit_boundary("rollback", &ctx, started);
                    return Err(match (e, &scope) {
                        (StoreError::UniqueViolation(c), Some(scope)) if c == SCOPE_CONSTRAINT => {
                            TransactionError::OperationInProgress {
                                key: scope.idempotency_key.clone(),
                            }
                        }
                        (other, _) => TransactionError::Store(other),
                    });
                }
                emit_boundary("commit", &ctx, started);

                let hooks = ctx.take_hooks();
                if !hooks.is_empty() {
                    hooks.run().await;
                }

                Ok(ExecutionOutcome {
                    value,
                    replayed: false,
                    record_id,
                })
            }
            Err(err) => {
                if let Some(id) = record_id {
                    // Rolled back with everything else; keeps the in-transaction view consistent.
                    if let Err(e) = tx
                        .finish_idempotency_record(id, IdempotencyStatus::Failed, None, &[])
                        .await
                    {
                        warn!(error = %e, "failed to mark idempotency record failed");
                    }
                }
                self.abort(tx, &ctx, started).await;
                Err(err)
            }
        }
    }

    async fn run<O>(
        &self,
        tx: &mut D::Tx,
        ctx: &mut OperationContext,
        operation: &O,
        record_id: Option<Uuid>,
    ) -> Result<O::Output, TransactionError>
    where
        O: TransactionalOperation<D::Tx> + ?Sized,
    {
        let op_type = ctx.operation_type.clone();

        self.faults.check(&op_type, FailPoint::BeforeOperation)?;
        let value = operation.execute(tx, ctx).await?;
        self.faults.check(&op_type, FailPoint::AfterOperation)?;

        if let Some(id) = record_id {
            let response = serde_json::to_value(&value)
                .map_err(|e| TransactionError::Serialization(e.to_string()))?;
            let refs = operation.result_refs(&value);

            self.faults.check(&op_type, FailPoint::BeforeIdempotencyUpdate)?;
            tx.finish_idempotency_record(id, IdempotencyStatus::Completed, Some(&response), &refs)
                .await?;
        }

        Ok(value)
    }

    async fn abort(&self, tx: D::Tx, ctx: &OperationContext, started: Instant) {
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "transaction rollback failed");
        }
        emit_boundary("rollback", ctx, started);
    }
}

fn emit_boundary(phase: &'static str, ctx: &OperationContext, started: Instant) {
    info!(
        target: "docflow::transaction",
        phase,
        tenant = %mask_tenant(&ctx.tenant_id.to_string()),
        operation = %sanitize_identifier(&ctx.operation_type),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transaction {phase}"
    );
}

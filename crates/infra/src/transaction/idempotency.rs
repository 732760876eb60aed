//! Idempotency records.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use docflow_core::TenantId;

use super::store::StoreError;

/// Name of the unique constraint on `(tenant_id, operation_type, idempotency_key)`.
pub const SCOPE_CONSTRAINT: &str = "idempotency_records_scope_key";

/// The unique key of an idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyScope {
    pub tenant_id: TenantId,
    pub operation_type: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }
}

impl FromStr for IdempotencyStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IdempotencyStatus::Pending),
            "completed" => Ok(IdempotencyStatus::Completed),
            "failed" => Ok(IdempotencyStatus::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown idempotency status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub operation_type: String,
    pub idempotency_key: String,
    /// Compared against later requests to detect key reuse with another payload.
    pub request_payload: Value,
    pub response_payload: Option<Value>,
    pub status: IdempotencyStatus,
    /// Identifiers of rows the operation produced.
    pub result_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(
        scope: &IdempotencyScope,
        request_payload: Value,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: Uuid::now_v7(),
            tenant_id: scope.tenant_id,
            operation_type: scope.operation_type.clone(),
            idempotency_key: scope.idempotency_key.clone(),
            request_payload,
            response_payload: None,
            status: IdempotencyStatus::Pending,
            result_refs: Vec::new(),
            created_at: now,
            expires_at,
        }
    }

    pub fn scope(&self) -> IdempotencyScope {
        IdempotencyScope {
            tenant_id: self.tenant_id,
            operation_type: self.operation_type.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A new execution may reuse this key.
    pub fn can_be_taken_over(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Failed || self.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> IdempotencyScope {
        IdempotencyScope {
            tenant_id: TenantId::new(),
            operation_type: "document_create".into(),
            idempotency_key: "k1".into(),
        }
    }

    #[test]
    fn pending_records_expire_after_ttl() {
        let now = Utc::now();
        let record = IdempotencyRecord::pending(&scope(), json!({"a": 1}), now, Duration::from_secs(60));

        assert_eq!(record.status, IdempotencyStatus::Pending);
        assert_eq!(record.expires_at, now + chrono::Duration::seconds(60));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + chrono::Duration::seconds(60)));
        assert!(!record.can_be_taken_over(now));
        assert!(record.can_be_taken_over(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn failed_records_can_be_taken_over() {
        let now = Utc::now();
        let mut record = IdempotencyRecord::pending(&scope(), json!({}), now, Duration::from_secs(60));
        record.status = IdempotencyStatus::Failed;
        assert!(record.can_be_taken_over(now));
    }
}

//! Fault injection for rollback tests.
//!
//! Production code only ever sees `NoFaults`. `FailPoints` is compiled for
//! tests and for the `test-util` feature.

use serde::Serialize;

use super::error::OperationError;

/// Where inside `execute_with_idempotency` a fault can be raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPoint {
    BeforeOperation,
    AfterOperation,
    BeforeIdempotencyUpdate,
}

impl FailPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailPoint::BeforeOperation => "before_operation",
            FailPoint::AfterOperation => "after_operation",
            FailPoint::BeforeIdempotencyUpdate => "before_idempotency_update",
        }
    }
}

impl core::fmt::Display for FailPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait FaultInjector: Send + Sync + core::fmt::Debug {
    fn check(&self, operation_type: &str, point: FailPoint) -> Result<(), OperationError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn check(&self, _operation_type: &str, _point: FailPoint) -> Result<(), OperationError> {
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use armed::FailPoints;

#[cfg(any(test, feature = "test-util"))]
mod armed {
    use std::collections::HashSet;
    use std::sync::{Mutex, PoisonError};

    use super::{FailPoint, FaultInjector, OperationError};

    /// Set of armed `(operation_type, point)` pairs.
    #[derive(Debug, Default)]
    pub struct FailPoints {
        armed: Mutex<HashSet<(String, FailPoint)>>,
    }

    impl FailPoints {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn arm(&self, operation_type: impl Into<String>, point: FailPoint) {
            self.armed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((operation_type.into(), point));
        }

        pub fn disarm(&self, operation_type: &str, point: FailPoint) {
            self.armed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&(operation_type.to_string(), point));
        }

        pub fn clear(&self) {
            self.armed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    impl FaultInjector for FailPoints {
        fn check(&self, operation_type: &str, point: FailPoint) -> Result<(), OperationError> {
            let armed = self
                .armed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&(operation_type.to_string(), point));

            if armed {
                Err(OperationError::InjectedFault {
                    operation_type: operation_type.to_string(),
                    point,
                })
            } else {
                Ok(())
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn only_armed_points_fire() {
            let faults = FailPoints::new();
            faults.arm("document_create", FailPoint::BeforeIdempotencyUpdate);

            assert!(faults.check("document_create", FailPoint::BeforeOperation).is_ok());
            assert!(faults.check("analysis", FailPoint::BeforeIdempotencyUpdate).is_ok());
            assert!(matches!(
                faults.check("document_create", FailPoint::BeforeIdempotencyUpdate),
                Err(OperationError::InjectedFault { .. })
            ));

            faults.disarm("document_create", FailPoint::BeforeIdempotencyUpdate);
            assert!(faults.check("document_create", FailPoint::BeforeIdempotencyUpdate).is_ok());
        }
    }
}

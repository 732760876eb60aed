//! Request-scoped operation context and post-commit hooks.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use docflow_core::TenantId;

use super::idempotency::IdempotencyScope;

type Hook = BoxFuture<'static, anyhow::Result<()>>;

/// Deferred side effects collected while an operation runs.
///
/// Hooks run only after the owning transaction commits, in registration order.
/// A failing (or panicking) hook is logged and does not affect the others.
/// Held behind a mutex so a borrowed context stays `Send` across awaits.
#[derive(Default)]
pub struct PostCommitHooks {
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl core::fmt::Debug for PostCommitHooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_list()
            .entries(hooks.iter().map(|(name, _)| name))
            .finish()
    }
}

impl PostCommitHooks {
    pub fn register<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.into(), hook.boxed()));
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook. Returns how many failed.
    pub async fn run(self) -> usize {
        let hooks = self.hooks.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut failed = 0;
        for (name, hook) in hooks {
            match AssertUnwindSafe(hook).catch_unwind().await {
                Ok(Ok(())) => debug!(hook = %name, "post-commit hook finished"),
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(hook = %name, error = %e, "post-commit hook failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(hook = %name, "post-commit hook panicked");
                }
            }
        }
        failed
    }
}

/// Context passed explicitly through one `execute_with_idempotency` call.
///
/// It is created per request and consumed by the transaction core, so hooks
/// registered by one request can never leak into another.
#[derive(Debug)]
pub struct OperationContext {
    pub tenant_id: TenantId,
    pub operation_type: String,
    pub idempotency_key: Option<String>,
    hooks: PostCommitHooks,
}

impl OperationContext {
    pub fn new(tenant_id: TenantId, operation_type: impl Into<String>) -> Self {
        Self {
            tenant_id,
            operation_type: operation_type.into(),
            idempotency_key: None,
            hooks: PostCommitHooks::default(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Defer `hook` until after the transaction commits.
    pub fn after_commit<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.register(name, hook);
    }

    pub fn pending_hooks(&self) -> usize {
        self.hooks.len()
    }

    pub fn scope(&self) -> Option<IdempotencyScope> {
        self.idempotency_key.as_ref().map(|key| IdempotencyScope {
            tenant_id: self.tenant_id,
            operation_type: self.operation_type.clone(),
            idempotency_key: key.clone(),
        })
    }

    pub(crate) fn take_hooks(&mut self) -> PostCommitHooks {
        std::mem::take(&mut self.hooks)
    }
}

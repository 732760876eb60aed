//! Periodic purge of expired idempotency records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::store::{Database, StoreError};
use crate::shutdown::ShutdownSignal;

#[derive(Debug)]
pub struct IdempotencySweeper<D: Database> {
    db: Arc<D>,
    interval: Duration,
}

impl<D: Database> IdempotencySweeper<D> {
    pub fn new(db: Arc<D>, interval: Duration) -> Self {
        Self { db, interval }
    }

    pub async fn sweep_once(&self) -> Result<u64, StoreError> {
        let purged = self.db.purge_expired_idempotency(Utc::now()).await?;
        if purged > 0 {
            info!(purged, "expired idempotency records purged");
        } else {
            debug!("no expired idempotency records");
        }
        Ok(purged)
    }

    /// Sweep on every interval until shutdown is triggered.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "idempotency sweep failed");
                    }
                }
                _ = shutdown.triggered() => break,
            }
        }
        debug!("idempotency sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::{DocumentId, TenantId};

    use crate::shutdown::{ShutdownController, ShutdownReason};
    use crate::transaction::{CreateDocument, InMemoryDatabase, NewDocument, TransactionCore};

    #[tokio::test]
    async fn purges_only_expired_records() {
        let db = Arc::new(InMemoryDatabase::new());
        let tenant = TenantId::new();
        let short = TransactionCore::new(db.clone(), Duration::from_millis(1));
        let long = TransactionCore::new(db.clone(), Duration::from_secs(3600));

        for (core, key) in [(&short, "short-lived"), (&long, "long-lived")] {
            let op = CreateDocument::new(NewDocument {
                tenant_id: tenant,
                document_id: DocumentId::new(),
                title: key.to_string(),
                source_uri: None,
            });
            core.execute_with_idempotency(op.context(Some(key.into())), &op, &op.request_payload())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sweeper = IdempotencySweeper::new(db.clone(), Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(db.count_idempotency_records(tenant).await.unwrap(), 1);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let controller = ShutdownController::new(Duration::from_secs(1));
        let sweeper = IdempotencySweeper::new(Arc::new(InMemoryDatabase::new()), Duration::from_secs(60));
        let task = tokio::spawn(sweeper.run(controller.subscribe()));

        controller.trigger(ShutdownReason::Requested);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Returns jobs whose worker vanished to the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::store::{JobStoreError, SharedJobStore};
use super::types::QueueJob;
use crate::shutdown::ShutdownSignal;

/// Lease reaper.
///
/// A job `processing` for longer than the lease timeout is assumed abandoned
/// (crashed or force-killed worker) and goes back to `pending` with its attempt
/// count preserved.
pub struct LeaseReaper {
    store: SharedJobStore,
    lease_timeout: Duration,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(store: SharedJobStore, lease_timeout: Duration, interval: Duration) -> Self {
        Self {
            store,
            lease_timeout,
            interval,
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub async fn reap_once(&self) -> Result<Vec<QueueJob>, JobStoreError> {
        let reclaimed = self.store.reclaim_stale(self.cutoff(Utc::now())).await?;
        for job in &reclaimed {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt_count,
                reason = job.last_error.as_deref().unwrap_or_default(),
                "stale job returned to queue"
            );
        }
        Ok(reclaimed)
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        warn!(error = %e, "lease reaper pass failed");
                    }
                }
                _ = shutdown.triggered() => break,
            }
        }
        info!("lease reaper stopped");
    }
}

//! Queue metrics: in-process counters and periodic snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jobs::retry::DeadLetterCause;
use crate::jobs::store::{JobStoreError, SharedJobStore};
use crate::shutdown::ShutdownSignal;

/// Counters accumulated since the last snapshot.
#[derive(Debug, Default)]
pub struct QueueCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    poison_pills: AtomicU64,
    dead_lettered: AtomicU64,
    processing_ms: AtomicU64,
}

/// A drained set of counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterWindow {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub poison_pills: u64,
    pub dead_lettered: u64,
    pub processing_ms: u64,
}

impl CounterWindow {
    /// Mean processing time of the window; 0 when nothing was processed.
    pub fn avg_processing_time_ms(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.processing_ms as f64 / self.processed as f64
        }
    }
}

impl QueueCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.processing_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.processed(elapsed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, elapsed: Duration) {
        self.processed(elapsed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self, cause: DeadLetterCause, elapsed: Duration) {
        self.processed(elapsed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if cause == DeadLetterCause::PoisonPill {
            self.poison_pills.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current values, without resetting.
    pub fn peek(&self) -> CounterWindow {
        CounterWindow {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            poison_pills: self.poison_pills.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            processing_ms: self.processing_ms.load(Ordering::Relaxed),
        }
    }

    /// Read and reset every counter.
    ///
    /// Each event lands in exactly one window.
    pub fn drain(&self) -> CounterWindow {
        CounterWindow {
            processed: self.processed.swap(0, Ordering::AcqRel),
            succeeded: self.succeeded.swap(0, Ordering::AcqRel),
            failed: self.failed.swap(0, Ordering::AcqRel),
            retried: self.retried.swap(0, Ordering::AcqRel),
            poison_pills: self.poison_pills.swap(0, Ordering::AcqRel),
            dead_lettered: self.dead_lettered.swap(0, Ordering::AcqRel),
            processing_ms: self.processing_ms.swap(0, Ordering::AcqRel),
        }
    }
}

/// Append-only record produced by the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetricsSnapshot {
    pub id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub queue_depth: u64,
    pub processing_depth: u64,
    pub dlq_depth: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub poison_pills: u64,
    pub avg_processing_time_ms: f64,
    pub active_workers: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error("metrics storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn append(&self, snapshot: &QueueMetricsSnapshot) -> Result<(), MetricsError>;

    /// Most recent snapshots first.
    async fn recent(&self, limit: usize) -> Result<Vec<QueueMetricsSnapshot>, MetricsError>;
}

#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    snapshots: Mutex<Vec<QueueMetricsSnapshot>>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn append(&self, snapshot: &QueueMetricsSnapshot) -> Result<(), MetricsError> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(snapshot.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<QueueMetricsSnapshot>, MetricsError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshots.iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresMetricsStore {
    pool: Arc<PgPool>,
}

impl PostgresMetricsStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl MetricsStore for PostgresMetricsStore {
    async fn append(&self, s: &QueueMetricsSnapshot) -> Result<(), MetricsError> {
        sqlx::query(
            r#"
            INSERT INTO queue_metrics_snapshots (
                id, captured_at, queue_depth, processing_depth, dlq_depth, processed,
                succeeded, failed, retried, poison_pills, avg_processing_time_ms, active_workers
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(s.id)
        .bind(s.captured_at)
        .bind(to_i64(s.queue_depth))
        .bind(to_i64(s.processing_depth))
        .bind(to_i64(s.dlq_depth))
        .bind(to_i64(s.processed))
        .bind(to_i64(s.succeeded))
        .bind(to_i64(s.failed))
        .bind(to_i64(s.retried))
        .bind(to_i64(s.poison_pills))
        .bind(s.avg_processing_time_ms)
        .bind(i32::try_from(s.active_workers).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await
        .map_err(|e| MetricsError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<QueueMetricsSnapshot>, MetricsError> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"
            SELECT id, captured_at, queue_depth, processing_depth, dlq_depth, processed,
                   succeeded, failed, retried, poison_pills, avg_processing_time_ms, active_workers
            FROM queue_metrics_snapshots
            ORDER BY captured_at DESC
            LIMIT $1
            "#,
        )
        .bind(to_i64(limit as u64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| MetricsError::Storage(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let n = |col: &str| -> Result<u64, sqlx::Error> {
                    Ok(row.try_get::<i64, _>(col)?.max(0) as u64)
                };
                Ok(QueueMetricsSnapshot {
                    id: row.try_get("id")?,
                    captured_at: row.try_get("captured_at")?,
                    queue_depth: n("queue_depth")?,
                    processing_depth: n("processing_depth")?,
                    dlq_depth: n("dlq_depth")?,
                    processed: n("processed")?,
                    succeeded: n("succeeded")?,
                    failed: n("failed")?,
                    retried: n("retried")?,
                    poison_pills: n("poison_pills")?,
                    avg_processing_time_ms: row.try_get("avg_processing_time_ms")?,
                    active_workers: row.try_get::<i32, _>("active_workers")?.max(0) as u32,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| MetricsError::Storage(e.to_string()))
    }
}

/// Source of the active-worker gauge.
pub trait ActivityGauge: Send + Sync {
    fn active_workers(&self) -> usize;
}

/// Periodically snapshots queue depth and drains the counters.
pub struct MetricsCollector {
    jobs: SharedJobStore,
    counters: Arc<QueueCounters>,
    sink: Arc<dyn MetricsStore>,
    gauge: Option<Arc<dyn ActivityGauge>>,
    interval: Duration,
}

impl MetricsCollector {
    pub fn new(
        jobs: SharedJobStore,
        counters: Arc<QueueCounters>,
        sink: Arc<dyn MetricsStore>,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            counters,
            sink,
            gauge: None,
            interval,
        }
    }

    pub fn with_gauge(mut self, gauge: Arc<dyn ActivityGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub async fn collect_once(&self) -> Result<QueueMetricsSnapshot, MetricsError> {
        // Depth first: if it fails the counters keep accumulating for the next round.
        let depth = self.jobs.depth().await?;
        let window = self.counters.drain();
        let active = self.gauge.as_ref().map_or(0, |g| g.active_workers());

        let snapshot = QueueMetricsSnapshot {
            id: Uuid::now_v7(),
            captured_at: Utc::now(),
            queue_depth: depth.pending,
            processing_depth: depth.processing,
            dlq_depth: depth.dlq,
            processed: window.processed,
            succeeded: window.succeeded,
            failed: window.failed,
            retried: window.retried,
            poison_pills: window.poison_pills,
            avg_processing_time_ms: window.avg_processing_time_ms(),
            active_workers: u32::try_from(active).unwrap_or(u32::MAX),
        };

        self.sink.append(&snapshot).await?;
        debug!(
            queue_depth = snapshot.queue_depth,
            dlq_depth = snapshot.dlq_depth,
            processed = snapshot.processed,
            "queue metrics snapshot stored"
        );
        Ok(snapshot)
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so windows have full length.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.collect_once().await {
                        warn!(error = %e, "queue metrics collection failed");
                    }
                }
                _ = shutdown.triggered() => break,
            }
        }
        info!("metrics collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::{JobType, NewJob};
    use docflow_core::{DocumentId, TenantId, WorkerId};

    struct FixedGauge(usize);

    impl ActivityGauge for FixedGauge {
        fn active_workers(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn drain_resets_counters() {
        let counters = QueueCounters::new();
        counters.record_success(Duration::from_millis(100));
        counters.record_retry(Duration::from_millis(300));
        counters.record_dead_letter(DeadLetterCause::PoisonPill, Duration::from_millis(200));

        let window = counters.drain();
        assert_eq!(window.processed, 3);
        assert_eq!(window.succeeded, 1);
        assert_eq!(window.failed, 2);
        assert_eq!(window.retried, 1);
        assert_eq!(window.poison_pills, 1);
        assert_eq!(window.dead_lettered, 1);
        assert_eq!(window.avg_processing_time_ms(), 200.0);

        assert_eq!(counters.peek(), CounterWindow::default());
        assert_eq!(counters.drain().avg_processing_time_ms(), 0.0);
    }

    #[tokio::test]
    async fn snapshot_reads_depth_and_windows_counters() {
        let jobs = InMemoryJobStore::arc();
        let worker = WorkerId::new("w1").unwrap();
        for _ in 0..3 {
            jobs.enqueue(NewJob::new(TenantId::new(), DocumentId::new(), JobType::Analysis))
                .await
                .unwrap();
        }
        jobs.claim_next(JobType::Analysis, &worker).await.unwrap();

        let counters = Arc::new(QueueCounters::new());
        let sink = Arc::new(InMemoryMetricsStore::new());
        let collector = MetricsCollector::new(
            jobs.clone(),
            counters.clone(),
            sink.clone(),
            Duration::from_secs(60),
        )
        .with_gauge(Arc::new(FixedGauge(1)));

        counters.record_success(Duration::from_millis(40));
        counters.record_success(Duration::from_millis(60));

        let first = collector.collect_once().await.unwrap();
        assert_eq!(first.queue_depth, 2);
        assert_eq!(first.processing_depth, 1);
        assert_eq!(first.dlq_depth, 0);
        assert_eq!(first.processed, 2);
        assert_eq!(first.avg_processing_time_ms, 50.0);
        assert_eq!(first.active_workers, 1);

        counters.record_retry(Duration::from_millis(10));
        let second = collector.collect_once().await.unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.succeeded, 0);
        assert_eq!(second.retried, 1);

        let third = collector.collect_once().await.unwrap();
        assert_eq!(third.processed, 0);
        assert_eq!(third.avg_processing_time_ms, 0.0);

        let recent = sink.recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, third.id);
    }
}

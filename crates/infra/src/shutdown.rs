//! Graceful shutdown.
//!
//! Signals and panics in supervised tasks funnel into one `ShutdownController`. Background loops
//! hold a `ShutdownSignal`; the binary drains the worker pool and exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::jobs::scheduler::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    Panic,
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight job finished within the grace period.
    Graceful,
    /// The grace period ran out with jobs still running.
    Forced { in_flight: usize },
}

impl ShutdownOutcome {
    pub fn is_forced(&self) -> bool {
        matches!(self, ShutdownOutcome::Forced { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
    grace: Duration,
}

/// Receiving side handed to background loops.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolves once shutdown has been triggered. Cancel safe.
    pub async fn triggered(&mut self) -> ShutdownReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                // Controller dropped.
                return (*self.rx.borrow()).unwrap_or(ShutdownReason::Requested);
            }
        }
    }
}

fn trigger_on(tx: &watch::Sender<Option<ShutdownReason>>, reason: ShutdownReason) -> bool {
    tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    })
}

impl ShutdownController {
    pub fn new(grace: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Start shutting down. Only the first reason is kept.
    pub fn trigger(&self, reason: ShutdownReason) {
        if trigger_on(&self.tx, reason) {
            info!(reason = ?reason, "shutdown triggered");
        }
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger on SIGINT, SIGTERM or SIGQUIT (Ctrl-C outside unix).
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(name) => {
                    info!(signal = name, "received shutdown signal");
                    controller.trigger(ShutdownReason::Signal(name));
                }
                Err(e) => error!(error = %e, "failed to install signal handlers"),
            }
        })
    }

    /// Watch a top-level task. If it panics, shut the process down.
    ///
    /// Panics caught inside the task (a job body, a post-commit hook) never
    /// reach this point.
    pub fn supervise(&self, task: &'static str, handle: JoinHandle<()>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    error!(task, "background task panicked");
                    controller.trigger(ShutdownReason::Panic);
                }
                Err(e) => warn!(task, error = %e, "background task cancelled"),
            }
        })
    }

    /// Stop claiming, then wait up to the grace period for in-flight jobs.
    pub async fn drain(&self, pool: &WorkerPool) -> ShutdownOutcome {
        pool.pause();
        pool.stop();

        info!(
            in_flight = pool.in_flight(),
            grace_ms = self.grace.as_millis() as u64,
            "draining worker pool"
        );

        if pool.wait_idle(self.grace).await {
            info!("worker pool drained");
            ShutdownOutcome::Graceful
        } else {
            let in_flight = pool.in_flight();
            warn!(in_flight, "grace period elapsed with jobs still running");
            ShutdownOutcome::Forced { in_flight }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl_c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use docflow_core::{DocumentId, TenantId, WorkerId};

    use crate::jobs::scheduler::{JobProcessor, SchedulerConfig};
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::{JobType, NewJob, QueueJob};
    use crate::transaction::PostCommitHooks;

    struct Stuck;

    #[async_trait]
    impl JobProcessor for Stuck {
        async fn process(&self, _job: QueueJob) {
            std::future::pending::<()>().await;
        }
    }

    fn pool(store: Arc<InMemoryJobStore>) -> WorkerPool {
        WorkerPool::new(
            SchedulerConfig::default(),
            store,
            Arc::new(Stuck),
            WorkerId::new("shutdown-test").unwrap(),
        )
    }

    #[tokio::test]
    async fn first_reason_wins() {
        let controller = ShutdownController::new(Duration::from_secs(1));
        let mut early = controller.subscribe();
        assert!(!early.is_triggered());

        controller.trigger(ShutdownReason::Signal("SIGTERM"));
        controller.trigger(ShutdownReason::Panic);

        assert_eq!(early.triggered().await, ShutdownReason::Signal("SIGTERM"));
        let mut late = controller.subscribe();
        assert!(late.is_triggered());
        assert_eq!(late.triggered().await, ShutdownReason::Signal("SIGTERM"));
        assert_eq!(controller.reason(), Some(ShutdownReason::Signal("SIGTERM")));
    }

    #[tokio::test]
    async fn dropped_controller_releases_waiters() {
        let controller = ShutdownController::new(Duration::from_secs(1));
        let mut signal = controller.subscribe();
        drop(controller);
        assert_eq!(signal.triggered().await, ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn panicking_task_triggers_shutdown() {
        let controller = ShutdownController::new(Duration::from_secs(1));
        controller
            .supervise("reaper", tokio::spawn(async { panic!("reaper bug") }))
            .await
            .unwrap();
        assert_eq!(controller.reason(), Some(ShutdownReason::Panic));
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("hook bug")
    }

    #[tokio::test]
    async fn contained_panics_do_not_trigger_shutdown() {
        let controller = ShutdownController::new(Duration::from_secs(1));
        let failed = Arc::new(AtomicUsize::new(0));

        let counted = failed.clone();
        let task = tokio::spawn(async move {
            let mut hooks = PostCommitHooks::default();
            hooks.register("explodes", explode());
            hooks.register("fine", async { Ok(()) });
            counted.store(hooks.run().await, Ordering::SeqCst);
        });

        controller.supervise("scheduler", task).await.unwrap();
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(controller.reason(), None);
    }

    #[tokio::test]
    async fn finished_task_leaves_controller_idle() {
        let controller = ShutdownController::new(Duration::from_secs(1));
        controller
            .supervise("sweeper", tokio::spawn(async {}))
            .await
            .unwrap();
        assert_eq!(controller.reason(), None);
    }

    #[tokio::test]
    async fn idle_pool_drains_gracefully() {
        let controller = ShutdownController::new(Duration::from_millis(100));
        let pool = pool(InMemoryJobStore::arc());

        assert_eq!(controller.drain(&pool).await, ShutdownOutcome::Graceful);
        assert!(pool.is_paused());
        assert!(pool.is_stopped());
    }

    #[tokio::test]
    async fn stuck_job_forces_exit_after_grace() {
        let store = InMemoryJobStore::arc();
        store
            .enqueue(NewJob::new(TenantId::new(), DocumentId::new(), JobType::Analysis))
            .await
            .unwrap();
        let pool = pool(store.clone());
        assert_eq!(pool.tick().await, 1);

        let controller = ShutdownController::new(Duration::from_millis(50));
        let outcome = controller.drain(&pool).await;
        assert_eq!(outcome, ShutdownOutcome::Forced { in_flight: 1 });
        assert!(outcome.is_forced());

        // The job stays processing for the lease reaper.
        assert_eq!(store.depth().await.unwrap().processing, 1);
    }
}

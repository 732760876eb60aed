//! Document job worker.
//!
//! Runs the scheduler, lease reaper, metrics collector and idempotency sweeper
//! against Postgres until a signal (or a panic) triggers shutdown.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use docflow_ai::{AnalysisEngine, HttpAnalysisEngine};
use docflow_infra::config::Settings;
use docflow_infra::jobs::{
    FollowUp, JobRunner, LeaseReaper, PostgresJobStore, RetryController, SharedJobStore,
    WorkerPool, document_handlers,
};
use docflow_infra::metrics::{MetricsCollector, PostgresMetricsStore, QueueCounters};
use docflow_infra::schema::ensure_schema;
use docflow_infra::shutdown::{ShutdownController, ShutdownOutcome};
use docflow_infra::transaction::{IdempotencySweeper, PgDatabase, TransactionCore};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine; real deployments use the environment.
    let _ = dotenvy::dotenv();
    docflow_observability::init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "worker failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let settings = Settings::load().context("failed to load configuration")?;
    let worker = settings.worker_id().context("invalid worker instance id")?;

    let pg = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await
        .context("failed to connect to Postgres")?;
    ensure_schema(&pg).await.context("failed to apply schema")?;

    let engine: Arc<dyn AnalysisEngine> = Arc::new(
        HttpAnalysisEngine::new(settings.engine_config())
            .context("failed to build analysis engine client")?,
    );

    let jobs: SharedJobStore = Arc::new(PostgresJobStore::new(pg.clone()));
    let db = Arc::new(PgDatabase::new(pg.clone()));
    let counters = Arc::new(QueueCounters::new());

    let follow_up = settings
        .worker
        .chain_follow_up_jobs
        .then(|| FollowUp::new(jobs.clone(), settings.retry.max_attempts));
    let runner = JobRunner::new(
        jobs.clone(),
        TransactionCore::new(db.clone(), settings.idempotency_ttl()),
        document_handlers(engine, follow_up),
        Arc::new(RetryController::new(
            settings.retry_policy(),
            settings.poison_pill_policy(),
        )),
        counters.clone(),
        worker.clone(),
    );
    let workers = WorkerPool::new(
        settings.scheduler_config(),
        jobs.clone(),
        Arc::new(runner),
        worker.clone(),
    );

    let shutdown = ShutdownController::new(settings.shutdown_grace());
    shutdown.listen_for_signals();

    let scheduler = shutdown.supervise("scheduler", workers.spawn());
    let background = [
        shutdown.supervise(
            "lease_reaper",
            tokio::spawn(
                LeaseReaper::new(jobs.clone(), settings.lease_timeout(), settings.reaper_interval())
                    .run(shutdown.subscribe()),
            ),
        ),
        shutdown.supervise(
            "metrics_collector",
            tokio::spawn(
                MetricsCollector::new(
                    jobs.clone(),
                    counters,
                    Arc::new(PostgresMetricsStore::new(pg.clone())),
                    settings.metrics_interval(),
                )
                .with_gauge(Arc::new(workers.clone()))
                .run(shutdown.subscribe()),
            ),
        ),
        shutdown.supervise(
            "idempotency_sweeper",
            tokio::spawn(
                IdempotencySweeper::new(db, settings.sweep_interval()).run(shutdown.subscribe()),
            ),
        ),
    ];

    info!(worker = %worker, "docflow worker started");
    let reason = shutdown.subscribe().triggered().await;
    info!(?reason, "shutting down");

    let outcome = shutdown.drain(&workers).await;
    if let Err(e) = scheduler.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    for task in background {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    match outcome {
        ShutdownOutcome::Graceful => {
            pg.close().await;
            info!("docflow worker stopped");
            Ok(ExitCode::SUCCESS)
        }
        ShutdownOutcome::Forced { in_flight } => {
            // Left `processing`; the lease reaper of a later worker reclaims them.
            error!(in_flight, "forced exit with jobs still running");
            Ok(ExitCode::FAILURE)
        }
    }
}

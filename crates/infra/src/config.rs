//! Worker configuration.
//!
//! Layered: optional `config/default.toml`, optional `config/{DOCFLOW_ENV}.toml`,
//! then `DOCFLOW__SECTION__KEY` environment variables.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

use docflow_ai::HttpEngineConfig;
use docflow_core::WorkerId;

use crate::jobs::retry::{PoisonPillPolicy, RetryPolicy};
use crate::jobs::scheduler::SchedulerConfig;
use crate::jobs::types::{DEFAULT_MAX_ATTEMPTS, JobType};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub poison_pill: PoisonPillSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// `PostgreSQL` connection URL.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Generated per process when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub max_workers: MaxWorkers,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    /// Enqueue `analysis` after extraction and `embedding_generation` after analysis.
    #[serde(default = "default_true")]
    pub chain_follow_up_jobs: bool,
}

/// Concurrency cap per job type.
#[derive(Debug, Clone, Deserialize)]
pub struct MaxWorkers {
    #[serde(default = "default_lane_size")]
    pub content_extraction: usize,
    #[serde(default = "default_lane_size")]
    pub analysis: usize,
    #[serde(default = "default_lane_size")]
    pub embedding_generation: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoisonPillSettings {
    #[serde(default = "default_poison_threshold")]
    pub threshold: u32,
    #[serde(default = "default_poison_window_ms")]
    pub window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_rate_limited_types")]
    pub rate_limited_types: Vec<JobType>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencySettings {
    #[serde(default = "default_idempotency_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_engine_base_url")]
    pub base_url: String,
    #[serde(default = "default_engine_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub api_key: Option<String>,
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_tick_interval_ms() -> u64 {
    1_000
}

const fn default_lane_size() -> usize {
    2
}

const fn default_shutdown_grace_ms() -> u64 {
    30_000
}

const fn default_lease_timeout_ms() -> u64 {
    600_000
}

const fn default_reaper_interval_ms() -> u64 {
    60_000
}

const fn default_true() -> bool {
    true
}

const fn default_initial_backoff_ms() -> u64 {
    5_000
}

const fn default_max_backoff_ms() -> u64 {
    300_000
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_poison_threshold() -> u32 {
    3
}

const fn default_poison_window_ms() -> u64 {
    60_000
}

const fn default_requests_per_minute() -> u32 {
    60
}

fn default_rate_limited_types() -> Vec<JobType> {
    vec![JobType::Analysis, JobType::EmbeddingGeneration]
}

const fn default_metrics_interval_ms() -> u64 {
    60_000
}

const fn default_idempotency_ttl_ms() -> u64 {
    86_400_000
}

const fn default_sweep_interval_ms() -> u64 {
    3_600_000
}

fn default_engine_base_url() -> String {
    "http://localhost:8081".to_string()
}

const fn default_engine_timeout_ms() -> u64 {
    30_000
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            instance_id: None,
            tick_interval_ms: default_tick_interval_ms(),
            max_workers: MaxWorkers::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            chain_follow_up_jobs: true,
        }
    }
}

impl Default for MaxWorkers {
    fn default() -> Self {
        Self {
            content_extraction: default_lane_size(),
            analysis: default_lane_size(),
            embedding_generation: default_lane_size(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for PoisonPillSettings {
    fn default() -> Self {
        Self {
            threshold: default_poison_threshold(),
            window_ms: default_poison_window_ms(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            rate_limited_types: default_rate_limited_types(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_metrics_interval_ms(),
        }
    }
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_idempotency_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: default_engine_base_url(),
            timeout_ms: default_engine_timeout_ms(),
            api_key: None,
        }
    }
}

impl Settings {
    /// Load from `config/` files and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("DOCFLOW_ENV").unwrap_or_else(|_| "development".to_string());

        let settings: Self = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("DOCFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load from a specific file, still honouring environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("DOCFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("worker.tick_interval_ms", self.worker.tick_interval_ms),
            ("worker.lease_timeout_ms", self.worker.lease_timeout_ms),
            ("worker.reaper_interval_ms", self.worker.reaper_interval_ms),
            ("metrics.interval_ms", self.metrics.interval_ms),
            ("idempotency.ttl_ms", self.idempotency.ttl_ms),
            ("idempotency.sweep_interval_ms", self.idempotency.sweep_interval_ms),
            ("retry.initial_backoff_ms", self.retry.initial_backoff_ms),
            ("engine.timeout_ms", self.engine.timeout_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Message(format!("{key} must be greater than 0")));
            }
        }

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ConfigError::Message(
                "retry.max_backoff_ms must be at least retry.initial_backoff_ms".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::Message(
                "rate_limit.requests_per_minute must be at least 1".to_string(),
            ));
        }
        if let Some(id) = &self.worker.instance_id {
            WorkerId::new(id.clone()).map_err(|e| ConfigError::Message(e.to_string()))?;
        }
        Ok(())
    }

    /// The configured instance id, or a freshly generated one.
    pub fn worker_id(&self) -> Result<WorkerId, ConfigError> {
        match &self.worker.instance_id {
            Some(id) => WorkerId::new(id.clone()).map_err(|e| ConfigError::Message(e.to_string())),
            None => Ok(WorkerId::generate()),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let lanes = &self.worker.max_workers;
        let max_workers: HashMap<JobType, usize> = [
            (JobType::ContentExtraction, lanes.content_extraction),
            (JobType::Analysis, lanes.analysis),
            (JobType::EmbeddingGeneration, lanes.embedding_generation),
        ]
        .into_iter()
        .collect();
        let rate_limited: HashSet<JobType> =
            self.rate_limit.rate_limited_types.iter().copied().collect();

        SchedulerConfig {
            tick_interval: Duration::from_millis(self.worker.tick_interval_ms),
            max_workers,
            rate_limited,
            requests_per_minute: self.rate_limit.requests_per_minute,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.initial_backoff_ms),
            Duration::from_millis(self.retry.max_backoff_ms),
        )
    }

    pub fn poison_pill_policy(&self) -> PoisonPillPolicy {
        PoisonPillPolicy {
            threshold: self.poison_pill.threshold,
            window: Duration::from_millis(self.poison_pill.window_ms),
        }
    }

    pub fn engine_config(&self) -> HttpEngineConfig {
        HttpEngineConfig {
            base_url: self.engine.base_url.clone(),
            timeout: Duration::from_millis(self.engine.timeout_ms),
            api_key: self.engine.api_key.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.worker.shutdown_grace_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.lease_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.worker.reaper_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics.interval_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idempotency.sweep_interval_ms)
    }
}

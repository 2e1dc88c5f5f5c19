//! Configuration management for the harvester.
//!
//! Configuration is loaded from, in order:
//! 1. Default values
//! 2. Config files (`config/harvest.{toml,yaml}`, or an explicit path)
//! 3. Environment variables prefixed with `HARVEST`, nested with `__`
//!    (e.g. `HARVEST__SCHEDULER__DEFAULT_COOLDOWN_SECS=10`)
//!
//! The raw [`HarvestConfig`] is turned into typed [`HarvestSettings`] that the
//! scheduling components consume.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Main harvester configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Endpoint scheduler defaults.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Monthly reconciliation.
    #[serde(default)]
    pub automatic: AutomaticConfig,
    /// Report client.
    #[serde(default)]
    pub client: ClientConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HarvestConfig {
    /// Load configuration from files and environment, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = Self::load_unchecked(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(path: Option<&str>) -> Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/harvest").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("HARVEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Check value combinations the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.scheduler.job_time_limit_secs == 0 {
            problems.push(
                "scheduler.job_time_limit_secs must be positive, otherwise every claimed \
                 endpoint is immediately considered stuck"
                    .to_string(),
            );
        }
        if self.scheduler.tick_interval_secs == 0 || self.scheduler.sweep_interval_secs == 0 {
            problems.push("scheduler tick and sweep intervals must be positive".to_string());
        }
        if self.retry.max_retry_count == 0 {
            problems.push(
                "retry.max_retry_count must be at least 1; set retry.data_not_ready_delay_secs \
                 instead to slow retries down"
                    .to_string(),
            );
        }
        let transient_floor = self
            .scheduler
            .service_busy_delay_secs
            .max(self.scheduler.service_not_available_delay_secs);
        if self.retry.transient_ceiling_secs < transient_floor {
            problems.push(format!(
                "retry.transient_ceiling_secs ({}) is below the service busy/unavailable delay \
                 ({transient_floor}); such errors would never be retried",
                self.retry.transient_ceiling_secs
            ));
        }
        if self.automatic.reconcile_interval_secs == 0 {
            problems.push("automatic.reconcile_interval_secs must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(HarvestError::Config(problems.join("; ")))
        }
    }

    /// Typed settings for the scheduling components.
    #[must_use]
    pub fn settings(&self) -> HarvestSettings {
        HarvestSettings {
            scheduler: SchedulerDefaults {
                cooldown: secs(self.scheduler.default_cooldown_secs),
                too_many_requests_delay: secs(self.scheduler.too_many_requests_delay_secs),
                service_not_available_delay: secs(
                    self.scheduler.service_not_available_delay_secs,
                ),
                service_busy_delay: secs(self.scheduler.service_busy_delay_secs),
            },
            retry: RetryPolicy {
                data_not_ready_delay: secs(self.retry.data_not_ready_delay_secs),
                max_retry_count: self.retry.max_retry_count,
                transient_ceiling: secs(self.retry.transient_ceiling_secs),
                no_data_grace: Duration::days(i64::from(self.retry.no_data_grace_days)),
            },
            job_time_limit: secs(self.scheduler.job_time_limit_secs),
            automatic_trigger_offset: Duration::hours(i64::from(
                self.automatic.trigger_offset_hours,
            )),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the `SQLite` database file.
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Defaults applied to lazily created endpoint schedulers, plus runtime cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Minimum spacing between two requests to one endpoint.
    #[serde(default = "default_cooldown")]
    pub default_cooldown_secs: u64,
    /// Endpoint-wide pause after a "too many requests" answer.
    #[serde(default = "default_provider_delay")]
    pub too_many_requests_delay_secs: u64,
    /// Initial endpoint-wide pause after "service not available".
    #[serde(default = "default_provider_delay")]
    pub service_not_available_delay_secs: u64,
    /// Initial endpoint-wide pause after "service busy".
    #[serde(default = "default_provider_delay")]
    pub service_busy_delay_secs: u64,
    /// Claims older than this are considered stuck.
    #[serde(default = "default_job_time_limit")]
    pub job_time_limit_secs: u64,
    /// How often endpoints with due work are enumerated.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// How often stuck schedulers are swept.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_cooldown_secs: default_cooldown(),
            too_many_requests_delay_secs: default_provider_delay(),
            service_not_available_delay_secs: default_provider_delay(),
            service_busy_delay_secs: default_provider_delay(),
            job_time_limit_secs: default_job_time_limit(),
            tick_interval_secs: default_tick_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Fixed delay between "data not ready" / "no data" retries.
    #[serde(default = "default_data_not_ready_delay")]
    pub data_not_ready_delay_secs: u64,
    /// Maximum number of "data not ready" / "no data" retries.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Backoff ceiling for service busy / not available.
    #[serde(default = "default_transient_ceiling")]
    pub transient_ceiling_secs: u64,
    /// "No data" retries stop this many days after the report period ends.
    #[serde(default = "default_no_data_grace_days")]
    pub no_data_grace_days: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            data_not_ready_delay_secs: default_data_not_ready_delay(),
            max_retry_count: default_max_retry_count(),
            transient_ceiling_secs: default_transient_ceiling(),
            no_data_grace_days: default_no_data_grace_days(),
        }
    }
}

/// Monthly reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomaticConfig {
    /// Offset into the following month at which planned fetches become eligible.
    #[serde(default = "default_trigger_offset_hours")]
    pub trigger_offset_hours: u32,
    /// How often the daemon reconciles.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

impl Default for AutomaticConfig {
    fn default() -> Self {
        Self {
            trigger_offset_hours: default_trigger_offset_hours(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

/// Report client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_client_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Delays copied onto a scheduler row when it is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerDefaults {
    pub cooldown: Duration,
    pub too_many_requests_delay: Duration,
    pub service_not_available_delay: Duration,
    pub service_busy_delay: Duration,
}

/// Limits for the retry handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub data_not_ready_delay: Duration,
    pub max_retry_count: u32,
    pub transient_ceiling: Duration,
    pub no_data_grace: Duration,
}

/// Typed settings derived from [`HarvestConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestSettings {
    pub scheduler: SchedulerDefaults,
    pub retry: RetryPolicy,
    pub job_time_limit: Duration,
    pub automatic_trigger_offset: Duration,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        HarvestConfig::default().settings()
    }
}

fn secs(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

fn default_database_path() -> String {
    "harvest.db".to_string()
}

fn default_cooldown() -> u64 {
    5
}

fn default_provider_delay() -> u64 {
    3600
}

fn default_job_time_limit() -> u64 {
    3600
}

fn default_tick_interval() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_data_not_ready_delay() -> u64 {
    86_400
}

fn default_max_retry_count() -> u32 {
    5
}

fn default_transient_ceiling() -> u64 {
    86_400
}

fn default_no_data_grace_days() -> u32 {
    45
}

fn default_trigger_offset_hours() -> u32 {
    48
}

fn default_reconcile_interval() -> u64 {
    86_400
}

fn default_client_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

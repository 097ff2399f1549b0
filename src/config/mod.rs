//! Configuration loading for the group membership sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `GROUPSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "GROUPSYNC_";

/// Application configuration derived from `GROUPSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub scheduler: JobSchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub graph_updater: GraphUpdaterConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

/// Job start-time distribution and scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct JobSchedulerConfig {
    /// Seconds between scheduler ticks (default: 60)
    #[serde(default = "default_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Reset stale start dates before distributing (default: true)
    ///
    /// Environment variable: `GROUPSYNC_SCHEDULER_RESET_JOBS`
    #[serde(default = "default_true")]
    pub reset_jobs: bool,

    /// Days added to "now" to form the reset base time (default: 0)
    #[serde(default)]
    pub days_to_add_for_reset: i64,

    /// Spread start times across concurrency lanes (default: true)
    #[serde(default = "default_true")]
    pub distribute_jobs: bool,

    /// Also re-time jobs whose start date is still in the future (default: false)
    #[serde(default)]
    pub include_future_jobs: bool,

    /// Delay before the first job of every lane starts (default: 5)
    #[serde(default = "default_start_time_delay_minutes")]
    pub start_time_delay_minutes: u64,

    /// Gap between consecutive jobs in the same lane (default: 10)
    #[serde(default = "default_delay_between_syncs_seconds")]
    pub delay_between_syncs_seconds: u64,

    /// Runtime assumed for jobs without history (default: 60)
    #[serde(default = "default_runtime_seconds")]
    pub default_runtime_seconds: u64,

    /// Number of jobs allowed to overlap (default: 4)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Launch an extra part that snapshots the destination group (default: false)
    #[serde(default)]
    pub include_destination_part: bool,
}

/// Retry policy for transient directory faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryConfig {
    /// Retry ceiling (default: 5)
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff; the n-th retry waits `base * 2^n` (default: 1000)
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff (default: 60000)
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random fraction added on top of each backoff (default: 0.0)
    #[serde(default)]
    pub jitter_factor: f64,
}

/// Outbound call to the membership aggregation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AggregatorConfig {
    /// Remote aggregation endpoint. When unset the in-process aggregator is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Shared key sent as `x-functions-key` and required by the local endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_key: Option<String>,

    /// Per-attempt timeout (default: 30)
    #[serde(default = "default_aggregator_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Retries after the first attempt (default: 3)
    #[serde(default = "default_aggregator_max_retries")]
    pub max_retries: u32,

    /// Base of the retry backoff; the first retry waits twice this (default: 15000)
    #[serde(default = "default_aggregator_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Destination-apply path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct GraphUpdaterConfig {
    /// Service-wide dry run: changes are logged, never applied (default: false)
    #[serde(default)]
    pub dry_run: bool,

    /// A session with no new message for this long is expired (default: 3600)
    #[serde(default = "default_session_timeout_seconds")]
    pub session_timeout_seconds: u64,

    /// Seconds between stalled-session sweeps (default: 60)
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

/// Email notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NotificationConfig {
    #[serde(default = "default_sender_address")]
    pub sender_address: String,

    /// Support addresses copied on every notification
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub support_cc_addresses: Vec<String>,
}

/// Blob storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct StorageConfig {
    /// Root directory of the filesystem blob store (default: ./data)
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

/// Backup housekeeping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Hours between backup passes (default: 24)
    #[serde(default = "default_backup_interval_hours")]
    pub interval_hours: u64,

    /// Snapshots older than this are deleted (default: 30)
    #[serde(default = "default_backup_delete_after_days")]
    pub delete_after_days: i64,

    /// Snapshot destination, only `blob` is supported (default: blob)
    #[serde(default = "default_backup_to")]
    pub backup_to: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            scheduler: JobSchedulerConfig::default(),
            retry: RetryConfig::default(),
            aggregator: AggregatorConfig::default(),
            graph_updater: GraphUpdaterConfig::default(),
            notifications: NotificationConfig::default(),
            storage: StorageConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_scheduler_tick_interval_seconds(),
            reset_jobs: true,
            days_to_add_for_reset: 0,
            distribute_jobs: true,
            include_future_jobs: false,
            start_time_delay_minutes: default_start_time_delay_minutes(),
            delay_between_syncs_seconds: default_delay_between_syncs_seconds(),
            default_runtime_seconds: default_runtime_seconds(),
            max_concurrency: default_max_concurrency(),
            include_destination_part: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter_factor: 0.0,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            url: None,
            function_key: None,
            timeout_seconds: default_aggregator_timeout_seconds(),
            max_retries: default_aggregator_max_retries(),
            retry_base_delay_ms: default_aggregator_retry_base_delay_ms(),
        }
    }
}

impl Default for GraphUpdaterConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            session_timeout_seconds: default_session_timeout_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            sender_address: default_sender_address(),
            support_cc_addresses: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: default_backup_interval_hours(),
            delete_after_days: default_backup_delete_after_days(),
            backup_to: default_backup_to(),
        }
    }
}

impl JobSchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 10 || self.tick_interval_seconds > 3600 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }

        if self.max_concurrency == 0 || self.max_concurrency > 64 {
            return Err(ConfigError::InvalidSchedulerConcurrency {
                value: self.max_concurrency,
            });
        }

        if self.default_runtime_seconds == 0 {
            return Err(ConfigError::InvalidDefaultRuntime {
                value: self.default_runtime_seconds,
            });
        }

        if !(0..=365).contains(&self.days_to_add_for_reset) {
            return Err(ConfigError::InvalidResetOffset {
                value: self.days_to_add_for_reset,
            });
        }

        Ok(())
    }
}

impl RetryConfig {
    /// Validate retry policy bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 || self.max_attempts > 10 {
            return Err(ConfigError::InvalidRetryAttempts {
                value: self.max_attempts,
            });
        }

        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRetryJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

impl AggregatorConfig {
    /// Validate the aggregation endpoint settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(raw) = &self.url {
            let parsed = Url::parse(raw).map_err(|source| ConfigError::InvalidAggregatorUrl {
                value: raw.clone(),
                reason: source.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidAggregatorUrl {
                    value: raw.clone(),
                    reason: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
        }

        if self.timeout_seconds == 0 || self.timeout_seconds > 300 {
            return Err(ConfigError::InvalidAggregatorTimeout {
                value: self.timeout_seconds,
            });
        }

        if self.max_retries > 10 {
            return Err(ConfigError::InvalidAggregatorRetries {
                value: self.max_retries,
            });
        }

        Ok(())
    }
}

impl GraphUpdaterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout_seconds < 60 {
            return Err(ConfigError::InvalidSessionTimeout {
                value: self.session_timeout_seconds,
            });
        }

        if self.sweep_interval_seconds < 5 {
            return Err(ConfigError::InvalidSweepInterval {
                value: self.sweep_interval_seconds,
            });
        }

        Ok(())
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_address(&self.sender_address) {
            return Err(ConfigError::InvalidEmailAddress {
                entry: self.sender_address.clone(),
            });
        }

        for entry in &self.support_cc_addresses {
            if !is_valid_address(entry) {
                return Err(ConfigError::InvalidEmailAddress {
                    entry: entry.clone(),
                });
            }
        }

        Ok(())
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_hours == 0 {
            return Err(ConfigError::InvalidBackupInterval {
                value: self.interval_hours,
            });
        }

        if self.delete_after_days < 1 {
            return Err(ConfigError::InvalidBackupRetention {
                value: self.delete_after_days,
            });
        }

        if self.backup_to != "blob" {
            return Err(ConfigError::UnsupportedBackupTarget {
                value: self.backup_to.clone(),
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.aggregator.function_key.is_some() {
            config.aggregator.function_key = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration and every sub-section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        // Outside local/test the aggregation endpoint must be protected
        if !matches!(self.profile.as_str(), "local" | "test")
            && self.aggregator.function_key.is_none()
        {
            return Err(ConfigError::MissingFunctionKey);
        }

        self.scheduler.validate()?;
        self.retry.validate()?;
        self.aggregator.validate()?;
        self.graph_updater.validate()?;
        self.notifications.validate()?;
        self.backup.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://groupsync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_scheduler_tick_interval_seconds() -> u64 {
    60 // 1 minute
}

fn default_start_time_delay_minutes() -> u64 {
    5
}

fn default_delay_between_syncs_seconds() -> u64 {
    10
}

fn default_runtime_seconds() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    4
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1000 // 1s, 2s, 4s, 8s, 16s
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_aggregator_timeout_seconds() -> u64 {
    30
}

fn default_aggregator_max_retries() -> u32 {
    3
}

fn default_aggregator_retry_base_delay_ms() -> u64 {
    15_000
}

fn default_session_timeout_seconds() -> u64 {
    3600 // 1 hour
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_sender_address() -> String {
    "groupsync@localhost.localdomain".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_backup_interval_hours() -> u64 {
    24
}

fn default_backup_delete_after_days() -> i64 {
    30
}

fn default_backup_to() -> String {
    "blob".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("database url is missing; set GROUPSYNC_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("aggregator function key is missing; set GROUPSYNC_AGGREGATOR_FUNCTION_KEY")]
    MissingFunctionKey,
    #[error("scheduler tick interval must be between 10 and 3600 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("scheduler max concurrency must be between 1 and 64, got {value}")]
    InvalidSchedulerConcurrency { value: usize },
    #[error("default job runtime must be positive, got {value}")]
    InvalidDefaultRuntime { value: u64 },
    #[error("days to add for reset must be between 0 and 365, got {value}")]
    InvalidResetOffset { value: i64 },
    #[error("retry attempts must be between 1 and 10, got {value}")]
    InvalidRetryAttempts { value: u32 },
    #[error("retry base delay ({base}ms) cannot be greater than max delay ({max}ms)")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRetryJitter { value: f64 },
    #[error("invalid aggregator url '{value}': {reason}")]
    InvalidAggregatorUrl { value: String, reason: String },
    #[error("aggregator timeout must be between 1 and 300 seconds, got {value}")]
    InvalidAggregatorTimeout { value: u64 },
    #[error("aggregator retries must not exceed 10, got {value}")]
    InvalidAggregatorRetries { value: u32 },
    #[error("session timeout must be at least 60 seconds, got {value}")]
    InvalidSessionTimeout { value: u64 },
    #[error("session sweep interval must be at least 5 seconds, got {value}")]
    InvalidSweepInterval { value: u64 },
    #[error("invalid email address: {entry}")]
    InvalidEmailAddress { entry: String },
    #[error("backup interval must be positive, got {value}")]
    InvalidBackupInterval { value: u64 },
    #[error("backup retention must be at least 1 day, got {value}")]
    InvalidBackupRetention { value: i64 },
    #[error("unsupported backup target '{value}'")]
    UnsupportedBackupTarget { value: String },
}

fn is_valid_address(entry: &str) -> bool {
    let parts: Vec<&str> = entry.split('@').collect();
    parts.len() == 2 && !parts[0].is_empty() && parts[1].contains('.')
}

fn split_list(raw: String) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn take_parsed<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: impl FnOnce() -> T,
) -> T {
    layered
        .remove(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(default)
}

fn take_string(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: impl FnOnce() -> String,
) -> String {
    layered
        .remove(key)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(default)
}

fn take_optional(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered.remove(key).and_then(|val| {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Loads configuration using layered `.env` files and `GROUPSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`
    /// and finally the process environment, later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let l = &mut layered;

        let scheduler = JobSchedulerConfig {
            tick_interval_seconds: take_parsed(
                l,
                "SCHEDULER_TICK_INTERVAL_SECONDS",
                default_scheduler_tick_interval_seconds,
            ),
            reset_jobs: take_parsed(l, "SCHEDULER_RESET_JOBS", default_true),
            days_to_add_for_reset: take_parsed(l, "SCHEDULER_DAYS_TO_ADD_FOR_RESET", || 0),
            distribute_jobs: take_parsed(l, "SCHEDULER_DISTRIBUTE_JOBS", default_true),
            include_future_jobs: take_parsed(l, "SCHEDULER_INCLUDE_FUTURE_JOBS", || false),
            start_time_delay_minutes: take_parsed(
                l,
                "SCHEDULER_START_TIME_DELAY_MINUTES",
                default_start_time_delay_minutes,
            ),
            delay_between_syncs_seconds: take_parsed(
                l,
                "SCHEDULER_DELAY_BETWEEN_SYNCS_SECONDS",
                default_delay_between_syncs_seconds,
            ),
            default_runtime_seconds: take_parsed(
                l,
                "SCHEDULER_DEFAULT_RUNTIME_SECONDS",
                default_runtime_seconds,
            ),
            max_concurrency: take_parsed(
                l,
                "SCHEDULER_MAX_CONCURRENCY",
                default_max_concurrency,
            ),
            include_destination_part: take_parsed(
                l,
                "SCHEDULER_INCLUDE_DESTINATION_PART",
                || false,
            ),
        };

        let retry = RetryConfig {
            max_attempts: take_parsed(l, "RETRY_MAX_ATTEMPTS", default_retry_max_attempts),
            base_delay_ms: take_parsed(l, "RETRY_BASE_DELAY_MS", default_retry_base_delay_ms),
            max_delay_ms: take_parsed(l, "RETRY_MAX_DELAY_MS", default_retry_max_delay_ms),
            jitter_factor: take_parsed(l, "RETRY_JITTER_FACTOR", || 0.0),
        };

        let aggregator = AggregatorConfig {
            url: take_optional(l, "AGGREGATOR_URL"),
            function_key: take_optional(l, "AGGREGATOR_FUNCTION_KEY"),
            timeout_seconds: take_parsed(
                l,
                "AGGREGATOR_TIMEOUT_SECONDS",
                default_aggregator_timeout_seconds,
            ),
            max_retries: take_parsed(
                l,
                "AGGREGATOR_MAX_RETRIES",
                default_aggregator_max_retries,
            ),
            retry_base_delay_ms: take_parsed(
                l,
                "AGGREGATOR_RETRY_BASE_DELAY_MS",
                default_aggregator_retry_base_delay_ms,
            ),
        };

        let graph_updater = GraphUpdaterConfig {
            dry_run: take_parsed(l, "GRAPH_UPDATER_DRY_RUN", || false),
            session_timeout_seconds: take_parsed(
                l,
                "GRAPH_UPDATER_SESSION_TIMEOUT_SECONDS",
                default_session_timeout_seconds,
            ),
            sweep_interval_seconds: take_parsed(
                l,
                "GRAPH_UPDATER_SWEEP_INTERVAL_SECONDS",
                default_sweep_interval_seconds,
            ),
        };

        let notifications = NotificationConfig {
            sender_address: take_string(l, "NOTIFICATION_SENDER_ADDRESS", default_sender_address),
            support_cc_addresses: l
                .remove("NOTIFICATION_SUPPORT_CC_ADDRESSES")
                .map(split_list)
                .unwrap_or_default(),
        };

        let storage = StorageConfig {
            root: take_optional(l, "STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(default_storage_root),
        };

        let backup = BackupConfig {
            enabled: take_parsed(l, "BACKUP_ENABLED", || false),
            interval_hours: take_parsed(
                l,
                "BACKUP_INTERVAL_HOURS",
                default_backup_interval_hours,
            ),
            delete_after_days: take_parsed(
                l,
                "BACKUP_DELETE_AFTER_DAYS",
                default_backup_delete_after_days,
            ),
            backup_to: take_string(l, "BACKUP_TO", default_backup_to),
        };

        let config = AppConfig {
            profile,
            api_bind_addr: take_string(l, "API_BIND_ADDR", default_api_bind_addr),
            log_level: take_string(l, "LOG_LEVEL", default_log_level),
            log_format: take_string(l, "LOG_FORMAT", default_log_format),
            database_url: take_string(l, "DATABASE_URL", default_database_url),
            db_max_connections: take_parsed(
                l,
                "DB_MAX_CONNECTIONS",
                default_db_max_connections,
            ),
            db_acquire_timeout_ms: take_parsed(
                l,
                "DB_ACQUIRE_TIMEOUT_MS",
                default_db_acquire_timeout_ms,
            ),
            scheduler,
            retry,
            aggregator,
            graph_updater,
            notifications,
            storage,
            backup,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.aggregator.timeout_seconds, 30);
        assert_eq!(config.aggregator.max_retries, 3);
    }

    #[test]
    fn scheduler_bounds_are_enforced() {
        let zero_lanes = JobSchedulerConfig {
            max_concurrency: 0,
            ..JobSchedulerConfig::default()
        };
        assert!(matches!(
            zero_lanes.validate(),
            Err(ConfigError::InvalidSchedulerConcurrency { value: 0 })
        ));

        let fast_tick = JobSchedulerConfig {
            tick_interval_seconds: 1,
            ..JobSchedulerConfig::default()
        };
        assert!(fast_tick.validate().is_err());
    }

    #[test]
    fn retry_policy_validation() {
        let inverted = RetryConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 100,
            ..RetryConfig::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvalidRetryBounds { .. })
        ));

        let unbounded = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(unbounded.validate().is_err());
    }

    #[test]
    fn aggregator_url_must_be_http() {
        let config = AggregatorConfig {
            url: Some("ftp://example.com/aggregate".to_string()),
            ..AggregatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAggregatorUrl { .. })
        ));

        let config = AggregatorConfig {
            url: Some("https://example.com/api/membership-aggregator".to_string()),
            ..AggregatorConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn production_profile_requires_function_key() {
        let config = AppConfig {
            profile: "prod".to_string(),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingFunctionKey)
        ));
    }

    #[test]
    fn redacts_function_key() {
        let mut config = AppConfig::default();
        config.aggregator.function_key = Some("super-secret".to_string());
        let json = config.redacted_json().unwrap();
        assert!(!json.contains("super-secret"));
        assert!(json.contains("[REDACTED]"));
    }

    #[test]
    fn cc_addresses_must_be_valid() {
        let config = NotificationConfig {
            sender_address: "sync@example.com".to_string(),
            support_cc_addresses: vec!["not-an-address".to_string()],
        };
        assert!(config.validate().is_err());
    }
}

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use url::Url;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Trigger scheduler settings
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between trigger sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Rate-limit window for pipelines that do not set their own
    #[serde(default = "default_trigger_interval")]
    pub default_interval_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            default_interval_minutes: default_trigger_interval(),
        }
    }
}

/// Approval gate settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Fallback timeout for pipelines that do not set their own
    #[serde(default = "default_approval_timeout")]
    pub default_timeout_minutes: i64,
    /// Base URL approval links are built from
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// SMS gateway webhook; unset disables the SMS channel
    #[serde(default)]
    pub sms_gateway_url: Option<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: default_approval_timeout(),
            base_url: default_base_url(),
            sms_gateway_url: None,
        }
    }
}

/// Position monitor settings
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Cadence for pipelines that do not set their own, in minutes
    #[serde(default = "default_monitor_interval")]
    pub default_interval_minutes: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_interval_minutes: default_monitor_interval(),
        }
    }
}

/// Reconciliation sweep settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Seconds between master reconciliation passes
    #[serde(default = "default_reconcile_interval")]
    pub sweep_interval_secs: u64,
    /// Parallel broker lookups within one user's pass
    #[serde(default = "default_per_user_concurrency")]
    pub per_user_concurrency: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_reconcile_interval(),
            per_user_concurrency: default_per_user_concurrency(),
        }
    }
}

/// Maintenance sweep settings
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes
    #[serde(default = "default_maintenance_interval")]
    pub sweep_interval_secs: u64,
    /// PENDING/RUNNING rows older than this are failed as stale
    #[serde(default = "default_stale_after")]
    pub stale_after_minutes: i64,
    /// Terminal rows older than this are deleted
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_maintenance_interval(),
            stale_after_minutes: default_stale_after(),
            retention_days: default_retention_days(),
        }
    }
}

/// Work dispatcher settings
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent work item handlers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
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

fn default_database_url() -> String {
    "postgres://localhost/drover".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_trigger_interval() -> i64 {
    5
}

fn default_approval_timeout() -> i64 {
    15
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_monitor_interval() -> f64 {
    5.0
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_per_user_concurrency() -> usize {
    4
}

fn default_maintenance_interval() -> u64 {
    3600
}

fn default_stale_after() -> i64 {
    120
}

fn default_retention_days() -> i64 {
    30
}

fn default_workers() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load from a specific config directory
    pub fn load_from(config_dir: impl AsRef<Path>) -> Result<Self> {
        let config_dir = config_dir.as_ref();
        let env = std::env::var("DROVER_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .add_source(File::from(config_dir.join("default")).required(false))
            .add_source(File::from(config_dir.join(&env)).required(false))
            .add_source(File::from(config_dir.join("local")).required(false))
            .add_source(
                Environment::with_prefix("DROVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate configuration, collecting every problem instead of stopping
    /// at the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.database.url.is_empty() {
            problems.push("database.url must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            problems.push("database.max_connections must be at least 1".to_string());
        }
        if self.scheduler.sweep_interval_secs == 0 {
            problems.push("scheduler.sweep_interval_secs must be at least 1".to_string());
        }
        if self.scheduler.default_interval_minutes <= 0 {
            problems.push("scheduler.default_interval_minutes must be positive".to_string());
        }
        if self.approval.default_timeout_minutes <= 0 {
            problems.push("approval.default_timeout_minutes must be positive".to_string());
        }
        if Url::parse(&self.approval.base_url).is_err() {
            problems.push(format!(
                "approval.base_url is not a valid URL: {}",
                self.approval.base_url
            ));
        }
        if let Some(gateway) = &self.approval.sms_gateway_url {
            if Url::parse(gateway).is_err() {
                problems.push(format!(
                    "approval.sms_gateway_url is not a valid URL: {}",
                    gateway
                ));
            }
        }
        if !(self.monitor.default_interval_minutes.is_finite()
            && self.monitor.default_interval_minutes > 0.0)
        {
            problems.push("monitor.default_interval_minutes must be a positive number".to_string());
        }
        if self.reconciliation.per_user_concurrency == 0 {
            problems.push("reconciliation.per_user_concurrency must be at least 1".to_string());
        }
        if self.maintenance.stale_after_minutes <= 0 {
            problems.push("maintenance.stale_after_minutes must be positive".to_string());
        }
        if self.maintenance.retention_days <= 0 {
            problems.push("maintenance.retention_days must be positive".to_string());
        }
        if self.dispatch.workers == 0 {
            problems.push("dispatch.workers must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            approval: ApprovalConfig::default(),
            monitor: MonitorConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            maintenance: MaintenanceConfig::default(),
            dispatch: DispatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

mod validate;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub app: AppConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub migrations: Vec<MigrationSpec>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AppConfig {
    pub name: String,
}

/// Orchestration policy. Every threshold here is an operational judgment
/// call, so all of them are tunable; the defaults mirror common practice
/// (5-minute windows, error budget of 10).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeployConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_monitor_window")]
    pub monitor_window_secs: u64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_rollback_window")]
    pub rollback_window_secs: u64,
    #[serde(default = "default_rollback_max_retries")]
    pub rollback_max_retries: u32,
    #[serde(default = "default_rollback_backoff")]
    pub rollback_backoff_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            monitor_window_secs: default_monitor_window(),
            sample_interval_secs: default_sample_interval(),
            error_threshold: default_error_threshold(),
            max_consecutive_failures: default_max_consecutive_failures(),
            rollback_window_secs: default_rollback_window(),
            rollback_max_retries: default_rollback_max_retries(),
            rollback_backoff_secs: default_rollback_backoff(),
            retention_days: default_retention_days(),
            probe_retries: default_probe_retries(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

fn default_state_dir() -> String {
    "/var/lib/cutover".to_string()
}
fn default_monitor_window() -> u64 {
    300
}
fn default_sample_interval() -> u64 {
    10
}
fn default_error_threshold() -> u32 {
    10
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_rollback_window() -> u64 {
    300
}
fn default_rollback_max_retries() -> u32 {
    3
}
fn default_rollback_backoff() -> u64 {
    2
}
fn default_retention_days() -> i64 {
    14
}
fn default_probe_retries() -> u32 {
    15
}
fn default_probe_interval() -> u64 {
    2
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EnvironmentConfig {
    pub health_url: String,
    pub database_url: String,
    pub media_path: String,
    /// Label selector used to find the running container for this app.
    #[serde(default = "default_container_label")]
    pub container_label: String,
    /// Image reference (or build context) handed to the container runtime.
    pub artifact: String,
    pub webhook_url: Option<String>,
    /// Optional off-site copy of every snapshot.
    pub snapshot_bucket: Option<String>,
    /// Best-effort cache flush command run during rollback.
    pub cache_clear_cmd: Option<String>,
}

fn default_container_label() -> String {
    "role=web".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MigrationSpec {
    pub id: String,
    #[serde(default = "default_migration_kind")]
    pub kind: String,
    pub forward: String,
    pub reverse: String,
    /// Probe query read through the new access path after apply; the step
    /// only counts as durably applied once it returns rows.
    pub shadow_read: Option<String>,
    /// Count query recording how many rows the step touched.
    pub count_rows: Option<String>,
}

fn default_migration_kind() -> String {
    "schema".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env_overrides()?;
        validate::validate(&config)?;

        Ok(config)
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments
            .get(name)
            .with_context(|| format!("Environment '{}' not found in config", name))
    }

    /// Recognized `CUTOVER_*` variables override the file. Policy values
    /// apply globally; URL overrides apply to every environment.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("CUTOVER_ERROR_THRESHOLD") {
            self.deploy.error_threshold = parse_var("CUTOVER_ERROR_THRESHOLD", &v)?;
        }
        if let Ok(v) = std::env::var("CUTOVER_MONITOR_WINDOW_SECS") {
            self.deploy.monitor_window_secs = parse_var("CUTOVER_MONITOR_WINDOW_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("CUTOVER_SAMPLE_INTERVAL_SECS") {
            self.deploy.sample_interval_secs = parse_var("CUTOVER_SAMPLE_INTERVAL_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("CUTOVER_ROLLBACK_WINDOW_SECS") {
            self.deploy.rollback_window_secs = parse_var("CUTOVER_ROLLBACK_WINDOW_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("CUTOVER_RETENTION_DAYS") {
            self.deploy.retention_days = parse_var("CUTOVER_RETENTION_DAYS", &v)?;
        }
        if let Ok(v) = std::env::var("CUTOVER_HEALTH_URL") {
            for env in self.environments.values_mut() {
                env.health_url = v.clone();
            }
        }
        if let Ok(v) = std::env::var("CUTOVER_WEBHOOK_URL") {
            for env in self.environments.values_mut() {
                env.webhook_url = Some(v.clone());
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{} has invalid value '{}'", name, value))
}

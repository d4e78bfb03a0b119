use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_LEASE_SECS: u64 = 300; // a claimed row is released after 5 min
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 2_000;

/// Top-level config (hookline.toml + HOOKLINE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooklineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Dispatch loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two polls of the ready queue.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound on deliveries in flight within one tick.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long a claimed message stays locked before another dispatcher may
    /// reclaim it.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            lease_secs: DEFAULT_LEASE_SECS,
        }
    }
}

/// Outbound webhook delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
    /// Total attempts per dispatch, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on every further retry.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_DELIVERY_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            user_agent: default_user_agent(),
        }
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}
fn default_delivery_timeout() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_SECS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_retry_backoff() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}
fn default_user_agent() -> String {
    format!("hookline/{}", env!("CARGO_PKG_VERSION"))
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.hookline/hookline.db", home)
}

impl HooklineConfig {
    /// Load config from a TOML file with HOOKLINE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `HOOKLINE_SCHEDULER__POLL_INTERVAL_SECS=5`. A missing file is not an
    /// error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading config");

        let config: HooklineConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HOOKLINE_").split("__"))
            .extract()
            .map_err(|e| crate::error::HooklineError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        use crate::error::HooklineError::Config;

        if self.scheduler.poll_interval_secs == 0 {
            return Err(Config("scheduler.poll_interval_secs must be > 0".into()));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(Config("scheduler.max_concurrency must be > 0".into()));
        }
        if self.delivery.max_attempts == 0 {
            return Err(Config("delivery.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.hookline/hookline.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = HooklineConfig::load(Some("/nonexistent/hookline.toml")).unwrap();
        assert_eq!(config.scheduler.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(config.delivery.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(config.database.path.ends_with("hookline.db"));
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            "[database]\npath = \"/tmp/h.db\"\n\n[scheduler]\nmax_concurrency = 8\n",
        );
        let config = HooklineConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.database.path, "/tmp/h.db");
        assert_eq!(config.scheduler.max_concurrency, 8);
        // untouched keys keep their defaults
        assert_eq!(config.scheduler.lease_secs, DEFAULT_LEASE_SECS);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let file = write_config("[delivery]\nmax_attempts = 0\n");
        let err = HooklineConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}

//! Configuration management for jobshard
//!
//! Two layers of configuration exist:
//!
//! - [`JobConfig`] - the per-job document shared through the registry
//! - [`EngineConfig`] - process-level settings (local identity, wait timeouts,
//!   logging) loaded from environment variables or a TOML file

pub mod job;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::utils::retry::RetryConfig;

pub use job::{JobConfig, JobConfigBuilder, JobType, ShardingItemParameters};

/// Main process-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Coordination settings
    pub coordination: CoordinationConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// How this process takes part in coordination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// IP used in the instance id; detected as loopback when unset
    pub local_ip: Option<String>,

    /// Upper bound on waiting for another instance to finish resharding
    pub sharding_wait_timeout_ms: u64,

    /// Upper bound on waiting for a leader to appear
    pub leader_wait_timeout_ms: u64,

    /// First delay between registry polls while waiting
    pub poll_interval_ms: u64,

    /// Largest delay between registry polls while waiting
    pub max_poll_interval_ms: u64,

    /// Confirm failover claims with a token before acting on them
    pub failover_claim_token: bool,

    /// Retries of recoverable registry errors during bootstrap
    pub bootstrap_retries: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `JOBSHARD_LOCAL_IP`: IP used in instance ids [optional]
    /// - `JOBSHARD_SHARDING_WAIT_TIMEOUT_MS`: [default: 30000]
    /// - `JOBSHARD_LEADER_WAIT_TIMEOUT_MS`: [default: 10000]
    /// - `JOBSHARD_POLL_INTERVAL_MS`: [default: 100]
    /// - `JOBSHARD_MAX_POLL_INTERVAL_MS`: [default: 1000]
    /// - `JOBSHARD_FAILOVER_CLAIM_TOKEN`: [default: false]
    /// - `JOBSHARD_BOOTSTRAP_RETRIES`: [default: 3]
    /// - `JOBSHARD_LOG_LEVEL`: [default: info]
    /// - `JOBSHARD_LOG_FORMAT`: [default: text]
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            coordination: CoordinationConfig {
                local_ip: std::env::var("JOBSHARD_LOCAL_IP").ok(),
                sharding_wait_timeout_ms: env_parse("JOBSHARD_SHARDING_WAIT_TIMEOUT_MS")
                    .unwrap_or(defaults.coordination.sharding_wait_timeout_ms),
                leader_wait_timeout_ms: env_parse("JOBSHARD_LEADER_WAIT_TIMEOUT_MS")
                    .unwrap_or(defaults.coordination.leader_wait_timeout_ms),
                poll_interval_ms: env_parse("JOBSHARD_POLL_INTERVAL_MS")
                    .unwrap_or(defaults.coordination.poll_interval_ms),
                max_poll_interval_ms: env_parse("JOBSHARD_MAX_POLL_INTERVAL_MS")
                    .unwrap_or(defaults.coordination.max_poll_interval_ms),
                failover_claim_token: env_parse("JOBSHARD_FAILOVER_CLAIM_TOKEN")
                    .unwrap_or(defaults.coordination.failover_claim_token),
                bootstrap_retries: env_parse("JOBSHARD_BOOTSTRAP_RETRIES")
                    .unwrap_or(defaults.coordination.bootstrap_retries),
            },
            logging: LoggingConfig {
                level: std::env::var("JOBSHARD_LOG_LEVEL")
                    .unwrap_or_else(|_| defaults.logging.level.clone()),
                format: std::env::var("JOBSHARD_LOG_FORMAT")
                    .unwrap_or_else(|_| defaults.logging.format.clone()),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let c = &self.coordination;
        if c.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms", "must be greater than 0"));
        }
        if c.max_poll_interval_ms < c.poll_interval_ms {
            return Err(Error::config(
                "max_poll_interval_ms",
                "must not be smaller than poll_interval_ms",
            ));
        }
        if c.sharding_wait_timeout_ms == 0 {
            return Err(Error::config(
                "sharding_wait_timeout_ms",
                "must be greater than 0",
            ));
        }
        if c.leader_wait_timeout_ms == 0 {
            return Err(Error::config("leader_wait_timeout_ms", "must be greater than 0"));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::config(
                "logging.format",
                format!("Unknown log format '{}'. Expected text or json", self.logging.format),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn sharding_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.sharding_wait_timeout_ms)
    }

    #[must_use]
    pub fn leader_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.leader_wait_timeout_ms)
    }

    /// Backoff used while polling the registry
    #[must_use]
    pub fn poll_backoff(&self) -> RetryConfig {
        RetryConfig::with_delays(
            u32::MAX,
            self.coordination.poll_interval_ms,
            self.coordination.max_poll_interval_ms,
        )
    }

    /// Backoff used for recoverable registry errors at bootstrap
    #[must_use]
    pub fn bootstrap_retry(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.coordination.bootstrap_retries,
            self.coordination.poll_interval_ms,
            self.coordination.max_poll_interval_ms,
        )
    }

    /// IP used to build the local instance id
    pub fn local_ip(&self) -> String {
        self.coordination
            .local_ip
            .clone()
            .unwrap_or_else(|| String::from("127.0.0.1"))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coordination: CoordinationConfig {
                local_ip: None,
                sharding_wait_timeout_ms: 30_000,
                leader_wait_timeout_ms: 10_000,
                poll_interval_ms: 100,
                max_poll_interval_ms: 1_000,
                failover_claim_token: false,
                bootstrap_retries: 3,
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Relay configuration
///
/// `shard_count` and `region_prefix` must be identical across all
/// processes sharing the broker; mismatched processes route rooms to
/// different channels and stop seeing each other's traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Namespaces channel names per deployment region.
    pub region_prefix: String,

    /// Broker connection target.
    pub broker_url: String,

    /// Fixed partition count, agreed on by all cooperating processes.
    pub shard_count: u32,

    /// Timeout for establishing a broker connection.
    pub connect_timeout_secs: u64,

    /// Retries the broker client performs per failed request before
    /// surfacing the error.
    pub max_retries_per_request: usize,

    /// Linear step for the reconnect delay: attempt `n` waits
    /// `n * retry_delay_step_ms`, capped below.
    pub retry_delay_step_ms: u64,

    /// Upper bound on a single reconnect delay.
    pub retry_delay_cap_ms: u64,

    /// Reconnect attempts before the subscriber stops retrying and
    /// waits for the next explicit operation to wake it up.
    pub max_reconnect_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            region_prefix: "us-east-1".to_string(),
            broker_url: "redis://localhost:6379".to_string(),
            shard_count: 8,
            connect_timeout_secs: 5,
            max_retries_per_request: 3,
            retry_delay_step_ms: 50,
            retry_delay_cap_ms: 2000,
            max_reconnect_attempts: 20,
        }
    }
}

impl RelayConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (ROOMCAST_BROKER_URL, etc.)
        builder = builder.add_source(Environment::with_prefix("ROOMCAST").try_parsing(true));

        let config: Self = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Reject configurations the relay cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Configuration(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if self.broker_url.is_empty() {
            return Err(Error::Configuration("broker_url must not be empty".to_string()));
        }
        Ok(())
    }

    /// Connection establishment timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None`
    /// once the attempt cap is exceeded and retrying should stop.
    ///
    /// Linearly scaled and capped: 50ms, 100ms, ... up to the cap.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_reconnect_attempts {
            return None;
        }
        let delay = u64::from(attempt)
            .saturating_mul(self.retry_delay_step_ms)
            .min(self.retry_delay_cap_ms);
        Some(Duration::from_millis(delay))
    }
}

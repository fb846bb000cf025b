use crate::ledger::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    // Target-ledger finality
    pub confirmation_threshold: u64, // confirmations before a target lock counts as final
    pub fraud_reorg_depth: u64,      // minimum reorg depth for an attributable fraud proof

    // Creation limits
    #[serde(with = "humantime_serde")]
    pub min_lock_window: Duration, // lock_timeout must be at least this far ahead
    pub max_relayer_fee_divisor: u64, // relayer_fee <= base_amount / divisor

    // Coordinator runtime
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration, // observer polling cadence
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration, // backstop scan for overdue timeouts
    pub event_queue_capacity: usize, // per-swap event queue depth
    pub retry: RetryPolicy,
}

impl Default for SwapConfig {
    fn default() -> Self {
        SwapConfig {
            confirmation_threshold: 10,
            fraud_reorg_depth: 10,

            min_lock_window: Duration::from_secs(24 * 60 * 60),
            max_relayer_fee_divisor: 20, // 5%

            poll_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            event_queue_capacity: 64,
            retry: RetryPolicy::default(),
        }
    }
}

impl SwapConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SwapConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.confirmation_threshold == 0 {
            return Err(ConfigError::Invalid("confirmation_threshold must be positive".into()));
        }
        if self.fraud_reorg_depth == 0 {
            return Err(ConfigError::Invalid("fraud_reorg_depth must be positive".into()));
        }
        if self.max_relayer_fee_divisor == 0 {
            return Err(ConfigError::Invalid("max_relayer_fee_divisor must be positive".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid("event_queue_capacity must be positive".into()));
        }
        if self.poll_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("poll and sweep intervals must be non-zero".into()));
        }
        Ok(())
    }
}

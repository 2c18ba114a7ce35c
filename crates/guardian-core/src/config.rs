//! Ceremony configuration

use crate::transport::QoS;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration text is not valid JSON for this structure
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Timing, retry and buffering parameters of one ceremony instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CeremonyConfig {
    /// Base retransmission interval in milliseconds
    pub retransmit_interval_ms: u64,
    /// Upper bound on the retransmission interval after transport failures
    pub max_backoff_ms: u64,
    /// Retransmission cycles per waiting state before giving up
    pub max_retries: u32,
    /// Maximum number of buffered future-round messages
    pub buffer_capacity: usize,
    /// Polynomial threshold; defaults to every registered guardian
    pub quorum: Option<u32>,
    /// Delivery guarantee requested for ceremony traffic
    pub qos: QoS,
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        CeremonyConfig {
            retransmit_interval_ms: 2_000,
            max_backoff_ms: 30_000,
            max_retries: 5,
            buffer_capacity: 64,
            quorum: None,
            qos: QoS::AtLeastOnce,
        }
    }
}

impl CeremonyConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: CeremonyConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retransmit_interval_ms == 0 {
            return Err(ConfigError::Invalid("retransmit_interval_ms must be positive"));
        }
        if self.max_backoff_ms < self.retransmit_interval_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be at least retransmit_interval_ms",
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer_capacity must be positive"));
        }
        if self.quorum == Some(0) {
            return Err(ConfigError::Invalid("quorum must be positive"));
        }
        Ok(())
    }

    /// Base retransmission interval
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    /// Retransmission interval after `failures` consecutive transport failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.min(16);
        let millis = self
            .retransmit_interval_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config =
            CeremonyConfig::from_json(r#"{"max_retries": 2, "qos": "exactly_once"}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.qos, QoS::ExactlyOnce);
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.quorum, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            CeremonyConfig::from_json(r#"{"buffer_capacity": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CeremonyConfig::from_json(r#"{"quorum": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CeremonyConfig::from_json(r#"{"retransmit_interval_ms": "soon"}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = CeremonyConfig {
            retransmit_interval_ms: 100,
            max_backoff_ms: 1_000,
            ..CeremonyConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(10), Duration::from_millis(1_000));
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(1_000));
    }
}

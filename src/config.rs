//! Static deployment configuration: identity, credentials, timing and retry
//! policy. Unlike [`crate::settings::LiveSettings`] none of this changes at
//! runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// SDI-12 line timing
const PRESENCE_WINDOW_MS: u64 = 100;
const PRESENCE_ATTEMPTS: u8 = 3;
const ECHO_TIMEOUT_MS: u64 = 100;
const REPLY_TIMEOUT_MS: u64 = 1500;
const IDLE_GAP_MS: u64 = 10;

const RETRIEVE_ATTEMPTS: u8 = 5;

const CONNECT_ATTEMPTS: u8 = 10;
const RECONNECT_BACKOFF_MS: u64 = 5_000;
const COOLDOWN_MS: u64 = 10 * 60 * 1000;

const KEEP_ALIVE_S: u16 = 120;
const INBOUND_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("invalid logger configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("configuration field '{0}' must not be empty")]
    Empty(&'static str),
}

/// Which measure command drives a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MeasureMode {
    /// `aM!` per sensor, each waited out before the next sensor is addressed.
    Sequential,
    /// `aC!` to every sensor up front, one wait for the slowest.
    #[default]
    Concurrent,
}

impl MeasureMode {
    pub fn is_concurrent(self) -> bool {
        matches!(self, MeasureMode::Concurrent)
    }
}

/// Bounded waits applied to every bus exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTiming {
    pub presence_window_ms: u64,
    pub presence_attempts: u8,
    /// First-byte wait for measure, identify and address-change replies.
    pub echo_timeout_ms: u64,
    /// First-byte wait for a data retrieve reply.
    pub reply_timeout_ms: u64,
    /// Silence after the last byte that ends a reply.
    pub idle_gap_ms: u64,
    pub retrieve_attempts: u8,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            presence_window_ms: PRESENCE_WINDOW_MS,
            presence_attempts: PRESENCE_ATTEMPTS,
            echo_timeout_ms: ECHO_TIMEOUT_MS,
            reply_timeout_ms: REPLY_TIMEOUT_MS,
            idle_gap_ms: IDLE_GAP_MS,
            retrieve_attempts: RETRIEVE_ATTEMPTS,
        }
    }
}

/// Connect retry budget shared by the network and broker links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub backoff_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: CONNECT_ATTEMPTS,
            backoff_ms: RECONNECT_BACKOFF_MS,
            cooldown_ms: COOLDOWN_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// First channel level; also the broker user name.
    pub tenant: alloc::string::String,
    pub zone: alloc::string::String,
    pub device_id: alloc::string::String,
    pub password: alloc::string::String,
    pub keep_alive_s: u16,
    pub measure_mode: MeasureMode,
    pub timing: BusTiming,
    pub retry: RetryPolicy,
    pub inbound_queue_depth: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            tenant: "tenant".into(),
            zone: "Zone1".into(),
            device_id: "logger".into(),
            password: alloc::string::String::new(),
            keep_alive_s: KEEP_ALIVE_S,
            measure_mode: MeasureMode::default(),
            timing: BusTiming::default(),
            retry: RetryPolicy::default(),
            inbound_queue_depth: INBOUND_QUEUE_DEPTH,
        }
    }
}

impl LoggerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigFileError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigFileError> {
        if self.tenant.is_empty() {
            return Err(ConfigFileError::Empty("tenant"));
        }
        if self.zone.is_empty() {
            return Err(ConfigFileError::Empty("zone"));
        }
        if self.device_id.is_empty() {
            return Err(ConfigFileError::Empty("device_id"));
        }
        Ok(())
    }

    /// `<tenant>/<device-id>/config`
    pub fn config_topic(&self) -> alloc::string::String {
        alloc::format!("{}/{}/config", self.tenant, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = LoggerConfig::from_json_str(r#"{"tenant":"acme","timing":{"idle_gap_ms":20}}"#).unwrap();
        assert_eq!(config.tenant, "acme");
        assert_eq!(config.zone, "Zone1");
        assert_eq!(config.timing.idle_gap_ms, 20);
        assert_eq!(config.timing.reply_timeout_ms, 1500);
        assert_eq!(config.timing.echo_timeout_ms, 100);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.measure_mode, MeasureMode::Concurrent);
    }

    #[test]
    fn test_sequential_mode_and_config_topic() {
        let config = LoggerConfig::from_json_str(r#"{"tenant":"t","device_id":"rak","measure_mode":"Sequential"}"#).unwrap();
        assert!(!config.measure_mode.is_concurrent());
        assert_eq!(config.config_topic(), "t/rak/config");
    }

    #[test]
    fn test_rejects_empty_identity() {
        assert!(matches!(LoggerConfig::from_json_str(r#"{"zone":""}"#), Err(ConfigFileError::Empty("zone"))));
        assert!(matches!(LoggerConfig::from_json_str("{"), Err(ConfigFileError::Parse(_))));
    }
}

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for the long-poll hold time and the abort margin, in seconds.
pub const MAX_HOLD_SECS: u64 = 3600;

/// Errors raised while loading or validating a [`DeliveryConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The config file is not valid JSON for this schema.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),

    /// A value is present but unusable.
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// # Delivery Config
///
/// Every knob of the delivery subsystem. Field names are camelCase on disk so
/// a config file reads like the server's own JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryConfig {
    /// Long-poll endpoint (`GET ?client_id=&timeout=`).
    pub poll_url: String,
    /// Reset endpoint (`POST client_id=`). `None` disables reset.
    pub reset_url: Option<String>,
    /// Delivery confirmation endpoint for the poll variant.
    pub confirm_url: Option<String>,
    /// WebSocket endpoint for the stream variant.
    pub stream_url: String,
    /// How long the server may hold a long-poll request open.
    pub timeout_hint_secs: u64,
    /// Extra time the client waits past the hint before aborting.
    pub abort_margin_secs: u64,
    /// First transport-failure backoff step.
    pub base_delay_ms: u64,
    /// Upper bound for transport-failure backoff.
    pub cap_delay_ms: u64,
    /// Fixed delay after a server-reported error.
    pub server_error_delay_ms: u64,
    /// Delay after an alert once the backlog is drained.
    pub caught_up_delay_ms: u64,
    /// Delay after an empty (timed out) acquire.
    pub idle_delay_ms: u64,
    /// Delay after a malformed payload.
    pub protocol_error_delay_ms: u64,
    /// Consecutive reconnect attempts the stream variant may make before giving up.
    pub max_reconnect_attempts: Option<u32>,
    /// Number of alert ids remembered for dedup. Oldest ids are evicted first.
    pub dedup_capacity: usize,
    /// Quiet period on the stream after which a ping probe is sent.
    pub ping_interval_secs: u64,
    /// Silence on the stream after which the socket is considered dead.
    pub silent_failure_timeout_secs: u64,
    /// Key under which the client id is persisted.
    pub identity_namespace: String,
    /// Explicit identity store location; the platform data dir is used otherwise.
    pub identity_path: Option<PathBuf>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_url: "http://localhost:8001/api/poll/alerts/".to_string(),
            reset_url: Some("http://localhost:8001/api/poll/reset/".to_string()),
            confirm_url: None,
            stream_url: "ws://localhost:8001/ws/alerts/".to_string(),
            timeout_hint_secs: 30,
            abort_margin_secs: 5,
            base_delay_ms: 1000,
            cap_delay_ms: 30_000,
            server_error_delay_ms: 5000,
            caught_up_delay_ms: 1000,
            idle_delay_ms: 100,
            protocol_error_delay_ms: 1000,
            max_reconnect_attempts: Some(5),
            dedup_capacity: 10_000,
            ping_interval_secs: 15,
            silent_failure_timeout_secs: 45,
            identity_namespace: "alert_client_id".to_string(),
            identity_path: None,
        }
    }
}

impl DeliveryConfig {
    /// Server-side hold time requested on each long poll.
    pub fn timeout_hint(&self) -> Duration {
        Duration::from_secs(self.timeout_hint_secs)
    }

    /// Hard client-side abort: server timeout plus the fixed margin.
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_hint_secs.saturating_add(self.abort_margin_secs))
    }

    /// Stream quiet period before a ping probe.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Stream silence tolerated before reconnecting.
    pub fn silent_failure_timeout(&self) -> Duration {
        Duration::from_secs(self.silent_failure_timeout_secs)
    }

    /// Rejects combinations the delivery loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_hint_secs == 0 {
            return Err(ConfigError::Invalid("timeoutHintSecs must be greater than zero".into()));
        }
        if self.timeout_hint_secs > MAX_HOLD_SECS || self.abort_margin_secs > MAX_HOLD_SECS {
            return Err(ConfigError::Invalid(format!(
                "timeoutHintSecs and abortMarginSecs must not exceed {}",
                MAX_HOLD_SECS
            )));
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("baseDelayMs must be greater than zero".into()));
        }
        if self.cap_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "capDelayMs ({}) is smaller than baseDelayMs ({})",
                self.cap_delay_ms, self.base_delay_ms
            )));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid("dedupCapacity must be greater than zero".into()));
        }
        if self.silent_failure_timeout_secs <= self.ping_interval_secs {
            return Err(ConfigError::Invalid(
                "silentFailureTimeoutSecs must exceed pingIntervalSecs".into(),
            ));
        }
        if self.identity_namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("identityNamespace must not be empty".into()));
        }
        Ok(())
    }
}

impl fmt::Display for DeliveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeliveryConfig
    Poll url: {},
    Reset url: {:?},
    Confirm url: {:?},
    Stream url: {},
    Timeout hint: {}s (+{}s margin),
    Backoff: {}ms..{}ms,
    Max reconnect attempts: {:?},
    Dedup capacity: {}
",
            self.poll_url,
            self.reset_url,
            self.confirm_url,
            self.stream_url,
            self.timeout_hint_secs,
            self.abort_margin_secs,
            self.base_delay_ms,
            self.cap_delay_ms,
            self.max_reconnect_attempts,
            self.dedup_capacity
        )
    }
}

/// Reads a JSON config file over the defaults without validating it, for
/// callers that layer further overrides before calling
/// [`DeliveryConfig::validate`].
///
/// Keys missing from the file keep their default values.
pub fn read_delivery_config(path: &Path) -> Result<DeliveryConfig, ConfigError> {
    let raw = fs::read_to_string(path)?;
    let config: DeliveryConfig = serde_json::from_str(&raw)?;
    log::debug!("Read delivery config from {}", path.display());
    Ok(config)
}

/// Reads a JSON config file over the defaults and validates the result.
pub fn load_delivery_config(path: &Path) -> Result<DeliveryConfig, ConfigError> {
    let config = read_delivery_config(path)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.abort_timeout(), Duration::from_secs(35));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "pollUrl": "http://example.test/poll", "capDelayMs": 5000 }}"#).unwrap();

        let config = load_delivery_config(file.path()).unwrap();
        assert_eq!(config.poll_url, "http://example.test/poll");
        assert_eq!(config.cap_delay_ms, 5000);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_reconnect_attempts, Some(5));
    }

    #[test]
    fn cap_below_base_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "baseDelayMs": 2000, "capDelayMs": 1000 }}"#).unwrap();

        match load_delivery_config(file.path()) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("capDelayMs")),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn huge_hold_times_are_rejected_not_overflowed() {
        let config = DeliveryConfig {
            timeout_hint_secs: u64::MAX,
            abort_margin_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.abort_timeout(), Duration::from_secs(u64::MAX));
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("timeoutHintSecs")),
            other => panic!("expected invalid config, got {:?}", other),
        }

        let margin_only = DeliveryConfig {
            abort_margin_secs: MAX_HOLD_SECS + 1,
            ..Default::default()
        };
        assert!(margin_only.validate().is_err());
    }

    #[test]
    fn reading_skips_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "baseDelayMs": 2000, "capDelayMs": 1000 }}"#).unwrap();

        let config = read_delivery_config(file.path()).unwrap();
        assert_eq!(config.cap_delay_ms, 1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(load_delivery_config(file.path()), Err(ConfigError::ParseError(_))));
    }
}

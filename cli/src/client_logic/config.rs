use clap::{ArgAction, Parser, ValueEnum};
use lib_alerts::{DeliveryConfig, read_delivery_config};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "alert_client.conf";

#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// HTTP long polling.
    #[default]
    Poll,
    /// WebSocket stream.
    Stream,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Alert delivery client (long polling or WebSocket stream)", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, value_enum, env = "ALERT_MODE", help = "Delivery channel to use.")]
    pub mode: Option<Mode>,

    #[clap(long, env = "ALERT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ALERT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ALERT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ALERT_POLL_URL", help = "Long-poll endpoint.")]
    pub poll_url: Option<String>,

    #[clap(long, env = "ALERT_RESET_URL", help = "Delivery cursor reset endpoint.")]
    pub reset_url: Option<String>,

    #[clap(long, env = "ALERT_CONFIRM_URL", help = "Delivery confirmation endpoint (long-poll mode).")]
    pub confirm_url: Option<String>,

    #[clap(long, env = "ALERT_STREAM_URL", help = "WebSocket endpoint.")]
    pub stream_url: Option<String>,

    #[clap(long, env = "ALERT_TIMEOUT_HINT_SECS", help = "Seconds the server may hold a long poll.")]
    pub timeout_hint_secs: Option<u64>,

    #[clap(long, env = "ALERT_BASE_DELAY_MS", help = "First reconnect backoff step in milliseconds.")]
    pub base_delay_ms: Option<u64>,

    #[clap(long, env = "ALERT_CAP_DELAY_MS", help = "Reconnect backoff ceiling in milliseconds.")]
    pub cap_delay_ms: Option<u64>,

    #[clap(long, env = "ALERT_MAX_RECONNECT_ATTEMPTS", help = "Consecutive stream failures before giving up.")]
    pub max_reconnect_attempts: Option<u32>,

    #[clap(long, env = "ALERT_DEDUP_CAPACITY", help = "Alert ids remembered for duplicate suppression.")]
    pub dedup_capacity: Option<usize>,

    #[clap(long, env = "ALERT_IDENTITY_PATH", help = "File holding the persisted client id.")]
    pub identity_path: Option<PathBuf>,

    #[clap(long, action = ArgAction::SetTrue, help = "Reset the server delivery cursor before starting.")]
    #[serde(default)]
    pub reset: bool,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            mode: other.mode.or(self.mode),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            poll_url: other.poll_url.or(self.poll_url),
            reset_url: other.reset_url.or(self.reset_url),
            confirm_url: other.confirm_url.or(self.confirm_url),
            stream_url: other.stream_url.or(self.stream_url),
            timeout_hint_secs: other.timeout_hint_secs.or(self.timeout_hint_secs),
            base_delay_ms: other.base_delay_ms.or(self.base_delay_ms),
            cap_delay_ms: other.cap_delay_ms.or(self.cap_delay_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            dedup_capacity: other.dedup_capacity.or(self.dedup_capacity),
            identity_path: other.identity_path.or(self.identity_path),
            reset: other.reset || self.reset,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode.unwrap_or_default()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Writes every value set on this layer into `base`.
    pub fn apply_to(&self, mut base: DeliveryConfig) -> DeliveryConfig {
        if let Some(v) = &self.poll_url {
            base.poll_url = v.clone();
        }
        if let Some(v) = &self.reset_url {
            base.reset_url = Some(v.clone()).filter(|url| !url.is_empty());
        }
        if let Some(v) = &self.confirm_url {
            base.confirm_url = Some(v.clone()).filter(|url| !url.is_empty());
        }
        if let Some(v) = &self.stream_url {
            base.stream_url = v.clone();
        }
        if let Some(v) = self.timeout_hint_secs {
            base.timeout_hint_secs = v;
        }
        if let Some(v) = self.base_delay_ms {
            base.base_delay_ms = v;
        }
        if let Some(v) = self.cap_delay_ms {
            base.cap_delay_ms = v;
        }
        if let Some(v) = self.max_reconnect_attempts {
            base.max_reconnect_attempts = Some(v);
        }
        if let Some(v) = self.dedup_capacity {
            base.dedup_capacity = v;
        }
        if let Some(v) = &self.identity_path {
            base.identity_path = Some(v.clone());
        }
        base
    }

    /// Delivery tunables: library defaults, then the config file, then this
    /// layer (which already carries file, environment and CLI values).
    pub fn delivery_config(&self) -> anyhow::Result<DeliveryConfig> {
        let base = match self.config_path.as_deref().filter(|p| p.exists()) {
            Some(path) => read_delivery_config(path)?,
            None => DeliveryConfig::default(),
        };
        let merged = self.apply_to(base);
        merged.validate()?;
        Ok(merged)
    }
}

fn read_file_layer(path: &Path) -> Option<Config> {
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

pub fn load_config() -> Config {
    // 1. Defaults
    let default_config = Config {
        mode: Some(Mode::Poll),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    };

    // 2. Config file; its path may itself come from the CLI or environment.
    let cli_args = Config::parse();
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = default_config;
    current_config.config_path = Some(config_file_path.clone());

    if config_file_path.exists() {
        if let Some(file_config) = read_file_layer(&config_file_path) {
            current_config = current_config.merge(file_config);
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. Environment variables and CLI arguments (clap reads both).
    current_config.merge(cli_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_override_file_values() {
        let file = Config {
            mode: Some(Mode::Stream),
            poll_url: Some("http://file/poll/".into()),
            log_level: Some("debug".into()),
            ..Default::default()
        };
        let cli = Config::try_parse_from(["alert_client", "--mode", "poll", "--cap-delay-ms", "9000"]).unwrap();

        let merged = file.merge(cli);
        assert_eq!(merged.mode(), Mode::Poll);
        assert_eq!(merged.poll_url.as_deref(), Some("http://file/poll/"));
        assert_eq!(merged.log_level(), "debug");
        assert_eq!(merged.cap_delay_ms, Some(9000));
    }

    #[test]
    fn reset_flag_is_sticky() {
        let cli = Config::try_parse_from(["alert_client", "--reset"]).unwrap();
        assert!(Config::default().merge(cli).reset);
    }

    #[test]
    fn layer_applies_over_delivery_defaults() {
        let layer = Config {
            stream_url: Some("ws://example/ws/".into()),
            max_reconnect_attempts: Some(2),
            reset_url: Some(String::new()),
            ..Default::default()
        };
        let delivery = layer.apply_to(DeliveryConfig::default());
        assert_eq!(delivery.stream_url, "ws://example/ws/");
        assert_eq!(delivery.max_reconnect_attempts, Some(2));
        assert_eq!(delivery.reset_url, None);
        assert_eq!(delivery.timeout_hint_secs, 30);
    }

    #[test]
    fn file_feeds_both_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alert_client.conf");
        fs::write(&path, r#"{"mode":"stream","logLevel":"warn","timeoutHintSecs":12}"#).unwrap();

        let layer = read_file_layer(&path).unwrap();
        assert_eq!(layer.mode(), Mode::Stream);
        assert_eq!(layer.log_level(), "warn");

        let cli = Config {
            config_path: Some(path),
            ..Default::default()
        };
        let delivery = cli.delivery_config().unwrap();
        assert_eq!(delivery.timeout_hint_secs, 12);
    }

    #[test]
    fn overrides_can_repair_the_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alert_client.conf");
        fs::write(&path, r#"{"baseDelayMs":2000,"capDelayMs":1000}"#).unwrap();

        let layer = Config {
            config_path: Some(path),
            cap_delay_ms: Some(8000),
            ..Default::default()
        };
        let delivery = layer.delivery_config().unwrap();
        assert_eq!(delivery.base_delay_ms, 2000);
        assert_eq!(delivery.cap_delay_ms, 8000);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let layer = Config {
            base_delay_ms: Some(5000),
            cap_delay_ms: Some(100),
            ..Default::default()
        };
        assert!(layer.delivery_config().is_err());
    }
}

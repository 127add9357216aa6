//! Command line and environment configuration.
//!
//! Every setting resolves as: CLI flag > `CHATWATCH_*` env var > default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::HeaderValue;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::broadcaster::DEFAULT_RELAY_CAPACITY;
use crate::watcher::WatcherSettings;

#[derive(Debug, Parser)]
#[command(
    name = "chatwatch",
    version,
    about = "Live mirror of bot conversation logs over WebSocket"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Watch the conversations directory and serve observers (default)
    Start,
    /// Decode the conversations directory once and print the snapshot as JSON
    Dump,
}

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Root directory holding one subdirectory per bot
    #[arg(
        long,
        global = true,
        env = "CHATWATCH_CONVERSATIONS_DIR",
        default_value = "./conversations"
    )]
    pub conversations_dir: PathBuf,

    /// Quiescence window before a burst of file events is applied
    #[arg(long, global = true, env = "CHATWATCH_DEBOUNCE_MS", default_value_t = 1000)]
    pub debounce_ms: u64,

    /// Conversation log file suffix
    #[arg(long, global = true, env = "CHATWATCH_LOG_SUFFIX", default_value = "log")]
    pub log_suffix: String,

    /// HTTP listen address
    #[arg(long, global = true, env = "CHATWATCH_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Allowed CORS origin (any origin when unset)
    #[arg(long, global = true, env = "CHATWATCH_CORS_ORIGIN")]
    pub cors_origin: Option<String>,

    /// Events an observer may fall behind before it is disconnected
    #[arg(
        long,
        global = true,
        env = "CHATWATCH_RELAY_CAPACITY",
        default_value_t = DEFAULT_RELAY_CAPACITY
    )]
    pub relay_capacity: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("log suffix must not be empty")]
    EmptySuffix,
    #[error("debounce window must be greater than zero")]
    ZeroDebounce,
    #[error("relay capacity must be greater than zero")]
    ZeroRelayCapacity,
    #[error("invalid CORS origin {0:?}")]
    InvalidCorsOrigin(String),
}

impl Config {
    /// Check ranges and normalize the suffix (`.log` and `log` are equivalent).
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let suffix = self.log_suffix.trim().trim_start_matches('.').to_string();
        if suffix.is_empty() {
            return Err(ConfigError::EmptySuffix);
        }
        self.log_suffix = suffix;

        if self.debounce_ms == 0 {
            return Err(ConfigError::ZeroDebounce);
        }
        if self.relay_capacity == 0 {
            return Err(ConfigError::ZeroRelayCapacity);
        }
        self.cors_origin_header()?;
        Ok(self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cors_origin_header(&self) -> Result<Option<HeaderValue>, ConfigError> {
        self.cors_origin
            .as_deref()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .map_err(|_| ConfigError::InvalidCorsOrigin(origin.to_string()))
            })
            .transpose()
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            root: self.conversations_dir.clone(),
            suffix: self.log_suffix.clone(),
            debounce: self.debounce(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("chatwatch").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn flags_override_defaults() {
        let cli = parse(&[
            "--conversations-dir",
            "/srv/logs",
            "--debounce-ms",
            "250",
            "--log-suffix",
            ".txt",
            "--bind",
            "0.0.0.0:8080",
            "--cors-origin",
            "http://localhost:5173",
            "--relay-capacity",
            "32",
        ]);
        let config = cli.config.validate().expect("valid config");

        assert_eq!(cli.command, None);
        assert_eq!(config.conversations_dir, PathBuf::from("/srv/logs"));
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.log_suffix, "txt");
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.relay_capacity, 32);
        assert!(config.cors_origin_header().expect("origin").is_some());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = parse(&["dump", "--conversations-dir", "/srv/logs"]);
        assert_eq!(cli.command, Some(Command::Dump));
        assert_eq!(cli.config.conversations_dir, PathBuf::from("/srv/logs"));
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let base = parse(&["--conversations-dir", "/srv/logs"]).config;

        let mut config = base.clone();
        config.log_suffix = ".".to_string();
        assert_eq!(config.validate().unwrap_err(), ConfigError::EmptySuffix);

        let mut config = base.clone();
        config.debounce_ms = 0;
        assert_eq!(config.validate().unwrap_err(), ConfigError::ZeroDebounce);

        let mut config = base.clone();
        config.relay_capacity = 0;
        assert_eq!(config.validate().unwrap_err(), ConfigError::ZeroRelayCapacity);

        let mut config = base;
        config.cors_origin = Some("bad\norigin".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCorsOrigin(_))
        ));
    }

    #[test]
    fn watcher_settings_carry_normalized_suffix() {
        let config = parse(&["--conversations-dir", "/srv/logs", "--log-suffix", ".log"])
            .config
            .validate()
            .expect("valid config");
        let settings = config.watcher_settings();

        assert_eq!(settings.root, PathBuf::from("/srv/logs"));
        assert_eq!(settings.suffix, "log");
    }
}

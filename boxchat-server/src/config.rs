//! Server configuration.
//!
//! Every flag has an environment fallback (`BOXCHAT_*`) so the binary can
//! run unmodified under a process supervisor.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::authority::{BAN_THRESHOLD, Policy};
use crate::error::ConfigError;

/// Default listen address. Port 7000 on all interfaces.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7000";
/// Default penalty length in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;
/// Default minimum spacing between accepted messages, in seconds.
pub const DEFAULT_DEBOUNCE_SECS: f64 = 1.0;
/// Default greeting sent to a freshly connected client.
pub const DEFAULT_WELCOME: &str = "Welcome to the box";

/// How a client's identity is derived from its remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum IdentityMode {
    /// Full `ip:port`. Every connection is its own client.
    #[default]
    Endpoint,
    /// IP only. Bans follow the host across reconnects.
    Host,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "boxchat-server", about = "TCP text broadcast server with flood control")]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, env = "BOXCHAT_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Penalty length (seconds) after a debounce violation.
    #[arg(long, env = "BOXCHAT_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: f64,

    /// Minimum spacing (seconds) between accepted messages from one client.
    #[arg(long, env = "BOXCHAT_DEBOUNCE_SECS", default_value_t = DEFAULT_DEBOUNCE_SECS)]
    pub debounce_secs: f64,

    /// How clients (and bans) are keyed.
    #[arg(long, env = "BOXCHAT_IDENTITY", value_enum, default_value_t = IdentityMode::Endpoint)]
    pub identity: IdentityMode,

    /// Greeting sent on connect.
    #[arg(long, env = "BOXCHAT_WELCOME", default_value = DEFAULT_WELCOME)]
    pub welcome: String,

    /// Read the greeting from a file (overrides --welcome).
    #[arg(long, env = "BOXCHAT_WELCOME_FILE")]
    pub welcome_file: Option<String>,

    /// Maximum bytes taken from the socket per read. One read is one message.
    #[arg(long, env = "BOXCHAT_READ_BUFFER", default_value_t = 256)]
    pub read_buffer: usize,

    /// Capacity of the event queue feeding the authority.
    #[arg(long, env = "BOXCHAT_EVENT_QUEUE", default_value_t = 1)]
    pub event_queue: usize,

    /// Per-client outbound queue capacity. Writes beyond it are dropped.
    #[arg(long, env = "BOXCHAT_OUTBOUND_QUEUE", default_value_t = 4096)]
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            debounce_secs: DEFAULT_DEBOUNCE_SECS,
            identity: IdentityMode::Endpoint,
            welcome: DEFAULT_WELCOME.to_string(),
            welcome_file: None,
            read_buffer: 256,
            event_queue: 1,
            outbound_queue: 4096,
        }
    }
}

impl ServerConfig {
    /// Check sizes and durations, returning the abuse-control policy.
    pub fn validate(&self) -> Result<Policy, ConfigError> {
        for (name, size) in [
            ("read_buffer", self.read_buffer),
            ("event_queue", self.event_queue),
            ("outbound_queue", self.outbound_queue),
        ] {
            if size == 0 {
                return Err(ConfigError::ZeroSize { name });
            }
        }
        Ok(Policy {
            timeout: secs("timeout_secs", self.timeout_secs)?,
            debounce: secs("debounce_secs", self.debounce_secs)?,
            ban_threshold: BAN_THRESHOLD,
        })
    }

    /// Resolve `--welcome-file` into `--welcome`.
    pub fn load_welcome_file(&mut self) {
        let Some(ref path) = self.welcome_file else {
            return;
        };
        match std::fs::read_to_string(path) {
            Ok(content) => {
                tracing::info!("Loaded welcome text from {path}");
                self.welcome = content;
            }
            Err(e) => tracing::warn!("Failed to read welcome file {path}: {e}"),
        }
    }
}

fn secs(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { name, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::parse_from(["boxchat-server"]);
        assert_eq!(config.listen_addr, "0.0.0.0:7000");
        assert_eq!(config.identity, IdentityMode::Endpoint);
        assert_eq!(config.welcome, "Welcome to the box");

        let policy = config.validate().unwrap();
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.debounce, Duration::from_secs(1));
        assert_eq!(policy.ban_threshold, 3);
    }

    #[test]
    fn flags_override_defaults() {
        let config = ServerConfig::parse_from([
            "boxchat-server",
            "--timeout-secs",
            "0.5",
            "--identity",
            "host",
            "--listen-addr",
            "127.0.0.1:0",
        ]);
        assert_eq!(config.identity, IdentityMode::Host);
        assert_eq!(config.validate().unwrap().timeout, Duration::from_millis(500));
    }

    #[test]
    fn rejects_negative_and_nan_durations() {
        let config = ServerConfig {
            debounce_secs: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration { name: "debounce_secs", .. })
        ));

        let config = ServerConfig {
            timeout_secs: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_sizes() {
        let config = ServerConfig {
            event_queue: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroSize { name: "event_queue" })
        ));
    }

    #[test]
    fn missing_welcome_file_keeps_default() {
        let mut config = ServerConfig {
            welcome_file: Some("/nonexistent/boxchat/welcome.txt".to_string()),
            ..Default::default()
        };
        config.load_welcome_file();
        assert_eq!(config.welcome, DEFAULT_WELCOME);
    }
}

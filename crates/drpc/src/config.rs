use crate::backoff::LinearBackoff;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application id the daemon identifies itself with by default.
pub const DEFAULT_CLIENT_ID: &str = "594190466782724099";

/// CLI interface for the presence daemon.
#[derive(Parser)]
#[command(name = "drpc", about = "Rich presence client daemon")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Local API listen address override.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Application id override.
    #[arg(long, global = true)]
    pub client_id: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the presence daemon.
    Start,
    /// Show connection status.
    Status,
    /// Show the user the peer reported at login.
    User,
    /// Ask the daemon to (re)connect to the peer.
    Login {
        /// Retry budget after a failed attempt (-1 retries forever).
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        retries: i32,
    },
    /// Set the displayed activity.
    Set {
        /// Primary line.
        #[arg(long)]
        details: Option<String>,
        /// Secondary line.
        #[arg(long)]
        state: Option<String>,
        /// Large image asset key.
        #[arg(long)]
        large_image: Option<String>,
        /// Large image hover text.
        #[arg(long)]
        large_text: Option<String>,
        /// Small image asset key.
        #[arg(long)]
        small_image: Option<String>,
        /// Small image hover text.
        #[arg(long)]
        small_text: Option<String>,
        /// Show elapsed time starting now.
        #[arg(long)]
        start_now: bool,
    },
    /// Clear the displayed activity.
    Clear,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Application id sent in the handshake.
    pub client_id: String,
    /// Local API listen address (`tcp://` or `unix://`).
    pub listen: String,
    /// How long to wait for the peer's readiness notification, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Reconnection backoff settings.
    pub retry: RetryConfig,
    /// Status update throttling.
    pub throttle: ThrottleConfig,
    /// HTTP side-channel probe settings.
    pub endpoint: EndpointConfig,
    /// User-facing presence toggles.
    pub presence: PresenceSettings,
    /// Game id → large image key. Games without an entry use the default art.
    #[serde(default)]
    pub art: HashMap<String, String>,
}

/// Reconnect backoff parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Added to the delay after every failed attempt, in milliseconds.
    pub step_ms: u64,
    /// Maximum delay between attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Retries after a failed login; `-1` retries forever.
    pub attempts: i32,
}

impl RetryConfig {
    /// Builds the backoff described by this section.
    #[must_use]
    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.step_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Throttle window for outbound status updates.
#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleConfig {
    /// Length of the throttling window, in milliseconds.
    pub window_ms: u64,
}

/// Bounded probe for the peer's local HTTP endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// First port tried.
    pub base_port: u16,
    /// Number of consecutive ports cycled through.
    pub port_span: u16,
    /// Total probe attempts across all ports.
    pub max_tries: u32,
}

/// Presence toggles the host application exposes to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Master switch; when off no status is sent and the client is dropped.
    pub enabled: bool,
    /// Include the enabled mod count.
    pub show_mods: bool,
    /// Show collection install progress.
    pub show_collections: bool,
    /// Clear the status while a game or tool runs.
    pub hide_on_game_launch: bool,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            show_mods: true,
            show_collections: true,
            hide_on_game_launch: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 10_000,
            step_ms: 10_000,
            max_delay_ms: 120_000,
            attempts: -1,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { window_ms: 5_000 }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_port: 6463,
            port_span: 10,
            max_tries: 30,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            listen: "tcp://127.0.0.1:7710".to_string(),
            connect_timeout_ms: 10_000,
            retry: RetryConfig::default(),
            throttle: ThrottleConfig::default(),
            endpoint: EndpointConfig::default(),
            presence: PresenceSettings::default(),
            art: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.is_empty() {
            return Err("client_id must not be empty".to_string());
        }
        if !self.client_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "client_id must be a numeric application id, got: {}",
                self.client_id
            ));
        }

        if self.listen.is_empty() {
            return Err("listen address must not be empty".to_string());
        }
        if !(self.listen.starts_with("tcp://") || self.listen.starts_with("unix://")) {
            return Err(format!(
                "listen address must start with tcp:// or unix://, got: {}",
                self.listen
            ));
        }

        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than 0".to_string());
        }

        if self.retry.base_delay_ms == 0 {
            return Err("retry.base_delay_ms must be greater than 0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err("retry.max_delay_ms must be >= base_delay_ms".to_string());
        }
        if self.retry.attempts < -1 {
            return Err("retry.attempts must be -1 (unbounded) or >= 0".to_string());
        }

        if self.throttle.window_ms == 0 {
            return Err("throttle.window_ms must be greater than 0".to_string());
        }

        if self.endpoint.port_span == 0 {
            return Err("endpoint.port_span must be greater than 0".to_string());
        }
        if u32::from(self.endpoint.base_port) + u32::from(self.endpoint.port_span) > 65_536 {
            return Err("endpoint port range exceeds 65535".to_string());
        }
        if self.endpoint.max_tries == 0 {
            return Err("endpoint.max_tries must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Readiness timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Throttle window as a [`Duration`].
    #[must_use]
    pub const fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle.window_ms)
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("client_id", defaults.client_id.as_str())?
        .set_default("listen", defaults.listen.as_str())?
        .set_default("connect_timeout_ms", defaults.connect_timeout_ms)?
        .set_default("retry.base_delay_ms", defaults.retry.base_delay_ms)?
        .set_default("retry.step_ms", defaults.retry.step_ms)?
        .set_default("retry.max_delay_ms", defaults.retry.max_delay_ms)?
        .set_default("retry.attempts", i64::from(defaults.retry.attempts))?
        .set_default("throttle.window_ms", defaults.throttle.window_ms)?
        .set_default("endpoint.base_port", i64::from(defaults.endpoint.base_port))?
        .set_default("endpoint.port_span", i64::from(defaults.endpoint.port_span))?
        .set_default("endpoint.max_tries", i64::from(defaults.endpoint.max_tries))?
        .set_default("presence.enabled", defaults.presence.enabled)?
        .set_default("presence.show_mods", defaults.presence.show_mods)?
        .set_default("presence.show_collections", defaults.presence.show_collections)?
        .set_default(
            "presence.hide_on_game_launch",
            defaults.presence.hide_on_game_launch,
        )?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Platform config dir first, then ~/.config/drpc/
        let native_path = dirs::config_dir().map(|d| d.join("drpc").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| d.join(".config").join("drpc").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    // DRPC_CLIENT_ID, DRPC_RETRY__ATTEMPTS, ...
    builder = builder.add_source(
        config::Environment::with_prefix("DRPC")
            .prefix_separator("_")
            .separator("__"),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;

    #[test]
    fn test_client_config_default_has_expected_values() {
        let config = ClientConfig::default();

        assert_eq!(config.client_id, "594190466782724099");
        assert_eq!(config.listen, "tcp://127.0.0.1:7710");
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.throttle_window(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_config_with_no_file_returns_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")))
            .expect("load_config should succeed with no file");

        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.retry.attempts, -1);
        assert_eq!(config.endpoint.base_port, 6463);
        assert!(config.presence.enabled);
        assert!(config.art.is_empty());
    }

    #[test]
    fn test_load_config_reads_toml_file() {
        let dir = std::env::temp_dir().join(format!("drpc_config_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            "client_id = \"123\"\n\
             [retry]\nattempts = 3\n\
             [presence]\nshow_mods = false\n\
             [art]\nskyrimse = \"skyrimse-art\"\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(config.client_id, "123");
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 10_000);
        assert!(!config.presence.show_mods);
        assert!(config.presence.enabled);
        assert_eq!(config.art.get("skyrimse").map(String::as_str), Some("skyrimse-art"));
    }

    #[test]
    fn test_retry_config_default_values() {
        let config = RetryConfig::default();

        assert_eq!(config.base_delay_ms, 10_000);
        assert_eq!(config.step_ms, 10_000);
        assert_eq!(config.max_delay_ms, 120_000);
        assert_eq!(config.attempts, -1);
    }

    #[test]
    fn test_retry_config_builds_matching_backoff() {
        let mut backoff = RetryConfig::default().backoff();
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(20));
    }

    #[test]
    fn test_endpoint_config_default_values() {
        let config = EndpointConfig::default();
        assert_eq!(config.base_port, 6463);
        assert_eq!(config.port_span, 10);
        assert_eq!(config.max_tries, 30);
    }

    #[test]
    fn test_default_config_passes_validation() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_client_id() {
        let mut config = ClientConfig::default();
        config.client_id = String::new();
        assert!(config.validate().unwrap_err().contains("client_id"));
    }

    #[test]
    fn test_validate_rejects_non_numeric_client_id() {
        let mut config = ClientConfig::default();
        config.client_id = "my-app".to_string();
        assert!(config.validate().unwrap_err().contains("numeric"));
    }

    #[test]
    fn test_validate_rejects_invalid_listen_scheme() {
        let mut config = ClientConfig::default();
        config.listen = "http://127.0.0.1:7710".to_string();
        assert!(config.validate().unwrap_err().contains("tcp://"));
    }

    #[test]
    fn test_validate_accepts_unix_listen() {
        let mut config = ClientConfig::default();
        config.listen = "unix:///tmp/drpc.sock".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_base_delay() {
        let mut config = ClientConfig::default();
        config.retry.base_delay_ms = 0;
        assert!(config.validate().unwrap_err().contains("base_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_max_delay_less_than_base() {
        let mut config = ClientConfig::default();
        config.retry.base_delay_ms = 1000;
        config.retry.max_delay_ms = 500;
        assert!(config.validate().unwrap_err().contains("max_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_attempts_below_unbounded() {
        let mut config = ClientConfig::default();
        config.retry.attempts = -2;
        assert!(config.validate().unwrap_err().contains("attempts"));
    }

    #[test]
    fn test_validate_rejects_zero_throttle_window() {
        let mut config = ClientConfig::default();
        config.throttle.window_ms = 0;
        assert!(config.validate().unwrap_err().contains("window_ms"));
    }

    #[test]
    fn test_validate_rejects_port_range_overflow() {
        let mut config = ClientConfig::default();
        config.endpoint.base_port = 65_530;
        config.endpoint.port_span = 10;
        assert!(config.validate().unwrap_err().contains("port range"));
    }

    #[test]
    fn test_validate_rejects_zero_probe_tries() {
        let mut config = ClientConfig::default();
        config.endpoint.max_tries = 0;
        assert!(config.validate().unwrap_err().contains("max_tries"));
    }
}

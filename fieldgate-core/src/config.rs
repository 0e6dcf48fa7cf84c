//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/fieldgate/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/fieldgate/` (~/.config/fieldgate/)
//! - Data: `$XDG_DATA_HOME/fieldgate/` (~/.local/share/fieldgate/)
//! - State/Logs: `$XDG_STATE_HOME/fieldgate/` (~/.local/state/fieldgate/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// MQTT broker connection
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Uplink probing
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Durable outbox
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Relay loop tuning
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker configuration
///
/// Credentials live here rather than in code; leave them unset for
/// anonymous brokers.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    /// Broker host name or address
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// MQTT client id (generated when unset)
    pub client_id: Option<String>,

    pub username: Option<String>,

    pub password: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Upper bound on one publish call, including the broker ack for QoS 1
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// MQTT QoS level (0 or 1)
    #[serde(default = "default_qos")]
    pub qos: u8,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            publish_timeout_ms: default_publish_timeout(),
            qos: default_qos(),
        }
    }
}

impl BrokerConfig {
    /// Client id to present to the broker
    pub fn resolved_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("fieldgate-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_publish_timeout() -> u64 {
    5000
}

fn default_qos() -> u8 {
    1
}

/// Which check decides whether the uplink is usable
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Broker client's own connection flag
    Broker,
    /// TCP connect to `tcp_target`
    Tcp,
    /// HTTP GET against `health_url`
    Http,
}

/// Connectivity monitor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectivityConfig {
    #[serde(default = "default_probe_kind")]
    pub probe: ProbeKind,

    /// Seconds between probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// A probe that takes longer than this is a `Down` verdict
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Consecutive agreeing probes required before the state flips
    #[serde(default = "default_debounce_probes")]
    pub debounce_probes: u32,

    /// `host:port` for the TCP probe (defaults to the broker address)
    pub tcp_target: Option<String>,

    /// URL for the HTTP probe
    pub health_url: Option<String>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe: default_probe_kind(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            debounce_probes: default_debounce_probes(),
            tcp_target: None,
            health_url: None,
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_probe_kind() -> ProbeKind {
    ProbeKind::Broker
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    3000
}

fn default_debounce_probes() -> u32 {
    1
}

/// Outbox storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    /// Database file (defaults to the XDG data directory)
    pub path: Option<PathBuf>,

    /// Reject new records once this many are pending (0 = unbounded)
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Records fetched per query while draining
    #[serde(default = "default_drain_page_size")]
    pub drain_page_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_records: default_max_records(),
            drain_page_size: default_drain_page_size(),
        }
    }
}

impl OutboxConfig {
    /// Configured path, or the default location under the data directory
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(Config::outbox_path)
    }
}

fn default_max_records() -> usize {
    100_000
}

fn default_drain_page_size() -> usize {
    64
}

/// Relay loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Bounded intake channel size shared by all producers
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    /// Resume an interrupted drain on probe ticks while the link stays up
    #[serde(default = "default_retry_drain")]
    pub retry_drain_while_up: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            intake_capacity: default_intake_capacity(),
            retry_drain_while_up: default_retry_drain(),
        }
    }
}

fn default_intake_capacity() -> usize {
    256
}

fn default_retry_drain() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Mirror log lines to stderr (foreground runs)
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(Error::Config("broker.host must not be empty".to_string()));
        }
        if self.broker.port == 0 {
            return Err(Error::Config("broker.port must be non-zero".to_string()));
        }
        if self.broker.qos > 1 {
            return Err(Error::Config("broker.qos must be 0 or 1".to_string()));
        }
        if self.broker.publish_timeout_ms == 0 {
            return Err(Error::Config(
                "broker.publish_timeout_ms must be positive".to_string(),
            ));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(Error::Config(
                "broker.password requires broker.username".to_string(),
            ));
        }

        let conn = &self.connectivity;
        if conn.probe_interval_secs == 0 || conn.probe_timeout_ms == 0 {
            return Err(Error::Config(
                "connectivity.probe_interval_secs and probe_timeout_ms must be positive"
                    .to_string(),
            ));
        }
        if conn.debounce_probes == 0 {
            return Err(Error::Config(
                "connectivity.debounce_probes must be at least 1".to_string(),
            ));
        }
        if conn.probe == ProbeKind::Http && conn.health_url.is_none() {
            return Err(Error::Config(
                "connectivity.health_url is required when probe = \"http\"".to_string(),
            ));
        }

        if self.outbox.drain_page_size == 0 {
            return Err(Error::Config(
                "outbox.drain_page_size must be positive".to_string(),
            ));
        }
        if self.relay.intake_capacity == 0 {
            return Err(Error::Config(
                "relay.intake_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Address the TCP probe dials
    pub fn tcp_probe_target(&self) -> String {
        self.connectivity
            .tcp_target
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.broker.host, self.broker.port))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/fieldgate/config.toml` (~/.config/fieldgate/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("fieldgate").join("config.toml")
    }

    /// Returns the data directory path (for the outbox database)
    ///
    /// `$XDG_DATA_HOME/fieldgate/` (~/.local/share/fieldgate/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("fieldgate")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/fieldgate/` (~/.local/state/fieldgate/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("fieldgate")
    }

    /// Returns the default outbox database path
    ///
    /// `$XDG_DATA_HOME/fieldgate/outbox.db`
    pub fn outbox_path() -> PathBuf {
        Self::data_dir().join("outbox.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/fieldgate/fieldgate.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("fieldgate.log")
    }
}

//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (APRSGATE_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use aprsgate_core::{GatewayIdentity, RouterConfig};
use aprsgate_link::{Credential, LinkConfig, LoginLine};
use aprsgate_protocol::{is_valid_callsign, normalize};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream APRS-IS connection.
    #[serde(default)]
    pub link: LinkSettings,

    /// Client-facing gateway settings.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Client keepalive.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Served callsigns.
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Upstream connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// APRS-IS server as `host:port`.
    #[serde(default = "default_server")]
    pub server: String,

    /// Callsign the gateway logs in as.
    #[serde(default = "default_callsign")]
    pub callsign: String,

    /// Passcode; derived from the callsign when unset.
    #[serde(default)]
    pub passcode: Option<u16>,

    /// Log in read-only (`pass -1`).
    #[serde(default)]
    pub listen_only: bool,

    /// Server-side filter expression.
    #[serde(default)]
    pub filter: String,

    /// Dial timeout in milliseconds.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,

    /// Delay between reconnect attempts in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Bound on one upstream write in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Client-facing gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Path hops for outbound packets; `TCPIP,<callsign>*` when unset.
    #[serde(default)]
    pub path: Option<Vec<String>>,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds; 0 disables keepalive.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Time a client has to answer a ping, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Callsigns served from startup.
    #[serde(default)]
    pub callsigns: Vec<String>,

    /// Newline-separated callsign file, reloaded periodically.
    #[serde(default)]
    pub file: Option<String>,

    /// Reload interval for `file` in seconds.
    #[serde(default = "default_directory_refresh")]
    pub refresh_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("APRSGATE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("APRSGATE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_server() -> String {
    "rotate.aprs.net:10152".to_string()
}

fn default_callsign() -> String {
    "N0CALL".to_string()
}

fn default_dial_timeout() -> u64 {
    10_000
}

fn default_reconnect_delay() -> u64 {
    10_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    10_000
}

fn default_directory_refresh() -> u64 {
    300
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            link: LinkSettings::default(),
            gateway: GatewaySettings::default(),
            heartbeat: HeartbeatConfig::default(),
            directory: DirectoryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            server: default_server(),
            callsign: default_callsign(),
            passcode: None,
            listen_only: false,
            filter: String::new(),
            dial_timeout_ms: default_dial_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            path: None,
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            callsigns: Vec::new(),
            file: None,
            refresh_secs: default_directory_refresh(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// `APRSGATE_CONFIG` names a file to use instead of the default paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("APRSGATE_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).into_owned());
        }

        let config_paths = [
            "aprsgate.toml",
            "/etc/aprsgate/aprsgate.toml",
            "~/.config/aprsgate/aprsgate.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check settings that serde can't.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_callsign(&self.link.callsign) {
            bail!("Invalid gateway callsign: {}", self.link.callsign);
        }
        if self.link.listen_only && self.link.passcode.is_some() {
            bail!("link.passcode cannot be combined with link.listen_only");
        }
        if self.link.write_timeout_ms == 0 {
            bail!("link.write_timeout_ms must be greater than zero");
        }
        if !self.gateway.websocket_path.starts_with('/') {
            bail!(
                "gateway.websocket_path must start with '/': {}",
                self.gateway.websocket_path
            );
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port don't form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// The login line sent upstream.
    #[must_use]
    pub fn login_line(&self) -> LoginLine {
        let credential = match (self.link.listen_only, self.link.passcode) {
            (true, _) => Credential::ListenOnly,
            (false, Some(code)) => Credential::Passcode(code),
            (false, None) => Credential::for_callsign(&self.link.callsign),
        };
        LoginLine::new(&self.link.callsign)
            .with_credential(credential)
            .with_filter(self.link.filter.clone())
    }

    /// Link manager settings.
    #[must_use]
    pub fn link_config(&self) -> LinkConfig {
        let mut config = LinkConfig::new(self.link.server.clone(), self.login_line());
        config.dial_timeout = Duration::from_millis(self.link.dial_timeout_ms);
        config.reconnect_delay = Duration::from_millis(self.link.reconnect_delay_ms);
        config.write_timeout = Duration::from_millis(self.link.write_timeout_ms);
        config
    }

    /// How the gateway appears in outbound paths.
    #[must_use]
    pub fn gateway_identity(&self) -> GatewayIdentity {
        let identity = GatewayIdentity::new(&self.link.callsign);
        match &self.gateway.path {
            Some(path) => identity.with_path(path.iter().map(|hop| normalize(hop)).collect()),
            None => identity,
        }
    }

    /// Session router settings.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            keepalive_interval: (self.heartbeat.interval_ms > 0)
                .then(|| Duration::from_millis(self.heartbeat.interval_ms)),
            keepalive_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
        }
    }
}

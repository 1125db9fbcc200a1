//! The endpoint configuration contract.
//!
//! A single structure selects one of three operating modes and carries the
//! mode-specific options. Every field has a default; a missing config file
//! is not fatal as long as the mode-required fields are present. Durations
//! are whole seconds.
//!
//! - `relay`: rendezvous through a relay, with direct-path migration
//! - `listener`: serve a direct connection (no relay)
//! - `connector`: dial a listener directly (no relay)

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Rendezvous through a relay with direct-path migration
    #[default]
    Relay,
    /// Accept a direct connection from the peer
    Listener,
    /// Dial the peer's listener directly
    Connector,
}

/// Endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Operating mode
    #[serde(default)]
    pub mode: Mode,
    /// Relay-mode options
    #[serde(default)]
    pub relay: RelaySection,
    /// Direct-mode options
    #[serde(default)]
    pub p2p: P2pSection,
    /// Virtual device options
    #[serde(default)]
    pub tap: TapSection,
    /// Key rotation options
    #[serde(default)]
    pub crypto: CryptoSection,
    /// Identity store paths
    #[serde(default)]
    pub identity: IdentitySection,
    /// Logging options
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Relay-mode options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// WebSocket URL of the rendezvous relay (required in relay mode)
    #[serde(default)]
    pub url: String,
    /// Skip CA verification of the relay TLS certificate
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// PEM CA bundle to validate the relay against (required unless
    /// `tls_skip_verify`)
    #[serde(default)]
    pub tls_ca_file: String,
    /// Seconds between reconnect attempts (>= 1)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    /// Reconnect attempts before giving up (>= 1)
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Handshake deadline in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

/// Direct-mode options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct P2pSection {
    /// `host:port` to listen on (listener mode)
    #[serde(default)]
    pub listen_address: String,
    /// `host:port` to dial (connector mode)
    #[serde(default)]
    pub peer_address: String,
    /// Whether the direct link uses TLS
    #[serde(default = "default_true")]
    pub tls_enabled: bool,
    /// Skip certificate verification when dialing
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// PEM certificate file (listener mode)
    #[serde(default)]
    pub tls_cert_file: String,
    /// PEM key file (listener mode)
    #[serde(default)]
    pub tls_key_file: String,
}

/// Virtual device options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapSection {
    /// Interface name
    #[serde(default = "default_tap_name")]
    pub name: String,
    /// Device MTU; must be within [576, 9000]
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Interface IPv4 address
    #[serde(default = "default_tap_addr")]
    pub ip_addr: String,
    /// Interface netmask
    #[serde(default = "default_tap_netmask")]
    pub netmask: String,
}

/// Key rotation options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSection {
    /// Rotate session keys periodically
    #[serde(default = "default_true")]
    pub enable_key_rotation: bool,
    /// Seconds between rotations (>= 60 when enabled)
    #[serde(default = "default_rotation_interval")]
    pub key_rotation_interval: u64,
}

/// Identity store paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySection {
    /// Directory holding the key files
    #[serde(default = "default_keys_dir")]
    pub keys_dir: String,
    /// Private key blob filename
    #[serde(default = "default_private_key_file")]
    pub private_key_file: String,
    /// Hex endpoint-id filename
    #[serde(default = "default_client_id_file")]
    pub client_id_file: String,
}

/// Logging options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// One of `debug`, `info`, `warn`, `error`
    #[serde(default = "default_log_level")]
    pub level: String,
    /// One of `text`, `json`
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Log file path; empty for stdout
    #[serde(default)]
    pub file: String,
}

fn default_reconnect_interval() -> u64 {
    5
}
fn default_max_reconnects() -> u32 {
    10
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_tap_name() -> String {
    "veil0".to_string()
}
fn default_mtu() -> u16 {
    1500
}
fn default_tap_addr() -> String {
    "10.99.0.1".to_string()
}
fn default_tap_netmask() -> String {
    "255.255.255.0".to_string()
}
fn default_rotation_interval() -> u64 {
    3600
}
fn default_keys_dir() -> String {
    "veilnet_keys".to_string()
}
fn default_private_key_file() -> String {
    "identity.key".to_string()
}
fn default_client_id_file() -> String {
    "endpoint_id".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            url: String::new(),
            tls_skip_verify: false,
            tls_ca_file: String::new(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnects: default_max_reconnects(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl Default for TapSection {
    fn default() -> Self {
        Self {
            name: default_tap_name(),
            mtu: default_mtu(),
            ip_addr: default_tap_addr(),
            netmask: default_tap_netmask(),
        }
    }
}

impl Default for CryptoSection {
    fn default() -> Self {
        Self {
            enable_key_rotation: true,
            key_rotation_interval: default_rotation_interval(),
        }
    }
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            keys_dir: default_keys_dir(),
            private_key_file: default_private_key_file(),
            client_id_file: default_client_id_file(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: String::new(),
        }
    }
}

impl Config {
    /// Validate once at startup.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidConfiguration`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidConfiguration(msg));

        match self.mode {
            Mode::Relay => {
                if self.relay.url.is_empty() {
                    return invalid("relay.url is required in relay mode".into());
                }
                match url::Url::parse(&self.relay.url) {
                    Ok(parsed) if matches!(parsed.scheme(), "ws" | "wss") => {}
                    Ok(parsed) => {
                        return invalid(format!(
                            "relay.url scheme '{}' is not ws or wss",
                            parsed.scheme()
                        ));
                    }
                    Err(e) => return invalid(format!("relay.url: {e}")),
                }
                if self.relay.reconnect_interval < 1 {
                    return invalid("relay.reconnect_interval must be at least 1 second".into());
                }
                if self.relay.max_reconnects < 1 {
                    return invalid("relay.max_reconnects must be at least 1".into());
                }
                if !self.relay.tls_skip_verify && self.relay.tls_ca_file.is_empty() {
                    return invalid(
                        "relay.tls_ca_file is required unless relay.tls_skip_verify".into(),
                    );
                }
            }
            Mode::Listener => {
                if self.p2p.listen_address.is_empty() {
                    return invalid("p2p.listen_address is required in listener mode".into());
                }
                if self.p2p.tls_enabled
                    && (self.p2p.tls_cert_file.is_empty() || self.p2p.tls_key_file.is_empty())
                {
                    return invalid(
                        "p2p.tls_cert_file and p2p.tls_key_file are required with TLS".into(),
                    );
                }
            }
            Mode::Connector => {
                if self.p2p.peer_address.is_empty() {
                    return invalid("p2p.peer_address is required in connector mode".into());
                }
            }
        }

        if !(576..=9000).contains(&self.tap.mtu) {
            return invalid(format!("tap.mtu {} outside [576, 9000]", self.tap.mtu));
        }
        if self.tap.ip_addr.parse::<Ipv4Addr>().is_err() {
            return invalid(format!("tap.ip_addr '{}' is not an IPv4 address", self.tap.ip_addr));
        }
        if self.tap.netmask.parse::<Ipv4Addr>().is_err() {
            return invalid(format!("tap.netmask '{}' is not an IPv4 netmask", self.tap.netmask));
        }

        if self.crypto.enable_key_rotation && self.crypto.key_rotation_interval < 60 {
            return invalid("crypto.key_rotation_interval must be at least 60 seconds".into());
        }

        if !matches!(self.logging.level.as_str(), "debug" | "info" | "warn" | "error") {
            return invalid(format!("logging.level '{}' unrecognized", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return invalid(format!("logging.format '{}' unrecognized", self.logging.format));
        }

        Ok(())
    }

    /// Reconnect interval as a [`Duration`]
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.relay.reconnect_interval)
    }

    /// Handshake deadline as a [`Duration`]
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.handshake_timeout)
    }

    /// Key rotation interval as a [`Duration`]
    #[must_use]
    pub fn key_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.crypto.key_rotation_interval)
    }
}

//! Relay server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use veilnet_core::ConfigError;

/// The `server` section of the relay configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayServerConfig {
    /// Listen address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// PEM certificate file for the public TLS endpoint
    #[serde(default)]
    pub tls_cert_file: String,
    /// PEM key file for the public TLS endpoint
    #[serde(default)]
    pub tls_key_file: String,
    /// Maximum concurrent clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Heartbeat interval handed to clients, in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// MTU handed to clients
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Key rotation interval handed to clients, in seconds
    #[serde(default = "default_key_rotation_interval")]
    pub key_rotation_interval: u64,
    /// Forwarded messages per client per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    /// Identity key directory
    #[serde(default = "default_keys_dir")]
    pub keys_dir: String,
}

fn default_listen_address() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_max_clients() -> usize {
    1000
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_mtu() -> u16 {
    1500
}
fn default_key_rotation_interval() -> u64 {
    3600
}
fn default_rate_limit() -> usize {
    5000
}
fn default_keys_dir() -> String {
    "veilnet_relay_keys".to_string()
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            max_clients: default_max_clients(),
            heartbeat_interval: default_heartbeat_interval(),
            mtu: default_mtu(),
            key_rotation_interval: default_key_rotation_interval(),
            rate_limit: default_rate_limit(),
            keys_dir: default_keys_dir(),
        }
    }
}

impl RelayServerConfig {
    /// Validate once at startup.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidConfiguration`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidConfiguration(msg));

        if self.listen_address.parse::<SocketAddr>().is_err() {
            return invalid(format!(
                "server.listen_address '{}' is not host:port",
                self.listen_address
            ));
        }
        if self.tls_cert_file.is_empty() || self.tls_key_file.is_empty() {
            return invalid("server.tls_cert_file and server.tls_key_file are required".into());
        }
        if self.max_clients < 2 {
            return invalid("server.max_clients must allow at least one pair".into());
        }
        if self.heartbeat_interval < 1 {
            return invalid("server.heartbeat_interval must be at least 1 second".into());
        }
        if !(576..=9000).contains(&self.mtu) {
            return invalid(format!("server.mtu {} outside [576, 9000]", self.mtu));
        }
        if self.rate_limit < 1 {
            return invalid("server.rate_limit must be at least 1".into());
        }

        Ok(())
    }

    /// Heartbeat interval as a [`Duration`]
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Key rotation interval as a [`Duration`]
    #[must_use]
    pub fn key_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.key_rotation_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelayServerConfig {
        RelayServerConfig {
            tls_cert_file: "relay.pem".into(),
            tls_key_file: "relay.key".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_tls_files_required() {
        let config = RelayServerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_listen_address() {
        let mut config = valid();
        config.listen_address = "nonsense".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_clients_floor() {
        let mut config = valid();
        config.max_clients = 1;
        assert!(config.validate().is_err());
    }
}

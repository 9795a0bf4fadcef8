//! Every option the client recognizes at construction.

use crate::error::Error;
use crate::tls::TlsConfig;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6379;

#[derive(Serialize, Deserialize, Debug, Clone, Derivative)]
#[serde(deny_unknown_fields)]
#[derivative(Default)]
pub struct ClientConfig {
    /// Seed nodes. In standalone mode the first entry is the server; in
    /// cluster mode any reachable entry bootstraps topology discovery.
    pub addresses: Vec<NodeAddress>,

    /// When present, every connection is wrapped in TLS. Must match the
    /// server's expectation.
    pub tls: Option<TlsConfig>,

    /// Sent during the handshake when present; otherwise no AUTH is issued.
    pub credentials: Option<Credentials>,

    /// Per-request deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    #[derivative(Default(value = "default_request_timeout_ms()"))]
    pub request_timeout_ms: u64,

    /// Where reads are routed by default. Per-request routing can override
    /// this with `prefer_replica`.
    #[serde(default)]
    pub read_from: ReadFrom,

    /// Protocol version requested via HELLO. The connection degrades to
    /// RESP2 when the server does not understand HELLO.
    #[serde(default)]
    pub protocol: ProtocolVersion,

    /// Sent via CLIENT SETNAME during the handshake.
    pub client_name: Option<String>,

    /// Standalone only: SELECT this database during the handshake.
    pub database_id: Option<i64>,

    #[serde(default)]
    pub reconnect_strategy: ReconnectStrategy,

    /// Selects the cluster topology engine (slot discovery, redirections).
    #[serde(default)]
    pub cluster_mode: bool,

    #[serde(default = "default_connect_timeout_ms")]
    #[derivative(Default(value = "default_connect_timeout_ms()"))]
    pub connect_timeout_ms: u64,

    /// When set, the slot map is re-fetched on this interval even without
    /// redirections.
    pub periodic_refresh_ms: Option<u64>,

    /// Connections with no pending requests for this long may be reaped.
    #[serde(default = "default_idle_timeout_ms")]
    #[derivative(Default(value = "default_idle_timeout_ms()"))]
    pub idle_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    250
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Seed addresses in `host:port` form.
    pub fn seed_addresses(&self) -> Vec<String> {
        self.addresses.iter().map(NodeAddress::to_address).collect()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.addresses.is_empty() {
            return Err(Error::Configuration(
                "at least one address is required".into(),
            ));
        }
        if let Some(credentials) = &self.credentials {
            if credentials.password.is_empty() {
                return Err(Error::Configuration("password must not be empty".into()));
            }
        }
        if self.cluster_mode && self.database_id.is_some() {
            return Err(Error::Configuration(
                "database_id is only supported in standalone mode".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Configuration(
                "request_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeAddress {
    pub host: String,
    /// Defaults to 6379.
    pub port: Option<u16>,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeAddress {
            host: host.into(),
            port: Some(port),
        }
    }

    pub fn to_address(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(DEFAULT_PORT))
    }
}

#[derive(Serialize, Deserialize, Clone, Derivative)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub username: Option<String>,

    // Reduce risk of logging passwords.
    #[derivative(Debug = "ignore")]
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFrom {
    #[default]
    Primary,
    PreferReplica,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[serde(rename = "RESP2")]
    Resp2,
    #[default]
    #[serde(rename = "RESP3")]
    Resp3,
}

/// Backoff schedule for reconnecting a dropped node connection.
///
/// The delay before attempt `n` (zero based) is
/// `base_ms * factor * exponent_base^n`, capped at `max_ms`. The attempt
/// counter resets whenever a connection reaches Ready.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReconnectStrategy {
    pub number_of_retries: u32,
    pub factor: u32,
    pub exponent_base: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        ReconnectStrategy {
            number_of_retries: 8,
            factor: 2,
            exponent_base: 2,
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults() {
        let address = NodeAddress {
            host: "cache-1".into(),
            port: None,
        };
        assert_eq!(address.to_address(), "cache-1:6379");
        assert_eq!(NodeAddress::new("cache-2", 7000).to_address(), "cache-2:7000");
    }

    #[test]
    fn empty_addresses_are_rejected() {
        let config = ClientConfig::default();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn database_id_is_standalone_only() {
        let config = ClientConfig {
            addresses: vec![NodeAddress::new("localhost", 6379)],
            cluster_mode: true,
            database_id: Some(2),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn defaults_match_documentation() {
        let config = ClientConfig {
            addresses: vec![NodeAddress::new("localhost", 6379)],
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.read_from, ReadFrom::Primary);
        assert_eq!(config.protocol, ProtocolVersion::Resp3);
        assert!(!config.cluster_mode);
    }
}

//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TANDEM_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tandem_core::ProtocolConfig;
use tandem_protocol::{ProtocolVersion, DEFAULT_PORT};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Protocol engine configuration.
    pub protocol: ProtocolConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TANDEM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        apply_protocol_env_overrides(&mut self.protocol);
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Validates every section and their consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tls.validate()?;
        self.effective_protocol()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if self.protocol.requires_tls && !self.tls.enabled {
            return Err(ConfigError::ValidationError(
                "protocol.requires_tls is set but TLS is not enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the protocol configuration sessions run with.
    ///
    /// TLS can only be offered when certificate material is configured,
    /// so `supports_tls` follows `tls.enabled`.
    pub fn effective_protocol(&self) -> ProtocolConfig {
        let mut protocol = self.protocol.clone();
        protocol.supports_tls = self.tls.enabled;
        protocol
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TANDEM_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("TANDEM_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

fn apply_protocol_env_overrides(protocol: &mut ProtocolConfig) {
    if let Some(v) = env_version("TANDEM_MIN_VERSION") {
        protocol.server_min_version = v;
    }
    if let Some(v) = env_version("TANDEM_MAX_VERSION") {
        protocol.server_max_version = v;
    }
    if let Some(ms) = env_u64("TANDEM_KEEP_ALIVE_INTERVAL_MS") {
        protocol.keep_alive_interval_ms = ms;
    }
    if let Some(ms) = env_u64("TANDEM_KEEP_ALIVE_TIMEOUT_MS") {
        protocol.keep_alive_timeout_ms = ms;
    }
    if let Some(ms) = env_u64("TANDEM_RPC_TIMEOUT_MS") {
        protocol.rpc_timeout_ms = ms;
    }
    if let Some(ms) = env_u64("TANDEM_HANDSHAKE_TIMEOUT_MS") {
        protocol.handshake_timeout_ms = ms;
    }
    if let Ok(required) = std::env::var("TANDEM_TLS_REQUIRED") {
        protocol.requires_tls = parse_bool(&required);
    }
    if let Ok(enabled) = std::env::var("TANDEM_ENABLED") {
        protocol.enabled = parse_bool(&enabled);
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_version(name: &str) -> Option<ProtocolVersion> {
    let raw: u8 = std::env::var(name).ok()?.parse().ok()?;
    ProtocolVersion::new(raw)
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Offer the in-band TLS upgrade. Needs `cert_path` and `key_path`.
    pub enabled: bool,
    /// Server certificate chain (PEM).
    pub cert_path: Option<PathBuf>,
    /// Server private key (PEM).
    pub key_path: Option<PathBuf>,
    /// Ask upgrading clients for a certificate (mTLS).
    pub require_client_cert: bool,
    /// CA bundle (PEM) that client certificates must chain to.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TANDEM_TLS_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Ok(path) = std::env::var("TANDEM_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("TANDEM_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(require) = std::env::var("TANDEM_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = parse_bool(&require);
        }
        if let Ok(path) = std::env::var("TANDEM_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Checks that certificate material is configured when TLS is on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = match self {
            Self { enabled: false, .. } => None,
            Self { cert_path: None, .. } => Some("tls.cert_path"),
            Self { key_path: None, .. } => Some("tls.key_path"),
            Self {
                require_client_cert: true,
                client_ca_path: None,
                ..
            } => Some("tls.client_ca_path"),
            _ => None,
        };
        match missing {
            Some(field) => Err(ConfigError::ValidationError(format!(
                "TLS is enabled but {} is not set",
                field
            ))),
            None => Ok(()),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TANDEM_METRICS_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Ok(addr) = std::env::var("TANDEM_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {1}", .0.display())]
    IoError(PathBuf, #[source] std::io::Error),
    #[error("cannot parse {}: {1}", .0.display())]
    ParseError(PathBuf, String),
    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Socket addresses as plain strings in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

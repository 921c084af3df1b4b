//! Protocol engine configuration.
//!
//! A [`ProtocolConfig`] is built once (usually deserialized from the
//! server or client configuration file), validated, and then shared
//! read-only by every session created from it.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_protocol::{ProtocolVersion, VERSION_TABLE};

/// Largest accepted value for any `*_ms` option; call deadlines travel
/// as 32-bit milliseconds.
pub const MAX_DURATION_MS: u64 = u32::MAX as u64;

/// Options recognized by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Lowest version offered when acting as client.
    pub client_min_version: ProtocolVersion,
    /// Highest version offered when acting as client.
    pub client_max_version: ProtocolVersion,
    /// Lowest version accepted when acting as server.
    pub server_min_version: ProtocolVersion,
    /// Highest version accepted when acting as server.
    pub server_max_version: ProtocolVersion,
    /// Outbound idle interval after which a keep-alive is sent.
    pub keep_alive_interval_ms: u64,
    /// Inbound idle time after which the peer is considered dead.
    pub keep_alive_timeout_ms: u64,
    /// Default deadline for outgoing calls.
    pub rpc_timeout_ms: u64,
    /// Period of the pending-call expiry scan.
    pub expiry_scan_interval_ms: u64,
    /// Upper bound on the whole handshake, TLS upgrade included.
    pub handshake_timeout_ms: u64,
    /// Whether this endpoint can upgrade to TLS.
    pub supports_tls: bool,
    /// Whether this endpoint refuses to run without TLS.
    pub requires_tls: bool,
    /// Server-side kill switch; when false every `CONNECT` is rejected.
    pub enabled: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            client_min_version: ProtocolVersion::MIN,
            client_max_version: ProtocolVersion::MAX,
            server_min_version: ProtocolVersion::MIN,
            server_max_version: ProtocolVersion::MAX,
            keep_alive_interval_ms: 10_000,
            keep_alive_timeout_ms: 30_000,
            rpc_timeout_ms: 30_000,
            expiry_scan_interval_ms: 100,
            handshake_timeout_ms: 10_000,
            supports_tls: false,
            requires_tls: false,
            enabled: true,
        }
    }
}

impl ProtocolConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.client_bounds().validate("client")?;
        self.server_bounds().validate("server")?;

        if self.requires_tls && !self.supports_tls {
            return Err(CoreError::Config(
                "requires_tls is set but supports_tls is not".to_string(),
            ));
        }
        for (name, value) in [
            ("keep_alive_interval_ms", self.keep_alive_interval_ms),
            ("keep_alive_timeout_ms", self.keep_alive_timeout_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("expiry_scan_interval_ms", self.expiry_scan_interval_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
        ] {
            if value > MAX_DURATION_MS {
                return Err(CoreError::Config(format!(
                    "{} ({}) exceeds {}",
                    name, value, MAX_DURATION_MS
                )));
            }
        }
        if self.rpc_timeout_ms == 0 {
            return Err(CoreError::Config("rpc_timeout_ms must be positive".to_string()));
        }
        if self.expiry_scan_interval_ms == 0 {
            return Err(CoreError::Config(
                "expiry_scan_interval_ms must be positive".to_string(),
            ));
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(CoreError::Config(
                "keep_alive_interval_ms must be positive".to_string(),
            ));
        }
        // Peers are expected to share keep-alive settings, so our own
        // interval stands in for the peer's.
        if self.keep_alive_timeout_ms <= self.keep_alive_interval_ms {
            return Err(CoreError::Config(format!(
                "keep_alive_timeout_ms ({}) must exceed keep_alive_interval_ms ({})",
                self.keep_alive_timeout_ms, self.keep_alive_interval_ms
            )));
        }
        Ok(())
    }

    /// Version bounds used when acting as client.
    pub fn client_bounds(&self) -> VersionBounds {
        VersionBounds::new(self.client_min_version, self.client_max_version)
    }

    /// Version bounds used when acting as server.
    pub fn server_bounds(&self) -> VersionBounds {
        VersionBounds::new(self.server_min_version, self.server_max_version)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn expiry_scan_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_scan_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Sets both client and server version bounds.
    pub fn with_versions(mut self, min: ProtocolVersion, max: ProtocolVersion) -> Self {
        self.client_min_version = min;
        self.client_max_version = max;
        self.server_min_version = min;
        self.server_max_version = max;
        self
    }

    pub fn with_client_versions(mut self, min: ProtocolVersion, max: ProtocolVersion) -> Self {
        self.client_min_version = min;
        self.client_max_version = max;
        self
    }

    pub fn with_server_versions(mut self, min: ProtocolVersion, max: ProtocolVersion) -> Self {
        self.server_min_version = min;
        self.server_max_version = max;
        self
    }

    pub fn with_tls(mut self, supports: bool, requires: bool) -> Self {
        self.supports_tls = supports;
        self.requires_tls = requires;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_ms = millis(timeout);
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive_interval_ms = millis(interval);
        self.keep_alive_timeout_ms = millis(timeout);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// An inclusive `[min, max]` version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionBounds {
    pub min: ProtocolVersion,
    pub max: ProtocolVersion,
}

impl VersionBounds {
    pub fn new(min: ProtocolVersion, max: ProtocolVersion) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: ProtocolVersion) -> bool {
        self.min <= version && version <= self.max
    }

    /// Known versions inside the bounds, highest first.
    pub fn descending(&self) -> Vec<ProtocolVersion> {
        VERSION_TABLE
            .iter()
            .rev()
            .map(|entry| entry.version)
            .filter(|v| self.contains(*v))
            .collect()
    }

    fn validate(&self, role: &str) -> Result<(), CoreError> {
        if self.min > self.max {
            return Err(CoreError::Config(format!(
                "{} min version {} exceeds max version {}",
                role, self.min, self.max
            )));
        }
        for v in [self.min, self.max] {
            if !v.is_known() {
                return Err(CoreError::Config(format!(
                    "{} version bound {} is not a known protocol version",
                    role, v
                )));
            }
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: u8) -> ProtocolVersion {
        ProtocolVersion::new(n).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ProtocolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rpc_timeout(), Duration::from_secs(30));
        assert!(config.enabled);
        assert_eq!(config.client_bounds().descending().len(), 5);
    }

    #[test]
    fn test_descending_bounds() {
        let bounds = VersionBounds::new(v(2), v(4));
        assert_eq!(bounds.descending(), vec![v(4), v(3), v(2)]);
        assert!(bounds.contains(v(3)));
        assert!(!bounds.contains(v(5)));
    }

    #[test]
    fn test_requires_implies_supports() {
        let config = ProtocolConfig::default().with_tls(false, true);
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let config = ProtocolConfig::default().with_client_versions(v(4), v(2));
        assert!(config.validate().is_err());

        let config = ProtocolConfig::default().with_server_versions(v(1), v(9));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keep_alive_relationship_enforced() {
        let config = ProtocolConfig::default()
            .with_keep_alive(Duration::from_secs(10), Duration::from_secs(10));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keep_alive_timeout_ms"));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let config = ProtocolConfig::default().with_rpc_timeout(Duration::MAX);
        assert_eq!(config.rpc_timeout_ms, u64::MAX);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rpc_timeout_ms"));

        let config = ProtocolConfig::default()
            .with_keep_alive(Duration::from_secs(10), Duration::from_secs(u64::MAX / 1000));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keep_alive_timeout_ms"));

        let config: ProtocolConfig =
            serde_json::from_str(r#"{"handshake_timeout_ms": 18446744073709551615}"#).unwrap();
        assert!(config.validate().is_err());

        let config = ProtocolConfig {
            rpc_timeout_ms: MAX_DURATION_MS,
            ..ProtocolConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ProtocolConfig =
            serde_json::from_str(r#"{"server_min_version": 2, "requires_tls": true}"#).unwrap();
        assert_eq!(config.server_min_version, v(2));
        assert!(config.requires_tls);
        assert_eq!(config.keep_alive_timeout_ms, 30_000);
    }
}

//! Relay configuration

use netherlink_proto::{MAX_DECOMPRESSED_SIZE, MIN_PROTOCOL, MIN_VERSION};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Name advertised in LAN discovery and used in disconnect messages
pub const DEFAULT_SERVER_NAME: &str = "NetherLink";

pub const DEFAULT_IPV4_PORT: u16 = 19132;
pub const DEFAULT_IPV6_PORT: u16 = 19133;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Loopback ingress (IPv4)
    pub ipv4_bind: SocketAddr,
    /// Loopback ingress (IPv6); `None` disables the second listener
    pub ipv6_bind: Option<SocketAddr>,
    /// Answer LAN discovery pings next to each ingress listener
    pub discovery: bool,
    pub server_name: String,
    /// Oldest client protocol accepted
    pub min_protocol: i32,
    /// Game version shown to clients below `min_protocol`
    pub min_version: String,
    /// Pause before closing a connection after the last directive
    #[serde(with = "duration_millis")]
    pub drain_delay: Duration,
    /// Echo probes per candidate address
    pub probe_count: u32,
    #[serde(with = "duration_millis")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub status_cycle: Duration,
    #[serde(with = "duration_millis")]
    pub status_spacing: Duration,
    #[serde(with = "duration_millis")]
    pub login_timeout: Duration,
    pub max_decompressed_size: usize,
}

/// Helper module for serializing Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ipv4_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_IPV4_PORT),
            ipv6_bind: Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                DEFAULT_IPV6_PORT,
            )),
            discovery: true,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            min_protocol: MIN_PROTOCOL,
            min_version: MIN_VERSION.to_string(),
            drain_delay: Duration::from_secs(1),
            probe_count: 3,
            probe_timeout: Duration::from_secs(2),
            status_cycle: Duration::from_secs(5),
            status_spacing: Duration::from_millis(100),
            login_timeout: Duration::from_secs(30),
            max_decompressed_size: MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Disconnect text for clients below the protocol floor
    pub fn outdated_client_message(&self) -> String {
        format!(
            "{} requires Minecraft {} or newer.",
            self.server_name, self.min_version
        )
    }
}

/// Builder for RelayConfig
#[derive(Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    pub fn ipv4_bind(mut self, addr: SocketAddr) -> Self {
        self.config.ipv4_bind = addr;
        self
    }

    pub fn ipv6_bind(mut self, addr: Option<SocketAddr>) -> Self {
        self.config.ipv6_bind = addr;
        self
    }

    pub fn discovery(mut self, enabled: bool) -> Self {
        self.config.discovery = enabled;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    pub fn min_protocol(mut self, protocol: i32, version: impl Into<String>) -> Self {
        self.config.min_protocol = protocol;
        self.config.min_version = version.into();
        self
    }

    pub fn drain_delay(mut self, delay: Duration) -> Self {
        self.config.drain_delay = delay;
        self
    }

    pub fn probe_count(mut self, count: u32) -> Self {
        self.config.probe_count = count;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn status_cycle(mut self, cycle: Duration, spacing: Duration) -> Self {
        self.config.status_cycle = cycle;
        self.config.status_spacing = spacing;
        self
    }

    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.config.login_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RelayConfig, String> {
        if self.config.server_name.is_empty() {
            return Err("server_name must not be empty".to_string());
        }
        if self.config.probe_count == 0 {
            return Err("probe_count must be at least 1".to_string());
        }
        if self.config.status_cycle.is_zero() {
            return Err("status_cycle must be positive".to_string());
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.ipv4_bind.to_string(), "127.0.0.1:19132");
        assert_eq!(config.ipv6_bind.unwrap().to_string(), "[::1]:19133");
        assert_eq!(config.min_protocol, 818);
        assert_eq!(config.drain_delay, Duration::from_secs(1));
        assert_eq!(config.probe_count, 3);
    }

    #[test]
    fn test_outdated_client_message() {
        let config = RelayConfig::default();
        assert_eq!(
            config.outdated_client_message(),
            "NetherLink requires Minecraft 1.21.90 or newer."
        );
    }

    #[test]
    fn test_builder_rejects_zero_probes() {
        assert!(RelayConfig::builder().probe_count(0).build().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"drain_delay": 250, "server_name": "Relay"}"#).unwrap();
        assert_eq!(config.drain_delay, Duration::from_millis(250));
        assert_eq!(config.server_name, "Relay");
        assert_eq!(config.status_cycle, Duration::from_secs(5));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["status_spacing"], 100);
    }
}

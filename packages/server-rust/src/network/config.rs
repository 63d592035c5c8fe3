//! Network configuration types for the dispatcher.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use jobrelay_core::codec::DEFAULT_MAX_FRAME_LEN;

/// Configuration of the socket workers connect back to.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Host network interface preference. `"all"` or any IPv4-looking value
    /// selects IPv4 loopback; anything else selects IPv6 loopback.
    pub network_interface: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// How long a fresh connection may take to announce its language.
    pub handshake_timeout: Duration,
    /// Once the first announcement byte arrived, how long to wait for more
    /// before treating the announcement as complete.
    pub announce_grace: Duration,
}

impl ListenerConfig {
    /// Loopback address matching the configured interface preference.
    #[must_use]
    pub fn host_address(&self) -> IpAddr {
        if self.network_interface == "all" || self.network_interface.contains('.') {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            network_interface: "all".to_string(),
            port: 0,
            handshake_timeout: Duration::from_secs(1),
            announce_grace: Duration::from_millis(50),
        }
    }
}

/// Per-connection configuration controlling backpressure and framing limits.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound requests per connection.
    pub outbound_channel_capacity: usize,
    /// Largest accepted response payload in bytes.
    pub max_frame_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_config_defaults() {
        let config = ListenerConfig::default();
        assert_eq!(config.network_interface, "all");
        assert_eq!(config.port, 0);
        assert_eq!(config.handshake_timeout, Duration::from_secs(1));
        assert_eq!(config.announce_grace, Duration::from_millis(50));
    }

    #[test]
    fn connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.outbound_channel_capacity, 64);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn host_address_selection() {
        let mut config = ListenerConfig::default();
        assert_eq!(config.host_address(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        config.network_interface = "192.168.1.10".to_string();
        assert_eq!(config.host_address(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        config.network_interface = "fe80::1".to_string();
        assert_eq!(config.host_address(), IpAddr::V6(Ipv6Addr::LOCALHOST));

        config.network_interface = "allv6".to_string();
        assert_eq!(config.host_address(), IpAddr::V6(Ipv6Addr::LOCALHOST));
    }
}

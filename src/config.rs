use std::time::Duration;

use anyhow::bail;

use crate::packet_header::ClientIndex;
use crate::peer_addr::PeerAddr;

/// Thresholds for the binary congestion classifier.
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    /// RTT average above which a connection is classified as congested.
    pub congested_rtt_threshold: Duration,

    /// Continuous below-threshold time required before a congested connection
    ///  is classified as healthy again. Clamped to [1s, 60s].
    pub reset_congested_time: Duration,
}

impl CongestionConfig {
    pub const MIN_RESET_CONGESTED_TIME: Duration = Duration::from_secs(1);
    pub const MAX_RESET_CONGESTED_TIME: Duration = Duration::from_secs(60);

    pub fn effective_reset_congested_time(&self) -> Duration {
        self.reset_congested_time.clamp(
            Self::MIN_RESET_CONGESTED_TIME,
            Self::MAX_RESET_CONGESTED_TIME,
        )
    }
}

impl Default for CongestionConfig {
    fn default() -> CongestionConfig {
        CongestionConfig {
            congested_rtt_threshold: Duration::from_millis(250),
            reset_congested_time: Duration::from_secs(10),
        }
    }
}

/// Shared configuration for both roles. Both peers must be built from the same
///  values - nothing in here is negotiated on the wire.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Application protocol id stamped into every packet. A received packet
    ///  with a different app id is silently discarded - it signals a foreign
    ///  or stale sender, not an error.
    pub app_protocol_id: u8,

    /// The server's endpoint: the server binds this port, clients send to it.
    pub server_addr: PeerAddr,

    /// A connection whose last received packet is older than this is
    ///  considered dead. Also bounds the client's handshake wait.
    pub connection_timeout: Duration,

    /// Cadence of keep-alive packets on an established connection.
    pub keep_alive_interval: Duration,

    /// Cadence of `ConnectionRequest` retransmission while the handshake is
    ///  pending.
    pub connection_request_interval: Duration,

    /// Capacity of the server's connection pool. Must leave room below the
    ///  invalid-index marker (0xff).
    pub max_clients: usize,

    pub congestion: CongestionConfig,
}

impl NetConfig {
    pub fn new(app_protocol_id: u8, server_addr: PeerAddr) -> NetConfig {
        NetConfig {
            app_protocol_id,
            server_addr,
            connection_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_millis(50),
            connection_request_interval: Duration::from_secs(1),
            max_clients: 64,
            congestion: CongestionConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_timeout.is_zero() {
            bail!("connection timeout must be non-zero");
        }
        if self.keep_alive_interval.is_zero() {
            bail!("keep-alive interval must be non-zero");
        }
        if self.connection_request_interval.is_zero() {
            bail!("connection request interval must be non-zero");
        }
        if self.max_clients == 0 {
            bail!("connection pool capacity must be at least 1");
        }
        if self.max_clients >= crate::packet_header::INVALID_CLIENT_INDEX as usize {
            bail!(
                "connection pool capacity must be below {}",
                ClientIndex::MAX
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_addr() -> PeerAddr {
        PeerAddr::new(Ipv4Addr::new(127, 0, 0, 1), 30000)
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(NetConfig::new(0x4b, test_addr()).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = NetConfig::new(0x4b, test_addr());
        config.keep_alive_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = NetConfig::new(0x4b, test_addr());
        config.connection_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_pool() {
        let mut config = NetConfig::new(0x4b, test_addr());
        config.max_clients = 255;
        assert!(config.validate().is_err());

        config.max_clients = 254;
        assert!(config.validate().is_ok());
    }
}

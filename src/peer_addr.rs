use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// A peer's network endpoint: a 32-bit IPv4 address plus a 16-bit UDP port.
///
/// This is a plain value type - it is copied freely, compared for equality when
///  matching a datagram's sender against a connection slot, and packed into
///  socket addresses for the actual send/receive calls. The protocol is IPv4
///  only; the fixed wire header has no room for address family negotiation.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerAddr {
    ip: Ipv4Addr,
    port: u16,
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl PeerAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> PeerAddr {
        PeerAddr { ip, port }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ip.to_bits());
        buf.put_u16(self.port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddr> {
        let ip = buf.try_get_u32()?;
        let port = buf.try_get_u16()?;
        Ok(PeerAddr {
            ip: ip.into(),
            port,
        })
    }
}

impl From<SocketAddrV4> for PeerAddr {
    fn from(addr: SocketAddrV4) -> Self {
        PeerAddr {
            ip: *addr.ip(),
            port: addr.port(),
        }
    }
}

impl TryFrom<SocketAddr> for PeerAddr {
    type Error = anyhow::Error;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => Err(anyhow!("IPv6 peer address is not supported: {}", v6)),
        }
    }
}

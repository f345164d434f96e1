use std::io::ErrorKind;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::peer_addr::PeerAddr;

/// The narrow datagram transport interface the protocol is built on: bind a
///  local port, send a buffer to an address, non-blocking receive with sender,
///  and a readiness primitive to park on. Introduced as a trait to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Fire-and-forget send. A true return only means the datagram left the
    ///  socket, not that it was received.
    async fn send_packet(&self, to: PeerAddr, packet_buf: &[u8]) -> bool;

    /// Non-blocking receive: None when no datagram is currently available.
    fn try_receive(&self, buf: &mut [u8]) -> Option<(PeerAddr, usize)>;

    /// Suspend until the socket (probably) has a datagram to read.
    async fn readable(&self);

    fn local_port(&self) -> u16;
}

pub struct UdpDatagramSocket {
    socket: UdpSocket,
}

impl UdpDatagramSocket {
    /// Bind a UDP socket on all IPv4 interfaces. Port 0 binds an ephemeral
    ///  port. Bind failure is fatal to startup - there is no retry.
    pub async fn bind(port: u16) -> anyhow::Result<UdpDatagramSocket> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!("bound datagram socket to {:?}", socket.local_addr()?);

        Ok(UdpDatagramSocket { socket })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_packet(&self, to: PeerAddr, packet_buf: &[u8]) -> bool {
        match self.socket.send_to(packet_buf, to.to_socket_addr()).await {
            Ok(num_sent) if num_sent == packet_buf.len() => true,
            Ok(num_sent) => {
                warn!("short send to {:?}: {} of {} bytes", to, num_sent, packet_buf.len());
                false
            }
            Err(e) => {
                error!("error sending datagram to {:?}: {}", to, e);
                false
            }
        }
    }

    fn try_receive(&self, buf: &mut [u8]) -> Option<(PeerAddr, usize)> {
        loop {
            match self.socket.try_recv_from(buf) {
                Ok((num_read, from)) => match PeerAddr::try_from(from) {
                    Ok(peer) => return Some((peer, num_read)),
                    Err(_) => {
                        debug!("datagram from non-IPv4 sender {:?} - dropping", from);
                        continue;
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) => {
                    error!("socket error on receive: {}", e);
                    return None;
                }
            }
        }
    }

    async fn readable(&self) {
        if let Err(e) = self.socket.readable().await {
            error!("error waiting for socket readiness: {}", e);
        }
    }

    fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
            .port()
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::NetConfig;
use crate::event_handler::{ClientEventHandler, ConnectionStatus};
use crate::packet_header::{
    encode_packet, ClientIndex, PacketHeader, PacketType, INVALID_CLIENT_INDEX, MAX_PACKET_SIZE,
    MAX_PAYLOAD_SIZE,
};
use crate::peer_addr::PeerAddr;
use crate::reliability::ReliabilityContext;
use crate::socket::DatagramSocket;

const COMMAND_CHANNEL_SIZE: usize = 256;

pub enum ClientCommand {
    SendMessage(Vec<u8>),
    Shutdown,
}

/// Cheaply cloneable handle for submitting work to the client's network task.
/// This is the only way other tasks may interact with connection state - the
///  state itself is owned exclusively by the network task.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<ClientCommand>,
}

impl ClientHandle {
    pub async fn send_message(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.commands
            .send(ClientCommand::SendMessage(payload))
            .await
            .map_err(|_| anyhow!("client network task has terminated"))
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(ClientCommand::Shutdown).await;
    }
}

/// The client's view of its single peer: the server.
struct ServerConnection {
    peer: PeerAddr,
    client_index: ClientIndex,
    status: ConnectionStatus,
    reliability: ReliabilityContext,
}

/// Single-peer state machine: Disconnected -> Connecting -> Connected.
///
/// [Client::run] is the network-processing task for the client role. It drives
///  the handshake (request retransmission and timeout), then enters a drain
///  loop that suspends until the socket becomes readable, a command arrives,
///  or the keep-alive timer fires. All connection state is owned by this one
///  task, so the hot path needs no locking.
pub struct Client {
    config: Arc<NetConfig>,
    socket: Arc<dyn DatagramSocket>,
    handler: Arc<dyn ClientEventHandler>,
    commands: mpsc::Receiver<ClientCommand>,
    connection: ServerConnection,
    keep_alive_counter: u32,
}

impl Client {
    pub fn new(
        config: Arc<NetConfig>,
        socket: Arc<dyn DatagramSocket>,
        handler: Arc<dyn ClientEventHandler>,
    ) -> anyhow::Result<(Client, ClientHandle)> {
        config.validate()?;

        let (command_sender, command_receiver) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let connection = ServerConnection {
            peer: config.server_addr,
            client_index: INVALID_CLIENT_INDEX,
            status: ConnectionStatus::Disconnected,
            reliability: ReliabilityContext::new(&config.congestion),
        };

        Ok((
            Client {
                config,
                socket,
                handler,
                commands: command_receiver,
                connection,
                keep_alive_counter: 0,
            },
            ClientHandle {
                commands: command_sender,
            },
        ))
    }

    /// Run the client to completion: handshake, then the connected drain loop.
    /// Returns once the connection is shut down, denied, or timed out.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if !self.establish_connection().await? {
            self.set_status(ConnectionStatus::Disconnected).await;
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connected).await;
        self.connected_loop().await;
        self.set_status(ConnectionStatus::Disconnected).await;

        Ok(())
    }

    /// Send `ConnectionRequest` until the server replies or the configured
    ///  timeout expires. Returns true iff the connection was established.
    async fn establish_connection(&mut self) -> anyhow::Result<bool> {
        self.set_status(ConnectionStatus::Connecting).await;
        info!("connecting to {:?}", self.connection.peer);
        self.send_to_server(PacketType::ConnectionRequest, &[]).await?;

        let deadline = Instant::now() + self.config.connection_timeout;
        let mut retransmit = interval(self.config.connection_request_interval);
        retransmit.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                _ = self.socket.readable() => {
                    if let Some(outcome) = self.drain_handshake_replies() {
                        return Ok(outcome);
                    }
                }
                _ = retransmit.tick() => {
                    trace!("retransmitting connection request");
                    self.send_to_server(PacketType::ConnectionRequest, &[]).await?;
                }
                _ = sleep_until(deadline) => {
                    warn!("connection attempt to {:?} timed out", self.connection.peer);
                    return Ok(false);
                }
            }
        }
    }

    /// Drain pending datagrams while connecting. Only the connection
    ///  management replies mean anything in this state.
    fn drain_handshake_replies(&mut self) -> Option<bool> {
        let mut buf = [0u8; MAX_PACKET_SIZE];

        while let Some((from, num_read)) = self.socket.try_receive(&mut buf) {
            let Some(header) = self.decode_and_validate(from, &buf[..num_read]) else {
                continue;
            };

            match header.packet_type {
                PacketType::ConnectionSuccess => {
                    info!("connected to {:?} as client {}", self.connection.peer, header.client_index);
                    self.connection.client_index = header.client_index;
                    return Some(true);
                }
                PacketType::ConnectionDenied => {
                    warn!("connection denied by {:?}", self.connection.peer);
                    return Some(false);
                }
                _ => {
                    // reliable traffic is meaningless before the handshake completes
                }
            }
        }
        None
    }

    async fn connected_loop(&mut self) {
        let mut tick = interval(self.config.keep_alive_interval);
        tick.tick().await; // the immediate first tick
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = self.socket.readable() => {
                    self.drain_datagrams().await;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(ClientCommand::SendMessage(payload)) => {
                            if let Err(e) = self.send_to_server(PacketType::Message, &payload).await {
                                warn!("failed to send message: {}", e);
                            }
                        }
                        Some(ClientCommand::Shutdown) | None => {
                            info!("client shutting down");
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    let delta_time = last_tick.elapsed();
                    last_tick = Instant::now();

                    if !self.on_tick(delta_time).await {
                        return;
                    }
                }
            }
        }
    }

    /// Per-tick upkeep while connected: keep-alive cadence (throttled to one
    ///  in three ticks while congested) and dead-peer detection. Returns false
    ///  once the connection has timed out.
    async fn on_tick(&mut self, delta_time: Duration) -> bool {
        if self.connection.reliability.is_congested() {
            if self.keep_alive_counter % 3 == 0 {
                let _ = self.send_to_server(PacketType::KeepAlive, &[]).await;
            }
            self.keep_alive_counter += 1;
        } else {
            let _ = self.send_to_server(PacketType::KeepAlive, &[]).await;
        }

        self.connection.reliability.on_update(delta_time);

        if self.connection.reliability.last_packet_received() > self.config.connection_timeout {
            warn!("connection to {:?} timed out", self.connection.peer);
            return false;
        }
        true
    }

    async fn drain_datagrams(&mut self) {
        let mut buf = [0u8; MAX_PACKET_SIZE];

        while let Some((from, num_read)) = self.socket.try_receive(&mut buf) {
            let datagram = &buf[..num_read];
            let Some(header) = self.decode_and_validate(from, datagram) else {
                continue;
            };
            let payload = &datagram[PacketHeader::SERIALIZED_LEN..];

            self.on_packet(&header, payload).await;
        }
    }

    async fn on_packet(&mut self, header: &PacketHeader, payload: &[u8]) {
        if header.packet_type.is_connection_management() {
            // stray handshake reply, nothing to do while connected
            return;
        }

        if header.client_index != self.connection.client_index {
            debug!(
                "packet for client index {} but we are {} - dropping",
                header.client_index, self.connection.client_index
            );
            return;
        }

        if !self.connection.reliability.process_segment(&header.segment) {
            debug!("stale or duplicate packet {:?} - dropping", header);
            return;
        }

        match header.packet_type {
            PacketType::KeepAlive => {}
            PacketType::Message => self.handler.on_message(payload).await,
            _ => {}
        }
    }

    fn decode_and_validate(&self, from: PeerAddr, datagram: &[u8]) -> Option<PacketHeader> {
        if from != self.connection.peer {
            debug!("datagram from unexpected sender {:?} - dropping", from);
            return None;
        }

        let mut parse_buf = datagram;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(_) => {
                debug!("received unparsable packet header from {:?} - dropping", from);
                return None;
            }
        };

        if header.app_id != self.config.app_protocol_id {
            debug!("foreign app id {} from {:?} - dropping", header.app_id, from);
            return None;
        }

        Some(header)
    }

    async fn send_to_server(&mut self, packet_type: PacketType, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            bail!(
                "payload of {} bytes exceeds the per-packet budget of {}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            );
        }

        let header = if packet_type.is_connection_management() {
            PacketHeader::for_management(
                self.config.app_protocol_id,
                packet_type,
                self.connection.client_index,
            )
        } else {
            PacketHeader {
                app_id: self.config.app_protocol_id,
                packet_type,
                client_index: self.connection.client_index,
                segment: self.connection.reliability.next_segment(),
            }
        };

        let buf = encode_packet(&header, payload)?;
        self.socket.send_packet(self.connection.peer, &buf).await;
        Ok(())
    }

    async fn set_status(&mut self, status: ConnectionStatus) {
        if self.connection.status == status {
            return;
        }
        self.connection.status = status;
        self.handler.on_connection_status_changed(status).await;
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::connection_list::ConnectionList;
use crate::event_handler::{ConnectionStatus, ServerEventHandler};
use crate::packet_header::{
    encode_packet, ClientIndex, PacketHeader, PacketType, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE,
};
use crate::peer_addr::PeerAddr;
use crate::socket::DatagramSocket;

const COMMAND_CHANNEL_SIZE: usize = 256;

pub enum ServerCommand {
    SendMessage(ClientIndex, Vec<u8>),
    Broadcast(Vec<u8>),
    Disconnect(ClientIndex),
    Shutdown,
}

/// Cheaply cloneable handle for submitting work to the server's network task.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    pub async fn send_message(&self, client: ClientIndex, payload: Vec<u8>) -> anyhow::Result<()> {
        self.commands
            .send(ServerCommand::SendMessage(client, payload))
            .await
            .map_err(|_| anyhow!("server network task has terminated"))
    }

    pub async fn broadcast(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.commands
            .send(ServerCommand::Broadcast(payload))
            .await
            .map_err(|_| anyhow!("server network task has terminated"))
    }

    pub async fn disconnect(&self, client: ClientIndex) {
        let _ = self.commands.send(ServerCommand::Disconnect(client)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(ServerCommand::Shutdown).await;
    }
}

/// Multi-peer state machine: admits clients into a fixed-size connection pool,
///  routes incoming packets by the client index embedded in each header, and
///  periodically sweeps the pool for keep-alives and dead-peer eviction.
///
/// [Server::run] is the network-processing task for the server role; it owns
///  all connection state, so the hot path needs no locking.
pub struct Server {
    config: Arc<NetConfig>,
    socket: Arc<dyn DatagramSocket>,
    handler: Arc<dyn ServerEventHandler>,
    commands: mpsc::Receiver<ServerCommand>,
    connections: ConnectionList,
    keep_alive_counter: u32,
}

impl Server {
    pub fn new(
        config: Arc<NetConfig>,
        socket: Arc<dyn DatagramSocket>,
        handler: Arc<dyn ServerEventHandler>,
    ) -> anyhow::Result<(Server, ServerHandle)> {
        config.validate()?;

        let (command_sender, command_receiver) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let connections = ConnectionList::with_capacity(config.max_clients, config.congestion.clone());

        Ok((
            Server {
                config,
                socket,
                handler,
                commands: command_receiver,
                connections,
                keep_alive_counter: 0,
            },
            ServerHandle {
                commands: command_sender,
            },
        ))
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("server listening on port {}", self.socket.local_port());

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
                        Some(ServerCommand::SendMessage(client, payload)) => {
                            if let Err(e) = self.send_to_client(client, PacketType::Message, &payload).await {
                                warn!("failed to send message to client {}: {}", client, e);
                            }
                        }
                        Some(ServerCommand::Broadcast(payload)) => {
                            self.broadcast(PacketType::Message, &payload).await;
                        }
                        Some(ServerCommand::Disconnect(client)) => {
                            self.remove_connection(client).await;
                        }
                        Some(ServerCommand::Shutdown) | None => {
                            info!("server shutting down");
                            return Ok(());
                        }
                    }
                }
                _ = tick.tick() => {
                    let delta_time = last_tick.elapsed();
                    last_tick = Instant::now();

                    if !self.connections.is_empty() {
                        self.manage_connections(delta_time).await;
                    }
                }
            }
        }
    }

    async fn drain_datagrams(&mut self) {
        let mut buf = [0u8; MAX_PACKET_SIZE];

        while let Some((from, num_read)) = self.socket.try_receive(&mut buf) {
            self.on_datagram(from, &buf[..num_read]).await;
        }
    }

    async fn on_datagram(&mut self, from: PeerAddr, datagram: &[u8]) {
        let mut parse_buf = datagram;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(_) => {
                debug!("received unparsable packet header from {:?} - dropping", from);
                return;
            }
        };

        if header.app_id != self.config.app_protocol_id {
            debug!("foreign app id {} from {:?} - dropping", header.app_id, from);
            return;
        }

        let payload = &datagram[PacketHeader::SERIALIZED_LEN..];

        if self.connections.is_active(header.client_index) {
            self.on_connection_packet(&header, payload, from).await;
        } else if header.packet_type == PacketType::ConnectionRequest {
            self.on_connection_request(from).await;
        } else {
            debug!("packet from unknown sender {:?} ({:?}) - dropping", from, header);
        }
    }

    /// A packet routed to an active connection slot.
    async fn on_connection_packet(&mut self, header: &PacketHeader, payload: &[u8], from: PeerAddr) {
        if header.packet_type.is_connection_management() {
            // a late handshake retransmission, nothing to do for an
            //  established connection
            return;
        }

        let Some(connection) = self.connections.get_mut(header.client_index) else {
            return;
        };

        if connection.peer != from {
            debug!(
                "client index {} used from {:?} instead of {:?} - dropping",
                header.client_index, from, connection.peer
            );
            return;
        }

        if !connection.reliability.process_segment(&header.segment) {
            debug!("stale or duplicate packet from client {} - dropping", header.client_index);
            return;
        }

        match header.packet_type {
            PacketType::KeepAlive => {}
            PacketType::Message => self.handler.on_message(header.client_index, payload).await,
            _ => {}
        }
    }

    /// Handshake: allocate a pool slot and confirm it to the requester. A
    ///  repeated request from a known address re-sends the confirmation
    ///  instead of allocating a second slot. When the pool is exhausted the
    ///  request is dropped without a reply, leaving the requester to its
    ///  timeout.
    async fn on_connection_request(&mut self, from: PeerAddr) {
        if let Some(existing) = self.connections.index_of(from) {
            debug!("repeated connection request from {:?} - re-sending confirmation", from);
            self.send_management(from, PacketType::ConnectionSuccess, existing).await;
            return;
        }

        match self.connections.add(from) {
            Some(index) => {
                info!("accepted connection from {:?} as client {}", from, index);
                self.send_management(from, PacketType::ConnectionSuccess, index).await;
                self.handler
                    .on_connection_status_changed(index, ConnectionStatus::Connected)
                    .await;
            }
            None => {
                warn!("connection pool exhausted - dropping request from {:?}", from);
            }
        }
    }

    /// Periodic pool sweep: keep-alives (every third sweep to everyone, the
    ///  other two only to peers that are not congested), reliability upkeep,
    ///  and eviction of peers that went silent for longer than the configured
    ///  connection timeout.
    async fn manage_connections(&mut self, delta_time: Duration) {
        if self.keep_alive_counter % 3 == 0 {
            self.broadcast(PacketType::KeepAlive, &[]).await;
        } else {
            let uncongested: Vec<ClientIndex> = self
                .connections
                .iter_active()
                .filter(|(_, conn)| !conn.reliability.is_congested())
                .map(|(index, _)| index)
                .collect();
            for index in uncongested {
                let _ = self.send_to_client(index, PacketType::KeepAlive, &[]).await;
            }
        }
        self.keep_alive_counter += 1;

        let mut timed_out = Vec::new();
        for (index, connection) in self.connections.iter_active_mut() {
            connection.reliability.on_update(delta_time);
            if connection.reliability.last_packet_received() > self.config.connection_timeout {
                timed_out.push(index);
            }
        }

        for index in timed_out {
            warn!("client {} went silent - evicting", index);
            self.remove_connection(index).await;
        }
    }

    async fn remove_connection(&mut self, index: ClientIndex) {
        if self.connections.remove(index) {
            self.handler
                .on_connection_status_changed(index, ConnectionStatus::Disconnected)
                .await;
        }
    }

    async fn broadcast(&mut self, packet_type: PacketType, payload: &[u8]) {
        let active: Vec<ClientIndex> = self.connections.iter_active().map(|(index, _)| index).collect();
        for index in active {
            if let Err(e) = self.send_to_client(index, packet_type, payload).await {
                warn!("failed to send to client {}: {}", index, e);
            }
        }
    }

    /// Stamp a fresh reliability segment for this connection and send.
    async fn send_to_client(
        &mut self,
        index: ClientIndex,
        packet_type: PacketType,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            bail!(
                "payload of {} bytes exceeds the per-packet budget of {}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            );
        }

        let Some(connection) = self.connections.get_mut(index) else {
            bail!("no active connection for client index {}", index);
        };

        let header = PacketHeader {
            app_id: self.config.app_protocol_id,
            packet_type,
            client_index: index,
            segment: connection.reliability.next_segment(),
        };

        let buf = encode_packet(&header, payload)?;
        self.socket.send_packet(connection.peer, &buf).await;
        Ok(())
    }

    async fn send_management(&mut self, to: PeerAddr, packet_type: PacketType, index: ClientIndex) {
        let header = PacketHeader::for_management(self.config.app_protocol_id, packet_type, index);

        match encode_packet(&header, &[]) {
            Ok(buf) => {
                self.socket.send_packet(to, &buf).await;
            }
            Err(e) => warn!("failed to encode management packet: {}", e),
        }
    }
}

//! End-to-end tests exercising both roles over real UDP sockets on localhost.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use rudp::client::{Client, ClientHandle};
use rudp::config::NetConfig;
use rudp::event_handler::{ClientEventHandler, ConnectionStatus, ServerEventHandler};
use rudp::packet_header::ClientIndex;
use rudp::peer_addr::PeerAddr;
use rudp::server::{Server, ServerHandle};
use rudp::socket::{DatagramSocket, UdpDatagramSocket};

const APP_ID: u8 = 0x4b;
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct RecordingClientHandler {
    messages: mpsc::UnboundedSender<Vec<u8>>,
    statuses: mpsc::UnboundedSender<ConnectionStatus>,
}

#[async_trait]
impl ClientEventHandler for RecordingClientHandler {
    async fn on_message(&self, payload: &[u8]) {
        let _ = self.messages.send(payload.to_vec());
    }

    async fn on_connection_status_changed(&self, status: ConnectionStatus) {
        let _ = self.statuses.send(status);
    }
}

struct RecordingServerHandler {
    messages: mpsc::UnboundedSender<(ClientIndex, Vec<u8>)>,
    statuses: mpsc::UnboundedSender<(ClientIndex, ConnectionStatus)>,
}

#[async_trait]
impl ServerEventHandler for RecordingServerHandler {
    async fn on_message(&self, client: ClientIndex, payload: &[u8]) {
        let _ = self.messages.send((client, payload.to_vec()));
    }

    async fn on_connection_status_changed(&self, client: ClientIndex, status: ConnectionStatus) {
        let _ = self.statuses.send((client, status));
    }
}

struct ServerFixture {
    addr: PeerAddr,
    handle: ServerHandle,
    messages: mpsc::UnboundedReceiver<(ClientIndex, Vec<u8>)>,
    statuses: mpsc::UnboundedReceiver<(ClientIndex, ConnectionStatus)>,
}

async fn spawn_server(config: &NetConfig) -> ServerFixture {
    let socket = UdpDatagramSocket::bind(config.server_addr.port()).await.unwrap();
    let addr = PeerAddr::new(Ipv4Addr::LOCALHOST, socket.local_port());

    let mut config = config.clone();
    config.server_addr = addr;

    let (message_sender, messages) = mpsc::unbounded_channel();
    let (status_sender, statuses) = mpsc::unbounded_channel();
    let handler = RecordingServerHandler {
        messages: message_sender,
        statuses: status_sender,
    };

    let (server, handle) =
        Server::new(Arc::new(config), Arc::new(socket), Arc::new(handler)).unwrap();
    tokio::spawn(server.run());

    ServerFixture {
        addr,
        handle,
        messages,
        statuses,
    }
}

struct ClientFixture {
    handle: ClientHandle,
    messages: mpsc::UnboundedReceiver<Vec<u8>>,
    statuses: mpsc::UnboundedReceiver<ConnectionStatus>,
}

async fn spawn_client(config: NetConfig) -> ClientFixture {
    let socket = UdpDatagramSocket::bind(0).await.unwrap();

    let (message_sender, messages) = mpsc::unbounded_channel();
    let (status_sender, statuses) = mpsc::unbounded_channel();
    let handler = RecordingClientHandler {
        messages: message_sender,
        statuses: status_sender,
    };

    let (client, handle) =
        Client::new(Arc::new(config), Arc::new(socket), Arc::new(handler)).unwrap();
    tokio::spawn(client.run());

    ClientFixture {
        handle,
        messages,
        statuses,
    }
}

async fn recv<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(TEST_TIMEOUT, receiver.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Base configuration: server on an ephemeral port, picked at bind time.
fn test_config() -> NetConfig {
    NetConfig::new(APP_ID, PeerAddr::new(Ipv4Addr::LOCALHOST, 0))
}

#[tokio::test]
async fn test_connect_and_exchange_messages() {
    let mut server = spawn_server(&test_config()).await;

    let mut config = test_config();
    config.server_addr = server.addr;
    let mut client = spawn_client(config).await;

    assert_eq!(recv(&mut client.statuses).await, ConnectionStatus::Connecting);
    assert_eq!(recv(&mut client.statuses).await, ConnectionStatus::Connected);
    assert_eq!(recv(&mut server.statuses).await, (0, ConnectionStatus::Connected));

    client.handle.send_message(b"ping".to_vec()).await.unwrap();
    assert_eq!(recv(&mut server.messages).await, (0, b"ping".to_vec()));

    server.handle.send_message(0, b"pong".to_vec()).await.unwrap();
    assert_eq!(recv(&mut client.messages).await, b"pong".to_vec());

    server.handle.broadcast(b"to everyone".to_vec()).await.unwrap();
    assert_eq!(recv(&mut client.messages).await, b"to everyone".to_vec());

    client.handle.shutdown().await;
    assert_eq!(recv(&mut client.statuses).await, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_two_clients_routed_independently() {
    let mut server = spawn_server(&test_config()).await;

    let mut config = test_config();
    config.server_addr = server.addr;
    let mut first = spawn_client(config.clone()).await;
    assert_eq!(recv(&mut server.statuses).await, (0, ConnectionStatus::Connected));

    let mut second = spawn_client(config).await;
    assert_eq!(recv(&mut server.statuses).await, (1, ConnectionStatus::Connected));

    first.handle.send_message(b"from first".to_vec()).await.unwrap();
    second.handle.send_message(b"from second".to_vec()).await.unwrap();

    let mut received = vec![
        recv(&mut server.messages).await,
        recv(&mut server.messages).await,
    ];
    received.sort();
    assert_eq!(
        received,
        vec![
            (0, b"from first".to_vec()),
            (1, b"from second".to_vec()),
        ]
    );

    // a targeted message reaches only its addressee
    server.handle.send_message(1, b"just for you".to_vec()).await.unwrap();
    assert_eq!(recv(&mut second.messages).await, b"just for you".to_vec());
    assert!(first.messages.try_recv().is_err());
}

#[tokio::test]
async fn test_handshake_times_out_without_server() {
    // bind and drop a socket to get a port nobody is listening on
    let port = {
        let socket = UdpDatagramSocket::bind(0).await.unwrap();
        socket.local_port()
    };

    let mut config = NetConfig::new(APP_ID, PeerAddr::new(Ipv4Addr::LOCALHOST, port));
    config.connection_timeout = Duration::from_millis(300);
    config.connection_request_interval = Duration::from_millis(50);

    let socket = UdpDatagramSocket::bind(0).await.unwrap();
    let (status_sender, mut statuses) = mpsc::unbounded_channel();
    let (message_sender, _messages) = mpsc::unbounded_channel();
    let handler = RecordingClientHandler {
        messages: message_sender,
        statuses: status_sender,
    };

    let (client, _handle) =
        Client::new(Arc::new(config), Arc::new(socket), Arc::new(handler)).unwrap();

    // the client task terminates on its own once the handshake times out
    timeout(TEST_TIMEOUT, client.run()).await.unwrap().unwrap();

    assert_eq!(recv(&mut statuses).await, ConnectionStatus::Connecting);
    assert_eq!(recv(&mut statuses).await, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_server_evicts_silent_client() {
    let mut config = test_config();
    config.connection_timeout = Duration::from_millis(300);

    let mut server = spawn_server(&config).await;

    config.server_addr = server.addr;
    let mut client = spawn_client(config).await;
    assert_eq!(recv(&mut client.statuses).await, ConnectionStatus::Connecting);
    assert_eq!(recv(&mut client.statuses).await, ConnectionStatus::Connected);
    assert_eq!(recv(&mut server.statuses).await, (0, ConnectionStatus::Connected));

    // once the client stops sending, the server notices the silence
    client.handle.shutdown().await;
    assert_eq!(recv(&mut server.statuses).await, (0, ConnectionStatus::Disconnected));
}

#[tokio::test]
async fn test_client_detects_dead_server() {
    let mut config = test_config();
    config.connection_timeout = Duration::from_millis(300);

    let mut server = spawn_server(&config).await;

    config.server_addr = server.addr;
    let mut client = spawn_client(config).await;
    assert_eq!(recv(&mut client.statuses).await, ConnectionStatus::Connecting);
    assert_eq!(recv(&mut client.statuses).await, ConnectionStatus::Connected);

    server.handle.shutdown().await;
    assert_eq!(recv(&mut client.statuses).await, ConnectionStatus::Disconnected);
}

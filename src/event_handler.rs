use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::packet_header::ClientIndex;

/// Lifecycle of a connection, as reported to the application.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Application callbacks on the client side, invoked synchronously from within
///  the network task's drain cycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientEventHandler: Send + Sync + 'static {
    async fn on_message(&self, payload: &[u8]);

    async fn on_connection_status_changed(&self, status: ConnectionStatus);
}

/// Application callbacks on the server side, invoked synchronously from within
///  the network task's drain cycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerEventHandler: Send + Sync + 'static {
    async fn on_message(&self, client: ClientIndex, payload: &[u8]);

    async fn on_connection_status_changed(&self, client: ClientIndex, status: ConnectionStatus);
}

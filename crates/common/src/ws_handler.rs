//! Handler trait the peer-side application implements.

use crate::error::Result;
use crate::messages::ControlCommand;
use async_trait::async_trait;

/// Callbacks the connection manager invokes on WebSocket events.
///
/// The handler owns the peer's identity and application logic; the manager
/// owns the socket, the keep-alive schedule, and reconnection.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    /// The relay URL to connect to, including handshake query parameters.
    fn url(&self) -> String;

    /// Message to send immediately after the connection is established.
    fn on_connect_message(&self) -> Option<String> {
        None
    }

    /// Called for each text frame from the relay. A returned string is
    /// written back to the socket as the reply.
    async fn on_message(&self, msg: &str) -> Result<Option<String>>;

    /// Called when the connection is lost, before any reconnect attempt.
    async fn on_disconnect(&self) {}

    /// Called after a reconnection succeeds.
    async fn on_reconnect(&self) {}

    /// Handle a supervisor command. A returned string is written to the
    /// socket.
    async fn handle_command(&self, cmd: ControlCommand) -> Option<String>;
}

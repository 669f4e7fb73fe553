//! Peer-side WebSocket connection manager.
//!
//! Owns a single connection to the relay: handshake, application-level
//! ping/pong keep-alive, reconnection with exponential backoff, and
//! supervisor commands. The relay evicts a client id that connects twice,
//! so a `4004 DuplicateConnection` close ends the manager for good instead
//! of fighting the newer session.

use crate::error::{Error, Result};
use crate::messages::{CloseReason, ControlCommand};
use crate::ws_handler::PeerHandler;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct WsManagerConfig {
    /// Interval between application-level `{"type":"ping"}` frames.
    pub ping_interval: Duration,
    /// Initial delay before a reconnection attempt.
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay (for exponential backoff).
    pub max_reconnect_delay: Duration,
    /// Label for metrics and logs (usually the client id).
    pub label: String,
}

impl Default for WsManagerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            label: "peer".to_string(),
        }
    }
}

/// WebSocket connection manager for one peer identity.
pub struct WsManager<H: PeerHandler> {
    handler: Arc<H>,
    config: WsManagerConfig,
    command_rx: mpsc::Receiver<ControlCommand>,
}

impl<H: PeerHandler> WsManager<H> {
    pub fn new(
        handler: H,
        config: WsManagerConfig,
        command_rx: mpsc::Receiver<ControlCommand>,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            config,
            command_rx,
        }
    }

    /// Run until shutdown, reconnecting on connection loss.
    pub async fn run(mut self) -> Result<()> {
        let mut reconnect_delay = self.config.reconnect_delay;
        let mut shutdown = false;

        while !shutdown {
            match self.connect_and_run_loop(&mut shutdown).await {
                Ok(()) => {
                    info!("[{}] connection closed gracefully", self.config.label);
                    break;
                }
                Err(Error::Replaced) => {
                    warn!(
                        "[{}] relay reported a duplicate connection, not reconnecting",
                        self.config.label
                    );
                    break;
                }
                Err(e) => {
                    counter!("peer_disconnects_total", "peer" => self.config.label.clone())
                        .increment(1);
                    warn!(
                        "[{}] disconnected: {:?}, reconnecting in {:?}",
                        self.config.label, e, reconnect_delay
                    );
                    self.handler.on_disconnect().await;

                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }

        gauge!("peer_connected", "peer" => self.config.label.clone()).set(0.0);
        Ok(())
    }

    async fn connect_and_run_loop(&mut self, shutdown: &mut bool) -> Result<()> {
        let url = self.handler.url();
        info!("[{}] connecting to {}", self.config.label, url);

        let (ws_stream, response) = connect_async(url.as_str()).await?;
        debug!(
            "[{}] handshake complete, status: {:?}",
            self.config.label,
            response.status()
        );
        let (mut write, mut read) = ws_stream.split();

        gauge!("peer_connected", "peer" => self.config.label.clone()).set(1.0);
        info!("[{}] connected", self.config.label);

        if let Some(init_msg) = self.handler.on_connect_message() {
            write.send(Message::Text(init_msg.into())).await?;
        }
        self.handler.on_reconnect().await;

        let mut ping_interval = interval(self.config.ping_interval);
        ping_interval.reset();
        let silence_budget = self.config.ping_interval * 3;
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = Instant::now();
                            counter!("peer_messages_received_total", "peer" => self.config.label.clone()).increment(1);
                            match self.handler.on_message(text.as_str()).await {
                                Ok(Some(reply)) => {
                                    write.send(Message::Text(reply.into())).await?;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!("[{}] handler error: {:?}", self.config.label, e);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_activity = Instant::now();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] received close frame: {:?}", self.config.label, frame);
                            if let Some(frame) = frame {
                                if u16::from(frame.code) == CloseReason::DuplicateConnection.code() {
                                    return Err(Error::Replaced);
                                }
                            }
                            return Err(Error::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            // Binary and raw frames are not part of the contract.
                        }
                        Some(Err(e)) => {
                            return Err(Error::WebSocket(e));
                        }
                        None => {
                            return Err(Error::ConnectionClosed);
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Shutdown) | None => {
                            info!("[{}] shutting down", self.config.label);
                            *shutdown = true;
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                        Some(cmd) => {
                            if let Some(msg) = self.handler.handle_command(cmd).await {
                                write.send(Message::Text(msg.into())).await?;
                            }
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    if last_activity.elapsed() > silence_budget {
                        warn!("[{}] no traffic for {:?}, treating socket as dead", self.config.label, silence_budget);
                        return Err(Error::ConnectionClosed);
                    }
                    debug!("[{}] sending ping", self.config.label);
                    write.send(Message::Text(r#"{"type":"ping"}"#.into())).await?;
                }
            }
        }
    }
}

//! Shared wire contract and peer-side connection manager for the relay.

pub mod error;
pub mod messages;
pub mod ws_handler;
pub mod ws_manager;

pub use error::Error;
pub use messages::{strip_sensitive, CloseReason, ControlCommand, RequestKind, WireMessage};
pub use ws_handler::PeerHandler;
pub use ws_manager::{WsManager, WsManagerConfig};

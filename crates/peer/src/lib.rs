//! Reference peer-side client for the relay.
//!
//! A peer owns exactly one WebSocket connection to the relay (the
//! supervisor in `main.rs` spawns a single managed connection task) and
//! answers relayed requests only while it holds the primary role among
//! the world's active administrators.

pub mod election;
pub mod handler;

pub use election::Election;
pub use handler::{PeerIdentity, RelayPeerHandler};

//! Bidirectional request-relay gateway.
//!
//! External HTTP callers issue REST requests that are answered by
//! long-lived backend peers connected over WebSocket. Each request is
//! translated into a typed frame, delivered to the peer that owns the
//! target client id, and held open until the peer replies with a matching
//! correlation id or the deadline fires.
//!
//! ## Architecture
//!
//! ```text
//! HTTP edge ──► Dispatcher ──► local PeerSession ──► peer
//!                   │                                  │
//!                   └──► Forwarder (NATS) ──► owning replica
//!                                                      │
//! HTTP reply ◄── waiter ◄── Response Router ◄── peer WS │
//! ```
//!
//! Ownership is tracked per replica in a Redis directory with TTL leases;
//! requests for a peer connected elsewhere travel over per-replica
//! pub/sub channels and their results come back the same way.

pub mod api;
pub mod auth;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod pending;
pub mod reaper;
pub mod response;
pub mod session;
pub mod ws_server;

pub use api::create_router;
pub use auth::{ApiKeyAuth, StaticKeyAuth};
pub use config::Config;
pub use dispatcher::{Dispatcher, RelayRequest};
pub use error::{RelayError, Result};
pub use forwarder::Forwarder;
pub use pending::PendingRequests;
pub use reaper::{Reaper, ReaperConfig};
pub use session::{PeerRegistry, PeerSession};

use directory::Directory;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<PeerRegistry>,
    pub pending: Arc<PendingRequests>,
    pub dispatcher: Arc<Dispatcher>,
    pub directory: Option<Directory>,
    pub forwarder: Option<Arc<Forwarder>>,
    pub auth: Arc<dyn ApiKeyAuth>,
}

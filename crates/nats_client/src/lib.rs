//! Thin NATS wrapper used by the inter-replica forwarder.

pub mod client;

pub use client::NatsClient;

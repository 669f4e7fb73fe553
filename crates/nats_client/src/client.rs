//! Core NATS pub/sub client.
//!
//! The forwarder only needs fire-and-forget publish and push subscribe;
//! forwarded requests are not persisted, so no stream layer is involved.

use anyhow::Result;
use async_nats::{Client, Subscriber};
use tracing::info;

/// Wrapper around the NATS core client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }

    /// Subscribe to a subject pattern. Messages are pushed as they arrive.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject pattern: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(subscriber)
    }

    /// Publish a message (fire-and-forget, lowest latency).
    pub async fn publish(&self, subject: &str, payload: bytes::Bytes) -> Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }
}

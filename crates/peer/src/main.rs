//! Demo peer entry point: one supervised connection to the relay.

use anyhow::Result;
use common::{ControlCommand, WsManager, WsManagerConfig};
use peer::{Election, PeerIdentity, RelayPeerHandler};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let relay_url =
        env::var("RELAY_URL").unwrap_or_else(|_| "ws://localhost:3010/relay".to_string());
    let client_id = env::var("CLIENT_ID").unwrap_or_else(|_| "demo-peer".to_string());
    let token = env::var("RELAY_TOKEN").unwrap_or_else(|_| "demo-key".to_string());
    let admin_id = env::var("ADMIN_ID").unwrap_or_else(|_| "gm-demo".to_string());
    let ping_secs: u64 = env::var("PING_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    info!("Starting demo peer {} against {}", client_id, relay_url);

    let identity = PeerIdentity {
        client_id: client_id.clone(),
        token,
        world_id: env::var("WORLD_ID").unwrap_or_else(|_| "demo-world".to_string()),
        world_title: env::var("WORLD_TITLE").unwrap_or_else(|_| "Demo World".to_string()),
        foundry_version: env::var("FOUNDRY_VERSION").unwrap_or_else(|_| "12.331".to_string()),
        system_id: env::var("SYSTEM_ID").unwrap_or_else(|_| "dnd5e".to_string()),
        system_title: env::var("SYSTEM_TITLE").unwrap_or_else(|_| "D&D 5e".to_string()),
        system_version: env::var("SYSTEM_VERSION").unwrap_or_else(|_| "3.3.1".to_string()),
        custom_name: env::var("CUSTOM_NAME").ok(),
    };

    let election = Arc::new(Election::new(admin_id.clone()));
    election.set_roster(vec![admin_id]);

    let handler = RelayPeerHandler::new(relay_url, identity, election);
    let config = WsManagerConfig {
        ping_interval: Duration::from_secs(ping_secs),
        label: client_id,
        ..Default::default()
    };

    // Exactly one connection task; the relay treats a second socket for
    // the same client id as a duplicate.
    let (command_tx, command_rx) = mpsc::channel(8);
    let manager = WsManager::new(handler, config, command_rx);
    let handle = tokio::spawn(async move {
        if let Err(e) = manager.run().await {
            error!("Connection manager failed: {:?}", e);
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    let _ = command_tx.send(ControlCommand::Shutdown).await;
    let _ = handle.await;

    info!("Peer stopped");
    Ok(())
}

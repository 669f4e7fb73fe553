//! Relay gateway entry point.

use anyhow::Result;
use gateway::{
    create_router, AppState, Config, Dispatcher, Forwarder, PeerRegistry, PendingRequests,
    Reaper, ReaperConfig, StaticKeyAuth,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());
    info!("Starting relay gateway");
    info!("  instance: {}", config.instance_id);
    info!("  port: {}", config.port);
    info!(
        "  directory: {}",
        config.redis_url.as_deref().unwrap_or("disabled")
    );
    info!(
        "  broker: {}",
        config.nats_url.as_deref().unwrap_or("disabled")
    );

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics on port {}", config.metrics_port);

    let registry = Arc::new(PeerRegistry::new());
    let pending = Arc::new(PendingRequests::new());
    let auth = Arc::new(StaticKeyAuth::new(config.api_keys.clone()));

    // Cross-replica routing needs both the directory and the broker;
    // with either absent this replica serves only its own peers.
    let directory = match &config.redis_url {
        Some(url) => {
            match gateway::directory::Directory::new(
                url,
                config.instance_id.clone(),
                config.directory_ttl,
            ) {
                Ok(directory) => Some(directory),
                Err(e) => {
                    warn!("Directory unavailable, running standalone: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    let forwarder = match (&config.nats_url, directory.is_some()) {
        (Some(url), true) => match nats_client::NatsClient::connect(url).await {
            Ok(nats) => Some(Arc::new(Forwarder::new(nats, config.instance_id.clone()))),
            Err(e) => {
                warn!("Broker unavailable, cross-replica routing disabled: {}", e);
                None
            }
        },
        _ => None,
    };

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        pending.clone(),
        directory.clone(),
        forwarder.clone(),
        auth.clone(),
        config.instance_id.clone(),
    ));

    let (forwarder_shutdown_tx, forwarder_shutdown_rx) = mpsc::channel(1);
    let forwarder_handle = forwarder.clone().map(|forwarder| {
        let dispatcher = dispatcher.clone();
        let pending = pending.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.run(dispatcher, pending, forwarder_shutdown_rx).await {
                error!("Forwarder error: {:?}", e);
            }
        })
    });

    let (reaper_shutdown_tx, reaper_shutdown_rx) = mpsc::channel(1);
    let reaper = Reaper::new(
        registry.clone(),
        pending.clone(),
        directory.clone(),
        forwarder.clone(),
        ReaperConfig {
            idle_session_timeout: config.idle_session_timeout,
            directory_refresh: config.directory_ttl / 2,
            ..Default::default()
        },
    );
    let reaper_handle = tokio::spawn(reaper.run(reaper_shutdown_rx));

    let state = Arc::new(AppState {
        config: config.clone(),
        registry: registry.clone(),
        pending,
        dispatcher,
        directory,
        forwarder,
        auth,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await?;

    let _ = forwarder_shutdown_tx.send(()).await;
    let _ = reaper_shutdown_tx.send(()).await;
    if let Some(handle) = forwarder_handle {
        let _ = handle.await;
    }
    let _ = reaper_handle.await;

    info!("Relay stopped");
    Ok(())
}

/// Wait for a shutdown signal, then tell every connected peer this
/// replica is going away. Closing the sessions is what lets the server
/// drain: graceful shutdown waits for the WebSocket tasks to finish.
async fn shutdown_signal(registry: Arc<PeerRegistry>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }

    info!("Shutting down, notifying {} peers", registry.len());
    for session in registry.all() {
        session.close(common::CloseReason::ServerShutdown);
    }
}

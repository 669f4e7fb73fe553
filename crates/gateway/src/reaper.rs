//! Periodic sweeps: expired waiters, idle sessions, directory leases.

use crate::directory::Directory;
use crate::error::RelayError;
use crate::forwarder::Forwarder;
use crate::pending::{PendingRequests, ResponseSink};
use crate::response;
use crate::session::PeerRegistry;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

/// Sweep cadences.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Expired-waiter scan interval.
    pub pending_sweep: Duration,
    /// Idle-session scan interval.
    pub session_sweep: Duration,
    /// Idle limit before an ancillary session is closed.
    pub idle_session_timeout: Duration,
    /// Directory lease renewal interval, typically half the record TTL.
    pub directory_refresh: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            pending_sweep: Duration::from_secs(10),
            session_sweep: Duration::from_secs(60),
            idle_session_timeout: Duration::from_secs(600),
            directory_refresh: Duration::from_secs(30),
        }
    }
}

/// Background sweeper owning no state of its own.
pub struct Reaper {
    registry: Arc<PeerRegistry>,
    pending: Arc<PendingRequests>,
    directory: Option<Directory>,
    forwarder: Option<Arc<Forwarder>>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        registry: Arc<PeerRegistry>,
        pending: Arc<PendingRequests>,
        directory: Option<Directory>,
        forwarder: Option<Arc<Forwarder>>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            registry,
            pending,
            directory,
            forwarder,
            config,
        }
    }

    /// Run until shutdown.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut pending_tick = interval(self.config.pending_sweep);
        let mut session_tick = interval(self.config.session_sweep);
        let mut directory_tick = interval(self.config.directory_refresh);

        info!("Reaper running");
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Reaper received shutdown signal");
                    break;
                }

                _ = pending_tick.tick() => {
                    self.sweep_pending().await;
                }

                _ = session_tick.tick() => {
                    let stale = self.registry.sweep_idle(
                        self.config.idle_session_timeout.as_millis() as i64,
                    );
                    if !stale.is_empty() {
                        counter!("relay_sessions_reaped_total").increment(stale.len() as u64);
                    }
                    gauge!("relay_active_connections").set(self.registry.len() as f64);
                }

                _ = directory_tick.tick() => {
                    self.refresh_directory().await;
                }
            }
        }
    }

    /// Fail every waiter past its deadline. Locally issued waiters
    /// resolve with a timeout; forwarded-in waiters are dropped, because
    /// the origin replica runs its own clock.
    async fn sweep_pending(&self) {
        let expired = self.pending.take_expired(Instant::now());
        if expired.is_empty() {
            return;
        }
        debug!("Reaping {} expired waiters", expired.len());
        counter!("relay_request_timeouts_total").increment(expired.len() as u64);
        for waiter in expired {
            match waiter.sink {
                ResponseSink::Remote { ref request_id, .. } => {
                    debug!(
                        "Dropping expired forwarded waiter {} (origin times out independently)",
                        request_id
                    );
                }
                ResponseSink::Local(_) => {
                    response::complete(waiter, Err(RelayError::Timeout), self.forwarder.as_ref())
                        .await;
                }
            }
        }
    }

    /// Renew directory leases for every locally owned session.
    async fn refresh_directory(&self) {
        let Some(directory) = &self.directory else {
            return;
        };
        for session in self.registry.all() {
            directory
                .refresh(&session.client_id, &session.api_key)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{ShapeHints, Waiter};
    use common::RequestKind;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_sweep_resolves_local_waiters_with_timeout() {
        let registry = Arc::new(PeerRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let (tx, rx) = oneshot::channel();
        pending
            .register(Waiter {
                request_id: "roll_1".to_string(),
                kind: RequestKind::Roll,
                origin_replica: "replica-a".to_string(),
                target_client_id: "c1".to_string(),
                sink: ResponseSink::Local(tx),
                created_at: 0,
                deadline: Instant::now() - Duration::from_millis(1),
                shape_hints: ShapeHints::default(),
            })
            .map_err(|_| ())
            .unwrap();

        let reaper = Reaper::new(
            registry,
            pending.clone(),
            None,
            None,
            ReaperConfig::default(),
        );
        reaper.sweep_pending().await;

        assert!(pending.is_empty());
        match rx.await {
            Ok(Err(RelayError::Timeout)) => {}
            other => panic!("expected timeout, got {:?}", other.map(|r| r.map(|_| ()))),
        }
    }
}

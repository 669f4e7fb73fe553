//! Environment-driven configuration for the relay.

use common::RequestKind;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use uuid::Uuid;

/// Hard cap on a single WebSocket text frame (250 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 250 * 1024 * 1024;

/// Relay configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP + WebSocket listen port.
    pub port: u16,
    /// Prometheus exporter port.
    pub metrics_port: u16,
    /// Identity of this replica in the directory and forwarder subjects.
    pub instance_id: String,
    /// Directory store URL. Absent disables cross-replica routing.
    pub redis_url: Option<String>,
    /// Broker URL for the inter-replica forwarder.
    pub nats_url: Option<String>,
    /// Accepted API keys. Empty means any non-empty key is accepted.
    pub api_keys: Vec<String>,
    /// Expected interval between peer pings.
    pub ping_interval: Duration,
    /// TTL on directory records, refreshed on keep-alive.
    pub directory_ttl: Duration,
    /// Default waiter deadline.
    pub default_timeout: Duration,
    /// Upper bound for per-request timeout overrides.
    pub max_timeout: Duration,
    /// Per-type deadline overrides.
    pub type_timeouts: HashMap<RequestKind, Duration>,
    /// Idle limit for ancillary sessions swept by the reaper.
    pub idle_session_timeout: Duration,
    /// Largest accepted WebSocket frame.
    pub max_frame_bytes: usize,
    /// Capacity of each session's outbound queue.
    pub send_queue: usize,
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 3010),
            metrics_port: env_parse("METRICS_PORT", 9310),
            instance_id: env::var("INSTANCE_ID")
                .unwrap_or_else(|_| Uuid::new_v4().to_string()),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            nats_url: env::var("NATS_URL").ok().filter(|s| !s.is_empty()),
            api_keys: env::var("RELAY_API_KEYS")
                .map(|s| {
                    s.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            ping_interval: Duration::from_secs(env_parse("PING_INTERVAL_SECS", 30)),
            directory_ttl: Duration::from_secs(env_parse("DIRECTORY_TTL_SECS", 60)),
            default_timeout: Duration::from_millis(env_parse("REQUEST_TIMEOUT_MS", 10_000)),
            max_timeout: Duration::from_millis(env_parse("MAX_REQUEST_TIMEOUT_MS", 60_000)),
            type_timeouts: parse_type_timeouts(
                &env::var("REQUEST_TIMEOUTS").unwrap_or_default(),
            ),
            idle_session_timeout: Duration::from_secs(env_parse(
                "IDLE_SESSION_TIMEOUT_SECS",
                600,
            )),
            max_frame_bytes: env_parse("MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES),
            send_queue: env_parse("SEND_QUEUE_CAPACITY", 256),
        }
    }

    /// The waiter deadline for a request type, honoring per-type overrides.
    pub fn timeout_for(&self, kind: RequestKind) -> Duration {
        self.type_timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Clamp a caller-supplied timeout override to the configured maximum.
    pub fn clamp_timeout(&self, requested_ms: u64) -> Duration {
        Duration::from_millis(requested_ms).min(self.max_timeout)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `"roll=5000,get-sheet=20000"` into per-type deadlines. Unknown
/// types and malformed entries are skipped.
fn parse_type_timeouts(raw: &str) -> HashMap<RequestKind, Duration> {
    let mut map = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((tag, ms)) = entry.split_once('=') {
            if let (Some(kind), Ok(ms)) = (RequestKind::from_str(tag.trim()), ms.trim().parse()) {
                map.insert(kind, Duration::from_millis(ms));
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_timeouts() {
        let map = parse_type_timeouts("roll=5000, get-sheet=20000,bogus=1,also-bad");
        assert_eq!(
            map.get(&RequestKind::Roll),
            Some(&Duration::from_millis(5000))
        );
        assert_eq!(
            map.get(&RequestKind::GetSheet),
            Some(&Duration::from_millis(20_000))
        );
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_timeout_for_falls_back_to_default() {
        let mut config = Config::from_env();
        config.default_timeout = Duration::from_secs(10);
        config.type_timeouts = parse_type_timeouts("roll=500");
        assert_eq!(
            config.timeout_for(RequestKind::Roll),
            Duration::from_millis(500)
        );
        assert_eq!(
            config.timeout_for(RequestKind::Search),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_clamp_timeout() {
        let mut config = Config::from_env();
        config.max_timeout = Duration::from_secs(60);
        assert_eq!(config.clamp_timeout(500), Duration::from_millis(500));
        assert_eq!(config.clamp_timeout(600_000), Duration::from_secs(60));
    }
}

//! Global directory: cross-replica client ownership over Redis.
//!
//! Key layout (all entries carry the directory TTL, refreshed on
//! keep-alive):
//! - `client:{id}:instance` → owning replica id
//! - `client:{id}:lastSeen`, `:connectedSince`, `:worldId`, `:worldTitle`,
//!   `:foundryVersion`, `:systemId`, `:systemTitle`, `:systemVersion`,
//!   `:customName`
//! - `apikey:{key}:clients` → set of client ids
//!
//! Every operation runs under a short deadline. Any error or timeout
//! degrades to "not found" so local clients keep working through a
//! directory outage.

use crate::session::PeerMetadata;
use chrono::Utc;
use redis::AsyncCommands;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Deadline on each directory RPC.
const OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Key prefix for client records: `client:{id}:{field}`.
pub const CLIENT_KEY_PREFIX: &str = "client:";

/// Key prefix for API-key membership sets: `apikey:{key}:clients`.
pub const APIKEY_KEY_PREFIX: &str = "apikey:";

/// Metadata suffixes mirrored into the directory, in MGET order.
const META_FIELDS: &[&str] = &[
    "lastSeen",
    "connectedSince",
    "worldId",
    "worldTitle",
    "foundryVersion",
    "systemId",
    "systemTitle",
    "systemVersion",
    "customName",
];

/// One field key of a client record.
fn client_key(client_id: &str, field: &str) -> String {
    format!("{CLIENT_KEY_PREFIX}{client_id}:{field}")
}

/// The membership set for an API key.
fn apikey_clients_key(api_key: &str) -> String {
    format!("{APIKEY_KEY_PREFIX}{api_key}:clients")
}

/// A client record assembled from directory metadata keys.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryClient {
    pub id: String,
    pub instance: String,
    #[serde(rename = "lastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(rename = "connectedSince", skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<String>,
    #[serde(rename = "worldId", skip_serializing_if = "Option::is_none")]
    pub world_id: Option<String>,
    #[serde(rename = "worldTitle", skip_serializing_if = "Option::is_none")]
    pub world_title: Option<String>,
    #[serde(rename = "foundryVersion", skip_serializing_if = "Option::is_none")]
    pub foundry_version: Option<String>,
    #[serde(rename = "systemId", skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(rename = "systemTitle", skip_serializing_if = "Option::is_none")]
    pub system_title: Option<String>,
    #[serde(rename = "systemVersion", skip_serializing_if = "Option::is_none")]
    pub system_version: Option<String>,
    #[serde(rename = "customName", skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

/// Redis-backed directory, shared by handle.
#[derive(Clone)]
pub struct Directory {
    client: Arc<redis::Client>,
    replica_id: String,
    ttl: Duration,
}

impl Directory {
    pub fn new(redis_url: &str, replica_id: String, ttl: Duration) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            replica_id,
            ttl,
        })
    }

    async fn connection(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    /// Run one directory RPC under the operation deadline, flattening
    /// timeouts and transport errors into `None`.
    async fn guarded<T, F>(&self, what: &str, fut: F) -> Option<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(OP_TIMEOUT, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Directory {} failed: {}", what, e);
                None
            }
            Err(_) => {
                warn!("Directory {} timed out after {:?}", what, OP_TIMEOUT);
                None
            }
        }
    }

    /// Record TTL in whole seconds. Sub-second configurations clamp to
    /// one second so records still expire.
    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    /// Upsert ownership and metadata for a client connected to this
    /// replica.
    pub async fn put(&self, client_id: &str, api_key: &str, metadata: &PeerMetadata) {
        let ttl = self.ttl_secs();
        let now = Utc::now().timestamp_millis().to_string();
        let replica = self.replica_id.clone();
        let meta = metadata.clone();
        let id = client_id.to_string();
        let key = api_key.to_string();
        let conn = self.guarded("connect", self.connection()).await;
        let Some(mut conn) = conn else { return };

        self.guarded("put", async move {
            let mut pipe = redis::pipe();
            pipe.set_ex(client_key(&id, "instance"), replica, ttl);
            pipe.set_ex(client_key(&id, "lastSeen"), &now, ttl);
            pipe.set_ex(client_key(&id, "connectedSince"), &now, ttl);
            for (field, value) in [
                ("worldId", &meta.world_id),
                ("worldTitle", &meta.world_title),
                ("foundryVersion", &meta.foundry_version),
                ("systemId", &meta.system_id),
                ("systemTitle", &meta.system_title),
                ("systemVersion", &meta.system_version),
                ("customName", &meta.custom_name),
            ] {
                if let Some(value) = value {
                    pipe.set_ex(client_key(&id, field), value, ttl);
                }
            }
            pipe.sadd(apikey_clients_key(&key), &id);
            pipe.expire(apikey_clients_key(&key), ttl as i64);
            pipe.query_async::<()>(&mut conn).await
        })
        .await;
        debug!("Directory record published for {}", client_id);
    }

    /// Which replica owns a client id, if any.
    pub async fn get(&self, client_id: &str) -> Option<String> {
        let id = client_id.to_string();
        let mut conn = self.guarded("connect", self.connection()).await?;
        self.guarded("get", async move {
            conn.get::<_, Option<String>>(client_key(&id, "instance"))
                .await
        })
        .await
        .flatten()
    }

    /// Renew the lease on every key for a client.
    pub async fn refresh(&self, client_id: &str, api_key: &str) {
        let ttl = self.ttl_secs();
        let now = Utc::now().timestamp_millis().to_string();
        let id = client_id.to_string();
        let key = api_key.to_string();
        let Some(mut conn) = self.guarded("connect", self.connection()).await else {
            return;
        };
        self.guarded("refresh", async move {
            let mut pipe = redis::pipe();
            pipe.set_ex(client_key(&id, "lastSeen"), &now, ttl);
            pipe.expire(client_key(&id, "instance"), ttl as i64);
            for field in &META_FIELDS[1..] {
                pipe.expire(client_key(&id, field), ttl as i64);
            }
            pipe.expire(apikey_clients_key(&key), ttl as i64);
            pipe.query_async::<()>(&mut conn).await
        })
        .await;
    }

    /// Delete the directory record, but only while this replica still
    /// owns it. A client that reconnected elsewhere keeps its new record.
    pub async fn delete_if_owner(&self, client_id: &str, api_key: &str) {
        let owner = self.get(client_id).await;
        if owner.as_deref() != Some(self.replica_id.as_str()) {
            debug!(
                "Skipping directory delete for {}: owned by {:?}",
                client_id, owner
            );
            return;
        }
        let id = client_id.to_string();
        let key = api_key.to_string();
        let Some(mut conn) = self.guarded("connect", self.connection()).await else {
            return;
        };
        self.guarded("delete", async move {
            let mut pipe = redis::pipe();
            pipe.del(client_key(&id, "instance"));
            for field in META_FIELDS {
                pipe.del(client_key(&id, field));
            }
            pipe.srem(apikey_clients_key(&key), &id);
            pipe.query_async::<()>(&mut conn).await
        })
        .await;
        debug!("Directory record deleted for {}", client_id);
    }

    /// Whether an API key owns a client id, per the directory index.
    /// Degrades to `false` on outage, which surfaces as a denial rather
    /// than a misroute.
    pub async fn api_key_owns(&self, api_key: &str, client_id: &str) -> bool {
        let key = api_key.to_string();
        let id = client_id.to_string();
        let Some(mut conn) = self.guarded("connect", self.connection()).await else {
            return false;
        };
        self.guarded("sismember", async move {
            conn.sismember(apikey_clients_key(&key), &id).await
        })
        .await
        .unwrap_or(false)
    }

    /// Clients visible to an API key, with whatever metadata the
    /// directory still holds.
    pub async fn list_by_api_key(&self, api_key: &str) -> Vec<DirectoryClient> {
        let key = api_key.to_string();
        let Some(mut conn) = self.guarded("connect", self.connection()).await else {
            return Vec::new();
        };
        let ids: Vec<String> = self
            .guarded("smembers", async {
                conn.smembers(apikey_clients_key(&key)).await
            })
            .await
            .unwrap_or_default();

        let mut clients = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(client) = self.fetch_client(&id).await {
                clients.push(client);
            }
        }
        clients
    }

    /// Assemble one client record; `None` when the lease expired.
    async fn fetch_client(&self, client_id: &str) -> Option<DirectoryClient> {
        let id = client_id.to_string();
        let mut conn = self.guarded("connect", self.connection()).await?;
        let keys: Vec<String> = std::iter::once(client_key(&id, "instance"))
            .chain(META_FIELDS.iter().map(|f| client_key(&id, f)))
            .collect();
        let values: Vec<Option<String>> = self
            .guarded("mget", async move { conn.mget(keys).await })
            .await?;

        let instance = values.first().cloned().flatten()?;
        let field = |i: usize| values.get(i + 1).cloned().flatten();
        Some(DirectoryClient {
            id: client_id.to_string(),
            instance,
            last_seen: field(0),
            connected_since: field(1),
            world_id: field(2),
            world_title: field(3),
            foundry_version: field(4),
            system_id: field(5),
            system_title: field(6),
            system_version: field(7),
            custom_name: field(8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_directory(ttl: Duration) -> Directory {
        // Client::open only parses the URL; no connection is made here.
        Directory::new("redis://127.0.0.1:6379", "replica-a".to_string(), ttl).unwrap()
    }

    #[test]
    fn test_key_prefixes() {
        assert_eq!(CLIENT_KEY_PREFIX, "client:");
        assert_eq!(APIKEY_KEY_PREFIX, "apikey:");
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(client_key("c1", "instance"), "client:c1:instance");
        assert_eq!(client_key("c1", "worldTitle"), "client:c1:worldTitle");
        assert_eq!(apikey_clients_key("k1"), "apikey:k1:clients");
    }

    #[test]
    fn test_meta_fields_mget_order() {
        // fetch_client maps MGET positions by this exact order.
        assert_eq!(
            META_FIELDS,
            &[
                "lastSeen",
                "connectedSince",
                "worldId",
                "worldTitle",
                "foundryVersion",
                "systemId",
                "systemTitle",
                "systemVersion",
                "customName",
            ]
        );
    }

    #[test]
    fn test_ttl_secs_floor() {
        assert_eq!(make_directory(Duration::from_secs(60)).ttl_secs(), 60);
        assert_eq!(make_directory(Duration::from_millis(10)).ttl_secs(), 1);
        assert_eq!(make_directory(Duration::ZERO).ttl_secs(), 1);
    }
}

//! API-key authentication collaborator.
//!
//! The relay only needs a yes/no on the key itself; key-to-client
//! authorization is decided against the registry and directory indexes.

use async_trait::async_trait;
use std::collections::HashSet;

/// Validates API keys presented on the HTTP edge and the WebSocket
/// handshake (`token` query parameter).
#[async_trait]
pub trait ApiKeyAuth: Send + Sync + 'static {
    async fn validate_key(&self, api_key: &str) -> bool;
}

/// Key validation against a fixed set from configuration.
///
/// An empty set accepts any non-empty key, which is the single-tenant
/// deployment mode.
pub struct StaticKeyAuth {
    keys: HashSet<String>,
}

impl StaticKeyAuth {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ApiKeyAuth for StaticKeyAuth {
    async fn validate_key(&self, api_key: &str) -> bool {
        if api_key.is_empty() {
            return false;
        }
        self.keys.is_empty() || self.keys.contains(api_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_set_accepts_any_nonempty_key() {
        let auth = StaticKeyAuth::new([]);
        assert!(auth.validate_key("anything").await);
        assert!(!auth.validate_key("").await);
    }

    #[tokio::test]
    async fn test_fixed_set() {
        let auth = StaticKeyAuth::new(["k1".to_string(), "k2".to_string()]);
        assert!(auth.validate_key("k1").await);
        assert!(!auth.validate_key("k3").await);
        assert!(!auth.validate_key("").await);
    }
}

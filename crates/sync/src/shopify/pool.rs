//! Long-lived client cache keyed by `(store, api_version)`.

use moka::future::Cache;
use secrecy::SecretString;

use super::ShopifyClient;

const MAX_CLIENTS: u64 = 32;

/// Hands out one shared [`ShopifyClient`] per store and API version so the
/// throttle bucket is shared by every query against that store.
#[derive(Clone)]
pub struct ShopifyClientPool {
    access_token: SecretString,
    clients: Cache<(String, String), ShopifyClient>,
}

impl ShopifyClientPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(access_token: SecretString) -> Self {
        Self {
            access_token,
            clients: Cache::builder().max_capacity(MAX_CLIENTS).build(),
        }
    }

    /// Get (or create) the client for a store and API version.
    pub async fn get(&self, store: &str, api_version: &str) -> ShopifyClient {
        let key = (store.to_string(), api_version.to_string());
        let token = self.access_token.clone();
        self.clients
            .get_with(key, async move { ShopifyClient::new(store, api_version, token) })
            .await
    }

    /// Number of cached clients.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.clients.entry_count()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_reuses_clients() {
        let pool = ShopifyClientPool::new(SecretString::from("token".to_string()));
        let a = pool.get("a.myshopify.com", "2026-01").await;
        let b = pool.get("a.myshopify.com", "2026-01").await;
        let c = pool.get("a.myshopify.com", "2025-10").await;

        assert_eq!(a.store(), "a.myshopify.com");
        assert_eq!(b.api_version(), "2026-01");
        assert_eq!(c.api_version(), "2025-10");
        pool.clients.run_pending_tasks().await;
        assert_eq!(pool.len(), 2);
    }
}

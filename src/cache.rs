//! Coherent cache
//!
//! Replica-local bounded TTL maps for key, account, and price records, kept
//! coherent across replicas by a Redis pub/sub invalidation channel.
//! Invalidation is best-effort: the TTL is the staleness upper bound, the
//! bus is the latency optimisation. Reads never block on the bus and
//! publishes never wait for acknowledgement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::db::{Account, ApiKey, ModelPrice, Store};
use crate::error::{GatewayError, GatewayResult};

/// Pub/sub channel carrying invalidation messages
pub const INVALIDATION_CHANNEL: &str = "cache_invalidation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Key,
    Account,
    Price,
}

/// Wire message published on every mutation: `{"namespace":...,"id":...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invalidation {
    pub namespace: Namespace,
    pub id: String,
}

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// Bounded TTL map. Single-entry eviction only; there is no full flush.
pub struct TtlCache<T: Clone> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    ttl: Duration,
    max_entries: usize,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: T) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                // Still full after purging expired entries: drop one arbitrary
                // entry. It will be reloaded from the store on next miss.
                if let Some(victim) = entries.keys().next().cloned() {
                    entries.remove(&victim);
                }
            }
        }
        entries.insert(
            key.to_string(),
            Entry { value, expires_at: Instant::now() + self.ttl },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Redis connection used for publish and subscribe. The publisher connection
/// is created lazily and dropped on error so the next publish reconnects.
pub struct CacheBus {
    client: redis::Client,
    publisher: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl CacheBus {
    /// Connect and verify the bus is reachable. Startup treats failure here
    /// as fatal; publish failures later are best-effort.
    pub async fn connect(uri: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(uri)
            .map_err(|e| GatewayError::Internal(format!("invalid cache bus URI: {}", e)))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GatewayError::Internal(format!("cache bus unreachable: {}", e)))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Internal(format!("cache bus ping failed: {}", e)))?;
        Ok(CacheBus {
            client,
            publisher: tokio::sync::Mutex::new(Some(conn)),
        })
    }

    async fn publish(&self, message: &Invalidation) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode invalidation message");
                return;
            }
        };

        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => *guard = Some(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "cache bus reconnect failed, invalidation dropped");
                    return;
                }
            }
        }

        if let Some(conn) = guard.as_mut() {
            let result: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                .arg(INVALIDATION_CHANNEL)
                .arg(&payload)
                .query_async(conn)
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "invalidation publish failed");
                *guard = None;
            }
        }
    }
}

/// The three cache namespaces plus their store-backed loaders
pub struct Cache {
    keys: TtlCache<ApiKey>,
    accounts: TtlCache<Account>,
    prices: TtlCache<ModelPrice>,
    store: Store,
    bus: Option<Arc<CacheBus>>,
}

impl Cache {
    pub fn new(
        store: Store,
        max_entries: usize,
        ttl: Duration,
        bus: Option<Arc<CacheBus>>,
    ) -> Self {
        Cache {
            keys: TtlCache::new(max_entries, ttl),
            accounts: TtlCache::new(max_entries, ttl),
            prices: TtlCache::new(max_entries, ttl),
            store,
            bus,
        }
    }

    pub async fn api_key(&self, key: &str) -> GatewayResult<Option<ApiKey>> {
        if let Some(hit) = self.keys.get(key) {
            return Ok(Some(hit));
        }
        let store = self.store.clone();
        let lookup = key.to_string();
        let loaded = spawn_store(move || store.api_key(&lookup)).await?;
        if let Some(ref record) = loaded {
            self.keys.insert(key, record.clone());
        }
        Ok(loaded)
    }

    pub async fn account(&self, user_id: &str) -> GatewayResult<Option<Account>> {
        if let Some(hit) = self.accounts.get(user_id) {
            return Ok(Some(hit));
        }
        let store = self.store.clone();
        let lookup = user_id.to_string();
        let loaded = spawn_store(move || store.account(&lookup)).await?;
        if let Some(ref record) = loaded {
            self.accounts.insert(user_id, record.clone());
        }
        Ok(loaded)
    }

    pub async fn price(&self, model_name: &str) -> GatewayResult<Option<ModelPrice>> {
        if let Some(hit) = self.prices.get(model_name) {
            return Ok(Some(hit));
        }
        let store = self.store.clone();
        let lookup = model_name.to_string();
        let loaded = spawn_store(move || store.price(&lookup)).await?;
        if let Some(ref record) = loaded {
            self.prices.insert(model_name, record.clone());
        }
        Ok(loaded)
    }

    /// Evict a single local entry
    pub fn evict(&self, invalidation: &Invalidation) {
        match invalidation.namespace {
            Namespace::Key => self.keys.remove(&invalidation.id),
            Namespace::Account => self.accounts.remove(&invalidation.id),
            Namespace::Price => self.prices.remove(&invalidation.id),
        }
        tracing::debug!(
            namespace = ?invalidation.namespace,
            id = %invalidation.id,
            "cache entry evicted"
        );
    }

    /// Evict locally and publish to the other replicas. Best-effort: a failed
    /// publish only means remote replicas serve stale reads until TTL expiry.
    pub async fn invalidate(&self, namespace: Namespace, id: &str) {
        let message = Invalidation { namespace, id: id.to_string() };
        self.evict(&message);
        if let Some(bus) = &self.bus {
            bus.publish(&message).await;
        }
    }
}

async fn spawn_store<T, F>(op: F) -> GatewayResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> rusqlite::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| GatewayError::Internal(format!("store task failed: {}", e)))?
        .map_err(GatewayError::from)
}

/// Background task that applies invalidations published by other replicas.
/// Reconnects with a short backoff if the subscription drops.
pub fn spawn_invalidation_listener(cache: Arc<Cache>) {
    let Some(bus) = cache.bus.clone() else {
        return;
    };
    tokio::spawn(async move {
        loop {
            match bus.client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    if let Err(e) = pubsub.subscribe(INVALIDATION_CHANNEL).await {
                        tracing::warn!(error = %e, "invalidation subscribe failed");
                    } else {
                        tracing::info!(channel = INVALIDATION_CHANNEL, "invalidation listener started");
                        let mut messages = pubsub.on_message();
                        while let Some(msg) = messages.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(e) => {
                                    tracing::warn!(error = %e, "unreadable invalidation payload");
                                    continue;
                                }
                            };
                            match serde_json::from_str::<Invalidation>(&payload) {
                                Ok(invalidation) => cache.evict(&invalidation),
                                Err(e) => {
                                    tracing::warn!(error = %e, payload = %payload, "malformed invalidation message")
                                }
                            }
                        }
                        tracing::warn!("invalidation subscription ended, reconnecting");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "invalidation listener connect failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AccountCreate;

    #[test]
    fn ttl_expiry_and_capacity() {
        let cache: TtlCache<i64> = TtlCache::new(2, Duration::from_millis(20));
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get("a"), Some(1));

        // Third insert evicts something; the new entry is present
        cache.insert("c", 3);
        assert!(cache.len() <= 2);
        assert_eq!(cache.get("c"), Some(3));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("c"), None);
        assert!(cache.is_empty() || cache.len() <= 2);
    }

    #[test]
    fn remove_is_single_entry() {
        let cache: TtlCache<i64> = TtlCache::new(10, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.remove("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn invalidation_message_wire_shape() {
        let msg = Invalidation { namespace: Namespace::Account, id: "u1".into() };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert_eq!(encoded, r#"{"namespace":"account","id":"u1"}"#);

        let decoded: Invalidation = serde_json::from_str(r#"{"namespace":"price","id":"m1"}"#).unwrap();
        assert_eq!(decoded.namespace, Namespace::Price);
        assert_eq!(decoded.id, "m1");
    }

    #[tokio::test]
    async fn loader_populates_and_eviction_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("cache_test.db")).unwrap();
        store
            .create_account(&AccountCreate {
                user_id: "u1".into(),
                account_name: None,
                budget_usd: 5.0,
                budget_period: Default::default(),
                is_active: true,
            })
            .unwrap();

        let cache = Cache::new(store.clone(), 10, Duration::from_secs(60), None);
        let account = cache.account("u1").await.unwrap().unwrap();
        assert_eq!(account.budget_usd, 5.0);

        // Mutate behind the cache's back: the cached value is served until
        // an invalidation lands.
        store.atomic_debit("u1", 1.0).unwrap();
        let stale = cache.account("u1").await.unwrap().unwrap();
        assert_eq!(stale.spent_usd, 0.0);

        cache.invalidate(Namespace::Account, "u1").await;
        let fresh = cache.account("u1").await.unwrap().unwrap();
        assert!((fresh.spent_usd - 1.0).abs() < 1e-9);

        assert_eq!(cache.account("missing").await.unwrap().map(|a| a.user_id), None);
    }
}

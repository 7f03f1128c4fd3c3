use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::users::dto::UserView;

/// Fixed key for the full user listing. The listing is the only cached
/// read pattern, so a single key is enough; the entry is always replaced
/// whole or absent, never merged.
const ALL_USERS_KEY: &str = "all_users";

const INVALIDATE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Minimal cache surface the service needs. Implemented by Redis in
/// production and by an in-memory map in tests.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    /// Deleting an absent key is a no-op, not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Redis-backed cache over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(host: &str, port: u16) -> anyhow::Result<Self> {
        let url = format!("redis://{host}:{port}/");
        info!(%host, %port, "connecting to redis");
        let client = redis::Client::open(url.as_str()).context("create redis client")?;
        // Bounded calls: a hung cache command surfaces as an error instead
        // of stalling the request.
        let config = redis::aio::ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(5))
            .set_response_timeout(Duration::from_secs(2));
        let conn = ConnectionManager::new_with_config(client, config)
            .await
            .context("connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.context("redis GET")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs())
            .await
            .context("redis SET EX")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.context("redis DEL")?;
        Ok(())
    }
}

/// TTL-bounded cache of the full user listing.
///
/// Policy: lazy fill on a missed read, eager invalidation after every
/// committed mutation. Read failures degrade to a miss so the listing can
/// fall back to the store; invalidation failures are retried once and then
/// propagated, so a mutation never reports success over a stale entry.
#[derive(Clone)]
pub struct ListingCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ListingCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Return the cached listing if present and unexpired.
    ///
    /// Backend errors and undecodable payloads are reported as a miss; the
    /// cache is never authoritative, so the caller re-reads the store.
    pub async fn get_listing(&self) -> Option<Vec<UserView>> {
        let raw = match self.backend.get(ALL_USERS_KEY).await {
            Ok(v) => v?,
            Err(e) => {
                warn!(error = %e, "listing cache read failed, falling back to store");
                return None;
            }
        };
        match serde_json::from_str::<Vec<UserView>>(&raw) {
            Ok(users) => {
                debug!(count = users.len(), "listing cache hit");
                Some(users)
            }
            Err(e) => {
                warn!(error = %e, "listing cache entry undecodable, treating as miss");
                None
            }
        }
    }

    /// Replace the cached listing with a fresh snapshot. Best effort: the
    /// read it came from was already served, so a failed fill is only logged.
    pub async fn put_listing(&self, users: &[UserView]) {
        let snapshot = match serde_json::to_string(users) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "listing snapshot serialization failed");
                return;
            }
        };
        if let Err(e) = self.backend.set(ALL_USERS_KEY, &snapshot, self.ttl).await {
            warn!(error = %e, "listing cache fill failed");
        } else {
            debug!(count = users.len(), ttl_seconds = self.ttl.as_secs(), "listing cached");
        }
    }

    /// Drop the cached listing. Called strictly after a store commit has
    /// succeeded. Idempotent, so concurrent mutations may call it in any
    /// order, and a reader refilling the entry between the commit and this
    /// call is harmless: the refill either already reflects the commit or
    /// is evicted here. One retry on failure, then the error propagates to
    /// fail the mutating request.
    pub async fn invalidate(&self) -> anyhow::Result<()> {
        if let Err(first) = self.backend.delete(ALL_USERS_KEY).await {
            warn!(error = %first, "listing invalidation failed, retrying");
            tokio::time::sleep(INVALIDATE_RETRY_DELAY).await;
            self.backend
                .delete(ALL_USERS_KEY)
                .await
                .context("listing invalidation failed after retry")?;
        }
        debug!("listing cache invalidated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::repo::Role;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// In-memory backend honoring TTLs, standing in for Redis.
    #[derive(Default)]
    struct MemoryBackend {
        entries: Mutex<HashMap<String, (String, Instant)>>,
    }

    #[async_trait]
    impl CacheBackend for MemoryBackend {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > Instant::now() => {
                    Ok(Some(value.clone()))
                }
                Some(_) => {
                    entries.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
            self.entries
                .lock()
                .await
                .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
            Ok(())
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.entries.lock().await.remove(key);
            Ok(())
        }
    }

    /// Backend that fails the first `failures` calls of each operation.
    struct FlakyBackend {
        inner: MemoryBackend,
        remaining_failures: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryBackend::default(),
                remaining_failures: AtomicUsize::new(failures),
            }
        }

        fn trip(&self) -> anyhow::Result<()> {
            let left = self.remaining_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining_failures.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.trip()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
            self.trip()?;
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.trip()?;
            self.inner.delete(key).await
        }
    }

    fn sample_users() -> Vec<UserView> {
        vec![
            UserView {
                id: Uuid::new_v4(),
                email: "a@x.com".into(),
                role: Role::User,
            },
            UserView {
                id: Uuid::new_v4(),
                email: "admin@x.com".into(),
                role: Role::Admin,
            },
        ]
    }

    #[tokio::test]
    async fn empty_cache_is_a_miss() {
        let cache = ListingCache::new(Arc::new(MemoryBackend::default()), Duration::from_secs(60));
        assert!(cache.get_listing().await.is_none());
    }

    #[tokio::test]
    async fn filled_cache_returns_identical_snapshot() {
        let cache = ListingCache::new(Arc::new(MemoryBackend::default()), Duration::from_secs(60));
        let users = sample_users();
        cache.put_listing(&users).await;

        let cached = cache.get_listing().await.expect("hit");
        assert_eq!(cached.len(), users.len());
        assert_eq!(cached[0].id, users[0].id);
        assert_eq!(cached[1].email, "admin@x.com");
    }

    #[tokio::test]
    async fn invalidation_evicts_the_entry() {
        let cache = ListingCache::new(Arc::new(MemoryBackend::default()), Duration::from_secs(60));
        cache.put_listing(&sample_users()).await;
        cache.invalidate().await.expect("invalidate");
        assert!(cache.get_listing().await.is_none());
    }

    #[tokio::test]
    async fn invalidating_an_empty_cache_is_a_no_op() {
        let cache = ListingCache::new(Arc::new(MemoryBackend::default()), Duration::from_secs(60));
        cache.invalidate().await.expect("no-op invalidate");
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = ListingCache::new(Arc::new(MemoryBackend::default()), Duration::ZERO);
        cache.put_listing(&sample_users()).await;
        assert!(cache.get_listing().await.is_none());
    }

    #[tokio::test]
    async fn read_degrades_to_miss_when_backend_is_down() {
        let cache = ListingCache::new(Arc::new(FlakyBackend::new(usize::MAX)), Duration::from_secs(60));
        assert!(cache.get_listing().await.is_none());
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss() {
        let backend = Arc::new(MemoryBackend::default());
        backend
            .set(ALL_USERS_KEY, "not json", Duration::from_secs(60))
            .await
            .unwrap();
        let cache = ListingCache::new(backend, Duration::from_secs(60));
        assert!(cache.get_listing().await.is_none());
    }

    #[tokio::test]
    async fn invalidation_retries_once_then_succeeds() {
        let cache = ListingCache::new(Arc::new(FlakyBackend::new(1)), Duration::from_secs(60));
        cache.invalidate().await.expect("second attempt succeeds");
    }

    #[tokio::test]
    async fn persistent_invalidation_failure_is_an_error() {
        let cache = ListingCache::new(Arc::new(FlakyBackend::new(usize::MAX)), Duration::from_secs(60));
        assert!(cache.invalidate().await.is_err());
    }
}

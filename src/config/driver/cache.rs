//! Read-through caching for any [`Driver`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Driver;
use crate::config::ConfigError;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_KEY: &str = "trust-registry:cfgs";

/// A string key-value cache with expiry.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ConfigError>;

    async fn delete(&self, key: &str) -> Result<(), ConfigError>;
}

/// In-process cache, used when Redis is not configured.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ConfigError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ConfigError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Redis-backed cache sharing one multiplexed connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KvCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ConfigError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ConfigError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// Serves `load` from the cache for up to `ttl`. `save` goes to the inner
/// driver and then drops the cached copy; a failed invalidation is only
/// logged, the TTL bounds how long the stale copy lives.
pub struct CachedDriver {
    inner: Arc<dyn Driver>,
    cache: Arc<dyn KvCache>,
    ttl_ms: AtomicU64,
}

impl CachedDriver {
    pub fn new(inner: Arc<dyn Driver>, cache: Arc<dyn KvCache>) -> Self {
        Self {
            inner,
            cache,
            ttl_ms: AtomicU64::new(DEFAULT_CACHE_TTL.as_millis() as u64),
        }
    }

    pub fn with_ttl(self, ttl: Duration) -> Self {
        self.set_ttl(ttl);
        self
    }

    /// Applies to entries written from now on.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl Driver for CachedDriver {
    async fn load(&self) -> Result<HashMap<String, String>, ConfigError> {
        match self.cache.get(CACHE_KEY).await {
            Ok(Some(hit)) => match serde_json::from_str(&hit) {
                Ok(cfg) => {
                    debug!("configuration served from cache");
                    return Ok(cfg);
                }
                Err(e) => warn!("cached configuration is unreadable, reloading: {e}"),
            },
            Ok(None) => {}
            Err(e) => warn!("configuration cache read failed: {e}"),
        }

        let cfg = self.inner.load().await?;
        match serde_json::to_string(&cfg) {
            Ok(doc) => {
                if let Err(e) = self.cache.set(CACHE_KEY, &doc, self.ttl()).await {
                    warn!("configuration cache write failed: {e}");
                }
            }
            Err(e) => warn!("configuration could not be cached: {e}"),
        }
        Ok(cfg)
    }

    async fn save(&self, cfg: HashMap<String, String>) -> Result<(), ConfigError> {
        self.inner.save(cfg).await?;
        if let Err(e) = self.cache.delete(CACHE_KEY).await {
            warn!("configuration cache invalidation failed: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryDriver;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        inner: MemoryDriver,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl Driver for Counting {
        async fn load(&self) -> Result<HashMap<String, String>, ConfigError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load().await
        }

        async fn save(&self, cfg: HashMap<String, String>) -> Result<(), ConfigError> {
            self.inner.save(cfg).await
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl KvCache for BrokenCache {
        async fn get(&self, _: &str) -> Result<Option<String>, ConfigError> {
            Err(ConfigError::Cache("down".into()))
        }

        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), ConfigError> {
            Err(ConfigError::Cache("down".into()))
        }

        async fn delete(&self, _: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Cache("down".into()))
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            inner: MemoryDriver::new(),
            loads: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn loads_are_cached_until_save() {
        let backing = counting();
        let driver = CachedDriver::new(backing.clone(), Arc::new(MemoryCache::new()));
        driver
            .save(HashMap::from([("email_host".to_string(), "a".to_string())]))
            .await
            .unwrap();

        assert_eq!(driver.load().await.unwrap()["email_host"], "a");
        assert_eq!(driver.load().await.unwrap()["email_host"], "a");
        assert_eq!(backing.loads.load(Ordering::SeqCst), 1);

        driver
            .save(HashMap::from([("email_host".to_string(), "b".to_string())]))
            .await
            .unwrap();
        assert_eq!(driver.load().await.unwrap()["email_host"], "b");
        assert_eq!(backing.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn entries_expire() {
        let backing = counting();
        let driver =
            CachedDriver::new(backing.clone(), Arc::new(MemoryCache::new())).with_ttl(Duration::from_millis(20));
        driver.load().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        driver.load().await.unwrap();
        assert_eq!(backing.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ttl_can_change_after_construction() {
        let backing = counting();
        let driver = CachedDriver::new(backing.clone(), Arc::new(MemoryCache::new()));
        assert_eq!(driver.ttl(), DEFAULT_CACHE_TTL);
        driver.set_ttl(Duration::from_millis(20));
        driver.load().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        driver.load().await.unwrap();
        assert_eq!(backing.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_failures_never_fail_the_driver() {
        let backing = counting();
        let driver = CachedDriver::new(backing.clone(), Arc::new(BrokenCache));
        driver
            .save(HashMap::from([("k".to_string(), "v".to_string())]))
            .await
            .unwrap();
        assert_eq!(driver.load().await.unwrap()["k"], "v");
    }
}

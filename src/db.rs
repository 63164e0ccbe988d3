// SPDX-License-Identifier: EUPL-1.2
// Copyright (c) 2026 Benjamin Küttner <benjamin.kuettner@icloud.com>
// Patent Pending — DE Gebrauchsmuster, filed 2026-02-23

//! Database pool, Redis cache, and application state.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use crate::config::{
    items, CachedDriver, ConfigStore, DbDriver, Driver, FileKeyProvider, KvCache, MemoryCache, MemoryDriver,
    PasswordCipher, RedisCache, Registry, RestDriver, StaticKeyProvider,
};
use crate::crypto::{CryptoService, MemoryCryptoService, SqlKeyStorage};
use crate::server::TrustService;
use crate::storage::{MemStorage, MetaStore, SqlStorage};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state injected into every Axum handler.
#[derive(Clone)]
pub struct AppState {
    pub trust: TrustService,
    pub config: Arc<ConfigStore>,
    /// `None` when `DATABASE_URL` is not set (in-memory dev mode).
    pub pool: Option<PgPool>,
    /// Redis connection manager, `None` if `REDIS_URL` is not set.
    pub cache: Option<ConnectionManager>,
    /// Shared secret for the internal configuration API (`JOBSERVICE_SECRET`).
    /// When `None`, the internal API is open.
    pub internal_secret: Option<String>,
    pub request_timeout: Duration,
}

impl AppState {
    /// Connect everything configured in the environment. PostgreSQL and
    /// Redis are optional; without them the service keeps state in memory.
    pub async fn connect() -> anyhow::Result<Self> {
        let pool = match std::env::var("DATABASE_URL") {
            Ok(url) => {
                let pool = PgPool::connect(&url).await?;
                tracing::info!("connected to PostgreSQL");
                // the schema must exist before keys and configuration are read
                sqlx::migrate!("./migrations").run(&pool).await?;
                tracing::info!("Migrations applied");
                Some(pool)
            }
            Err(_) => {
                tracing::warn!("DATABASE_URL not set, trust data is kept in memory (dev mode)");
                None
            }
        };

        let cache = match std::env::var("REDIS_URL") {
            Ok(url) => match redis::Client::open(url.as_str()) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(mgr) => {
                        tracing::info!("Redis cache connected: {}", url);
                        Some(mgr)
                    }
                    Err(e) => {
                        tracing::warn!("Redis connect failed (using in-process cache): {e}");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!("Redis URL invalid (using in-process cache): {e}");
                    None
                }
            },
            Err(_) => {
                tracing::info!("REDIS_URL not set, configuration cache is in-process");
                None
            }
        };

        let store: Arc<dyn MetaStore> = match &pool {
            Some(pool) => Arc::new(SqlStorage::new(pool.clone())),
            None => Arc::new(MemStorage::new()),
        };
        let crypto: Arc<dyn CryptoService> = Arc::new(MemoryCryptoService::new());
        let cipher = PasswordCipher::new(Arc::new(FileKeyProvider::from_env()));
        let mut trust = TrustService::new(store, crypto);
        match &pool {
            Some(pool) => {
                trust = trust.with_key_storage(Arc::new(SqlKeyStorage::new(pool.clone(), cipher.clone())));
                let restored = trust.restore_keys().await?;
                tracing::info!("restored {} server signing keys", restored);
            }
            None => tracing::warn!("server signing keys are kept in memory and are lost on restart (dev mode)"),
        }

        let registry = Registry::global();
        let internal_secret = std::env::var("JOBSERVICE_SECRET").ok();

        let driver: Arc<dyn Driver> = match (std::env::var("CONFIG_DRIVER").ok().as_deref(), &pool) {
            (Some("rest"), _) => {
                let core_url = std::env::var("CORE_URL").unwrap_or_else(|_| "http://core:8080".into());
                tracing::info!("configuration is owned by {}", core_url);
                Arc::new(RestDriver::new(&core_url, internal_secret.clone()))
            }
            (Some("db") | None, Some(pool)) => Arc::new(DbDriver::new(pool.clone(), registry.clone(), cipher.clone())),
            (Some("memory") | None, _) => Arc::new(MemoryDriver::with_encryption(registry.clone(), cipher.clone())),
            (Some(other), _) => {
                tracing::warn!("CONFIG_DRIVER={other} is not usable here, configuration is kept in memory");
                Arc::new(MemoryDriver::with_encryption(registry.clone(), cipher.clone()))
            }
        };

        let kv: Arc<dyn KvCache> = match &cache {
            Some(conn) => Arc::new(RedisCache::new(conn.clone())),
            None => Arc::new(MemoryCache::new()),
        };
        let (config, _) = cached_config(registry, driver, kv, cipher, |key| std::env::var(key).ok());
        if let Err(e) = config.load().await {
            tracing::warn!("configuration could not be loaded, using defaults and environment: {e}");
        }
        tracing::info!(
            "metrics labels: namespace={} subsystem={}",
            config.get(items::METRIC_NAMESPACE).map(|v| v.get_string()).unwrap_or_default(),
            config.get(items::METRIC_SUBSYSTEM).map(|v| v.get_string()).unwrap_or_default(),
        );

        if internal_secret.is_some() {
            tracing::info!("JOBSERVICE_SECRET set, internal configuration API is secret-protected");
        } else {
            tracing::warn!("JOBSERVICE_SECRET not set, internal configuration API is open (dev mode)");
        }

        let request_timeout = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        Ok(Self {
            trust,
            config,
            pool,
            cache,
            internal_secret,
            request_timeout,
        })
    }

    /// Everything in memory with a random password key. Used by tests and
    /// local runs.
    pub fn in_memory() -> Self {
        let registry = Registry::global();
        let cipher = PasswordCipher::new(Arc::new(StaticKeyProvider(rand::random::<[u8; 16]>().to_vec())));
        let driver = Arc::new(MemoryDriver::with_encryption(registry.clone(), cipher.clone()));
        let config = Arc::new(ConfigStore::new(registry, driver, cipher).with_system_save(false));
        let trust = TrustService::new(Arc::new(MemStorage::new()), Arc::new(MemoryCryptoService::new()));
        Self {
            trust,
            config,
            pool: None,
            cache: None,
            internal_secret: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_internal_secret(mut self, secret: impl Into<String>) -> Self {
        self.internal_secret = Some(secret.into());
        self
    }
}

/// A store over a caching driver. The environment is applied first, so the
/// cache TTL is the `config_cache_ttl` item before anything gets cached.
fn cached_config(
    registry: Arc<Registry>,
    driver: Arc<dyn Driver>,
    kv: Arc<dyn KvCache>,
    cipher: PasswordCipher,
    env: impl Fn(&str) -> Option<String>,
) -> (Arc<ConfigStore>, Arc<CachedDriver>) {
    let cached = Arc::new(CachedDriver::new(driver, kv));
    let config = Arc::new(ConfigStore::new(registry, cached.clone(), cipher));
    config.load_env_with(env);
    cached.set_ttl(config.cache_ttl());
    (config, cached)
}

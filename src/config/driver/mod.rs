//! Where configuration is persisted.

mod cache;
mod db;
mod memory;
mod rest;

use std::collections::HashMap;

use async_trait::async_trait;

pub use cache::{CachedDriver, KvCache, MemoryCache, RedisCache, DEFAULT_CACHE_TTL};
pub use db::DbDriver;
pub use memory::MemoryDriver;
pub use rest::RestDriver;

use super::{ConfigError, PasswordCipher, Registry};

/// Loads and saves raw `name → value` pairs. `save` upserts the given keys.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, String>, ConfigError>;

    async fn save(&self, cfg: HashMap<String, String>) -> Result<(), ConfigError>;
}

/// Encrypt password-typed values before they are written.
pub(crate) fn seal_passwords(
    registry: &Registry,
    cipher: &PasswordCipher,
    mut cfg: HashMap<String, String>,
) -> Result<HashMap<String, String>, ConfigError> {
    for (name, value) in cfg.iter_mut() {
        if registry.is_password(name) && !value.is_empty() {
            *value = cipher.encrypt(value)?;
        }
    }
    Ok(cfg)
}

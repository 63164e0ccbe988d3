//! Typed, schema-driven configuration.
//!
//! Values resolve in layers: item defaults, then the environment, then the
//! persistent [`Driver`], then in-memory overrides via [`ConfigStore::set`].

pub mod driver;
pub mod encrypt;
pub mod items;
pub mod metadata;
pub mod models;
pub mod rules;
pub mod store;
pub mod value;

pub use driver::{CachedDriver, DbDriver, Driver, KvCache, MemoryCache, MemoryDriver, RedisCache, RestDriver};
pub use encrypt::{FileKeyProvider, KeyProvider, PasswordCipher, StaticKeyProvider};
pub use metadata::{Item, ItemType, Registry, Scope};
pub use rules::Rule;
pub use store::ConfigStore;
pub use value::ConfigValue;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration item: {0}")]
    UnknownItem(String),

    #[error("invalid value for {name}: {reason}")]
    Validation { name: String, reason: String },

    #[error("{0} can not be changed at runtime")]
    NotEditable(String),

    #[error("{rule}: {reason}")]
    Rule { rule: &'static str, reason: String },

    #[error("password encryption: {0}")]
    Encryption(String),

    #[error("cache: {0}")]
    Cache(String),

    #[error("configuration peer returned {status}: {body}")]
    Peer { status: u16, body: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<redis::RedisError> for ConfigError {
    fn from(e: redis::RedisError) -> Self {
        ConfigError::Cache(e.to_string())
    }
}

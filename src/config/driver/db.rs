use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{seal_passwords, Driver};
use crate::config::{ConfigError, PasswordCipher, Registry};

/// Reads and writes the `properties(k, v)` table. Passwords are encrypted
/// on the way in.
pub struct DbDriver {
    pool: PgPool,
    registry: Arc<Registry>,
    cipher: PasswordCipher,
}

impl DbDriver {
    pub fn new(pool: PgPool, registry: Arc<Registry>, cipher: PasswordCipher) -> Self {
        Self { pool, registry, cipher }
    }
}

#[async_trait]
impl Driver for DbDriver {
    async fn load(&self) -> Result<HashMap<String, String>, ConfigError> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT k, v FROM properties")
            .fetch_all(&self.pool)
            .await?;
        debug!("loaded {} configuration properties", rows.len());
        Ok(rows.into_iter().collect())
    }

    async fn save(&self, cfg: HashMap<String, String>) -> Result<(), ConfigError> {
        let cfg = seal_passwords(&self.registry, &self.cipher, cfg)?;
        let mut tx = self.pool.begin().await?;
        for (k, v) in &cfg {
            sqlx::query(
                "INSERT INTO properties (k, v) VALUES ($1, $2)
                 ON CONFLICT (k) DO UPDATE SET v = EXCLUDED.v",
            )
            .bind(k)
            .bind(v)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("saved {} configuration properties", cfg.len());
        Ok(())
    }
}

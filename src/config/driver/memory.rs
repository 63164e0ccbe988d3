use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{seal_passwords, Driver};
use crate::config::{ConfigError, PasswordCipher, Registry};

/// Keeps configuration in process memory.
#[derive(Default)]
pub struct MemoryDriver {
    data: RwLock<HashMap<String, String>>,
    sealing: Option<(Arc<Registry>, PasswordCipher)>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store password-typed values encrypted, like the database does.
    pub fn with_encryption(registry: Arc<Registry>, cipher: PasswordCipher) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            sealing: Some((registry, cipher)),
        }
    }

    /// The raw stored value, as a database row would hold it.
    pub async fn raw(&self, name: &str) -> Option<String> {
        self.data.read().await.get(name).cloned()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn load(&self) -> Result<HashMap<String, String>, ConfigError> {
        Ok(self.data.read().await.clone())
    }

    async fn save(&self, cfg: HashMap<String, String>) -> Result<(), ConfigError> {
        let cfg = match &self.sealing {
            Some((registry, cipher)) => seal_passwords(registry, cipher, cfg)?,
            None => cfg,
        };
        self.data.write().await.extend(cfg);
        Ok(())
    }
}

//! The trust service: atomic publishes, server-side snapshot/timestamp
//! signing and key management for many GUNs on top of a [`MetaStore`].

pub mod keys;
pub mod snapshot;
pub mod timestamp;
pub mod validation;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::{CryptoError, CryptoService, KeyAlgorithm, KeyStorage, PublicKey};
use crate::storage::{Change, MetaStore, MetaUpdate, StorageError, TufMetaStorage};
use crate::tuf::data::{Signed, VersionOnly};
use crate::tuf::{Gun, RoleName, TufError, MAX_DOWNLOAD_SIZE, MAX_TIMESTAMP_SIZE};

/// Why a publish was rejected. Serialized into error responses as `detail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("bad root: {msg}")]
    BadRoot { msg: String },

    #[error("bad targets: {msg}")]
    BadTargets { msg: String },

    #[error("bad snapshot: {msg}")]
    BadSnapshot { msg: String },

    #[error("bad hierarchy, missing {missing}: {msg}")]
    BadHierarchy { missing: String, msg: String },

    #[error("validation failed: {msg}")]
    Validation { msg: String },

    #[error("old version: {msg}")]
    OldVersion { msg: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("server does not hold a key to sign {role}")]
    NoKey { role: String },

    #[error("no crypto service configured")]
    NoCryptoService,

    #[error("{0} is not a valid role")]
    InvalidRole(String),

    #[error("upload part has no filename")]
    NoFilename,

    #[error("malformed upload: {0}")]
    MalformedUpload(String),

    #[error("{role} is {size} bytes, limit is {limit}")]
    TooLarge { role: String, size: usize, limit: usize },

    #[error("key management: {0}")]
    Crypto(#[from] CryptoError),

    #[error("stored metadata failed validation: {0}")]
    Tuf(#[from] TufError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PublishError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        PublishError::Invalid(ValidationError::Validation { msg: msg.into() })
    }
}

/// One file of a multipart publish.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Handles every TUF operation for all GUNs.
#[derive(Clone)]
pub struct TrustService {
    store: Arc<dyn MetaStore>,
    crypto: Arc<dyn CryptoService>,
    key_storage: Option<Arc<dyn KeyStorage>>,
    key_algorithm: KeyAlgorithm,
}

impl TrustService {
    pub fn new(store: Arc<dyn MetaStore>, crypto: Arc<dyn CryptoService>) -> Self {
        Self {
            store,
            crypto,
            key_storage: None,
            key_algorithm: KeyAlgorithm::Ecdsa,
        }
    }

    /// Persist every server key created from now on.
    pub fn with_key_storage(mut self, storage: Arc<dyn KeyStorage>) -> Self {
        self.key_storage = Some(storage);
        self
    }

    pub fn with_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoService> {
        &self.crypto
    }

    /// Turn multipart parts into versioned updates without validating them.
    pub fn parse_upload(parts: Vec<UploadPart>) -> Result<Vec<MetaUpdate>, PublishError> {
        let mut seen = BTreeSet::new();
        let mut updates = Vec::with_capacity(parts.len());
        for part in parts {
            let name = part.filename.trim_end_matches(".json");
            if name.is_empty() {
                return Err(PublishError::NoFilename);
            }
            let role = RoleName::parse(name).map_err(|_| PublishError::InvalidRole(name.to_string()))?;
            if part.data.len() > MAX_DOWNLOAD_SIZE {
                return Err(PublishError::TooLarge {
                    role: role.to_string(),
                    size: part.data.len(),
                    limit: MAX_DOWNLOAD_SIZE,
                });
            }
            if role == "timestamp" && part.data.len() > MAX_TIMESTAMP_SIZE {
                return Err(PublishError::validation(format!(
                    "timestamp is {} bytes, limit is {}",
                    part.data.len(),
                    MAX_TIMESTAMP_SIZE
                )));
            }
            if !seen.insert(role.clone()) {
                return Err(PublishError::MalformedUpload(format!("{role} uploaded twice")));
            }
            let version = Signed::from_bytes(&part.data)
                .and_then(|env| env.body::<VersionOnly>())
                .map_err(|e| PublishError::MalformedUpload(format!("{role}: {e}")))?
                .version;
            updates.push(MetaUpdate {
                role,
                version,
                data: part.data,
            });
        }
        Ok(updates)
    }

    /// Validate and commit a multipart publish as one atomic write.
    pub async fn atomic_update(&self, gun: &Gun, parts: Vec<UploadPart>) -> Result<(), PublishError> {
        let updates = Self::parse_upload(parts)?;
        let view = TufMetaStorage::new(Arc::clone(&self.store));
        let to_apply = validation::validate_update(&view, Arc::clone(&self.crypto), gun, updates).await?;

        let roles: Vec<String> = to_apply.iter().map(|u| format!("{}@{}", u.role, u.version)).collect();
        self.store.update_many(gun, to_apply).await.map_err(|e| match e {
            StorageError::OldVersion(msg) => PublishError::Invalid(ValidationError::OldVersion { msg }),
            other => PublishError::Storage(other),
        })?;
        info!("published {}: {}", gun, roles.join(", "));
        Ok(())
    }

    /// Current bytes of a role. Timestamp and snapshot are re-signed here
    /// when they have gone stale.
    pub async fn get_current(&self, gun: &Gun, role: &RoleName) -> Result<(DateTime<Utc>, Vec<u8>), PublishError> {
        match role.as_str() {
            "timestamp" => timestamp::get_or_create_timestamp(self.store.as_ref(), gun, Arc::clone(&self.crypto)).await,
            "snapshot" => {
                let (_, ts) =
                    timestamp::get_or_create_timestamp(self.store.as_ref(), gun, Arc::clone(&self.crypto)).await?;
                let checksum = timestamp::snapshot_checksum(&ts)?;
                Ok(self
                    .store
                    .get_checksum(gun, role, &checksum)
                    .await?)
            }
            _ => {
                let view = TufMetaStorage::new(Arc::clone(&self.store));
                Ok(view.get_current(gun, role).await?)
            }
        }
    }

    pub async fn get_checksum(
        &self,
        gun: &Gun,
        role: &RoleName,
        checksum: &str,
    ) -> Result<(DateTime<Utc>, Vec<u8>), PublishError> {
        Ok(self.store.get_checksum(gun, role, checksum).await?)
    }

    pub async fn get_version(
        &self,
        gun: &Gun,
        role: &RoleName,
        version: u64,
    ) -> Result<(DateTime<Utc>, Vec<u8>), PublishError> {
        Ok(self.store.get_version(gun, role, version).await?)
    }

    pub async fn delete(&self, gun: &Gun) -> Result<(), PublishError> {
        self.store.delete(gun).await?;
        info!("deleted all trust data for {}", gun);
        Ok(())
    }

    pub async fn changes(&self, change_id: &str, records: i64, filter_gun: &str) -> Result<Vec<Change>, PublishError> {
        Ok(self.store.get_changes(change_id, records, filter_gun).await?)
    }

    pub async fn get_or_create_key(&self, gun: &Gun, role: &RoleName) -> Result<PublicKey, PublishError> {
        keys::get_or_create_key(self.crypto.as_ref(), self.key_storage.as_deref(), gun, role, self.key_algorithm).await
    }

    pub async fn rotate_key(&self, gun: &Gun, role: &RoleName) -> Result<PublicKey, PublishError> {
        keys::rotate_key(self.crypto.as_ref(), self.key_storage.as_deref(), gun, role, self.key_algorithm).await
    }

    /// Reload persisted server keys into the crypto service. Without key
    /// storage this is a no-op.
    pub async fn restore_keys(&self) -> Result<usize, PublishError> {
        match &self.key_storage {
            Some(storage) => keys::restore_keys(self.crypto.as_ref(), storage.as_ref()).await,
            None => Ok(0),
        }
    }

    pub async fn check_health(&self) -> Result<(), PublishError> {
        Ok(self.store.check_health().await?)
    }
}

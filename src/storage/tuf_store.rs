//! A read-through view that resolves "current" through the published
//! timestamp → snapshot → role checksum chain.
//!
//! Reads through this view only ever see role files that belong to the same
//! published snapshot. Each instance caches files by GUN, role and checksum
//! and is meant to live for one request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Change, MetaStore, MetaUpdate, StorageError};
use crate::tuf::data::{RoleBody, SignedMeta, Snapshot, Timestamp};
use crate::tuf::{Gun, RoleName};

type CacheKey = (Gun, RoleName, String);

pub struct TufMetaStorage {
    inner: Arc<dyn MetaStore>,
    cached: Mutex<HashMap<CacheKey, (DateTime<Utc>, Vec<u8>)>>,
}

impl TufMetaStorage {
    pub fn new(inner: Arc<dyn MetaStore>) -> Self {
        Self {
            inner,
            cached: Mutex::new(HashMap::new()),
        }
    }

    async fn checksum_cached(
        &self,
        gun: &Gun,
        role: &RoleName,
        checksum: &str,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        let key = (gun.clone(), role.clone(), checksum.to_string());
        if let Some(hit) = self.cached.lock().await.get(&key) {
            return Ok(hit.clone());
        }
        let found = self.inner.get_checksum(gun, role, checksum).await?;
        self.cached.lock().await.insert(key, found.clone());
        Ok(found)
    }

    fn parse<T: RoleBody>(role: &RoleName, data: &[u8]) -> Result<T, StorageError> {
        SignedMeta::<T>::from_bytes(role, data)
            .map(|m| m.body)
            .map_err(|e| StorageError::Corrupt(format!("{role}: {e}")))
    }

    fn checksum_from(meta: Option<&crate::tuf::FileMeta>, gun: &Gun, role: &RoleName) -> Result<String, StorageError> {
        meta.and_then(|m| m.sha256_hex())
            .ok_or_else(|| StorageError::NotFound(format!("{gun} {role} is not listed in the published metadata")))
    }
}

#[async_trait]
impl MetaStore for TufMetaStorage {
    async fn update_current(&self, gun: &Gun, update: MetaUpdate) -> Result<(), StorageError> {
        self.inner.update_current(gun, update).await
    }

    async fn update_many(&self, gun: &Gun, updates: Vec<MetaUpdate>) -> Result<(), StorageError> {
        self.inner.update_many(gun, updates).await
    }

    async fn get_current(&self, gun: &Gun, role: &RoleName) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        let timestamp_role = RoleName::timestamp();
        let (ts_modified, ts_data) = self.inner.get_current(gun, &timestamp_role).await?;
        if role == &timestamp_role {
            return Ok((ts_modified, ts_data));
        }

        let timestamp: Timestamp = Self::parse(&timestamp_role, &ts_data)?;
        let snapshot_role = RoleName::snapshot();
        let snapshot_sum = Self::checksum_from(timestamp.meta.get("snapshot"), gun, &snapshot_role)?;
        let (snap_modified, snap_data) = self.checksum_cached(gun, &snapshot_role, &snapshot_sum).await?;
        if role == &snapshot_role {
            return Ok((snap_modified, snap_data));
        }

        let snapshot: Snapshot = Self::parse(&snapshot_role, &snap_data)?;
        let role_sum = Self::checksum_from(snapshot.meta.get(role.as_str()), gun, role)?;
        self.checksum_cached(gun, role, &role_sum).await
    }

    async fn get_checksum(
        &self,
        gun: &Gun,
        role: &RoleName,
        checksum: &str,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        self.checksum_cached(gun, role, checksum).await
    }

    async fn get_version(
        &self,
        gun: &Gun,
        role: &RoleName,
        version: u64,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        self.inner.get_version(gun, role, version).await
    }

    async fn delete(&self, gun: &Gun) -> Result<(), StorageError> {
        self.cached.lock().await.retain(|(cached_gun, _, _), _| cached_gun != gun);
        self.inner.delete(gun).await
    }

    async fn get_changes(
        &self,
        change_id: &str,
        records: i64,
        filter_gun: &str,
    ) -> Result<Vec<Change>, StorageError> {
        self.inner.get_changes(change_id, records, filter_gun).await
    }

    async fn check_health(&self) -> Result<(), StorageError> {
        self.inner.check_health().await
    }
}

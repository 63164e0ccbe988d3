//! Serving the timestamp, re-signing it when it is missing, expired or no
//! longer points at the current snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::snapshot::get_or_create_snapshot;
use super::PublishError;
use crate::crypto::CryptoService;
use crate::storage::{MetaStore, MetaUpdate, StorageError};
use crate::tuf::data::Timestamp;
use crate::tuf::{Gun, RepoBuilder, RoleName, SignedMeta, TufError};

/// Hex sha256 of the snapshot a timestamp points at.
pub fn snapshot_checksum(timestamp: &[u8]) -> Result<String, PublishError> {
    let meta = SignedMeta::<Timestamp>::from_bytes(&RoleName::timestamp(), timestamp)?;
    meta.body
        .snapshot_meta()?
        .sha256_hex()
        .ok_or_else(|| TufError::MissingMeta { role: "snapshot".into() }.into())
}

pub async fn get_or_create_timestamp(
    store: &dyn MetaStore,
    gun: &Gun,
    crypto: Arc<dyn CryptoService>,
) -> Result<(DateTime<Utc>, Vec<u8>), PublishError> {
    let role = RoleName::timestamp();
    let stored = match store.get_current(gun, &role).await {
        Ok(found) => Some(found),
        Err(StorageError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let prev = stored.as_ref().and_then(|(_, data)| {
        SignedMeta::<Timestamp>::from_bytes(&role, data)
            .map_err(|e| warn!("{}: stored timestamp is unreadable, re-signing: {}", gun, e))
            .ok()
    });

    let pinned = prev
        .as_ref()
        .and_then(|p| p.body.snapshot_meta().ok())
        .and_then(|m| m.sha256_hex());
    let (_, snapshot) = get_or_create_snapshot(store, gun, pinned.as_deref(), Arc::clone(&crypto)).await?;

    if let (Some((modified, data)), Some(prev)) = (&stored, &prev) {
        let fresh = prev.body.expires > Utc::now();
        let current = prev
            .body
            .snapshot_meta()
            .map(|m| m.check(&RoleName::snapshot(), &snapshot).is_ok())
            .unwrap_or(false);
        if fresh && current {
            return Ok((*modified, data.clone()));
        }
        debug!("{}: timestamp is stale (fresh: {}, current: {})", gun, fresh, current);
    }

    let mut builder = RepoBuilder::new(gun.clone(), Some(crypto));
    let (_, root) = store.get_current(gun, &RoleName::root()).await?;
    builder.load(&RoleName::root(), &root, 1, true)?;
    builder.load(&RoleName::snapshot(), &snapshot, 1, true)?;
    let (data, version) = builder.generate_timestamp(prev.as_ref()).map_err(|e| match e {
        TufError::InsufficientSignatures { .. } | TufError::NoKeys { .. } => PublishError::NoKey {
            role: role.to_string(),
        },
        other => PublishError::Tuf(other),
    })?;

    match store
        .update_current(
            gun,
            MetaUpdate {
                role: role.clone(),
                version,
                data: data.clone(),
            },
        )
        .await
    {
        Ok(()) => {
            info!("{}: signed timestamp version {}", gun, version);
            Ok((Utc::now(), data))
        }
        Err(StorageError::OldVersion(_)) => {
            debug!("{}: timestamp advanced concurrently, serving the stored one", gun);
            Ok(store.get_current(gun, &role).await?)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MemoryCryptoService;
    use crate::server::{TrustService, UploadPart};
    use crate::storage::MemStorage;
    use crate::tuf::testutils::RepoFixture;
    use chrono::Duration;

    async fn published(server_snapshot: bool) -> (Arc<MemStorage>, Arc<dyn CryptoService>, RepoFixture) {
        let store = Arc::new(MemStorage::new());
        let crypto: Arc<dyn CryptoService> = Arc::new(MemoryCryptoService::new());
        let fx = RepoFixture::with_server("gun", crypto.clone(), server_snapshot).unwrap();
        let svc = TrustService::new(store.clone(), crypto.clone());
        let parts = fx
            .upload_parts()
            .unwrap()
            .into_iter()
            .map(|(filename, data)| UploadPart { filename, data })
            .collect();
        svc.atomic_update(&fx.gun, parts).await.unwrap();
        (store, crypto, fx)
    }

    #[tokio::test]
    async fn fresh_timestamp_is_served_as_stored() {
        let (store, crypto, fx) = published(true).await;
        let (_, stored) = store.get_current(&fx.gun, &RoleName::timestamp()).await.unwrap();
        let (_, served) = get_or_create_timestamp(store.as_ref(), &fx.gun, crypto).await.unwrap();
        assert_eq!(stored, served);
    }

    #[tokio::test]
    async fn expired_timestamp_is_resigned() {
        let (store, crypto, fx) = published(true).await;

        // store an already expired timestamp as the newest version
        let (_, snapshot) = store.get_current(&fx.gun, &RoleName::snapshot()).await.unwrap();
        let (_, root) = store.get_current(&fx.gun, &RoleName::root()).await.unwrap();
        let mut expired = Timestamp::new(crate::tuf::FileMeta::from_bytes(&snapshot), Utc::now() - Duration::hours(1));
        expired.version = 2;
        let mut env = crate::tuf::Signed::new_unsigned(&expired).unwrap();
        let base = SignedMeta::<crate::tuf::Root>::from_bytes(&RoleName::root(), &root)
            .unwrap()
            .body
            .base_role(&RoleName::timestamp())
            .unwrap();
        crate::tuf::signed::sign(crypto.as_ref(), &mut env, &base).unwrap();
        store
            .update_current(
                &fx.gun,
                MetaUpdate {
                    role: RoleName::timestamp(),
                    version: 2,
                    data: env.to_bytes().unwrap(),
                },
            )
            .await
            .unwrap();

        let (_, served) = get_or_create_timestamp(store.as_ref(), &fx.gun, crypto).await.unwrap();
        let served = SignedMeta::<Timestamp>::from_bytes(&RoleName::timestamp(), &served).unwrap();
        assert_eq!(served.body.version, 3);
        assert!(served.body.expires > Utc::now());
    }

    #[tokio::test]
    async fn missing_timestamp_key_is_reported() {
        let (store, _, fx) = published(true).await;
        let (_, ts) = store.get_current(&fx.gun, &RoleName::timestamp()).await.unwrap();
        // a store without keys cannot re-sign, but a fresh timestamp is still served
        let empty: Arc<dyn CryptoService> = Arc::new(MemoryCryptoService::new());
        let (_, served) = get_or_create_timestamp(store.as_ref(), &fx.gun, empty.clone()).await.unwrap();
        assert_eq!(served, ts);

        let other = Gun::from("unpublished");
        assert!(matches!(
            get_or_create_timestamp(store.as_ref(), &other, empty).await,
            Err(PublishError::Storage(StorageError::NotFound(_)))
        ));
    }
}

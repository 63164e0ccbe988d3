use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::PublishError;
use crate::crypto::CryptoService;
use crate::storage::{MetaStore, MetaUpdate, StorageError};
use crate::tuf::data::Snapshot;
use crate::tuf::{Gun, RepoBuilder, RoleName, SignedMeta, TufError};

/// The snapshot a timestamp should point at: the one pinned by `checksum`
/// (or the newest stored one), re-signed when it has expired or no longer
/// covers the current root and the server holds the snapshot key.
pub async fn get_or_create_snapshot(
    store: &dyn MetaStore,
    gun: &Gun,
    checksum: Option<&str>,
    crypto: Arc<dyn CryptoService>,
) -> Result<(DateTime<Utc>, Vec<u8>), PublishError> {
    let role = RoleName::snapshot();
    let stored = match checksum {
        Some(sum) => match store.get_checksum(gun, &role, sum).await {
            Ok(found) => found,
            // the pinned snapshot is gone; fall back to the newest one
            Err(StorageError::NotFound(_)) => store.get_current(gun, &role).await?,
            Err(e) => return Err(e.into()),
        },
        None => store.get_current(gun, &role).await?,
    };
    let (modified, data) = stored;

    let prev = SignedMeta::<Snapshot>::from_bytes(&role, &data)?;
    let (_, root) = store.get_current(gun, &RoleName::root()).await?;
    let fresh = prev.body.expires > Utc::now();
    let covers_root = prev
        .body
        .meta
        .get("root")
        .map(|m| m.check(&RoleName::root(), &root).is_ok())
        .unwrap_or(false);
    if fresh && covers_root {
        return Ok((modified, data));
    }

    let mut builder = RepoBuilder::new(gun.clone(), Some(crypto));
    builder.load(&RoleName::root(), &root, 1, true)?;
    let (new_data, version) = match builder.generate_snapshot(Some(&prev)) {
        Ok(generated) => generated,
        Err(TufError::InsufficientSignatures { .. }) | Err(TufError::NoKeys { .. }) => {
            debug!("{}: snapshot is stale but its key is not held by the server", gun);
            return Ok((modified, data));
        }
        Err(e) => return Err(e.into()),
    };

    match store
        .update_current(
            gun,
            MetaUpdate {
                role: role.clone(),
                version,
                data: new_data.clone(),
            },
        )
        .await
    {
        Ok(()) => {
            info!("{}: re-signed snapshot version {}", gun, version);
            Ok((Utc::now(), new_data))
        }
        Err(StorageError::OldVersion(_)) => Ok(store.get_current(gun, &role).await?),
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
    use crate::server::timestamp::{get_or_create_timestamp, snapshot_checksum};
    use sha2::{Digest, Sha256};

    async fn published(server_snapshot: bool) -> (Arc<MemStorage>, Arc<dyn CryptoService>, RepoFixture) {
        let store = Arc::new(MemStorage::new());
        let crypto: Arc<dyn CryptoService> = Arc::new(MemoryCryptoService::new());
        let fx = RepoFixture::with_server("gun", crypto.clone(), server_snapshot).unwrap();
        let parts = fx
            .upload_parts()
            .unwrap()
            .into_iter()
            .map(|(filename, data)| UploadPart { filename, data })
            .collect();
        TrustService::new(store.clone(), crypto.clone())
            .atomic_update(&fx.gun, parts)
            .await
            .unwrap();
        (store, crypto, fx)
    }

    /// Write a new root straight into storage, bypassing the publish path.
    async fn replace_root(store: &MemStorage, fx: &mut RepoFixture) {
        fx.bump(&RoleName::root());
        let root = fx.sign_role(&RoleName::root()).unwrap();
        store
            .update_current(
                &fx.gun,
                MetaUpdate {
                    role: RoleName::root(),
                    version: fx.root.version,
                    data: root,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn current_snapshot_is_returned_untouched() {
        let (store, crypto, fx) = published(true).await;
        let (_, stored) = store.get_current(&fx.gun, &RoleName::snapshot()).await.unwrap();
        let (_, served) = get_or_create_snapshot(store.as_ref(), &fx.gun, None, crypto).await.unwrap();
        assert_eq!(stored, served);
    }

    #[tokio::test]
    async fn snapshot_is_resigned_when_root_changes() {
        let (store, crypto, mut fx) = published(true).await;
        replace_root(&store, &mut fx).await;

        let (_, served) = get_or_create_snapshot(store.as_ref(), &fx.gun, None, crypto.clone())
            .await
            .unwrap();
        let snapshot = SignedMeta::<Snapshot>::from_bytes(&RoleName::snapshot(), &served).unwrap();
        assert_eq!(snapshot.body.version, 2);
        let (_, root) = store.get_current(&fx.gun, &RoleName::root()).await.unwrap();
        assert!(snapshot.body.meta["root"].check(&RoleName::root(), &root).is_ok());

        // the timestamp follows the new snapshot
        let (_, ts) = get_or_create_timestamp(store.as_ref(), &fx.gun, crypto)
            .await
            .unwrap();
        let pinned = snapshot_checksum(&ts).unwrap();
        assert_eq!(pinned, hex::encode(Sha256::digest(&served)));
    }

    #[tokio::test]
    async fn client_held_snapshot_is_served_stale() {
        let (store, crypto, mut fx) = published(false).await;
        let (_, before) = store.get_current(&fx.gun, &RoleName::snapshot()).await.unwrap();
        replace_root(&store, &mut fx).await;
        let (_, served) = get_or_create_snapshot(store.as_ref(), &fx.gun, None, crypto).await.unwrap();
        assert_eq!(before, served);
    }
}

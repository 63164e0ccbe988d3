//! Server-held keys for the timestamp and snapshot roles.

use tracing::info;

use super::PublishError;
use crate::crypto::{CryptoError, CryptoService, KeyAlgorithm, KeyStorage, PublicKey};
use crate::tuf::{Gun, RoleName};

fn server_role(role: &RoleName) -> Result<(), PublishError> {
    match role.as_str() {
        "timestamp" | "snapshot" => Ok(()),
        other => Err(PublishError::InvalidRole(other.to_string())),
    }
}

fn current_key(crypto: &dyn CryptoService, gun: &Gun, role: &RoleName) -> Result<Option<PublicKey>, PublishError> {
    match crypto.list_keys(gun, role).last() {
        Some(id) => crypto
            .get_key(id)
            .map(Some)
            .ok_or_else(|| PublishError::Crypto(CryptoError::KeyNotFound(id.clone()))),
        None => Ok(None),
    }
}

/// Create a key and write it through to `storage`. A key that could not be
/// persisted is dropped again so it never signs anything.
async fn create_key(
    crypto: &dyn CryptoService,
    storage: Option<&dyn KeyStorage>,
    gun: &Gun,
    role: &RoleName,
    algorithm: KeyAlgorithm,
) -> Result<PublicKey, PublishError> {
    let public = crypto.create(gun, role, algorithm)?;
    let Some(storage) = storage else {
        return Ok(public);
    };
    let id = public.id();
    let (private, _) = crypto
        .get_private_key(&id)
        .ok_or_else(|| PublishError::Crypto(CryptoError::KeyNotFound(id.clone())))?;
    if let Err(e) = storage.save(gun, role, &private).await {
        crypto.remove_key(&id)?;
        return Err(e.into());
    }
    Ok(public)
}

/// The newest key the server holds for `role`, creating one if there is none.
pub async fn get_or_create_key(
    crypto: &dyn CryptoService,
    storage: Option<&dyn KeyStorage>,
    gun: &Gun,
    role: &RoleName,
    algorithm: KeyAlgorithm,
) -> Result<PublicKey, PublishError> {
    server_role(role)?;
    if let Some(key) = current_key(crypto, gun, role)? {
        return Ok(key);
    }
    let key = create_key(crypto, storage, gun, role, algorithm).await?;
    info!("{}: created {} key {}", gun, role, key.id());
    Ok(key)
}

/// Always create a new key. Older keys stay until a root that no longer
/// lists them has been published.
pub async fn rotate_key(
    crypto: &dyn CryptoService,
    storage: Option<&dyn KeyStorage>,
    gun: &Gun,
    role: &RoleName,
    algorithm: KeyAlgorithm,
) -> Result<PublicKey, PublishError> {
    server_role(role)?;
    let key = create_key(crypto, storage, gun, role, algorithm).await?;
    info!("{}: rotated {} key, new key {}", gun, role, key.id());
    Ok(key)
}

/// Load every persisted key into `crypto`, oldest first, so the newest key
/// of each role is current again. Returns how many keys were loaded.
pub async fn restore_keys(crypto: &dyn CryptoService, storage: &dyn KeyStorage) -> Result<usize, PublishError> {
    let stored = storage.load().await?;
    let count = stored.len();
    for entry in stored {
        crypto.add_key(&entry.gun, &entry.role, entry.key)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PasswordCipher, StaticKeyProvider};
    use crate::crypto::{MemoryCryptoService, MemoryKeyStorage};
    use std::sync::Arc;

    fn storage() -> MemoryKeyStorage {
        MemoryKeyStorage::new(PasswordCipher::new(Arc::new(StaticKeyProvider(b"0123456789abcdef".to_vec()))))
    }

    #[tokio::test]
    async fn key_is_created_once() {
        let crypto = MemoryCryptoService::new();
        let gun = Gun::from("gun");
        let first = get_or_create_key(&crypto, None, &gun, &RoleName::timestamp(), KeyAlgorithm::Ecdsa)
            .await
            .unwrap();
        let again = get_or_create_key(&crypto, None, &gun, &RoleName::timestamp(), KeyAlgorithm::Ecdsa)
            .await
            .unwrap();
        assert_eq!(first.id(), again.id());
        assert_eq!(first.keytype, KeyAlgorithm::Ecdsa);
    }

    #[tokio::test]
    async fn rotation_makes_the_new_key_current() {
        let crypto = MemoryCryptoService::new();
        let gun = Gun::from("gun");
        let role = RoleName::snapshot();
        let old = get_or_create_key(&crypto, None, &gun, &role, KeyAlgorithm::Ed25519).await.unwrap();
        let new = rotate_key(&crypto, None, &gun, &role, KeyAlgorithm::Ed25519).await.unwrap();
        assert_ne!(old.id(), new.id());
        let current = get_or_create_key(&crypto, None, &gun, &role, KeyAlgorithm::Ed25519).await.unwrap();
        assert_eq!(current.id(), new.id());
        assert_eq!(crypto.list_keys(&gun, &role).len(), 2);
    }

    #[tokio::test]
    async fn only_server_roles_have_keys() {
        let crypto = MemoryCryptoService::new();
        let gun = Gun::from("gun");
        for role in [RoleName::root(), RoleName::targets()] {
            assert!(matches!(
                get_or_create_key(&crypto, None, &gun, &role, KeyAlgorithm::Ecdsa).await,
                Err(PublishError::InvalidRole(_))
            ));
            assert!(matches!(
                rotate_key(&crypto, None, &gun, &role, KeyAlgorithm::Ecdsa).await,
                Err(PublishError::InvalidRole(_))
            ));
        }
    }

    #[tokio::test]
    async fn restored_keys_keep_rotation_order() {
        let store = storage();
        let gun = Gun::from("gun");
        let role = RoleName::timestamp();
        let before = MemoryCryptoService::new();
        get_or_create_key(&before, Some(&store), &gun, &role, KeyAlgorithm::Ecdsa).await.unwrap();
        let rotated = rotate_key(&before, Some(&store), &gun, &role, KeyAlgorithm::Ed25519).await.unwrap();

        let after = MemoryCryptoService::new();
        assert_eq!(restore_keys(&after, &store).await.unwrap(), 2);
        assert_eq!(after.list_keys(&gun, &role), before.list_keys(&gun, &role));
        let current = get_or_create_key(&after, Some(&store), &gun, &role, KeyAlgorithm::Ecdsa).await.unwrap();
        assert_eq!(current.id(), rotated.id());
        assert!(after.get_private_key(&rotated.id()).is_some());
    }
}

//! Validation of a multipart publish against what is already stored.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use super::{PublishError, ValidationError};
use crate::crypto::CryptoService;
use crate::storage::{MetaStore, MetaUpdate, StorageError};
use crate::tuf::data::{Snapshot, Timestamp};
use crate::tuf::{Gun, RepoBuilder, RoleName, SignedMeta, TufError};

/// Validate `updates` for `gun` and return the full set of files to commit,
/// including a generated snapshot (if the client sent none) and a freshly
/// signed timestamp.
pub async fn validate_update(
    store: &dyn MetaStore,
    crypto: Arc<dyn CryptoService>,
    gun: &Gun,
    updates: Vec<MetaUpdate>,
) -> Result<Vec<MetaUpdate>, PublishError> {
    let mut roles: BTreeMap<RoleName, MetaUpdate> = updates.into_iter().map(|u| (u.role.clone(), u)).collect();
    let mut builder = RepoBuilder::new(gun.clone(), Some(crypto));
    let mut to_apply = Vec::with_capacity(roles.len() + 2);

    let root = RoleName::root();
    load_from_store(store, gun, &root, &mut builder).await?;

    if let Some(update) = roles.remove(&root) {
        let current = builder.loaded_version(&root);
        if update.version != current && update.version != current + 1 {
            return Err(ValidationError::BadRoot {
                msg: format!(
                    "root modifications must increment the version; current {current}, new {}",
                    update.version
                ),
            }
            .into());
        }
        builder = builder.bootstrap_new_builder();
        builder
            .load(&root, &update.data, current, false)
            .map_err(|e| ValidationError::BadRoot { msg: e.to_string() })?;
        to_apply.push(update);
    } else if !builder.is_loaded(&root) {
        return Err(PublishError::validation(
            "no pre-existing root and no root provided in update",
        ));
    }

    to_apply.extend(load_and_validate_targets(store, gun, &mut builder, &mut roles).await?);

    let snapshot = RoleName::snapshot();
    match roles.remove(&snapshot) {
        Some(update) => {
            builder
                .load(&snapshot, &update.data, 1, false)
                .map_err(|e| ValidationError::BadSnapshot { msg: e.to_string() })?;
            to_apply.push(update);
        }
        None => to_apply.push(generate_snapshot(store, gun, &mut builder).await?),
    }

    if roles.remove(&RoleName::timestamp()).is_some() {
        debug!("{}: ignoring client timestamp, the server always signs its own", gun);
    }
    to_apply.push(generate_timestamp(store, gun, &mut builder).await?);
    Ok(to_apply)
}

/// Load a role from storage into the builder. A missing role is not an error.
async fn load_from_store(
    store: &dyn MetaStore,
    gun: &Gun,
    role: &RoleName,
    builder: &mut RepoBuilder,
) -> Result<(), PublishError> {
    match store.get_current(gun, role).await {
        Ok((_, data)) => builder.load(role, &data, 1, true).map_err(|e| {
            error!("{}: stored {} failed validation: {}", gun, role, e);
            PublishError::Tuf(e)
        }),
        Err(StorageError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load uploaded targets roles parents first, pulling any ancestor that was
/// not uploaded from storage.
async fn load_and_validate_targets(
    store: &dyn MetaStore,
    gun: &Gun,
    builder: &mut RepoBuilder,
    roles: &mut BTreeMap<RoleName, MetaUpdate>,
) -> Result<Vec<MetaUpdate>, PublishError> {
    let mut targets: Vec<RoleName> = roles.keys().filter(|r| r.is_targets_like()).cloned().collect();
    targets.sort_by(|a, b| (a.depth(), a).cmp(&(b.depth(), b)));

    let mut applied = Vec::with_capacity(targets.len());
    for role in targets {
        let Some(update) = roles.remove(&role) else { continue };

        let mut ancestors = Vec::new();
        let mut parent = role.parent();
        while let Some(p) = parent {
            parent = p.parent();
            ancestors.push(p);
        }
        for ancestor in ancestors.into_iter().rev() {
            if !builder.is_loaded(&ancestor) {
                load_from_store(store, gun, &ancestor, builder).await?;
            }
        }

        builder
            .load(&role, &update.data, 1, false)
            .map_err(|e| ValidationError::BadTargets { msg: e.to_string() })?;
        applied.push(update);
    }
    Ok(applied)
}

async fn generate_snapshot(
    store: &dyn MetaStore,
    gun: &Gun,
    builder: &mut RepoBuilder,
) -> Result<MetaUpdate, PublishError> {
    let role = RoleName::snapshot();
    let prev = match store.get_current(gun, &role).await {
        Ok((_, data)) => Some(SignedMeta::<Snapshot>::from_bytes(&role, &data).map_err(|e| {
            error!("{}: previous snapshot is unreadable: {}", gun, e);
            PublishError::validation(e.to_string())
        })?),
        Err(StorageError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    match builder.generate_snapshot(prev.as_ref()) {
        Ok((data, version)) => Ok(MetaUpdate { role, version, data }),
        Err(TufError::InsufficientSignatures { .. }) | Err(TufError::NoKeys { .. }) => {
            Err(ValidationError::BadHierarchy {
                missing: role.to_string(),
                msg: "no snapshot was included in update and server does not hold current snapshot key for repository"
                    .into(),
            }
            .into())
        }
        Err(TufError::NoCryptoService(_)) => Err(PublishError::NoCryptoService),
        Err(e) => Err(PublishError::validation(e.to_string())),
    }
}

async fn generate_timestamp(
    store: &dyn MetaStore,
    gun: &Gun,
    builder: &mut RepoBuilder,
) -> Result<MetaUpdate, PublishError> {
    let role = RoleName::timestamp();
    let prev = match store.get_current(gun, &role).await {
        Ok((_, data)) => SignedMeta::<Timestamp>::from_bytes(&role, &data)
            .map_err(|e| error!("{}: previous timestamp is unreadable, starting over: {}", gun, e))
            .ok(),
        Err(StorageError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    match builder.generate_timestamp(prev.as_ref()) {
        Ok((data, version)) => Ok(MetaUpdate { role, version, data }),
        Err(TufError::InsufficientSignatures { .. }) | Err(TufError::NoKeys { .. }) => {
            Err(PublishError::NoKey { role: role.to_string() })
        }
        Err(TufError::NoCryptoService(_)) => Err(PublishError::NoCryptoService),
        Err(e) => Err(PublishError::validation(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MemoryCryptoService;
    use crate::storage::{MemStorage, TufMetaStorage};
    use crate::tuf::testutils::RepoFixture;
    use crate::tuf::Targets;

    fn as_updates(fx: &RepoFixture, files: Vec<(String, Vec<u8>)>) -> Vec<MetaUpdate> {
        files
            .into_iter()
            .map(|(name, data)| {
                let role = RoleName::parse(name.trim_end_matches(".json")).unwrap();
                let version = match role.as_str() {
                    "root" => fx.root.version,
                    "snapshot" => fx.snapshot.version,
                    "timestamp" => fx.timestamp.version,
                    _ => fx.targets[&role].version,
                };
                MetaUpdate { role, version, data }
            })
            .collect()
    }

    async fn publish(store: &Arc<MemStorage>, crypto: Arc<dyn CryptoService>, fx: &RepoFixture, files: Vec<(String, Vec<u8>)>) -> Result<(), PublishError> {
        let view = TufMetaStorage::new(store.clone());
        let updates = validate_update(&view, crypto, &fx.gun, as_updates(fx, files)).await?;
        store.update_many(&fx.gun, updates).await?;
        Ok(())
    }

    fn setup(server_snapshot: bool) -> (Arc<MemStorage>, Arc<dyn CryptoService>, RepoFixture) {
        let crypto: Arc<dyn CryptoService> = Arc::new(MemoryCryptoService::new());
        let fx = RepoFixture::with_server("docker.io/library/alpine", crypto.clone(), server_snapshot).unwrap();
        (Arc::new(MemStorage::new()), crypto, fx)
    }

    #[tokio::test]
    async fn first_publish_needs_a_root() {
        let (store, crypto, fx) = setup(true);
        let err = publish(&store, crypto, &fx, fx.upload_parts_for(&["targets"]).unwrap())
            .await
            .unwrap_err();
        assert!(
            matches!(err, PublishError::Invalid(ValidationError::Validation { ref msg }) if msg.contains("no pre-existing root")),
            "{err}"
        );
    }

    #[tokio::test]
    async fn missing_snapshot_without_server_key_is_a_bad_hierarchy() {
        let (store, crypto, fx) = setup(false);
        let err = publish(&store, crypto, &fx, fx.upload_parts_for(&["root", "targets"]).unwrap())
            .await
            .unwrap_err();
        assert!(
            matches!(err, PublishError::Invalid(ValidationError::BadHierarchy { ref missing, .. }) if missing == "snapshot"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn client_snapshot_is_accepted_and_timestamp_generated() {
        let (store, crypto, fx) = setup(false);
        publish(&store, crypto, &fx, fx.upload_parts().unwrap()).await.unwrap();
        let (_, ts) = store.get_current(&fx.gun, &RoleName::timestamp()).await.unwrap();
        let ts = SignedMeta::<Timestamp>::from_bytes(&RoleName::timestamp(), &ts).unwrap();
        let (_, snapshot) = store.get_current(&fx.gun, &RoleName::snapshot()).await.unwrap();
        assert!(ts.body.snapshot_meta().unwrap().check(&RoleName::snapshot(), &snapshot).is_ok());
    }

    #[tokio::test]
    async fn root_rotation() {
        let (store, crypto, mut fx) = setup(true);
        publish(&store, crypto.clone(), &fx, fx.upload_parts().unwrap()).await.unwrap();

        fx.rotate_root_key().unwrap();
        let only_new = fx.sign_root_without_old_keys().unwrap();
        let err = publish(&store, crypto.clone(), &fx, vec![("root.json".into(), only_new)])
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Invalid(ValidationError::BadRoot { .. })), "{err}");

        let both = fx.sign_role(&RoleName::root()).unwrap();
        publish(&store, crypto.clone(), &fx, vec![("root.json".into(), both)]).await.unwrap();

        // the generated snapshot covers the new root
        let view = TufMetaStorage::new(store.clone());
        let (_, root) = view.get_current(&fx.gun, &RoleName::root()).await.unwrap();
        let (_, snapshot) = view.get_current(&fx.gun, &RoleName::snapshot()).await.unwrap();
        let snapshot = SignedMeta::<Snapshot>::from_bytes(&RoleName::snapshot(), &snapshot).unwrap();
        assert!(snapshot.body.meta["root"].check(&RoleName::root(), &root).is_ok());
        assert_eq!(snapshot.body.version, 2);
    }

    #[tokio::test]
    async fn rotated_root_signed_only_by_old_keys_is_a_bad_root() {
        let (store, crypto, mut fx) = setup(true);
        publish(&store, crypto.clone(), &fx, fx.upload_parts().unwrap()).await.unwrap();

        fx.rotate_root_key().unwrap();
        let only_old = fx.sign_root_with_old_keys_only().unwrap();
        let err = publish(&store, crypto, &fx, vec![("root.json".into(), only_old)])
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Invalid(ValidationError::BadRoot { .. })), "{err}");

        let view = TufMetaStorage::new(store.clone());
        let (_, root) = view.get_current(&fx.gun, &RoleName::root()).await.unwrap();
        let root = SignedMeta::<crate::tuf::Root>::from_bytes(&RoleName::root(), &root).unwrap();
        assert_eq!(root.body.version, 1);
    }

    #[tokio::test]
    async fn root_version_must_not_jump() {
        let (store, crypto, mut fx) = setup(true);
        publish(&store, crypto.clone(), &fx, fx.upload_parts().unwrap()).await.unwrap();
        fx.bump(&RoleName::root());
        fx.bump(&RoleName::root());
        let v3 = fx.sign_role(&RoleName::root()).unwrap();
        let err = publish(&store, crypto, &fx, vec![("root.json".into(), v3)]).await.unwrap_err();
        assert!(matches!(err, PublishError::Invalid(ValidationError::BadRoot { .. })), "{err}");
    }

    #[tokio::test]
    async fn delegation_published_after_parent() {
        let (store, crypto, mut fx) = setup(true);
        publish(&store, crypto.clone(), &fx, fx.upload_parts().unwrap()).await.unwrap();

        fx.add_delegation("targets", "targets/releases", &["releases/"]).unwrap();
        fx.bump(&RoleName::targets());
        fx.add_target("targets/releases", "releases/v1.tar", b"v1").unwrap();
        publish(
            &store,
            crypto.clone(),
            &fx,
            fx.upload_parts_for(&["targets", "targets/releases"]).unwrap(),
        )
        .await
        .unwrap();

        // the delegation alone, parent pulled from storage
        let releases = RoleName::parse("targets/releases").unwrap();
        fx.bump(&releases);
        fx.add_target("targets/releases", "releases/v2.tar", b"v2").unwrap();
        publish(&store, crypto.clone(), &fx, fx.upload_parts_for(&["targets/releases"]).unwrap())
            .await
            .unwrap();

        let view = TufMetaStorage::new(store.clone());
        let (_, data) = view.get_current(&fx.gun, &releases).await.unwrap();
        let body = SignedMeta::<Targets>::from_bytes(&releases, &data).unwrap().body;
        assert_eq!(body.version, 2);
        assert!(body.targets.contains_key("releases/v2.tar"));
    }

    #[tokio::test]
    async fn delegation_outside_parent_paths_is_bad_targets() {
        let (store, crypto, mut fx) = setup(true);
        fx.add_delegation("targets", "targets/a", &["ok/"]).unwrap();
        fx.add_delegation("targets/a", "targets/a/b", &["bad/"]).unwrap();
        let err = publish(&store, crypto, &fx, fx.upload_parts().unwrap()).await.unwrap_err();
        assert!(matches!(err, PublishError::Invalid(ValidationError::BadTargets { .. })), "{err}");
        assert!(store.get_current(&fx.gun, &RoleName::root()).await.is_err());
    }
}

//! In-process [`MetaStore`], used for development mode and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{db_version, Change, ChangeCategory, ChangeQuery, MetaStore, MetaUpdate, StorageError};
use crate::tuf::data::TIMESTAMP;
use crate::tuf::{Gun, RoleName};

#[derive(Debug, Clone)]
struct StoredFile {
    version: u64,
    data: Vec<u8>,
    sha256: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<(Gun, RoleName), Vec<StoredFile>>,
    changes: Vec<Change>,
}

impl Inner {
    fn has_version_at_least(&self, gun: &Gun, role: &RoleName, version: u64) -> bool {
        self.files
            .get(&(gun.clone(), role.clone()))
            .map_or(false, |files| files.iter().any(|f| f.version >= version))
    }

    fn insert(&mut self, gun: &Gun, update: MetaUpdate) {
        let now = Utc::now();
        let sha256 = update.sha256();
        if update.role == TIMESTAMP {
            let id = self.changes.len() as i64 + 1;
            self.changes.push(Change {
                id,
                created_at: now,
                gun: gun.to_string(),
                version: db_version(update.version),
                sha256: sha256.clone(),
                category: ChangeCategory::Update,
            });
        }
        self.files
            .entry((gun.clone(), update.role))
            .or_default()
            .push(StoredFile {
                version: update.version,
                data: update.data,
                sha256,
                created_at: now,
            });
    }

    fn find<F>(&self, gun: &Gun, role: &RoleName, pick: F) -> Result<(DateTime<Utc>, Vec<u8>), StorageError>
    where
        F: Fn(&[StoredFile]) -> Option<&StoredFile>,
    {
        self.files
            .get(&(gun.clone(), role.clone()))
            .and_then(|files| pick(files))
            .map(|f| (f.created_at, f.data.clone()))
            .ok_or_else(|| StorageError::NotFound(format!("{gun} {role}")))
    }
}

#[derive(Default)]
pub struct MemStorage {
    inner: Mutex<Inner>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn old_version(gun: &Gun, role: &RoleName, version: u64) -> StorageError {
    StorageError::OldVersion(format!("{gun} {role} version {version} is not newer than the stored version"))
}

#[async_trait]
impl MetaStore for MemStorage {
    async fn update_current(&self, gun: &Gun, update: MetaUpdate) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.has_version_at_least(gun, &update.role, update.version) {
            return Err(old_version(gun, &update.role, update.version));
        }
        inner.insert(gun, update);
        Ok(())
    }

    async fn update_many(&self, gun: &Gun, mut updates: Vec<MetaUpdate>) -> Result<(), StorageError> {
        updates.sort_by(|a, b| (&a.role, a.version).cmp(&(&b.role, b.version)));
        let mut inner = self.inner.lock().await;

        for (i, update) in updates.iter().enumerate() {
            let duplicate = updates[..i]
                .iter()
                .any(|u| u.role == update.role && u.version >= update.version);
            if duplicate || inner.has_version_at_least(gun, &update.role, update.version) {
                return Err(old_version(gun, &update.role, update.version));
            }
        }
        for update in updates {
            inner.insert(gun, update);
        }
        Ok(())
    }

    async fn get_current(&self, gun: &Gun, role: &RoleName) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        let inner = self.inner.lock().await;
        inner.find(gun, role, |files| files.iter().max_by_key(|f| f.version))
    }

    async fn get_checksum(
        &self,
        gun: &Gun,
        role: &RoleName,
        checksum: &str,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        let inner = self.inner.lock().await;
        inner.find(gun, role, |files| files.iter().find(|f| f.sha256 == checksum))
    }

    async fn get_version(
        &self,
        gun: &Gun,
        role: &RoleName,
        version: u64,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        let inner = self.inner.lock().await;
        inner.find(gun, role, |files| files.iter().find(|f| f.version == version))
    }

    async fn delete(&self, gun: &Gun) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let before = inner.files.len();
        inner.files.retain(|(g, _), _| g != gun);
        if inner.files.len() != before {
            let id = inner.changes.len() as i64 + 1;
            inner.changes.push(Change {
                id,
                created_at: Utc::now(),
                gun: gun.to_string(),
                version: 0,
                sha256: String::new(),
                category: ChangeCategory::Deletion,
            });
        }
        Ok(())
    }

    async fn get_changes(
        &self,
        change_id: &str,
        records: i64,
        filter_gun: &str,
    ) -> Result<Vec<Change>, StorageError> {
        let query = ChangeQuery::parse(change_id, records, filter_gun)?;
        let inner = self.inner.lock().await;
        Ok(query.select(inner.changes.iter()))
    }

    async fn check_health(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(role: &str, version: u64, data: &[u8]) -> MetaUpdate {
        MetaUpdate {
            role: RoleName::parse(role).unwrap(),
            version,
            data: data.to_vec(),
        }
    }

    async fn publish_timestamps(store: &MemStorage, gun: &str, versions: std::ops::Range<u64>) {
        let gun = Gun::from(gun);
        for v in versions {
            store
                .update_current(&gun, update("timestamp", v, format!("ts{v}").as_bytes()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn update_current_rejects_old_versions() {
        let store = MemStorage::new();
        let gun = Gun::from("gun");
        store.update_current(&gun, update("root", 2, b"r2")).await.unwrap();
        assert!(matches!(
            store.update_current(&gun, update("root", 2, b"again")).await,
            Err(StorageError::OldVersion(_))
        ));
        assert!(matches!(
            store.update_current(&gun, update("root", 1, b"r1")).await,
            Err(StorageError::OldVersion(_))
        ));
        let (_, data) = store.get_current(&gun, &RoleName::root()).await.unwrap();
        assert_eq!(data, b"r2");
    }

    #[tokio::test]
    async fn update_many_is_all_or_nothing() {
        let store = MemStorage::new();
        let gun = Gun::from("gun");
        store.update_current(&gun, update("targets", 3, b"t3")).await.unwrap();

        let batch = vec![update("root", 1, b"r1"), update("targets", 2, b"t2")];
        assert!(matches!(
            store.update_many(&gun, batch).await,
            Err(StorageError::OldVersion(_))
        ));
        assert!(matches!(
            store.get_current(&gun, &RoleName::root()).await,
            Err(StorageError::NotFound(_))
        ));

        let dup = vec![update("root", 1, b"a"), update("root", 1, b"b")];
        assert!(store.update_many(&gun, dup).await.is_err());

        let ok = vec![update("root", 2, b"r2"), update("root", 1, b"r1"), update("targets", 4, b"t4")];
        store.update_many(&gun, ok).await.unwrap();
        let (_, data) = store.get_current(&gun, &RoleName::root()).await.unwrap();
        assert_eq!(data, b"r2");
        let (_, data) = store.get_version(&gun, &RoleName::root(), 1).await.unwrap();
        assert_eq!(data, b"r1");
    }

    #[tokio::test]
    async fn lookup_by_checksum() {
        let store = MemStorage::new();
        let gun = Gun::from("gun");
        let u = update("snapshot", 1, b"snap");
        let sum = u.sha256();
        store.update_current(&gun, u).await.unwrap();
        let (_, data) = store.get_checksum(&gun, &RoleName::snapshot(), &sum).await.unwrap();
        assert_eq!(data, b"snap");
        assert!(store
            .get_checksum(&gun, &RoleName::snapshot(), "00")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn only_timestamps_enter_the_change_feed() {
        let store = MemStorage::new();
        let gun = Gun::from("gun");
        let batch = vec![update("root", 1, b"r"), update("targets", 1, b"t"), update("timestamp", 1, b"ts")];
        store.update_many(&gun, batch).await.unwrap();
        let changes = store.get_changes("0", 100, "").await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].version, 1);
        assert_eq!(changes[0].category, ChangeCategory::Update);
    }

    #[tokio::test]
    async fn delete_records_a_change_only_when_something_existed() {
        let store = MemStorage::new();
        let gun = Gun::from("gun");
        store.delete(&gun).await.unwrap();
        assert!(store.get_changes("0", 10, "").await.unwrap().is_empty());

        publish_timestamps(&store, "gun", 1..2).await;
        store.delete(&gun).await.unwrap();
        let changes = store.get_changes("0", 10, "").await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].category, ChangeCategory::Deletion);
        assert!(store.get_current(&gun, &RoleName::timestamp()).await.is_err());
    }

    #[tokio::test]
    async fn change_feed_paging() {
        let store = MemStorage::new();
        publish_timestamps(&store, "alpine", 1..5).await;
        publish_timestamps(&store, "busybox", 1..5).await;

        let ids = |c: Vec<Change>| c.into_iter().map(|c| c.id).collect::<Vec<_>>();

        assert_eq!(ids(store.get_changes("0", 4, "").await.unwrap()), vec![1, 2, 3, 4]);
        assert_eq!(ids(store.get_changes("-1", 4, "").await.unwrap()), vec![5, 6, 7, 8]);
        assert_eq!(ids(store.get_changes("10", -4, "").await.unwrap()), vec![5, 6, 7, 8]);
        assert_eq!(ids(store.get_changes("7", -4, "").await.unwrap()), vec![3, 4, 5, 6]);
        assert!(store.get_changes("10", 4, "").await.unwrap().is_empty());
        assert_eq!(ids(store.get_changes("", 2, "").await.unwrap()), vec![1, 2]);

        assert_eq!(ids(store.get_changes("0", 10, "busybox").await.unwrap()), vec![5, 6, 7, 8]);
        assert_eq!(ids(store.get_changes("-1", 2, "alpine").await.unwrap()), vec![3, 4]);

        assert!(matches!(
            store.get_changes("abc", 4, "").await,
            Err(StorageError::BadQuery(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_writers_of_one_version_have_one_winner() {
        let store = std::sync::Arc::new(MemStorage::new());
        let gun = Gun::from("gun");
        store
            .update_many(&gun, vec![update("targets", 1, b"t1"), update("timestamp", 1, b"ts1")])
            .await
            .unwrap();

        let writers: Vec<_> = [b"left".as_slice(), b"right".as_slice()]
            .into_iter()
            .map(|tag| {
                let store = store.clone();
                let gun = gun.clone();
                let batch = vec![update("targets", 2, tag), update("timestamp", 2, tag)];
                tokio::spawn(async move { store.update_many(&gun, batch).await })
            })
            .collect();
        let mut results = Vec::new();
        for writer in writers {
            results.push(writer.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(StorageError::OldVersion(_)))));

        // both roles come from the same writer
        let (_, targets) = store.get_current(&gun, &RoleName::targets()).await.unwrap();
        let (_, timestamp) = store.get_current(&gun, &RoleName::timestamp()).await.unwrap();
        assert_eq!(targets, timestamp);
        assert_eq!(store.get_changes("0", 100, "").await.unwrap().len(), 2);
    }
}

//! Versioned TUF metadata storage and the repository change feed.

pub mod memory;
pub mod sql;
pub mod tuf_store;

pub use memory::MemStorage;
pub use sql::SqlStorage;
pub use tuf_store::TufMetaStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tuf::{Gun, RoleName};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("old version: {0}")]
    OldVersion(String),

    #[error("bad change feed query: {0}")]
    BadQuery(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored metadata is unusable: {0}")]
    Corrupt(String),
}

/// One role file to be written at a given version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaUpdate {
    pub role: RoleName,
    pub version: u64,
    pub data: Vec<u8>,
}

impl MetaUpdate {
    pub fn sha256(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeCategory {
    Update,
    Deletion,
}

impl ChangeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeCategory::Update => "update",
            ChangeCategory::Deletion => "deletion",
        }
    }
}

/// A change-feed record. Ids grow strictly in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "GUN")]
    pub gun: String,
    #[serde(rename = "Version")]
    pub version: i64,
    #[serde(rename = "SHA256")]
    pub sha256: String,
    #[serde(rename = "Category")]
    pub category: ChangeCategory,
}

/// Persistent storage for role files, keyed by (GUN, role, version).
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Write one role file. Fails with `OldVersion` if a version ≥ the new
    /// one is already stored.
    async fn update_current(&self, gun: &Gun, update: MetaUpdate) -> Result<(), StorageError>;

    /// Write several role files atomically: all or none.
    async fn update_many(&self, gun: &Gun, updates: Vec<MetaUpdate>) -> Result<(), StorageError>;

    /// Highest stored version of a role, with its creation time.
    async fn get_current(&self, gun: &Gun, role: &RoleName) -> Result<(DateTime<Utc>, Vec<u8>), StorageError>;

    async fn get_checksum(
        &self,
        gun: &Gun,
        role: &RoleName,
        checksum: &str,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError>;

    async fn get_version(
        &self,
        gun: &Gun,
        role: &RoleName,
        version: u64,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError>;

    /// Remove every file of a GUN; records a deletion if anything existed.
    async fn delete(&self, gun: &Gun) -> Result<(), StorageError>;

    /// Page through the change feed. See [`ChangeQuery`] for the cursor rules.
    async fn get_changes(
        &self,
        change_id: &str,
        records: i64,
        filter_gun: &str,
    ) -> Result<Vec<Change>, StorageError>;

    async fn check_health(&self) -> Result<(), StorageError>;
}

/// Parsed change-feed cursor.
///
/// A negative id or a negative record count pages backwards: the last
/// `|records|` changes before the cursor (or before the end when the id is
/// negative), still returned oldest first. Otherwise up to `records`
/// changes after the cursor are returned. An empty id means 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeQuery {
    pub cursor: Option<i64>,
    pub limit: usize,
    pub reversed: bool,
    pub gun: Option<String>,
}

impl ChangeQuery {
    pub fn parse(change_id: &str, records: i64, filter_gun: &str) -> Result<Self, StorageError> {
        let id = if change_id.is_empty() {
            0
        } else {
            change_id.parse::<i64>().map_err(|_| {
                StorageError::BadQuery(format!(
                    "change ID expected to be integer, provided ID was: {change_id}"
                ))
            })?
        };
        Ok(Self {
            cursor: (id >= 0).then_some(id),
            limit: records.unsigned_abs() as usize,
            reversed: id < 0 || records < 0,
            gun: (!filter_gun.is_empty()).then(|| filter_gun.to_string()),
        })
    }

    /// Apply the query to changes already sorted by ascending id.
    pub fn select<'a, I>(&self, changes: I) -> Vec<Change>
    where
        I: DoubleEndedIterator<Item = &'a Change>,
    {
        let matching = changes.filter(|c| self.gun.as_deref().map_or(true, |g| c.gun == g));
        if self.reversed {
            let mut page: Vec<Change> = matching
                .rev()
                .filter(|c| self.cursor.map_or(true, |cursor| c.id < cursor))
                .take(self.limit)
                .cloned()
                .collect();
            page.reverse();
            page
        } else {
            let cursor = self.cursor.unwrap_or(0);
            matching
                .filter(|c| c.id > cursor)
                .take(self.limit)
                .cloned()
                .collect()
        }
    }
}

/// Stored versions are signed 64-bit in every backend.
pub(crate) fn db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_parsing() {
        let q = ChangeQuery::parse("", 10, "").unwrap();
        assert_eq!(q.cursor, Some(0));
        assert!(!q.reversed);
        assert_eq!(q.gun, None);

        let q = ChangeQuery::parse("-1", 4, "alpine").unwrap();
        assert_eq!(q.cursor, None);
        assert!(q.reversed);
        assert_eq!(q.gun.as_deref(), Some("alpine"));

        let q = ChangeQuery::parse("10", -4, "").unwrap();
        assert!(q.reversed);
        assert_eq!(q.limit, 4);

        assert!(matches!(
            ChangeQuery::parse("abc", 1, ""),
            Err(StorageError::BadQuery(_))
        ));
    }
}

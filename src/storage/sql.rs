//! PostgreSQL-backed [`MetaStore`].
//!
//! Every write runs in one transaction, so a dropped request future rolls
//! back whatever it had not committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use super::{db_version, Change, ChangeCategory, ChangeQuery, MetaStore, MetaUpdate, StorageError};
use crate::tuf::data::TIMESTAMP;
use crate::tuf::{Gun, RoleName};

#[derive(sqlx::FromRow)]
struct FileRow {
    created_at: DateTime<Utc>,
    data: Vec<u8>,
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    id: i64,
    created_at: DateTime<Utc>,
    gun: String,
    version: i64,
    sha256: String,
    category: String,
}

impl From<ChangeRow> for Change {
    fn from(row: ChangeRow) -> Self {
        Change {
            id: row.id,
            created_at: row.created_at,
            gun: row.gun,
            version: row.version,
            sha256: row.sha256,
            category: if row.category == "deletion" {
                ChangeCategory::Deletion
            } else {
                ChangeCategory::Update
            },
        }
    }
}

#[derive(Clone)]
pub struct SqlStorage {
    pool: PgPool,
}

impl SqlStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_update(conn: &mut PgConnection, gun: &Gun, update: &MetaUpdate) -> Result<(), StorageError> {
    let version = db_version(update.version);
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM tuf_files WHERE gun = $1 AND role = $2 AND version >= $3)",
    )
    .bind(gun.as_str())
    .bind(update.role.as_str())
    .bind(version)
    .fetch_one(&mut *conn)
    .await?;
    if exists {
        return Err(StorageError::OldVersion(format!(
            "{gun} {} version {} is not newer than the stored version",
            update.role, update.version
        )));
    }

    let sha256 = update.sha256();
    sqlx::query("INSERT INTO tuf_files (gun, role, version, sha256, data) VALUES ($1, $2, $3, $4, $5)")
        .bind(gun.as_str())
        .bind(update.role.as_str())
        .bind(version)
        .bind(&sha256)
        .bind(&update.data)
        .execute(&mut *conn)
        .await
        .map_err(|e| match e {
            // lost a race against a concurrent writer of the same version
            sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::OldVersion(db.to_string()),
            other => StorageError::Database(other),
        })?;

    if update.role == TIMESTAMP {
        sqlx::query("INSERT INTO changefeed (gun, version, sha256, category) VALUES ($1, $2, $3, 'update')")
            .bind(gun.as_str())
            .bind(version)
            .bind(&sha256)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn not_found(gun: &Gun, role: &RoleName) -> StorageError {
    StorageError::NotFound(format!("{gun} {role}"))
}

#[async_trait]
impl MetaStore for SqlStorage {
    async fn update_current(&self, gun: &Gun, update: MetaUpdate) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        insert_update(&mut tx, gun, &update).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_many(&self, gun: &Gun, mut updates: Vec<MetaUpdate>) -> Result<(), StorageError> {
        updates.sort_by(|a, b| (&a.role, a.version).cmp(&(&b.role, b.version)));
        let mut tx = self.pool.begin().await?;
        for update in &updates {
            insert_update(&mut tx, gun, update).await?;
        }
        tx.commit().await?;
        tracing::debug!("{}: committed {} role file(s)", gun, updates.len());
        Ok(())
    }

    async fn get_current(&self, gun: &Gun, role: &RoleName) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT created_at, data FROM tuf_files WHERE gun = $1 AND role = $2 ORDER BY version DESC LIMIT 1",
        )
        .bind(gun.as_str())
        .bind(role.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| not_found(gun, role))?;
        Ok((row.created_at, row.data))
    }

    async fn get_checksum(
        &self,
        gun: &Gun,
        role: &RoleName,
        checksum: &str,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT created_at, data FROM tuf_files WHERE gun = $1 AND role = $2 AND sha256 = $3 LIMIT 1",
        )
        .bind(gun.as_str())
        .bind(role.as_str())
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| not_found(gun, role))?;
        Ok((row.created_at, row.data))
    }

    async fn get_version(
        &self,
        gun: &Gun,
        role: &RoleName,
        version: u64,
    ) -> Result<(DateTime<Utc>, Vec<u8>), StorageError> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT created_at, data FROM tuf_files WHERE gun = $1 AND role = $2 AND version = $3",
        )
        .bind(gun.as_str())
        .bind(role.as_str())
        .bind(db_version(version))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| not_found(gun, role))?;
        Ok((row.created_at, row.data))
    }

    async fn delete(&self, gun: &Gun) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM tuf_files WHERE gun = $1")
            .bind(gun.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted > 0 {
            sqlx::query("INSERT INTO changefeed (gun, version, sha256, category) VALUES ($1, 0, '', 'deletion')")
                .bind(gun.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_changes(
        &self,
        change_id: &str,
        records: i64,
        filter_gun: &str,
    ) -> Result<Vec<Change>, StorageError> {
        let query = ChangeQuery::parse(change_id, records, filter_gun)?;
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let (sql, cursor) = match (query.reversed, query.cursor) {
            (false, cursor) => (
                "SELECT id, created_at, gun, version, sha256, category FROM changefeed \
                 WHERE id > $1 AND ($3::TEXT IS NULL OR gun = $3) ORDER BY id ASC LIMIT $2",
                cursor.unwrap_or(0),
            ),
            (true, Some(cursor)) => (
                "SELECT id, created_at, gun, version, sha256, category FROM changefeed \
                 WHERE id < $1 AND ($3::TEXT IS NULL OR gun = $3) ORDER BY id DESC LIMIT $2",
                cursor,
            ),
            (true, None) => (
                "SELECT id, created_at, gun, version, sha256, category FROM changefeed \
                 WHERE id <= $1 AND ($3::TEXT IS NULL OR gun = $3) ORDER BY id DESC LIMIT $2",
                i64::MAX,
            ),
        };

        let rows = sqlx::query_as::<_, ChangeRow>(sql)
            .bind(cursor)
            .bind(limit)
            .bind(query.gun.as_deref())
            .fetch_all(&self.pool)
            .await?;

        let mut changes: Vec<Change> = rows.into_iter().map(Change::from).collect();
        if query.reversed {
            changes.reverse();
        }
        Ok(changes)
    }

    async fn check_health(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

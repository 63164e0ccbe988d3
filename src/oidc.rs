//! Linked OIDC identities (`oidc_user`), looked up by the external auth
//! adapter through the subject+issuer key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    #[error("{count} OIDC records share subiss {subiss}")]
    Duplicate { subiss: String, count: usize },

    #[error("no OIDC record for user {0}")]
    NotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct OidcUser {
    pub id: i64,
    pub user_id: i64,
    /// Encrypted CLI secret.
    #[serde(skip_serializing)]
    pub secret: String,
    pub subiss: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// The lookup key: subject immediately followed by issuer.
pub fn subiss(sub: &str, iss: &str) -> String {
    format!("{sub}{iss}")
}

fn at_most_one(subiss: &str, mut rows: Vec<OidcUser>) -> Result<Option<OidcUser>, OidcError> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        count => {
            error!("{} OIDC records share subiss {}", count, subiss);
            Err(OidcError::Duplicate {
                subiss: subiss.to_string(),
                count,
            })
        }
    }
}

#[async_trait]
pub trait OidcUserStore: Send + Sync {
    async fn create(&self, user_id: i64, subiss: &str, secret: &str, token: &str) -> Result<OidcUser, OidcError>;

    /// More than one matching record is an error.
    async fn get_by_sub_iss(&self, sub: &str, iss: &str) -> Result<Option<OidcUser>, OidcError>;

    async fn get_by_user_id(&self, user_id: i64) -> Result<Option<OidcUser>, OidcError>;

    /// Fill in the subiss of a record onboarded before it was recorded.
    /// Returns `false` if the record already had one.
    async fn fix_empty_sub_iss(&self, user_id: i64, sub: &str, iss: &str) -> Result<bool, OidcError>;
}

#[derive(Default)]
pub struct MemoryOidcUserStore {
    rows: Mutex<Vec<OidcUser>>,
}

impl MemoryOidcUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OidcUserStore for MemoryOidcUserStore {
    async fn create(&self, user_id: i64, subiss: &str, secret: &str, token: &str) -> Result<OidcUser, OidcError> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();
        let user = OidcUser {
            id: rows.len() as i64 + 1,
            user_id,
            secret: secret.to_string(),
            subiss: subiss.to_string(),
            token: token.to_string(),
            creation_time: now,
            update_time: now,
        };
        rows.push(user.clone());
        Ok(user)
    }

    async fn get_by_sub_iss(&self, sub: &str, iss: &str) -> Result<Option<OidcUser>, OidcError> {
        let key = subiss(sub, iss);
        let rows = self.rows.lock().await;
        let matching = rows.iter().filter(|u| u.subiss == key).cloned().collect();
        at_most_one(&key, matching)
    }

    async fn get_by_user_id(&self, user_id: i64) -> Result<Option<OidcUser>, OidcError> {
        Ok(self.rows.lock().await.iter().find(|u| u.user_id == user_id).cloned())
    }

    async fn fix_empty_sub_iss(&self, user_id: i64, sub: &str, iss: &str) -> Result<bool, OidcError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|u| u.user_id == user_id)
            .ok_or(OidcError::NotFound(user_id))?;
        if !row.subiss.is_empty() {
            return Ok(false);
        }
        row.subiss = subiss(sub, iss);
        row.update_time = Utc::now();
        info!("filled in subiss for user {}", user_id);
        Ok(true)
    }
}

pub struct SqlOidcUserStore {
    pool: PgPool,
}

impl SqlOidcUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const COLUMNS: &str = "id, user_id, secret, subiss, token, creation_time, update_time";

#[async_trait]
impl OidcUserStore for SqlOidcUserStore {
    async fn create(&self, user_id: i64, subiss: &str, secret: &str, token: &str) -> Result<OidcUser, OidcError> {
        let user = sqlx::query_as::<_, OidcUser>(&format!(
            "INSERT INTO oidc_user (user_id, subiss, secret, token) VALUES ($1, $2, $3, $4) RETURNING {COLUMNS}"
        ))
        .bind(user_id)
        .bind(subiss)
        .bind(secret)
        .bind(token)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_by_sub_iss(&self, sub: &str, iss: &str) -> Result<Option<OidcUser>, OidcError> {
        let key = subiss(sub, iss);
        let rows = sqlx::query_as::<_, OidcUser>(&format!("SELECT {COLUMNS} FROM oidc_user WHERE subiss = $1"))
            .bind(&key)
            .fetch_all(&self.pool)
            .await?;
        at_most_one(&key, rows)
    }

    async fn get_by_user_id(&self, user_id: i64) -> Result<Option<OidcUser>, OidcError> {
        let user = sqlx::query_as::<_, OidcUser>(&format!("SELECT {COLUMNS} FROM oidc_user WHERE user_id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn fix_empty_sub_iss(&self, user_id: i64, sub: &str, iss: &str) -> Result<bool, OidcError> {
        let updated = sqlx::query(
            "UPDATE oidc_user SET subiss = $2, update_time = NOW()
             WHERE user_id = $1 AND (subiss IS NULL OR subiss = '')",
        )
        .bind(user_id)
        .bind(subiss(sub, iss))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated > 0 {
            info!("filled in subiss for user {}", user_id);
            return Ok(true);
        }
        match self.get_by_user_id(user_id).await? {
            Some(_) => Ok(false),
            None => Err(OidcError::NotFound(user_id)),
        }
    }
}

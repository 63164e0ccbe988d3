//! Durable storage for server-held private keys.
//!
//! Key material is sealed with the same `<enc-v1>` cipher as configuration
//! passwords before it leaves the process. On boot every stored key is
//! loaded back into the [`CryptoService`](super::CryptoService).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use sqlx::PgPool;
use tokio::sync::Mutex;

use super::{CryptoError, KeyAlgorithm, PrivateKey};
use crate::config::PasswordCipher;
use crate::tuf::{Gun, RoleName};

/// A private key together with the role it signs for.
#[derive(Debug)]
pub struct StoredPrivateKey {
    pub gun: Gun,
    pub role: RoleName,
    pub key: PrivateKey,
}

#[async_trait]
pub trait KeyStorage: Send + Sync {
    async fn save(&self, gun: &Gun, role: &RoleName, key: &PrivateKey) -> Result<(), CryptoError>;

    /// Every stored key, oldest first.
    async fn load(&self) -> Result<Vec<StoredPrivateKey>, CryptoError>;
}

fn seal(cipher: &PasswordCipher, key: &PrivateKey) -> Result<String, CryptoError> {
    let encoded = STANDARD.encode(key.to_bytes()?);
    cipher
        .encrypt(&encoded)
        .map_err(|e| CryptoError::Storage(e.to_string()))
}

fn unseal(cipher: &PasswordCipher, algorithm: &str, sealed: &str) -> Result<PrivateKey, CryptoError> {
    let encoded = cipher
        .decrypt(sealed)
        .map_err(|e| CryptoError::Storage(e.to_string()))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(format!("stored key is not base64: {e}")))?;
    PrivateKey::from_bytes(KeyAlgorithm::parse(algorithm)?, &bytes)
}

#[derive(Clone)]
struct SealedRow {
    gun: String,
    role: String,
    algorithm: String,
    private: String,
}

fn open_row(cipher: &PasswordCipher, row: SealedRow) -> Result<StoredPrivateKey, CryptoError> {
    let role = RoleName::parse(&row.role).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(StoredPrivateKey {
        gun: Gun::new(row.gun),
        role,
        key: unseal(cipher, &row.algorithm, &row.private)?,
    })
}

/// Keeps sealed keys in process memory. Survives a rebuilt
/// `CryptoService`, which is what tests use it for.
pub struct MemoryKeyStorage {
    cipher: PasswordCipher,
    rows: Mutex<Vec<SealedRow>>,
}

impl MemoryKeyStorage {
    pub fn new(cipher: PasswordCipher) -> Self {
        Self {
            cipher,
            rows: Mutex::new(Vec::new()),
        }
    }

    /// The sealed form of every stored key.
    pub async fn sealed(&self) -> Vec<String> {
        self.rows.lock().await.iter().map(|r| r.private.clone()).collect()
    }
}

#[async_trait]
impl KeyStorage for MemoryKeyStorage {
    async fn save(&self, gun: &Gun, role: &RoleName, key: &PrivateKey) -> Result<(), CryptoError> {
        let row = SealedRow {
            gun: gun.to_string(),
            role: role.to_string(),
            algorithm: key.algorithm().as_str().to_string(),
            private: seal(&self.cipher, key)?,
        };
        self.rows.lock().await.push(row);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<StoredPrivateKey>, CryptoError> {
        let rows = self.rows.lock().await;
        rows.iter().cloned().map(|r| open_row(&self.cipher, r)).collect()
    }
}

/// Keys in the `private_keys` table.
pub struct SqlKeyStorage {
    pool: PgPool,
    cipher: PasswordCipher,
}

impl SqlKeyStorage {
    pub fn new(pool: PgPool, cipher: PasswordCipher) -> Self {
        Self { pool, cipher }
    }
}

fn db_error(e: sqlx::Error) -> CryptoError {
    CryptoError::Storage(e.to_string())
}

#[async_trait]
impl KeyStorage for SqlKeyStorage {
    async fn save(&self, gun: &Gun, role: &RoleName, key: &PrivateKey) -> Result<(), CryptoError> {
        let key_id = key.public()?.id();
        sqlx::query(
            "INSERT INTO private_keys (key_id, gun, role, algorithm, private) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (key_id) DO NOTHING",
        )
        .bind(&key_id)
        .bind(gun.as_str())
        .bind(role.as_str())
        .bind(key.algorithm().as_str())
        .bind(seal(&self.cipher, key)?)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<StoredPrivateKey>, CryptoError> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT gun, role, algorithm, private FROM private_keys ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.into_iter()
            .map(|(gun, role, algorithm, private)| {
                open_row(
                    &self.cipher,
                    SealedRow {
                        gun,
                        role,
                        algorithm,
                        private,
                    },
                )
            })
            .collect()
    }
}

// SPDX-License-Identifier: EUPL-1.2
// Copyright (c) 2026 Benjamin Küttner <benjamin.kuettner@icloud.com>
// Patent Pending — DE Gebrauchsmuster, filed 2026-02-23

//! Reversible encryption of password-typed configuration values.
//!
//! Ciphertext is `<enc-v1>` followed by base64(iv || AES-CFB128(plaintext)).
//! The AES variant follows the key length (16, 24 or 32 bytes).

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt, encrypt, Cipher};

use super::ConfigError;

pub const ENCRYPTED_PREFIX: &str = "<enc-v1>";
const IV_LEN: usize = 16;

/// Supplies the symmetric key.
pub trait KeyProvider: Send + Sync {
    fn key(&self) -> Result<Vec<u8>, ConfigError>;
}

/// Reads the key from a file once and keeps it (`KEY_PATH`).
pub struct FileKeyProvider {
    path: PathBuf,
    loaded: RwLock<Option<Vec<u8>>>,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: RwLock::new(None),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("KEY_PATH").unwrap_or_else(|_| "/etc/core/key".to_string()))
    }
}

impl KeyProvider for FileKeyProvider {
    fn key(&self) -> Result<Vec<u8>, ConfigError> {
        if let Ok(guard) = self.loaded.read() {
            if let Some(key) = guard.as_ref() {
                return Ok(key.clone());
            }
        }
        let raw = std::fs::read(&self.path)
            .map_err(|e| ConfigError::Encryption(format!("reading key from {}: {e}", self.path.display())))?;
        let key = trim_newline(raw);
        if let Ok(mut guard) = self.loaded.write() {
            *guard = Some(key.clone());
        }
        Ok(key)
    }
}

fn trim_newline(mut raw: Vec<u8>) -> Vec<u8> {
    while matches!(raw.last(), Some(b'\n' | b'\r')) {
        raw.pop();
    }
    raw
}

/// A fixed key, for tests and single-node setups.
pub struct StaticKeyProvider(pub Vec<u8>);

impl KeyProvider for StaticKeyProvider {
    fn key(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(self.0.clone())
    }
}

fn cipher_for(key: &[u8]) -> Result<Cipher, ConfigError> {
    match key.len() {
        16 => Ok(Cipher::aes_128_cfb128()),
        24 => Ok(Cipher::aes_192_cfb128()),
        32 => Ok(Cipher::aes_256_cfb128()),
        n => Err(ConfigError::Encryption(format!("key must be 16, 24 or 32 bytes, got {n}"))),
    }
}

pub fn reversible_encrypt(plaintext: &str, key: &[u8]) -> Result<String, ConfigError> {
    let cipher = cipher_for(key)?;
    let mut iv = [0u8; IV_LEN];
    rand_bytes(&mut iv).map_err(|e| ConfigError::Encryption(e.to_string()))?;
    let ciphertext =
        encrypt(cipher, key, Some(&iv), plaintext.as_bytes()).map_err(|e| ConfigError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(format!("{ENCRYPTED_PREFIX}{}", STANDARD.encode(out)))
}

/// Values without the prefix are returned as they are.
pub fn reversible_decrypt(text: &str, key: &[u8]) -> Result<String, ConfigError> {
    let Some(encoded) = text.strip_prefix(ENCRYPTED_PREFIX) else {
        return Ok(text.to_string());
    };
    let cipher = cipher_for(key)?;
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| ConfigError::Encryption(format!("ciphertext is not base64: {e}")))?;
    if raw.len() < IV_LEN {
        return Err(ConfigError::Encryption("ciphertext is too short".into()));
    }
    let (iv, body) = raw.split_at(IV_LEN);
    let plain = decrypt(cipher, key, Some(iv), body).map_err(|e| ConfigError::Encryption(e.to_string()))?;
    String::from_utf8(plain).map_err(|_| ConfigError::Encryption("plaintext is not UTF-8".into()))
}

/// Encrypts and decrypts with whatever key the provider hands out.
#[derive(Clone)]
pub struct PasswordCipher {
    provider: Arc<dyn KeyProvider>,
}

impl PasswordCipher {
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self { provider }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, ConfigError> {
        if plaintext.starts_with(ENCRYPTED_PREFIX) {
            return Ok(plaintext.to_string());
        }
        reversible_encrypt(plaintext, &self.provider.key()?)
    }

    pub fn decrypt(&self, text: &str) -> Result<String, ConfigError> {
        if !text.starts_with(ENCRYPTED_PREFIX) {
            return Ok(text.to_string());
        }
        reversible_decrypt(text, &self.provider.key()?)
    }
}

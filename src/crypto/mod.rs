//! Key material, signature methods and the server-side key holder.
//!
//! Public keys travel in the TUF `{"keytype", "keyval"}` shape. Ed25519 keys
//! are raw 32-byte points; ECDSA (P-256) and RSA keys are DER SubjectPublicKeyInfo.

pub mod keystore;
pub mod pkcs7;

pub use keystore::{KeyStorage, MemoryKeyStorage, SqlKeyStorage};

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey, Verifier as _, VerifyingKey};
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tuf::data::{Base64Bytes, Gun, RoleName};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("{method:?} signatures cannot be checked with a {key:?} key")]
    MethodMismatch {
        key: KeyAlgorithm,
        method: SignatureMethod,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("key storage: {0}")]
    Storage(String),

    #[error("openssl: {0}")]
    OpenSsl(#[from] ErrorStack),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Ed25519,
    Ecdsa,
    Rsa,
}

impl KeyAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::Ecdsa => "ecdsa",
            KeyAlgorithm::Rsa => "rsa",
        }
    }

    pub fn parse(name: &str) -> Result<Self, CryptoError> {
        match name {
            "ed25519" => Ok(KeyAlgorithm::Ed25519),
            "ecdsa" => Ok(KeyAlgorithm::Ecdsa),
            "rsa" => Ok(KeyAlgorithm::Rsa),
            other => Err(CryptoError::Unsupported(format!("key type {other}"))),
        }
    }

    pub fn signature_method(self) -> SignatureMethod {
        match self {
            KeyAlgorithm::Ed25519 => SignatureMethod::Ed25519,
            KeyAlgorithm::Ecdsa => SignatureMethod::Ecdsa,
            KeyAlgorithm::Rsa => SignatureMethod::Rsapss,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMethod {
    Ed25519,
    Ecdsa,
    Rsapss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub private: Option<Base64Bytes>,
    pub public: Base64Bytes,
}

/// A public key as it appears in root and delegation key tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub keytype: KeyAlgorithm,
    pub keyval: KeyValue,
}

impl PublicKey {
    pub fn new(keytype: KeyAlgorithm, public: Vec<u8>) -> Self {
        Self {
            keytype,
            keyval: KeyValue {
                private: None,
                public: Base64Bytes(public),
            },
        }
    }

    /// Hex sha256 of the canonical public-only key document.
    pub fn id(&self) -> String {
        let keytype = self.keytype.as_str();
        let public = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            &self.keyval.public.0,
        );
        let doc = format!(
            r#"{{"keytype":"{keytype}","keyval":{{"private":null,"public":"{public}"}}}}"#
        );
        hex::encode(Sha256::digest(doc.as_bytes()))
    }

    pub fn verify(&self, method: SignatureMethod, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        let public = &self.keyval.public.0;
        match (self.keytype, method) {
            (KeyAlgorithm::Ed25519, SignatureMethod::Ed25519) => verify_ed25519(public, msg, sig),
            (KeyAlgorithm::Ecdsa, SignatureMethod::Ecdsa) => verify_ecdsa(public, msg, sig),
            (KeyAlgorithm::Rsa, SignatureMethod::Rsapss) => verify_rsa_pss(public, msg, sig),
            (key, method) => Err(CryptoError::MethodMismatch { key, method }),
        }
    }
}

fn verify_ed25519(public: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let public: [u8; 32] = public
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ed25519 public key must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&public).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig: [u8; 64] = sig
        .try_into()
        .map_err(|_| CryptoError::BadSignature("ed25519 signature must be 64 bytes".into()))?;
    key.verify(msg, &ed25519_dalek::Signature::from_bytes(&sig))
        .map_err(|e| CryptoError::BadSignature(e.to_string()))
}

fn verify_ecdsa(spki: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    if sig.len() != 64 {
        return Err(CryptoError::BadSignature("ecdsa signature must be 64 bytes (r || s)".into()));
    }
    let key = PKey::public_key_from_der(spki)?.ec_key()?;
    let r = BigNum::from_slice(&sig[..32])?;
    let s = BigNum::from_slice(&sig[32..])?;
    let sig = EcdsaSig::from_private_components(r, s)?;
    let digest = Sha256::digest(msg);
    if sig.verify(&digest[..], &key)? {
        Ok(())
    } else {
        Err(CryptoError::BadSignature("ecdsa signature does not match".into()))
    }
}

fn verify_rsa_pss(spki: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let key = PKey::public_key_from_der(spki)?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), &key)?;
    verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
    verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
    verifier.update(msg)?;
    if verifier.verify(sig)? {
        Ok(())
    } else {
        Err(CryptoError::BadSignature("rsa-pss signature does not match".into()))
    }
}

/// A private signing key held by the server.
pub enum PrivateKey {
    Ed25519(SigningKey),
    Ecdsa(EcKey<Private>),
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({:?})", self.algorithm())
    }
}

impl PrivateKey {
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self, CryptoError> {
        match algorithm {
            KeyAlgorithm::Ed25519 => Ok(Self::Ed25519(SigningKey::generate(&mut OsRng))),
            KeyAlgorithm::Ecdsa => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                Ok(Self::Ecdsa(EcKey::generate(&group)?))
            }
            KeyAlgorithm::Rsa => Err(CryptoError::Unsupported(
                "the server does not generate RSA keys".into(),
            )),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Ed25519(_) => KeyAlgorithm::Ed25519,
            Self::Ecdsa(_) => KeyAlgorithm::Ecdsa,
        }
    }

    /// Raw private material: the 32-byte seed for ed25519, SEC1 DER for ECDSA.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Ed25519(key) => Ok(key.to_bytes().to_vec()),
            Self::Ecdsa(key) => Ok(key.private_key_to_der()?),
        }
    }

    pub fn from_bytes(algorithm: KeyAlgorithm, bytes: &[u8]) -> Result<Self, CryptoError> {
        match algorithm {
            KeyAlgorithm::Ed25519 => {
                let seed: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKey("ed25519 seed must be 32 bytes".into()))?;
                Ok(Self::Ed25519(SigningKey::from_bytes(&seed)))
            }
            KeyAlgorithm::Ecdsa => Ok(Self::Ecdsa(EcKey::private_key_from_der(bytes)?)),
            KeyAlgorithm::Rsa => Err(CryptoError::Unsupported(
                "the server does not hold RSA keys".into(),
            )),
        }
    }

    pub fn public(&self) -> Result<PublicKey, CryptoError> {
        let bytes = match self {
            Self::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
            Self::Ecdsa(key) => PKey::from_ec_key(key.clone())?.public_key_to_der()?,
        };
        Ok(PublicKey::new(self.algorithm(), bytes))
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Ed25519(key) => Ok(key.sign(msg).to_bytes().to_vec()),
            Self::Ecdsa(key) => {
                let digest = Sha256::digest(msg);
                let sig = EcdsaSig::sign(&digest[..], key)?;
                let mut out = sig.r().to_vec_padded(32)?;
                out.extend(sig.s().to_vec_padded(32)?);
                Ok(out)
            }
        }
    }
}

/// Holds server-managed private keys, addressed by key ID.
pub trait CryptoService: Send + Sync {
    /// Generate and store a fresh key for `role` of `gun`.
    fn create(&self, gun: &Gun, role: &RoleName, algorithm: KeyAlgorithm) -> Result<PublicKey, CryptoError>;

    fn add_key(&self, gun: &Gun, role: &RoleName, key: PrivateKey) -> Result<PublicKey, CryptoError>;

    fn get_private_key(&self, key_id: &str) -> Option<(Arc<PrivateKey>, RoleName)>;

    fn get_key(&self, key_id: &str) -> Option<PublicKey>;

    /// Key IDs for `role` of `gun`, oldest first.
    fn list_keys(&self, gun: &Gun, role: &RoleName) -> Vec<String>;

    fn remove_key(&self, key_id: &str) -> Result<(), CryptoError>;
}

struct StoredKey {
    gun: Gun,
    role: RoleName,
    private: Arc<PrivateKey>,
    public: PublicKey,
}

/// In-process key store.
#[derive(Default)]
pub struct MemoryCryptoService {
    keys: DashMap<String, StoredKey>,
    by_role: DashMap<(Gun, RoleName), Vec<String>>,
}

impl MemoryCryptoService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoService for MemoryCryptoService {
    fn create(&self, gun: &Gun, role: &RoleName, algorithm: KeyAlgorithm) -> Result<PublicKey, CryptoError> {
        let key = PrivateKey::generate(algorithm)?;
        self.add_key(gun, role, key)
    }

    fn add_key(&self, gun: &Gun, role: &RoleName, key: PrivateKey) -> Result<PublicKey, CryptoError> {
        let public = key.public()?;
        let id = public.id();
        self.keys.insert(
            id.clone(),
            StoredKey {
                gun: gun.clone(),
                role: role.clone(),
                private: Arc::new(key),
                public: public.clone(),
            },
        );
        let mut ids = self.by_role.entry((gun.clone(), role.clone())).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        Ok(public)
    }

    fn get_private_key(&self, key_id: &str) -> Option<(Arc<PrivateKey>, RoleName)> {
        self.keys
            .get(key_id)
            .map(|k| (Arc::clone(&k.private), k.role.clone()))
    }

    fn get_key(&self, key_id: &str) -> Option<PublicKey> {
        self.keys.get(key_id).map(|k| k.public.clone())
    }

    fn list_keys(&self, gun: &Gun, role: &RoleName) -> Vec<String> {
        self.by_role
            .get(&(gun.clone(), role.clone()))
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn remove_key(&self, key_id: &str) -> Result<(), CryptoError> {
        let (_, stored) = self
            .keys
            .remove(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))?;
        if let Some(mut ids) = self.by_role.get_mut(&(stored.gun, stored.role)) {
            ids.retain(|id| id != key_id);
        }
        Ok(())
    }
}

//! Wire types for TUF metadata.
//!
//! Every document is a [`Signed`] envelope whose `signed` section is kept as
//! raw JSON so the bytes handed out are exactly the bytes that were stored.
//! [`SignedMeta`] pairs an envelope with its parsed, structurally validated body.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256, Sha512};

use super::{canonical, TufError};
use crate::crypto::{PublicKey, SignatureMethod};

// ── Role names ───────────────────────────────────────────────

pub const ROOT: &str = "root";
pub const TARGETS: &str = "targets";
pub const SNAPSHOT: &str = "snapshot";
pub const TIMESTAMP: &str = "timestamp";

pub const BASE_ROLES: [&str; 4] = [ROOT, TARGETS, SNAPSHOT, TIMESTAMP];

fn delegation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^targets(/[A-Za-z0-9_\-][A-Za-z0-9_.\-]*)+$").expect("delegation pattern compiles")
    })
}

/// A validated role name: one of the four base roles or a `targets/...` delegation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoleName(String);

impl RoleName {
    pub fn parse(name: &str) -> Result<Self, TufError> {
        if BASE_ROLES.contains(&name) || delegation_re().is_match(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(TufError::InvalidRole {
                role: name.to_string(),
                reason: "not a base role or a targets delegation".into(),
            })
        }
    }

    pub fn root() -> Self {
        Self(ROOT.into())
    }

    pub fn targets() -> Self {
        Self(TARGETS.into())
    }

    pub fn snapshot() -> Self {
        Self(SNAPSHOT.into())
    }

    pub fn timestamp() -> Self {
        Self(TIMESTAMP.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_base_role(&self) -> bool {
        BASE_ROLES.contains(&self.0.as_str())
    }

    pub fn is_delegation(&self) -> bool {
        self.0.starts_with("targets/")
    }

    /// `targets` or any delegation below it.
    pub fn is_targets_like(&self) -> bool {
        self.0 == TARGETS || self.is_delegation()
    }

    pub fn parent(&self) -> Option<RoleName> {
        if !self.is_delegation() {
            return None;
        }
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| RoleName(parent.to_string()))
    }

    /// Number of path segments; `targets` is 1, `targets/a` is 2.
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<&str> for RoleName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl<'de> Deserialize<'de> for RoleName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RoleName::parse(&raw).map_err(de::Error::custom)
    }
}

/// Globally unique repository name, e.g. `docker.io/library/alpine`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gun(String);

impl Gun {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Gun {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for Gun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Encoded bytes ────────────────────────────────────────────

/// Raw bytes that travel as standard base64 strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Base64Bytes(pub Vec<u8>);

impl Serialize for Base64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map(Base64Bytes)
            .map_err(de::Error::custom)
    }
}

impl From<Vec<u8>> for Base64Bytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

// ── File metadata ────────────────────────────────────────────

/// Length and digests of a metadata or target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub hashes: BTreeMap<String, Base64Bytes>,
    pub length: i64,
}

impl FileMeta {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), Base64Bytes(Sha256::digest(data).to_vec()));
        hashes.insert("sha512".to_string(), Base64Bytes(Sha512::digest(data).to_vec()));
        Self {
            hashes,
            length: data.len() as i64,
        }
    }

    pub fn sha256_hex(&self) -> Option<String> {
        self.hashes.get("sha256").map(|h| hex::encode(&h.0))
    }

    /// Check `data` against every known digest; at least sha256 must be present.
    pub fn check(&self, role: &RoleName, data: &[u8]) -> Result<(), TufError> {
        let expected = self.sha256_hex().ok_or_else(|| TufError::MissingMeta {
            role: role.to_string(),
        })?;
        let mismatch = || TufError::MismatchedChecksum {
            role: role.to_string(),
            expected: expected.clone(),
        };
        for (algorithm, digest) in &self.hashes {
            let actual = match algorithm.as_str() {
                "sha256" => Sha256::digest(data).to_vec(),
                "sha512" => Sha512::digest(data).to_vec(),
                _ => continue,
            };
            if actual != digest.0 {
                return Err(mismatch());
            }
        }
        Ok(())
    }

    fn validate_hashes(&self, role: &str) -> Result<(), TufError> {
        let invalid = |msg: String| TufError::InvalidMetadata {
            role: role.to_string(),
            msg,
        };
        match self.hashes.get("sha256") {
            Some(h) if h.0.len() == 32 => {}
            Some(_) => return Err(invalid("sha256 checksum has the wrong length".into())),
            None => return Err(invalid("missing sha256 checksum".into())),
        }
        if let Some(h) = self.hashes.get("sha512") {
            if h.0.len() != 64 {
                return Err(invalid("sha512 checksum has the wrong length".into()));
            }
        }
        Ok(())
    }
}

// ── Envelope ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub method: SignatureMethod,
    pub sig: Base64Bytes,
}

/// `{"signatures": [...], "signed": {...}}` with `signed` left unparsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signed {
    pub signatures: Vec<Signature>,
    pub signed: Box<RawValue>,
}

impl Signed {
    pub fn from_bytes(data: &[u8]) -> Result<Self, TufError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Wrap a body in an unsigned envelope; the body is stored canonically.
    pub fn new_unsigned<T: Serialize>(body: &T) -> Result<Self, TufError> {
        let signed = RawValue::from_string(canonical::to_canonical_string(body)?)?;
        Ok(Self {
            signatures: Vec::new(),
            signed,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TufError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The exact bytes every signature covers.
    pub fn canonical_signed(&self) -> Result<Vec<u8>, TufError> {
        Ok(canonical::canonicalize(self.signed.get().as_bytes())?)
    }

    pub fn body<T: DeserializeOwned>(&self) -> Result<T, TufError> {
        Ok(serde_json::from_str(self.signed.get())?)
    }
}

/// Anything that lives in the `signed` section of a role file.
pub trait RoleBody: Serialize + DeserializeOwned + Clone {
    fn version(&self) -> u64;
    fn expires(&self) -> DateTime<Utc>;
    fn validate(&self, role: &RoleName) -> Result<(), TufError>;
}

/// A parsed envelope plus its structurally valid body.
#[derive(Debug, Clone)]
pub struct SignedMeta<T> {
    pub body: T,
    pub envelope: Signed,
}

impl<T: RoleBody> SignedMeta<T> {
    pub fn from_bytes(role: &RoleName, data: &[u8]) -> Result<Self, TufError> {
        let envelope = Signed::from_bytes(data)?;
        let body: T = envelope.body().map_err(|e| TufError::InvalidMetadata {
            role: role.to_string(),
            msg: e.to_string(),
        })?;
        body.validate(role)?;
        Ok(Self { body, envelope })
    }
}

/// Only the version field, used to label uploads without full validation.
#[derive(Debug, Deserialize)]
pub struct VersionOnly {
    pub version: u64,
}

fn invalid(role: &RoleName, msg: impl Into<String>) -> TufError {
    TufError::InvalidMetadata {
        role: role.to_string(),
        msg: msg.into(),
    }
}

fn check_type(role: &RoleName, actual: &str, expected: &str) -> Result<(), TufError> {
    if actual == expected {
        Ok(())
    } else {
        Err(invalid(role, format!("expected type {expected}, got {actual}")))
    }
}

/// Default lifetime of freshly generated metadata.
pub fn default_expiry(role: &RoleName) -> DateTime<Utc> {
    let lifetime = match role.as_str() {
        ROOT => Duration::days(10 * 365),
        TIMESTAMP => Duration::days(14),
        _ => Duration::days(3 * 365),
    };
    Utc::now() + lifetime
}

// ── Keys and thresholds ──────────────────────────────────────

/// The resolved key set and threshold for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseRole {
    pub name: RoleName,
    pub keys: BTreeMap<String, PublicKey>,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRole {
    pub keyids: Vec<String>,
    pub threshold: u32,
}

// ── Root ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    #[serde(rename = "_type")]
    pub kind: String,
    #[serde(default)]
    pub consistent_snapshot: bool,
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<String, PublicKey>,
    pub roles: BTreeMap<String, RootRole>,
    pub version: u64,
}

impl Root {
    pub fn new(
        keys: BTreeMap<String, PublicKey>,
        roles: BTreeMap<String, RootRole>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: "Root".into(),
            consistent_snapshot: false,
            expires,
            keys,
            roles,
            version: 1,
        }
    }

    pub fn base_role(&self, role: &RoleName) -> Result<BaseRole, TufError> {
        let entry = self.roles.get(role.as_str()).ok_or_else(|| TufError::InvalidRole {
            role: role.to_string(),
            reason: "not listed in root".into(),
        })?;
        let keys = entry
            .keyids
            .iter()
            .filter_map(|id| self.keys.get(id).map(|k| (id.clone(), k.clone())))
            .collect();
        Ok(BaseRole {
            name: role.clone(),
            keys,
            threshold: entry.threshold,
        })
    }
}

impl RoleBody for Root {
    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn validate(&self, role: &RoleName) -> Result<(), TufError> {
        check_type(role, &self.kind, "Root")?;
        for base in BASE_ROLES {
            let entry = self
                .roles
                .get(base)
                .ok_or_else(|| invalid(role, format!("missing {base} role")))?;
            if entry.threshold < 1 {
                return Err(invalid(role, format!("{base} threshold must be at least 1")));
            }
            if entry.keyids.is_empty() {
                return Err(invalid(role, format!("{base} lists no keys")));
            }
            if let Some(missing) = entry.keyids.iter().find(|id| !self.keys.contains_key(*id)) {
                return Err(invalid(role, format!("{base} references unknown key {missing}")));
            }
        }
        Ok(())
    }
}

// ── Targets ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRole {
    pub name: RoleName,
    pub keyids: Vec<String>,
    pub threshold: u32,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegations {
    #[serde(default)]
    pub keys: BTreeMap<String, PublicKey>,
    #[serde(default)]
    pub roles: Vec<DelegationRole>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(rename = "_type")]
    pub kind: String,
    #[serde(default)]
    pub delegations: Delegations,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub targets: BTreeMap<String, FileMeta>,
    pub version: u64,
}

impl Targets {
    pub fn new(expires: DateTime<Utc>) -> Self {
        Self {
            kind: "Targets".into(),
            delegations: Delegations::default(),
            expires,
            targets: BTreeMap::new(),
            version: 1,
        }
    }

    pub fn delegation(&self, child: &RoleName) -> Option<&DelegationRole> {
        self.delegations.roles.iter().find(|d| &d.name == child)
    }

    pub fn delegation_base_role(&self, child: &RoleName) -> Result<BaseRole, TufError> {
        let entry = self.delegation(child).ok_or_else(|| TufError::InvalidRole {
            role: child.to_string(),
            reason: "not delegated by its parent".into(),
        })?;
        let keys = entry
            .keyids
            .iter()
            .filter_map(|id| self.delegations.keys.get(id).map(|k| (id.clone(), k.clone())))
            .collect();
        Ok(BaseRole {
            name: child.clone(),
            keys,
            threshold: entry.threshold,
        })
    }
}

impl RoleBody for Targets {
    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn validate(&self, role: &RoleName) -> Result<(), TufError> {
        check_type(role, &self.kind, "Targets")?;
        let mut seen = BTreeSet::new();
        for d in &self.delegations.roles {
            if d.name.parent().as_ref() != Some(role) {
                return Err(invalid(role, format!("{} is not a direct child", d.name)));
            }
            if !seen.insert(d.name.clone()) {
                return Err(invalid(role, format!("{} is delegated twice", d.name)));
            }
            if d.threshold < 1 {
                return Err(invalid(role, format!("{} threshold must be at least 1", d.name)));
            }
            if let Some(missing) = d
                .keyids
                .iter()
                .find(|id| !self.delegations.keys.contains_key(*id))
            {
                return Err(invalid(role, format!("{} references unknown key {missing}", d.name)));
            }
        }
        for (name, meta) in &self.targets {
            if meta.length < 0 {
                return Err(invalid(role, format!("target {name} has a negative length")));
            }
        }
        Ok(())
    }
}

// ── Snapshot ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "_type")]
    pub kind: String,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, FileMeta>,
    pub version: u64,
}

impl Snapshot {
    pub fn new(expires: DateTime<Utc>) -> Self {
        Self {
            kind: "Snapshot".into(),
            expires,
            meta: BTreeMap::new(),
            version: 1,
        }
    }
}

impl RoleBody for Snapshot {
    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn validate(&self, role: &RoleName) -> Result<(), TufError> {
        check_type(role, &self.kind, "Snapshot")?;
        for required in [ROOT, TARGETS] {
            if !self.meta.contains_key(required) {
                return Err(invalid(role, format!("missing {required} checksum")));
            }
        }
        for meta in self.meta.values() {
            meta.validate_hashes(role.as_str())?;
        }
        Ok(())
    }
}

// ── Timestamp ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(rename = "_type")]
    pub kind: String,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, FileMeta>,
    pub version: u64,
}

impl Timestamp {
    pub fn new(snapshot: FileMeta, expires: DateTime<Utc>) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert(SNAPSHOT.to_string(), snapshot);
        Self {
            kind: "Timestamp".into(),
            expires,
            meta,
            version: 1,
        }
    }

    pub fn snapshot_meta(&self) -> Result<&FileMeta, TufError> {
        self.meta.get(SNAPSHOT).ok_or_else(|| TufError::MissingMeta {
            role: SNAPSHOT.to_string(),
        })
    }
}

impl RoleBody for Timestamp {
    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn validate(&self, role: &RoleName) -> Result<(), TufError> {
        check_type(role, &self.kind, "Timestamp")?;
        self.snapshot_meta()
            .map_err(|_| invalid(role, "missing snapshot checksum"))?
            .validate_hashes(role.as_str())
    }
}

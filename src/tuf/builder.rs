//! Single-shot repository builder.
//!
//! Roles are loaded one at a time. Each load checks signatures against the
//! already-trusted parent, versions, expiry and the checksums published by
//! snapshot/timestamp. Roles loaded before the snapshot are checksummed
//! retroactively once it arrives. After [`RepoBuilder::finish`] the builder
//! refuses all further input.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use super::data::{
    default_expiry, BaseRole, FileMeta, Gun, Root, RoleBody, RoleName, Signed, SignedMeta,
    Snapshot, Targets, Timestamp, ROOT, SNAPSHOT, TARGETS, TIMESTAMP,
};
use super::signed::{sign, verify_expiry, verify_signatures, verify_version};
use super::{TufError, MAX_DOWNLOAD_SIZE, MAX_TIMESTAMP_SIZE};
use crate::crypto::CryptoService;

/// A role that passed every check, with the exact bytes it was loaded from.
#[derive(Debug, Clone)]
pub struct Verified<T> {
    pub meta: SignedMeta<T>,
    pub raw: Vec<u8>,
    pub valid_signatures: BTreeSet<String>,
}

impl<T> Verified<T> {
    pub fn body(&self) -> &T {
        &self.meta.body
    }
}

/// The trusted output of a build.
#[derive(Debug, Clone, Default)]
pub struct Repo {
    pub root: Option<Verified<Root>>,
    pub targets: BTreeMap<RoleName, Verified<Targets>>,
    pub snapshot: Option<Verified<Snapshot>>,
    pub timestamp: Option<Verified<Timestamp>>,
}

/// A delegation that was rejected, kept for reporting.
#[derive(Debug, Clone)]
pub struct InvalidRole {
    pub envelope: Option<Signed>,
    pub reason: String,
}

/// What a consistent download of a role should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentInfo {
    pub role: RoleName,
    pub checksum: Option<String>,
    pub length: i64,
}

impl ConsistentInfo {
    pub fn checksum_known(&self) -> bool {
        self.checksum.is_some()
    }

    /// `<sha256>.<role>` when the checksum is known, the bare role otherwise.
    pub fn consistent_name(&self) -> String {
        match &self.checksum {
            Some(sum) => format!("{}.{}", sum, self.role),
            None => self.role.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct TrustedRoot {
    role: BaseRole,
    version: u64,
}

pub struct RepoBuilder {
    gun: Gun,
    crypto: Option<Arc<dyn CryptoService>>,
    prev_root: Option<TrustedRoot>,
    next_root_checksum: Option<FileMeta>,
    repo: Repo,
    invalid: BTreeMap<RoleName, InvalidRole>,
    not_checksummed: BTreeMap<RoleName, Vec<u8>>,
    finished: bool,
}

impl RepoBuilder {
    pub fn new(gun: Gun, crypto: Option<Arc<dyn CryptoService>>) -> Self {
        Self {
            gun,
            crypto,
            prev_root: None,
            next_root_checksum: None,
            repo: Repo::default(),
            invalid: BTreeMap::new(),
            not_checksummed: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn gun(&self) -> &Gun {
        &self.gun
    }

    pub fn is_loaded(&self, role: &RoleName) -> bool {
        if self.finished {
            return false;
        }
        match role.as_str() {
            ROOT => self.repo.root.is_some(),
            SNAPSHOT => self.repo.snapshot.is_some(),
            TIMESTAMP => self.repo.timestamp.is_some(),
            _ => self.repo.targets.contains_key(role),
        }
    }

    /// Version of a loaded role, or 0.
    pub fn loaded_version(&self, role: &RoleName) -> u64 {
        if self.finished {
            return 0;
        }
        match role.as_str() {
            ROOT => self.repo.root.as_ref().map_or(0, |r| r.meta.body.version),
            SNAPSHOT => self.repo.snapshot.as_ref().map_or(0, |r| r.meta.body.version),
            TIMESTAMP => self.repo.timestamp.as_ref().map_or(0, |r| r.meta.body.version),
            _ => self.repo.targets.get(role).map_or(0, |r| r.meta.body.version),
        }
    }

    /// Bytes a role was loaded from.
    pub fn loaded_raw(&self, role: &RoleName) -> Option<&[u8]> {
        if self.finished {
            return None;
        }
        match role.as_str() {
            ROOT => self.repo.root.as_ref().map(|r| r.raw.as_slice()),
            SNAPSHOT => self.repo.snapshot.as_ref().map(|r| r.raw.as_slice()),
            TIMESTAMP => self.repo.timestamp.as_ref().map(|r| r.raw.as_slice()),
            _ => self.repo.targets.get(role).map(|r| r.raw.as_slice()),
        }
    }

    pub fn load(
        &mut self,
        role: &RoleName,
        content: &[u8],
        min_version: u64,
        allow_expired: bool,
    ) -> Result<(), TufError> {
        self.check_prereqs(role)?;
        let limit = if role == &TIMESTAMP { MAX_TIMESTAMP_SIZE } else { MAX_DOWNLOAD_SIZE };
        if content.len() > limit {
            return Err(TufError::InvalidMetadata {
                role: role.to_string(),
                msg: format!("{} bytes exceeds the {} byte limit", content.len(), limit),
            });
        }
        match role.as_str() {
            ROOT => self.load_root(content, min_version, allow_expired),
            TIMESTAMP => self.load_timestamp(content, min_version, allow_expired),
            SNAPSHOT => self.load_snapshot(content, min_version, allow_expired),
            TARGETS => self.load_targets(content, min_version, allow_expired),
            _ => self.load_delegation(role, content, min_version, allow_expired),
        }
    }

    fn check_prereqs(&self, role: &RoleName) -> Result<(), TufError> {
        if self.finished {
            return Err(TufError::BuildDone);
        }
        if self.is_loaded(role) {
            return Err(TufError::InvalidBuilderInput(format!("{role} has already been loaded")));
        }
        if role != &ROOT && self.repo.root.is_none() {
            return Err(TufError::InvalidBuilderInput(format!(
                "root must be loaded before {role}"
            )));
        }
        if let Some(parent) = role.parent() {
            if !self.is_loaded(&parent) {
                return Err(TufError::InvalidBuilderInput(format!(
                    "{parent} must be loaded before {role}"
                )));
            }
        }
        Ok(())
    }

    fn trusted_root(&self) -> Result<&Root, TufError> {
        self.repo
            .root
            .as_ref()
            .map(|r| &r.meta.body)
            .ok_or_else(|| TufError::InvalidBuilderInput("root must be loaded first".into()))
    }

    /// Verify the common parts and wrap the role as trusted.
    fn verify_role<T: RoleBody>(
        role: &RoleName,
        meta: SignedMeta<T>,
        content: &[u8],
        base: &BaseRole,
        min_version: u64,
        allow_expired: bool,
    ) -> Result<Verified<T>, TufError> {
        let valid = verify_signatures(&meta.envelope, base)?;
        verify_version(role, meta.body.version(), min_version)?;
        if !allow_expired {
            verify_expiry(role, meta.body.expires())?;
        }
        Ok(Verified {
            meta,
            raw: content.to_vec(),
            valid_signatures: valid,
        })
    }

    /// Check `content` against the loaded snapshot. Returns false when no
    /// snapshot is loaded yet and the check has to happen later.
    fn checksum_against_snapshot(&self, role: &RoleName, content: &[u8]) -> Result<bool, TufError> {
        match &self.repo.snapshot {
            Some(snapshot) => {
                let entry = snapshot
                    .meta
                    .body
                    .meta
                    .get(role.as_str())
                    .ok_or_else(|| TufError::MissingMeta { role: role.to_string() })?;
                entry.check(role, content)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn load_root(&mut self, content: &[u8], min_version: u64, allow_expired: bool) -> Result<(), TufError> {
        let role = RoleName::root();
        let meta = SignedMeta::<Root>::from_bytes(&role, content)?;
        let new_role = meta.body.base_role(&role)?;

        // A rotated root must satisfy the previously trusted root as well.
        let mut valid = BTreeSet::new();
        if let Some(prev) = &self.prev_root {
            let new_version = meta.body.version;
            if new_version != prev.version && new_version != prev.version + 1 {
                return Err(TufError::RootVersion {
                    current: prev.version,
                    new: new_version,
                });
            }
            valid.extend(verify_signatures(&meta.envelope, &prev.role)?);
        }

        let mut verified = Self::verify_role(&role, meta, content, &new_role, min_version, allow_expired)?;
        verified.valid_signatures.extend(valid);
        self.repo.root = Some(verified);
        self.not_checksummed.insert(role, content.to_vec());
        Ok(())
    }

    fn load_timestamp(&mut self, content: &[u8], min_version: u64, allow_expired: bool) -> Result<(), TufError> {
        let role = RoleName::timestamp();
        let meta = SignedMeta::<Timestamp>::from_bytes(&role, content)?;
        let base = self.trusted_root()?.base_role(&role)?;
        let verified = Self::verify_role(&role, meta, content, &base, min_version, allow_expired)?;

        if let Some(snapshot) = &self.repo.snapshot {
            verified
                .meta
                .body
                .snapshot_meta()?
                .check(&RoleName::snapshot(), &snapshot.raw)?;
        }
        self.repo.timestamp = Some(verified);
        Ok(())
    }

    fn load_snapshot(&mut self, content: &[u8], min_version: u64, allow_expired: bool) -> Result<(), TufError> {
        let role = RoleName::snapshot();
        if let Some(timestamp) = &self.repo.timestamp {
            timestamp.meta.body.snapshot_meta()?.check(&role, content)?;
        }

        let meta = SignedMeta::<Snapshot>::from_bytes(&role, content)?;
        let base = self.trusted_root()?.base_role(&role)?;
        let verified = Self::verify_role(&role, meta, content, &base, min_version, allow_expired)?;

        for (loaded, bytes) in &self.not_checksummed {
            let entry = verified
                .meta
                .body
                .meta
                .get(loaded.as_str())
                .ok_or_else(|| TufError::MissingMeta { role: loaded.to_string() })?;
            entry.check(loaded, bytes)?;
        }
        self.not_checksummed.clear();
        self.repo.snapshot = Some(verified);
        Ok(())
    }

    fn load_targets(&mut self, content: &[u8], min_version: u64, allow_expired: bool) -> Result<(), TufError> {
        let role = RoleName::targets();
        let checked = self.checksum_against_snapshot(&role, content)?;
        let meta = SignedMeta::<Targets>::from_bytes(&role, content)?;
        let base = self.trusted_root()?.base_role(&role)?;
        let verified = Self::verify_role(&role, meta, content, &base, min_version, allow_expired)?;

        if !checked {
            self.not_checksummed.insert(role.clone(), content.to_vec());
        }
        self.repo.targets.insert(role, verified);
        Ok(())
    }

    /// Paths a role may sign for. Top-level targets may sign anything.
    fn effective_paths(&self, role: &RoleName) -> Vec<String> {
        if role == &TARGETS {
            return vec![String::new()];
        }
        role.parent()
            .and_then(|parent| self.repo.targets.get(&parent))
            .and_then(|parent| parent.meta.body.delegation(role))
            .map(|d| d.paths.clone())
            .unwrap_or_default()
    }

    fn load_delegation(
        &mut self,
        role: &RoleName,
        content: &[u8],
        min_version: u64,
        allow_expired: bool,
    ) -> Result<(), TufError> {
        let parent_name = role.parent().ok_or_else(|| TufError::InvalidRole {
            role: role.to_string(),
            reason: "not a delegation".into(),
        })?;
        let (entry, base) = {
            let parent = self.repo.targets.get(&parent_name).ok_or_else(|| {
                TufError::InvalidBuilderInput(format!("{parent_name} must be loaded before {role}"))
            })?;
            let entry = parent
                .meta
                .body
                .delegation(role)
                .cloned()
                .ok_or_else(|| TufError::InvalidRole {
                    role: role.to_string(),
                    reason: format!("not delegated by {parent_name}"),
                })?;
            (entry, parent.meta.body.delegation_base_role(role)?)
        };

        let parent_paths = self.effective_paths(&parent_name);
        if let Some(path) = entry
            .paths
            .iter()
            .find(|p| !parent_paths.iter().any(|pp| p.starts_with(pp.as_str())))
        {
            return Err(TufError::InvalidRole {
                role: role.to_string(),
                reason: format!("path {path:?} is outside the paths of {parent_name}"),
            });
        }

        let checked = self.checksum_against_snapshot(role, content)?;
        let meta = SignedMeta::<Targets>::from_bytes(role, content)?;
        let envelope = meta.envelope.clone();
        let verified = match Self::verify_role(role, meta, content, &base, min_version, allow_expired) {
            Ok(v) => v,
            Err(e) => {
                debug!("{}: rejecting delegation {}: {}", self.gun, role, e);
                self.invalid.insert(
                    role.clone(),
                    InvalidRole {
                        envelope: Some(envelope),
                        reason: e.to_string(),
                    },
                );
                return Err(TufError::BadTargets(format!("{role}: {e}")));
            }
        };

        if let Some(target) = verified
            .meta
            .body
            .targets
            .keys()
            .find(|name| !entry.paths.iter().any(|p| name.starts_with(p.as_str())))
        {
            return Err(TufError::InvalidRole {
                role: role.to_string(),
                reason: format!("target {target:?} is outside the delegated paths"),
            });
        }

        if !checked {
            self.not_checksummed.insert(role.clone(), content.to_vec());
        }
        self.repo.targets.insert(role.clone(), verified);
        Ok(())
    }

    fn generation_prereqs(&self, role: &RoleName) -> Result<Arc<dyn CryptoService>, TufError> {
        if self.finished {
            return Err(TufError::BuildDone);
        }
        if self.repo.root.is_none() {
            return Err(TufError::InvalidBuilderInput("root must be loaded first".into()));
        }
        if self.repo.timestamp.is_some() {
            return Err(TufError::InvalidBuilderInput(format!(
                "cannot generate {role} once the timestamp has been loaded"
            )));
        }
        self.crypto
            .clone()
            .ok_or_else(|| TufError::NoCryptoService(role.to_string()))
    }

    fn sign_body<T: RoleBody>(
        crypto: &dyn CryptoService,
        body: &T,
        base: &BaseRole,
    ) -> Result<(Signed, Vec<u8>, BTreeSet<String>), TufError> {
        let mut envelope = Signed::new_unsigned(body)?;
        let signed_by = sign(crypto, &mut envelope, base)?;
        let raw = envelope.to_bytes()?;
        Ok((envelope, raw, signed_by.into_iter().collect()))
    }

    /// Sign a new snapshot covering every role loaded so far, starting from
    /// `prev` when given. Returns the bytes and version.
    pub fn generate_snapshot(&mut self, prev: Option<&SignedMeta<Snapshot>>) -> Result<(Vec<u8>, u64), TufError> {
        let role = RoleName::snapshot();
        let crypto = self.generation_prereqs(&role)?;
        if self.repo.snapshot.is_some() {
            return Err(TufError::InvalidBuilderInput(
                "snapshot has already been loaded".into(),
            ));
        }

        let mut body = match prev {
            Some(prev) => {
                prev.body.validate(&role).map_err(|e| {
                    TufError::InvalidBuilderInput(format!("invalid previous snapshot: {e}"))
                })?;
                let mut body = prev.body.clone();
                body.version += 1;
                body
            }
            None => {
                if !self.repo.targets.contains_key(&RoleName::targets()) {
                    return Err(TufError::InvalidBuilderInput(
                        "targets must be loaded before generating a snapshot".into(),
                    ));
                }
                Snapshot::new(default_expiry(&role))
            }
        };
        body.expires = default_expiry(&role);
        for (loaded, bytes) in &self.not_checksummed {
            body.meta.insert(loaded.to_string(), FileMeta::from_bytes(bytes));
        }

        let base = self.trusted_root()?.base_role(&role)?;
        let (envelope, raw, signed_by) = Self::sign_body(crypto.as_ref(), &body, &base)?;
        let version = body.version;
        self.not_checksummed.clear();
        self.repo.snapshot = Some(Verified {
            meta: SignedMeta { body, envelope },
            raw: raw.clone(),
            valid_signatures: signed_by,
        });
        Ok((raw, version))
    }

    /// Sign a new timestamp over the loaded snapshot.
    pub fn generate_timestamp(&mut self, prev: Option<&SignedMeta<Timestamp>>) -> Result<(Vec<u8>, u64), TufError> {
        let role = RoleName::timestamp();
        let crypto = self.generation_prereqs(&role)?;
        let snapshot_raw = self
            .repo
            .snapshot
            .as_ref()
            .map(|s| s.raw.clone())
            .ok_or_else(|| TufError::InvalidBuilderInput("snapshot must be loaded first".into()))?;

        let version = match prev {
            Some(prev) => {
                prev.body.validate(&role).map_err(|e| {
                    TufError::InvalidBuilderInput(format!("invalid previous timestamp: {e}"))
                })?;
                prev.body.version + 1
            }
            None => 1,
        };
        let mut body = Timestamp::new(FileMeta::from_bytes(&snapshot_raw), default_expiry(&role));
        body.version = version;

        let base = self.trusted_root()?.base_role(&role)?;
        let (envelope, raw, signed_by) = Self::sign_body(crypto.as_ref(), &body, &base)?;
        self.repo.timestamp = Some(Verified {
            meta: SignedMeta { body, envelope },
            raw: raw.clone(),
            valid_signatures: signed_by,
        });
        Ok((raw, version))
    }

    pub fn consistent_info(&self, role: &RoleName) -> ConsistentInfo {
        let mut info = ConsistentInfo {
            role: role.clone(),
            checksum: None,
            length: -1,
        };
        if role == &TIMESTAMP {
            info.length = MAX_TIMESTAMP_SIZE as i64;
            return info;
        }
        if self.finished {
            return info;
        }
        let meta = match role.as_str() {
            SNAPSHOT => self
                .repo
                .timestamp
                .as_ref()
                .and_then(|t| t.meta.body.meta.get(SNAPSHOT).cloned()),
            ROOT if self.repo.snapshot.is_none() => self.next_root_checksum.clone(),
            _ => self
                .repo
                .snapshot
                .as_ref()
                .and_then(|s| s.meta.body.meta.get(role.as_str()).cloned()),
        };
        if let Some(meta) = meta {
            info.checksum = meta.sha256_hex();
            info.length = meta.length;
        }
        info
    }

    /// A fresh builder that trusts the current root as the previous root,
    /// for validating a root rotation.
    pub fn bootstrap_new_builder(&self) -> RepoBuilder {
        let prev_root = self.repo.root.as_ref().and_then(|r| {
            r.meta
                .body
                .base_role(&RoleName::root())
                .ok()
                .map(|role| TrustedRoot {
                    role,
                    version: r.meta.body.version,
                })
        });
        let next_root_checksum = self
            .repo
            .snapshot
            .as_ref()
            .and_then(|s| s.meta.body.meta.get(ROOT).cloned());
        RepoBuilder {
            gun: self.gun.clone(),
            crypto: self.crypto.clone(),
            prev_root,
            next_root_checksum,
            repo: Repo::default(),
            invalid: BTreeMap::new(),
            not_checksummed: BTreeMap::new(),
            finished: false,
        }
    }

    /// Hand out the trusted repo and the rejected delegations. The builder
    /// accepts nothing afterwards.
    pub fn finish(&mut self) -> Result<(Repo, BTreeMap<RoleName, InvalidRole>), TufError> {
        if self.finished {
            return Err(TufError::BuildDone);
        }
        self.finished = true;
        Ok((
            std::mem::take(&mut self.repo),
            std::mem::take(&mut self.invalid),
        ))
    }
}

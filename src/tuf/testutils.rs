//! Fixtures for building signed repositories in tests.
//!
//! A [`RepoFixture`] owns the "client" keys for root, targets and any
//! delegations, plus a handle to the crypto service the server signs with.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use super::data::{
    DelegationRole, FileMeta, Gun, Root, RoleBody, RoleName, RootRole, Signed, Snapshot, Targets,
    Timestamp, BASE_ROLES, ROOT, SNAPSHOT, TIMESTAMP,
};
use super::signed::sign_with_keys;
use super::{RepoBuilder, TufError};
use crate::crypto::{CryptoService, KeyAlgorithm, MemoryCryptoService, PublicKey};

#[derive(Clone)]
pub struct RepoFixture {
    pub gun: Gun,
    pub local: Arc<MemoryCryptoService>,
    pub server: Arc<dyn CryptoService>,
    pub root: Root,
    pub targets: BTreeMap<RoleName, Targets>,
    pub snapshot: Snapshot,
    pub timestamp: Timestamp,
    pub server_snapshot: bool,
    old_root_keys: Vec<PublicKey>,
}

impl RepoFixture {
    /// Every key lives in one local service that also acts as the server's.
    pub fn new(gun: &str) -> Result<Self, TufError> {
        let local = Arc::new(MemoryCryptoService::new());
        let server: Arc<dyn CryptoService> = local.clone();
        Self::build(gun, local, server, false)
    }

    /// Timestamp (and optionally snapshot) keys are created in `server`.
    pub fn with_server(gun: &str, server: Arc<dyn CryptoService>, server_snapshot: bool) -> Result<Self, TufError> {
        Self::build(gun, Arc::new(MemoryCryptoService::new()), server, server_snapshot)
    }

    fn build(
        gun: &str,
        local: Arc<MemoryCryptoService>,
        server: Arc<dyn CryptoService>,
        server_snapshot: bool,
    ) -> Result<Self, TufError> {
        let gun = Gun::from(gun);
        let expires = Utc::now() + Duration::days(365);
        let mut keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for base in BASE_ROLES {
            let role = RoleName::parse(base)?;
            let server_held = base == TIMESTAMP || (base == SNAPSHOT && server_snapshot);
            let key = if server_held {
                server.create(&gun, &role, KeyAlgorithm::Ecdsa)?
            } else {
                local.create(&gun, &role, KeyAlgorithm::Ed25519)?
            };
            roles.insert(
                base.to_string(),
                RootRole {
                    keyids: vec![key.id()],
                    threshold: 1,
                },
            );
            keys.insert(key.id(), key);
        }

        let mut targets = BTreeMap::new();
        targets.insert(RoleName::targets(), Targets::new(expires));
        Ok(Self {
            gun,
            local,
            server,
            root: Root::new(keys, roles, expires),
            targets,
            snapshot: Snapshot::new(expires),
            timestamp: Timestamp::new(FileMeta::from_bytes(b""), expires),
            server_snapshot,
            old_root_keys: Vec::new(),
        })
    }

    /// A builder signing with the server's keys.
    pub fn builder(&self) -> RepoBuilder {
        RepoBuilder::new(self.gun.clone(), Some(Arc::clone(&self.server)))
    }

    pub fn targets_mut(&mut self, role: &str) -> Result<&mut Targets, TufError> {
        let role = RoleName::parse(role)?;
        self.targets.get_mut(&role).ok_or_else(|| TufError::InvalidRole {
            role: role.to_string(),
            reason: "not part of the fixture".into(),
        })
    }

    pub fn add_target(&mut self, role: &str, name: &str, content: &[u8]) -> Result<(), TufError> {
        self.targets_mut(role)?
            .targets
            .insert(name.to_string(), FileMeta::from_bytes(content));
        Ok(())
    }

    pub fn add_delegation(&mut self, parent: &str, child: &str, paths: &[&str]) -> Result<(), TufError> {
        let child = RoleName::parse(child)?;
        let key = self.local.create(&self.gun, &child, KeyAlgorithm::Ed25519)?;
        let parent = self.targets_mut(parent)?;
        parent.delegations.keys.insert(key.id(), key.clone());
        parent.delegations.roles.push(DelegationRole {
            name: child.clone(),
            keyids: vec![key.id()],
            threshold: 1,
            paths: paths.iter().map(|p| p.to_string()).collect(),
        });
        let expires = parent.expires;
        self.targets.insert(child, Targets::new(expires));
        Ok(())
    }

    /// Forget the private keys of `role` so its metadata goes out unsigned.
    pub fn drop_signing_key(&mut self, role: &RoleName) {
        for id in self.local.list_keys(&self.gun, role) {
            let _ = self.local.remove_key(&id);
        }
    }

    /// Replace the root key; the old keys still co-sign the next root.
    pub fn rotate_root_key(&mut self) -> Result<(), TufError> {
        let role = RoleName::root();
        let old = self.root.base_role(&role)?;
        let key = self.local.create(&self.gun, &role, KeyAlgorithm::Ed25519)?;
        self.old_root_keys = old.keys.values().cloned().collect();
        for id in old.keys.keys() {
            self.root.keys.remove(id);
        }
        self.root.keys.insert(key.id(), key.clone());
        if let Some(entry) = self.root.roles.get_mut(ROOT) {
            entry.keyids = vec![key.id()];
        }
        self.root.version += 1;
        Ok(())
    }

    /// Point a base role at a fresh server-held key.
    pub fn rotate_server_key(&mut self, role: &RoleName) -> Result<PublicKey, TufError> {
        let key = self.server.create(&self.gun, role, KeyAlgorithm::Ecdsa)?;
        self.use_server_key(role, key.clone());
        Ok(key)
    }

    /// Make `key`, created elsewhere, the only key of a base role in root.
    pub fn use_server_key(&mut self, role: &RoleName, key: PublicKey) {
        if let Some(entry) = self.root.roles.get_mut(role.as_str()) {
            for id in entry.keyids.drain(..) {
                self.root.keys.remove(&id);
            }
            entry.keyids.push(key.id());
        }
        self.root.keys.insert(key.id(), key);
    }

    pub fn bump(&mut self, role: &RoleName) {
        match role.as_str() {
            ROOT => self.root.version += 1,
            SNAPSHOT => self.snapshot.version += 1,
            TIMESTAMP => self.timestamp.version += 1,
            _ => {
                if let Some(t) = self.targets.get_mut(role) {
                    t.version += 1;
                }
            }
        }
    }

    fn keys_for(&self, role: &RoleName) -> Result<Vec<PublicKey>, TufError> {
        if role.is_delegation() {
            let parent = role.parent().and_then(|p| self.targets.get(&p)).ok_or_else(|| {
                TufError::InvalidRole {
                    role: role.to_string(),
                    reason: "parent is not part of the fixture".into(),
                }
            })?;
            return Ok(parent.delegation_base_role(role)?.keys.into_values().collect());
        }
        let mut keys: Vec<PublicKey> = self.root.base_role(role)?.keys.into_values().collect();
        if role == &ROOT {
            keys.extend(self.old_root_keys.iter().cloned());
        }
        Ok(keys)
    }

    fn sign_body<T: RoleBody>(&self, body: &T, keys: &[PublicKey]) -> Result<Vec<u8>, TufError> {
        let mut envelope = Signed::new_unsigned(body)?;
        let services: [&dyn CryptoService; 2] = [self.local.as_ref(), self.server.as_ref()];
        sign_with_keys(&services, &mut envelope, keys)?;
        envelope.to_bytes()
    }

    /// Sign root or a targets role as it currently stands.
    pub fn sign_role(&self, role: &RoleName) -> Result<Vec<u8>, TufError> {
        let keys = self.keys_for(role)?;
        match role.as_str() {
            ROOT => self.sign_body(&self.root, &keys),
            SNAPSHOT | TIMESTAMP => Err(TufError::InvalidBuilderInput(
                "snapshot and timestamp are signed through sign_all".into(),
            )),
            _ => {
                let body = self.targets.get(role).ok_or_else(|| TufError::InvalidRole {
                    role: role.to_string(),
                    reason: "not part of the fixture".into(),
                })?;
                self.sign_body(body, &keys)
            }
        }
    }

    /// Root signed by the current root keys only.
    pub fn sign_root_without_old_keys(&self) -> Result<Vec<u8>, TufError> {
        let keys: Vec<PublicKey> = self.root.base_role(&RoleName::root())?.keys.into_values().collect();
        self.sign_body(&self.root, &keys)
    }

    /// Root signed by the keys of the previous root only.
    pub fn sign_root_with_old_keys_only(&self) -> Result<Vec<u8>, TufError> {
        self.sign_body(&self.root, &self.old_root_keys)
    }

    /// Every role, with snapshot and timestamp checksums computed over the
    /// freshly signed files.
    pub fn sign_all(&self) -> Result<BTreeMap<RoleName, Vec<u8>>, TufError> {
        let mut files = BTreeMap::new();
        files.insert(RoleName::root(), self.sign_role(&RoleName::root())?);
        for role in self.targets.keys() {
            files.insert(role.clone(), self.sign_role(role)?);
        }

        let mut snapshot = self.snapshot.clone();
        for (role, bytes) in &files {
            snapshot.meta.insert(role.to_string(), FileMeta::from_bytes(bytes));
        }
        let snapshot_bytes = self.sign_body(&snapshot, &self.keys_for(&RoleName::snapshot())?)?;

        let mut timestamp = self.timestamp.clone();
        timestamp
            .meta
            .insert(SNAPSHOT.to_string(), FileMeta::from_bytes(&snapshot_bytes));
        let timestamp_bytes = self.sign_body(&timestamp, &self.keys_for(&RoleName::timestamp())?)?;

        files.insert(RoleName::snapshot(), snapshot_bytes);
        files.insert(RoleName::timestamp(), timestamp_bytes);
        Ok(files)
    }

    /// `(filename, bytes)` pairs a client would upload: root, every targets
    /// role and the snapshot unless the server holds its key.
    pub fn upload_parts(&self) -> Result<Vec<(String, Vec<u8>)>, TufError> {
        let files = self.sign_all()?;
        Ok(files
            .into_iter()
            .filter(|(role, _)| {
                role != &TIMESTAMP && !(role == &SNAPSHOT && self.server_snapshot)
            })
            .map(|(role, bytes)| (format!("{role}.json"), bytes))
            .collect())
    }

    /// Only the named roles, as upload parts.
    pub fn upload_parts_for(&self, roles: &[&str]) -> Result<Vec<(String, Vec<u8>)>, TufError> {
        let files = self.sign_all()?;
        Ok(files
            .into_iter()
            .filter(|(role, _)| roles.contains(&role.as_str()))
            .map(|(role, bytes)| (format!("{role}.json"), bytes))
            .collect())
    }
}

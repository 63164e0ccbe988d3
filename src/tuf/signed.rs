//! Signing and verification of envelopes against a role's keys and threshold.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::data::{BaseRole, RoleName, Signature, Signed};
use super::TufError;
use crate::crypto::{CryptoService, PublicKey};

/// Check that at least `role.threshold` distinct keys of `role` signed the
/// canonical `signed` section. Returns the IDs of the keys that verified.
///
/// Signatures from unknown keys are ignored and duplicate key IDs count once.
pub fn verify_signatures(envelope: &Signed, role: &BaseRole) -> Result<BTreeSet<String>, TufError> {
    if role.threshold < 1 {
        return Err(TufError::InvalidRole {
            role: role.name.to_string(),
            reason: "threshold must be at least 1".into(),
        });
    }
    if envelope.signatures.is_empty() {
        return Err(TufError::NoSignatures {
            role: role.name.to_string(),
        });
    }

    let msg = envelope.canonical_signed()?;
    let mut valid = BTreeSet::new();
    for sig in &envelope.signatures {
        if valid.contains(&sig.keyid) {
            continue;
        }
        let Some(key) = role.keys.get(&sig.keyid) else {
            debug!("{}: ignoring signature from unknown key {}", role.name, sig.keyid);
            continue;
        };
        match key.verify(sig.method, &msg, &sig.sig.0) {
            Ok(()) => {
                valid.insert(sig.keyid.clone());
            }
            Err(e) => debug!("{}: signature by {} is invalid: {}", role.name, sig.keyid, e),
        }
    }

    if valid.len() < role.threshold as usize {
        return Err(TufError::RoleThreshold {
            role: role.name.to_string(),
            needed: role.threshold,
            found: valid.len(),
        });
    }
    Ok(valid)
}

pub fn verify_expiry(role: &RoleName, expires: DateTime<Utc>) -> Result<(), TufError> {
    if expires <= Utc::now() {
        return Err(TufError::Expired {
            role: role.to_string(),
            expired_at: expires.to_rfc3339(),
        });
    }
    Ok(())
}

pub fn verify_version(role: &RoleName, actual: u64, minimum: u64) -> Result<(), TufError> {
    if actual < minimum {
        return Err(TufError::LowVersion {
            role: role.to_string(),
            actual,
            minimum,
        });
    }
    Ok(())
}

/// Add a signature for every key in `keys` whose private half one of
/// `services` holds. Existing signatures by the same keys are replaced.
/// Returns the IDs that produced a signature.
pub fn sign_with_keys(
    services: &[&dyn CryptoService],
    envelope: &mut Signed,
    keys: &[PublicKey],
) -> Result<Vec<String>, TufError> {
    let msg = envelope.canonical_signed()?;
    let mut signed_by = Vec::new();
    for key in keys {
        let id = key.id();
        let Some((private, _)) = services.iter().find_map(|svc| svc.get_private_key(&id)) else {
            continue;
        };
        let sig = private.sign(&msg)?;
        envelope.signatures.retain(|s| s.keyid != id);
        envelope.signatures.push(Signature {
            keyid: id.clone(),
            method: private.algorithm().signature_method(),
            sig: sig.into(),
        });
        signed_by.push(id);
    }
    Ok(signed_by)
}

/// Sign for `role` and require that the threshold was reached.
pub fn sign(crypto: &dyn CryptoService, envelope: &mut Signed, role: &BaseRole) -> Result<Vec<String>, TufError> {
    if role.keys.is_empty() {
        return Err(TufError::NoKeys {
            role: role.name.to_string(),
        });
    }
    let keys: Vec<PublicKey> = role.keys.values().cloned().collect();
    let signed_by = sign_with_keys(&[crypto], envelope, &keys)?;
    if signed_by.len() < role.threshold as usize {
        return Err(TufError::InsufficientSignatures {
            role: role.name.to_string(),
            needed: role.threshold,
            found: signed_by.len(),
        });
    }
    Ok(signed_by)
}

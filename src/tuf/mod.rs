//! TUF metadata engine: data model, canonical encoding, signature checks and
//! the single-shot [`RepoBuilder`] that cross-validates a repository.

pub mod builder;
pub mod canonical;
pub mod data;
pub mod signed;
pub mod testutils;

pub use builder::{ConsistentInfo, InvalidRole, Repo, RepoBuilder, Verified};
pub use data::{
    BaseRole, Base64Bytes, DelegationRole, Delegations, FileMeta, Gun, Root, RoleName, RootRole,
    Signature, Signed, SignedMeta, Snapshot, Targets, Timestamp,
};

use crate::crypto::CryptoError;

/// Upper bound for any single piece of metadata accepted by the server.
pub const MAX_DOWNLOAD_SIZE: usize = 100 << 20;

/// Fixed size budget for a timestamp, which is never covered by a checksum.
pub const MAX_TIMESTAMP_SIZE: usize = 1 << 20;

/// Errors raised while parsing, validating, signing or building TUF metadata.
#[derive(Debug, thiserror::Error)]
pub enum TufError {
    #[error("the builder has finished building and cannot accept any more input or produce any more output")]
    BuildDone,

    #[error("invalid builder input: {0}")]
    InvalidBuilderInput(String),

    #[error("{role} is an invalid role: {reason}")]
    InvalidRole { role: String, reason: String },

    #[error("{role} metadata is invalid: {msg}")]
    InvalidMetadata { role: String, msg: String },

    #[error("{role} checksum does not match the published checksum {expected}")]
    MismatchedChecksum { role: String, expected: String },

    #[error("no checksum published for {role}")]
    MissingMeta { role: String },

    #[error("{role} is signed by {found} valid key(s), {needed} required")]
    RoleThreshold {
        role: String,
        needed: u32,
        found: usize,
    },

    #[error("{role} has no signatures")]
    NoSignatures { role: String },

    #[error("could only produce {found} signature(s) for {role}, {needed} required")]
    InsufficientSignatures {
        role: String,
        needed: u32,
        found: usize,
    },

    #[error("no signing keys available for {role}")]
    NoKeys { role: String },

    #[error("no crypto service available to sign {0}")]
    NoCryptoService(String),

    #[error("{role} expired at {expired_at}")]
    Expired { role: String, expired_at: String },

    #[error("{role} version {actual} is lower than the minimum {minimum}")]
    LowVersion {
        role: String,
        actual: u64,
        minimum: u64,
    },

    #[error("root version {new} must equal {current} or {current}+1")]
    RootVersion { current: u64, new: u64 },

    #[error("bad targets: {0}")]
    BadTargets(String),

    #[error("malformed metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

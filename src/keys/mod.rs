//! Encryption key hierarchy
//!
//! Data Encryption Keys (DEKs) are issued per scope (`GLOBAL`,
//! `STORAGE_BACKEND`, `VM`, `CONTAINER`), wrapped with a Key Encryption Key
//! (KEK) that only ever lives in process configuration, and persisted through
//! a [`KeyStore`]. Rotation issues a new version and leaves every older
//! version in place so existing backups remain decryptable.

/// Key lifecycle audit trail.
pub mod audit;
/// DEK lifecycle per scope.
pub mod hierarchy;
/// PostgreSQL key store.
pub mod postgres;
/// Key store seam and in-memory store.
pub mod store;
/// Scopes, targets and key records.
pub mod types;
/// Master keys and DEK wrapping.
pub mod wrap;

pub use audit::{KeyAuditEvent, KeyAuditLog, KeyEventKind};
pub use hierarchy::{KeyHierarchy, KeyReferences};
pub use postgres::{PostgresKeyStore, PostgresKeyStoreConfig};
pub use store::{KeyStore, MemoryKeyStore};
pub use types::{
    EncryptionKey, EncryptionScheme, EncryptionStrategy, ImportSummary, KeyAlgorithm, KeyExport,
    KeyHandle, KeyScope, KeyTarget,
};
pub use wrap::{Keyring, MasterKey, WrappedKey};

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the key hierarchy and key stores
#[derive(Error, Debug)]
pub enum KeyError {
    /// No key for the given id or target.
    #[error("No active encryption key for {0}")]
    KeyNotFound(String),

    /// The target already has an active key.
    #[error("An active encryption key already exists for {0}")]
    DuplicateActiveKey(String),

    /// The target already has a key with this version number.
    #[error("Version {version} of the key for {target} already exists")]
    DuplicateKeyVersion {
        /// Target the key belongs to.
        target: String,
        /// Version already taken.
        version: u32,
    },

    /// Backups still reference the key.
    #[error("Key {key_id} is still referenced by {references} backup(s)")]
    KeyInUse {
        /// Key that was to be deleted.
        key_id: Uuid,
        /// Backups still encrypted with it.
        references: usize,
    },

    /// Active keys must be rotated out before deletion.
    #[error("Key {0} is active and cannot be deleted")]
    ActiveKeyDelete(Uuid),

    /// The DEK was wrapped under a master key that is not loaded.
    #[error("Master key {0} is not loaded")]
    UnknownMasterKey(String),

    /// Master key material could not be loaded.
    #[error("Invalid master key: {0}")]
    InvalidMasterKey(String),

    /// Wrapping or unwrapping failed.
    #[error("Key wrapping error: {0}")]
    Wrap(String),

    /// Backing store failure.
    #[error("Key storage error: {0}")]
    Storage(String),
}

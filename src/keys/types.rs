// Key hierarchy types - scopes, targets and the persisted key record

use super::wrap::WrappedKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Scope of an encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyScope {
    /// One key for everything that has no narrower key.
    Global,
    /// Per storage backend.
    StorageBackend,
    /// Per virtual machine.
    Vm,
    /// Per container.
    Container,
}

impl KeyScope {
    /// Persisted label.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Global => "GLOBAL",
            KeyScope::StorageBackend => "STORAGE_BACKEND",
            KeyScope::Vm => "VM",
            KeyScope::Container => "CONTAINER",
        }
    }

    /// Inverse of [`KeyScope::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GLOBAL" => Some(KeyScope::Global),
            "STORAGE_BACKEND" => Some(KeyScope::StorageBackend),
            "VM" => Some(KeyScope::Vm),
            "CONTAINER" => Some(KeyScope::Container),
            _ => None,
        }
    }
}

/// A (scope, reference id) pair. Only `Global` carries no reference id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "reference_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyTarget {
    /// The global scope.
    Global,
    /// A storage backend, by id.
    StorageBackend(String),
    /// A virtual machine, by id.
    Vm(String),
    /// A container, by id.
    Container(String),
}

impl KeyTarget {
    /// Scope of the target.
    pub fn scope(&self) -> KeyScope {
        match self {
            KeyTarget::Global => KeyScope::Global,
            KeyTarget::StorageBackend(_) => KeyScope::StorageBackend,
            KeyTarget::Vm(_) => KeyScope::Vm,
            KeyTarget::Container(_) => KeyScope::Container,
        }
    }

    /// `None` for the global target.
    pub fn reference_id(&self) -> Option<&str> {
        match self {
            KeyTarget::Global => None,
            KeyTarget::StorageBackend(id) | KeyTarget::Vm(id) | KeyTarget::Container(id) => {
                Some(id.as_str())
            }
        }
    }

    /// Rebuild a target from its persisted column pair.
    pub fn from_parts(scope: KeyScope, reference_id: Option<String>) -> Option<Self> {
        match (scope, reference_id) {
            (KeyScope::Global, None) => Some(KeyTarget::Global),
            (KeyScope::StorageBackend, Some(id)) => Some(KeyTarget::StorageBackend(id)),
            (KeyScope::Vm, Some(id)) => Some(KeyTarget::Vm(id)),
            (KeyScope::Container, Some(id)) => Some(KeyTarget::Container(id)),
            _ => None,
        }
    }

    /// Whether this is the global target.
    pub fn is_global(&self) -> bool {
        matches!(self, KeyTarget::Global)
    }
}

impl fmt::Display for KeyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reference_id() {
            Some(id) => write!(f, "{}:{}", self.scope().as_str(), id),
            None => f.write_str(self.scope().as_str()),
        }
    }
}

/// Algorithm the DEK is meant for when encrypting backup streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// AES-256 in GCM mode.
    Aes256Gcm,
    /// ChaCha20-Poly1305.
    ChaCha20Poly1305,
}

impl KeyAlgorithm {
    /// DEK length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            KeyAlgorithm::Aes256Gcm | KeyAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Persisted label.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Aes256Gcm => "aes-256-gcm",
            KeyAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Inverse of `as_str`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aes-256-gcm" => Some(KeyAlgorithm::Aes256Gcm),
            "chacha20-poly1305" => Some(KeyAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Aes256Gcm
    }
}

/// How a storage backend wants its backups encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionStrategy {
    /// Backups are written unencrypted.
    Disabled,
    /// Always the global key.
    Global,
    /// The backend's own key.
    StorageBackend,
    /// A key per VM or container.
    PerWorkload,
}

/// Scheme tag recorded on a backup, derived from the key that was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionScheme {
    /// Encrypted with the global key.
    Global,
    /// Encrypted with a storage backend key.
    Storage,
    /// Encrypted with a VM key.
    Vm,
    /// Encrypted with a container key.
    Container,
}

impl From<KeyScope> for EncryptionScheme {
    fn from(scope: KeyScope) -> Self {
        match scope {
            KeyScope::Global => EncryptionScheme::Global,
            KeyScope::StorageBackend => EncryptionScheme::Storage,
            KeyScope::Vm => EncryptionScheme::Vm,
            KeyScope::Container => EncryptionScheme::Container,
        }
    }
}

/// Persisted encryption key record. Only the wrapped DEK is ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Unique id.
    pub id: Uuid,
    /// Scope and reference the key belongs to.
    pub target: KeyTarget,
    /// DEK wrapped under a master key.
    pub wrapped_key: WrappedKey,
    /// Starts at 1, unique per target.
    pub version: u32,
    /// Cipher the DEK is used with.
    pub algorithm: KeyAlgorithm,
    /// At most one active key per target.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When a newer version replaced this one.
    pub rotated_at: Option<DateTime<Utc>>,
    /// Free-form labels.
    pub metadata: HashMap<String, String>,
}

impl EncryptionKey {
    /// Scope of the target.
    pub fn scope(&self) -> KeyScope {
        self.target.scope()
    }

    /// Handle that identifies this key without exposing it.
    pub fn handle(&self) -> KeyHandle {
        KeyHandle {
            key_id: self.id,
            target: self.target.clone(),
            version: self.version,
            algorithm: self.algorithm,
        }
    }
}

/// Reference handed to the execution collaborator in place of key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    /// Id of the referenced key.
    pub key_id: Uuid,
    /// Scope and reference of the key.
    pub target: KeyTarget,
    /// Version of the key.
    pub version: u32,
    /// Cipher the DEK is used with.
    pub algorithm: KeyAlgorithm,
}

/// Disaster-recovery bundle of wrapped keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExport {
    /// Export time.
    pub exported_at: DateTime<Utc>,
    /// Master key that was current at export time.
    pub master_key_id: String,
    /// Every key version, wrapped.
    pub keys: Vec<EncryptionKey>,
}

/// Outcome of importing a [`KeyExport`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Keys inserted.
    pub imported: usize,
    /// Keys already present by id.
    pub skipped_existing: usize,
    /// Keys refused because of an active key or version clash.
    pub conflicts: Vec<Uuid>,
    /// Keys wrapped under a master key this process does not hold.
    pub unknown_master_keys: usize,
}

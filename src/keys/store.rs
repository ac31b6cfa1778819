// Key Store Adapter - durable storage seam for encryption key records

use super::types::{EncryptionKey, KeyTarget};
use super::KeyError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Storage for [`EncryptionKey`] rows.
///
/// Implementations must make `rotate` atomic: a concurrent `find_active`
/// observes either the old or the new active key, never zero or two.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load a key by id.
    async fn get(&self, id: Uuid) -> Result<Option<EncryptionKey>, KeyError>;

    /// Active key for exactly `target`, with no fallback.
    async fn find_active(&self, target: &KeyTarget) -> Result<Option<EncryptionKey>, KeyError>;

    /// Insert a new active key. Fails with `DuplicateActiveKey` when the
    /// target already has one.
    async fn insert_active(&self, key: &EncryptionKey) -> Result<(), KeyError>;

    /// Deactivate `current_id` and insert `replacement` as one unit. Fails
    /// with `KeyNotFound` if `current_id` is no longer the active key.
    async fn rotate(
        &self,
        current_id: Uuid,
        rotated_at: DateTime<Utc>,
        replacement: &EncryptionKey,
    ) -> Result<(), KeyError>;

    /// Insert a key carried over from an export. Returns `false` when a
    /// record with the same id is already present.
    async fn insert_imported(&self, key: &EncryptionKey) -> Result<bool, KeyError>;

    /// Every key, ordered by target and version.
    async fn list(&self) -> Result<Vec<EncryptionKey>, KeyError>;

    /// Every version ever issued for `target`, oldest first.
    async fn versions(&self, target: &KeyTarget) -> Result<Vec<EncryptionKey>, KeyError>;

    /// Remove an inactive key. Fails with `ActiveKeyDelete` otherwise.
    async fn delete(&self, id: Uuid) -> Result<(), KeyError>;
}

#[derive(Default)]
struct KeyTables {
    keys: HashMap<Uuid, EncryptionKey>,
    active: HashMap<KeyTarget, Uuid>,
}

impl KeyTables {
    fn check_version_free(&self, key: &EncryptionKey) -> Result<(), KeyError> {
        let taken = self
            .keys
            .values()
            .any(|k| k.target == key.target && k.version == key.version && k.id != key.id);
        if taken {
            return Err(KeyError::DuplicateKeyVersion {
                target: key.target.to_string(),
                version: key.version,
            });
        }
        Ok(())
    }
}

/// In-memory key store. One lock covers both tables so rotation is atomic.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    tables: Arc<RwLock<KeyTables>>,
}

impl MemoryKeyStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of key records.
    pub fn len(&self) -> usize {
        self.tables.read().keys.len()
    }

    /// Whether no key has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, id: Uuid) -> Result<Option<EncryptionKey>, KeyError> {
        Ok(self.tables.read().keys.get(&id).cloned())
    }

    async fn find_active(&self, target: &KeyTarget) -> Result<Option<EncryptionKey>, KeyError> {
        let tables = self.tables.read();
        Ok(tables
            .active
            .get(target)
            .and_then(|id| tables.keys.get(id))
            .cloned())
    }

    async fn insert_active(&self, key: &EncryptionKey) -> Result<(), KeyError> {
        let mut tables = self.tables.write();
        if tables.active.contains_key(&key.target) {
            return Err(KeyError::DuplicateActiveKey(key.target.to_string()));
        }
        tables.check_version_free(key)?;
        tables.active.insert(key.target.clone(), key.id);
        tables.keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn rotate(
        &self,
        current_id: Uuid,
        rotated_at: DateTime<Utc>,
        replacement: &EncryptionKey,
    ) -> Result<(), KeyError> {
        let mut tables = self.tables.write();
        if tables.active.get(&replacement.target) != Some(&current_id) {
            return Err(KeyError::KeyNotFound(format!(
                "{} is not the active key for {}",
                current_id, replacement.target
            )));
        }
        tables.check_version_free(replacement)?;
        let current = tables
            .keys
            .get_mut(&current_id)
            .ok_or_else(|| KeyError::KeyNotFound(current_id.to_string()))?;
        current.active = false;
        current.rotated_at = Some(rotated_at);

        tables.active.insert(replacement.target.clone(), replacement.id);
        tables.keys.insert(replacement.id, replacement.clone());
        Ok(())
    }

    async fn insert_imported(&self, key: &EncryptionKey) -> Result<bool, KeyError> {
        let mut tables = self.tables.write();
        if tables.keys.contains_key(&key.id) {
            return Ok(false);
        }
        tables.check_version_free(key)?;
        if key.active {
            if tables.active.contains_key(&key.target) {
                return Err(KeyError::DuplicateActiveKey(key.target.to_string()));
            }
            tables.active.insert(key.target.clone(), key.id);
        }
        tables.keys.insert(key.id, key.clone());
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<EncryptionKey>, KeyError> {
        let mut keys: Vec<EncryptionKey> = self.tables.read().keys.values().cloned().collect();
        keys.sort_by(|a, b| {
            a.target
                .to_string()
                .cmp(&b.target.to_string())
                .then(a.version.cmp(&b.version))
        });
        Ok(keys)
    }

    async fn versions(&self, target: &KeyTarget) -> Result<Vec<EncryptionKey>, KeyError> {
        let mut keys: Vec<EncryptionKey> = self
            .tables
            .read()
            .keys
            .values()
            .filter(|k| &k.target == target)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.version);
        Ok(keys)
    }

    async fn delete(&self, id: Uuid) -> Result<(), KeyError> {
        let mut tables = self.tables.write();
        match tables.keys.get(&id) {
            None => Err(KeyError::KeyNotFound(id.to_string())),
            Some(key) if key.active => Err(KeyError::ActiveKeyDelete(id)),
            Some(_) => {
                tables.keys.remove(&id);
                Ok(())
            }
        }
    }
}

// Encryption Key Hierarchy - DEK lifecycle per scope, wrapped under the KEK

use super::audit::{KeyAuditEvent, KeyAuditLog, KeyEventKind};
use super::store::KeyStore;
use super::types::{EncryptionKey, ImportSummary, KeyAlgorithm, KeyExport, KeyHandle, KeyTarget};
use super::wrap::{Keyring, MasterKey};
use super::KeyError;
use crate::config::KeyHierarchyConfig;
use crate::metrics;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Answers how many backups still point at a key.
#[async_trait]
pub trait KeyReferences: Send + Sync {
    /// Backups encrypted with `key_id`.
    async fn count_key_references(&self, key_id: Uuid) -> Result<usize, KeyError>;
}

/// Issues, rotates, unwraps and retires DEKs for every key scope.
///
/// Writes for one target are serialized by a per-target lock; the store
/// additionally enforces a single active key per target.
#[derive(Clone)]
pub struct KeyHierarchy {
    store: Arc<dyn KeyStore>,
    keyring: Arc<Keyring>,
    audit: KeyAuditLog,
    config: KeyHierarchyConfig,
    target_locks: Arc<DashMap<KeyTarget, Arc<Mutex<()>>>>,
}

impl KeyHierarchy {
    /// Hierarchy wrapping new DEKs under `master_key`.
    pub fn new(store: Arc<dyn KeyStore>, master_key: MasterKey, config: KeyHierarchyConfig) -> Self {
        Self {
            store,
            keyring: Arc::new(Keyring::new(master_key)),
            audit: KeyAuditLog::new(),
            config,
            target_locks: Arc::new(DashMap::new()),
        }
    }

    /// Share an existing audit log.
    pub fn with_audit_log(mut self, audit: KeyAuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Audit trail of key lifecycle events.
    pub fn audit_log(&self) -> &KeyAuditLog {
        &self.audit
    }

    /// Loaded master keys.
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    fn target_lock(&self, target: &KeyTarget) -> Arc<Mutex<()>> {
        self.target_locks
            .entry(target.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Active key for `target`, falling back to the global key when allowed.
    pub async fn resolve_active_key(
        &self,
        target: &KeyTarget,
        allow_fallback: bool,
    ) -> Result<EncryptionKey, KeyError> {
        if let Some(key) = self.store.find_active(target).await? {
            return Ok(key);
        }
        if allow_fallback && !target.is_global() {
            if let Some(key) = self.store.find_active(&KeyTarget::Global).await? {
                debug!(target = %target, key_id = %key.id, "Falling back to global key");
                return Ok(key);
            }
        }
        Err(KeyError::KeyNotFound(target.to_string()))
    }

    /// Resolve the key a new backup should use, creating it on first use when
    /// `auto_create_keys` is enabled.
    pub async fn resolve_or_create(
        &self,
        target: &KeyTarget,
        allow_fallback: bool,
    ) -> Result<EncryptionKey, KeyError> {
        if let Some(key) = self.store.find_active(target).await? {
            return Ok(key);
        }

        if self.config.auto_create_keys {
            return match self.create_key(target, self.config.default_algorithm).await {
                Ok(key) => Ok(key),
                // Lost a race with another creator; theirs is authoritative.
                Err(KeyError::DuplicateActiveKey(_)) => self.resolve_active_key(target, false).await,
                Err(e) => Err(e),
            };
        }

        self.resolve_active_key(target, allow_fallback).await
    }

    /// Create version 1 of the key for `target`. Fails with
    /// `DuplicateActiveKey` if the target already has an active key.
    pub async fn create_key(
        &self,
        target: &KeyTarget,
        algorithm: KeyAlgorithm,
    ) -> Result<EncryptionKey, KeyError> {
        let lock = self.target_lock(target);
        let _guard = lock.lock().await;

        if self.store.find_active(target).await?.is_some() {
            return Err(KeyError::DuplicateActiveKey(target.to_string()));
        }

        let key = self.issue(target, 1, algorithm)?;
        self.store.insert_active(&key).await?;

        info!(target = %target, key_id = %key.id, algorithm = algorithm.as_str(), "Created encryption key");
        metrics::record_key_event(target.scope(), "created");
        self.audit
            .record(KeyAuditEvent {
                kind: KeyEventKind::Created,
                target: Some(target.clone()),
                key_id: Some(key.id),
                version: Some(key.version),
                timestamp: key.created_at,
                detail: None,
            })
            .await;

        Ok(key)
    }

    /// Replace the active key for `target` with version N+1. Backups that
    /// reference the old version keep doing so.
    pub async fn rotate_key(&self, target: &KeyTarget) -> Result<EncryptionKey, KeyError> {
        let lock = self.target_lock(target);
        let _guard = lock.lock().await;

        let current = self
            .store
            .find_active(target)
            .await?
            .ok_or_else(|| KeyError::KeyNotFound(target.to_string()))?;

        let mut replacement = self.issue(target, current.version + 1, current.algorithm)?;
        replacement
            .metadata
            .insert("rotated_from".to_string(), current.id.to_string());
        self.store
            .rotate(current.id, replacement.created_at, &replacement)
            .await?;

        info!(
            target = %target,
            old_key_id = %current.id,
            new_key_id = %replacement.id,
            version = replacement.version,
            "Rotated encryption key"
        );
        metrics::record_key_event(target.scope(), "rotated");
        self.audit
            .record(KeyAuditEvent {
                kind: KeyEventKind::Rotated,
                target: Some(target.clone()),
                key_id: Some(replacement.id),
                version: Some(replacement.version),
                timestamp: replacement.created_at,
                detail: Some(format!("previous key {}", current.id)),
            })
            .await;

        Ok(replacement)
    }

    fn issue(
        &self,
        target: &KeyTarget,
        version: u32,
        algorithm: KeyAlgorithm,
    ) -> Result<EncryptionKey, KeyError> {
        let mut dek = Zeroizing::new(vec![0u8; algorithm.key_len()]);
        OsRng.fill_bytes(&mut dek[..]);
        let wrapped_key = self.keyring.wrap(&dek, &associated_data(target, version))?;

        Ok(EncryptionKey {
            id: Uuid::new_v4(),
            target: target.clone(),
            wrapped_key,
            version,
            algorithm,
            active: true,
            created_at: Utc::now(),
            rotated_at: None,
            metadata: HashMap::new(),
        })
    }

    /// Raw DEK for the lifetime of the returned buffer only.
    pub fn unwrap(&self, key: &EncryptionKey) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        self.keyring
            .unwrap(&key.wrapped_key, &associated_data(&key.target, key.version))
    }

    /// Look up a key by handle and unwrap it.
    pub async fn unwrap_handle(&self, handle: &KeyHandle) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let key = self.key_by_id(handle.key_id).await?;
        self.unwrap(&key)
    }

    /// Any version of any key, by id.
    pub async fn key_by_id(&self, id: Uuid) -> Result<EncryptionKey, KeyError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| KeyError::KeyNotFound(id.to_string()))
    }

    /// Every version for `target`, oldest first.
    pub async fn versions(&self, target: &KeyTarget) -> Result<Vec<EncryptionKey>, KeyError> {
        self.store.versions(target).await
    }

    /// Delete a retired key nothing references any more.
    pub async fn delete_key(&self, id: Uuid, references: &dyn KeyReferences) -> Result<(), KeyError> {
        let key = self.key_by_id(id).await?;
        let lock = self.target_lock(&key.target);
        let _guard = lock.lock().await;

        let count = references.count_key_references(id).await?;
        if count > 0 {
            return Err(KeyError::KeyInUse {
                key_id: id,
                references: count,
            });
        }
        self.store.delete(id).await?;

        metrics::record_key_event(key.scope(), "deleted");
        self.audit
            .record(KeyAuditEvent {
                kind: KeyEventKind::Deleted,
                target: Some(key.target.clone()),
                key_id: Some(id),
                version: Some(key.version),
                timestamp: Utc::now(),
                detail: None,
            })
            .await;
        Ok(())
    }

    /// Switch the KEK used for new DEKs. Existing DEKs stay wrapped under the
    /// previous master key, which stays loaded for this process only; list it
    /// in `CoreConfig::retired_master_keys` to unwrap them after a restart.
    pub async fn rotate_master_key(&self, next: MasterKey) -> String {
        let new_id = next.id().to_string();
        let previous = self.keyring.rotate(next);
        info!(previous = %previous, current = %new_id, "Rotated master key");
        self.audit
            .record(KeyAuditEvent {
                kind: KeyEventKind::MasterKeyRotated,
                target: None,
                key_id: None,
                version: None,
                timestamp: Utc::now(),
                detail: Some(format!("{} -> {}", previous, new_id)),
            })
            .await;
        previous
    }

    /// Load a previous master key so DEKs it wrapped can still be unwrapped.
    /// New DEKs keep using the current master key.
    pub fn register_retired_master_key(&self, master: MasterKey) {
        let id = master.id().to_string();
        if id == self.keyring.current_id() {
            return;
        }
        self.keyring.add_retired(master);
        info!(master_key_id = %id, "Registered retired master key");
    }

    /// Wrapped key set for disaster recovery. Raw DEKs never leave.
    pub async fn export_keys(&self) -> Result<KeyExport, KeyError> {
        let keys = self.store.list().await?;
        let export = KeyExport {
            exported_at: Utc::now(),
            master_key_id: self.keyring.current_id(),
            keys,
        };
        self.audit
            .record(KeyAuditEvent {
                kind: KeyEventKind::Exported,
                target: None,
                key_id: None,
                version: None,
                timestamp: export.exported_at,
                detail: Some(format!("{} keys", export.keys.len())),
            })
            .await;
        Ok(export)
    }

    /// Insert keys from an export. Ids already present are skipped; keys that
    /// would add a second active key or reuse a version are reported as
    /// conflicts.
    pub async fn import_keys(&self, export: &KeyExport) -> Result<ImportSummary, KeyError> {
        let mut summary = ImportSummary::default();

        for key in &export.keys {
            if !self.keyring.contains(&key.wrapped_key.master_key_id) {
                warn!(
                    key_id = %key.id,
                    master_key_id = %key.wrapped_key.master_key_id,
                    "Importing key wrapped under a master key that is not loaded"
                );
                summary.unknown_master_keys += 1;
            }

            let lock = self.target_lock(&key.target);
            let _guard = lock.lock().await;

            match self.store.insert_imported(key).await {
                Ok(true) => {
                    summary.imported += 1;
                    self.audit
                        .record(KeyAuditEvent {
                            kind: KeyEventKind::Imported,
                            target: Some(key.target.clone()),
                            key_id: Some(key.id),
                            version: Some(key.version),
                            timestamp: Utc::now(),
                            detail: None,
                        })
                        .await;
                }
                Ok(false) => summary.skipped_existing += 1,
                Err(KeyError::DuplicateActiveKey(target)) => {
                    warn!(key_id = %key.id, target = %target, "Import would create a second active key");
                    summary.conflicts.push(key.id);
                }
                Err(KeyError::DuplicateKeyVersion { target, version }) => {
                    warn!(key_id = %key.id, target = %target, version, "Import would reuse a key version");
                    summary.conflicts.push(key.id);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            imported = summary.imported,
            skipped = summary.skipped_existing,
            conflicts = summary.conflicts.len(),
            "Imported key set"
        );
        Ok(summary)
    }
}

fn associated_data(target: &KeyTarget, version: u32) -> Vec<u8> {
    format!("{}#{}", target, version).into_bytes()
}

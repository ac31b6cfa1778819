//! Audit trail for key lifecycle events

use super::types::KeyTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Kind of key lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEventKind {
    /// A new key was created.
    Created,
    /// A new version replaced the active key.
    Rotated,
    /// A retired key was deleted.
    Deleted,
    /// A key was restored from an export.
    Imported,
    /// The wrapped key set was exported.
    Exported,
    /// New DEKs are wrapped under a different master key.
    MasterKeyRotated,
}

/// Audit event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAuditEvent {
    /// What happened.
    pub kind: KeyEventKind,

    /// Target affected, absent for whole-keyring events
    pub target: Option<KeyTarget>,

    /// Key affected, if a single one.
    pub key_id: Option<Uuid>,

    /// Version of that key.
    pub version: Option<u32>,

    /// When it happened.
    pub timestamp: DateTime<Utc>,

    /// Free-form context.
    pub detail: Option<String>,
}

/// Append-only audit log kept in memory and mirrored to `tracing`.
#[derive(Clone, Default)]
pub struct KeyAuditLog {
    events: Arc<RwLock<Vec<KeyAuditEvent>>>,
}

impl KeyAuditLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and log it.
    pub async fn record(&self, event: KeyAuditEvent) {
        info!(
            kind = ?event.kind,
            target = ?event.target.as_ref().map(|t| t.to_string()),
            key_id = ?event.key_id,
            version = ?event.version,
            "Key audit event"
        );
        self.events.write().await.push(event);
    }

    /// Every event, oldest first.
    pub async fn events(&self) -> Vec<KeyAuditEvent> {
        self.events.read().await.clone()
    }

    /// Events that touched `target`.
    pub async fn events_for(&self, target: &KeyTarget) -> Vec<KeyAuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.target.as_ref() == Some(target))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audit_filter_by_target() {
        let log = KeyAuditLog::new();
        let vm = KeyTarget::Vm("vm-1".into());

        for target in [Some(vm.clone()), Some(KeyTarget::Global), None] {
            log.record(KeyAuditEvent {
                kind: KeyEventKind::Created,
                target,
                key_id: None,
                version: Some(1),
                timestamp: Utc::now(),
                detail: None,
            })
            .await;
        }

        assert_eq!(log.events().await.len(), 3);
        assert_eq!(log.events_for(&vm).await.len(), 1);
    }
}

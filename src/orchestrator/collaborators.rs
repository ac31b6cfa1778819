// Collaborator seams: execution hand-off and time

use crate::chain::{BackupType, Plan};
use crate::keys::KeyHandle;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// What the execution collaborator needs to run one backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Backup record to fill in.
    pub backup_id: Uuid,
    /// Full or incremental.
    pub backup_type: BackupType,
    /// Full backup an incremental builds on.
    pub anchor_backup_id: Option<Uuid>,
    /// Checkpoint an incremental diffs against.
    pub checkpoint_baseline: Option<String>,
    /// Key to encrypt with; `None` when unencrypted.
    pub key: Option<KeyHandle>,
}

impl From<&Plan> for ExecutionRequest {
    fn from(plan: &Plan) -> Self {
        Self {
            backup_id: plan.backup_id,
            backup_type: plan.backup_type,
            anchor_backup_id: plan.anchor_backup_id,
            checkpoint_baseline: plan.checkpoint_baseline.clone(),
            key: plan.key.clone(),
        }
    }
}

/// Why the execution collaborator refused a request.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    /// The request itself was refused.
    #[error("Execution request rejected: {0}")]
    Rejected(String),

    /// The collaborator could not be reached.
    #[error("Execution collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Job dispatcher that performs the data movement. Outcomes come back
/// asynchronously through `BackupOrchestrator::apply_completion`.
#[async_trait]
pub trait ExecutionCollaborator: Send + Sync {
    /// Queue a backup. Returning `Ok` hands ownership of the outcome to the collaborator.
    async fn submit(&self, request: ExecutionRequest) -> Result<(), ExecutionError>;
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), start + Duration::minutes(90));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}

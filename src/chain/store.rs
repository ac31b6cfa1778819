// Backup Store - persistence seam for schedules, backups and storage backends

use super::types::{Backup, BackupSchedule, StorageBackend, WorkloadRef};
use super::ChainError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Storage for chain state.
///
/// Schedule writes are optimistic: the caller passes the schedule carrying
/// the `row_version` it read, and the store rejects the write with
/// `ConcurrentModification` if someone else wrote in between. Successful
/// writes return the schedule with its bumped version.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Insert a new schedule as given.
    async fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<(), ChainError>;

    /// Load a schedule by id.
    async fn get_schedule(&self, id: Uuid) -> Result<Option<BackupSchedule>, ChainError>;

    /// Every schedule, in no particular order.
    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>, ChainError>;

    /// Schedules for which [`BackupSchedule::is_due`] holds at `now`.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>, ChainError>;

    /// Optimistic schedule write.
    async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule, ChainError>;

    /// Write the schedule and insert the planned backup as one unit.
    async fn commit_plan(
        &self,
        schedule: &BackupSchedule,
        backup: &Backup,
    ) -> Result<BackupSchedule, ChainError>;

    /// Write the schedule and replace the backup row as one unit.
    async fn commit_outcome(
        &self,
        schedule: &BackupSchedule,
        backup: &Backup,
    ) -> Result<BackupSchedule, ChainError>;

    /// Load a backup by id.
    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>, ChainError>;

    /// Replace a backup row without touching its schedule.
    async fn update_backup(&self, backup: &Backup) -> Result<(), ChainError>;

    /// Oldest first.
    async fn backups_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<Backup>, ChainError>;

    /// Oldest first.
    async fn backups_for_workload(&self, workload: &WorkloadRef) -> Result<Vec<Backup>, ChainError>;

    /// Backups encrypted with `key_id`.
    async fn count_key_references(&self, key_id: Uuid) -> Result<usize, ChainError>;

    /// Insert or replace a backend by id.
    async fn upsert_storage_backend(&self, backend: &StorageBackend) -> Result<(), ChainError>;

    /// Load a backend by id.
    async fn get_storage_backend(&self, id: &str) -> Result<Option<StorageBackend>, ChainError>;
}

#[derive(Default)]
struct ChainTables {
    schedules: HashMap<Uuid, BackupSchedule>,
    backups: HashMap<Uuid, Backup>,
    backends: HashMap<String, StorageBackend>,
}

impl ChainTables {
    fn write_schedule(&mut self, schedule: &BackupSchedule) -> Result<BackupSchedule, ChainError> {
        let stored = self
            .schedules
            .get_mut(&schedule.id)
            .ok_or(ChainError::ScheduleNotFound(schedule.id))?;
        if stored.row_version != schedule.row_version {
            return Err(ChainError::ConcurrentModification(schedule.id));
        }
        let mut next = schedule.clone();
        next.row_version += 1;
        *stored = next.clone();
        Ok(next)
    }
}

/// In-memory backup store
#[derive(Clone, Default)]
pub struct MemoryBackupStore {
    tables: Arc<RwLock<ChainTables>>,
}

impl MemoryBackupStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_time(mut backups: Vec<Backup>) -> Vec<Backup> {
    backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    backups
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<(), ChainError> {
        let mut tables = self.tables.write();
        if tables.schedules.contains_key(&schedule.id) {
            return Err(ChainError::Storage(format!(
                "schedule {} already exists",
                schedule.id
            )));
        }
        tables.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<BackupSchedule>, ChainError> {
        Ok(self.tables.read().schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>, ChainError> {
        let mut schedules: Vec<BackupSchedule> =
            self.tables.read().schedules.values().cloned().collect();
        schedules.sort_by_key(|s| s.id);
        Ok(schedules)
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>, ChainError> {
        let mut due: Vec<BackupSchedule> = self
            .tables
            .read()
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_run_at, s.id));
        Ok(due)
    }

    async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule, ChainError> {
        self.tables.write().write_schedule(schedule)
    }

    async fn commit_plan(
        &self,
        schedule: &BackupSchedule,
        backup: &Backup,
    ) -> Result<BackupSchedule, ChainError> {
        let mut tables = self.tables.write();
        if tables.backups.contains_key(&backup.id) {
            return Err(ChainError::Storage(format!("backup {} already exists", backup.id)));
        }
        let written = tables.write_schedule(schedule)?;
        tables.backups.insert(backup.id, backup.clone());
        Ok(written)
    }

    async fn commit_outcome(
        &self,
        schedule: &BackupSchedule,
        backup: &Backup,
    ) -> Result<BackupSchedule, ChainError> {
        let mut tables = self.tables.write();
        if !tables.backups.contains_key(&backup.id) {
            return Err(ChainError::BackupNotFound(backup.id));
        }
        let written = tables.write_schedule(schedule)?;
        tables.backups.insert(backup.id, backup.clone());
        Ok(written)
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>, ChainError> {
        Ok(self.tables.read().backups.get(&id).cloned())
    }

    async fn update_backup(&self, backup: &Backup) -> Result<(), ChainError> {
        let mut tables = self.tables.write();
        match tables.backups.get_mut(&backup.id) {
            Some(stored) => {
                *stored = backup.clone();
                Ok(())
            }
            None => Err(ChainError::BackupNotFound(backup.id)),
        }
    }

    async fn backups_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<Backup>, ChainError> {
        let backups = self
            .tables
            .read()
            .backups
            .values()
            .filter(|b| b.schedule_id == schedule_id)
            .cloned()
            .collect();
        Ok(sorted_by_time(backups))
    }

    async fn backups_for_workload(&self, workload: &WorkloadRef) -> Result<Vec<Backup>, ChainError> {
        let backups = self
            .tables
            .read()
            .backups
            .values()
            .filter(|b| &b.workload == workload)
            .cloned()
            .collect();
        Ok(sorted_by_time(backups))
    }

    async fn count_key_references(&self, key_id: Uuid) -> Result<usize, ChainError> {
        Ok(self
            .tables
            .read()
            .backups
            .values()
            .filter(|b| b.encryption_key_id == Some(key_id))
            .count())
    }

    async fn upsert_storage_backend(&self, backend: &StorageBackend) -> Result<(), ChainError> {
        self.tables
            .write()
            .backends
            .insert(backend.id.clone(), backend.clone());
        Ok(())
    }

    async fn get_storage_backend(&self, id: &str) -> Result<Option<StorageBackend>, ChainError> {
        Ok(self.tables.read().backends.get(id).cloned())
    }
}

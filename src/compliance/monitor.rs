// Compliance Monitor - recomputes and caches compliance per workload

use super::evaluator::{ComplianceEvaluator, ComplianceRecord, PolicyAssignment};
use super::ComplianceError;
use crate::chain::{BackupStore, WorkloadRef};
use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Source of policy assignments (the API layer's view of who is protected).
#[async_trait]
pub trait PolicyDirectory: Send + Sync {
    /// Assignment for `workload`; `Unassigned` when unknown.
    async fn assignment(&self, workload: &WorkloadRef) -> Result<PolicyAssignment, ComplianceError>;

    /// Workloads with an explicit assignment.
    async fn workloads(&self) -> Result<Vec<WorkloadRef>, ComplianceError>;
}

/// In-memory policy directory
#[derive(Clone, Default)]
pub struct MemoryPolicyDirectory {
    assignments: Arc<DashMap<WorkloadRef, PolicyAssignment>>,
}

impl MemoryPolicyDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign, exclude or unassign a workload.
    pub fn set(&self, workload: WorkloadRef, assignment: PolicyAssignment) {
        self.assignments.insert(workload, assignment);
    }
}

#[async_trait]
impl PolicyDirectory for MemoryPolicyDirectory {
    async fn assignment(&self, workload: &WorkloadRef) -> Result<PolicyAssignment, ComplianceError> {
        Ok(self
            .assignments
            .get(workload)
            .map(|entry| entry.value().clone())
            .unwrap_or(PolicyAssignment::Unassigned))
    }

    async fn workloads(&self) -> Result<Vec<WorkloadRef>, ComplianceError> {
        Ok(self.assignments.iter().map(|entry| entry.key().clone()).collect())
    }
}

/// Sole writer of compliance records. The cache only memoizes evaluator
/// output; every refresh recomputes from the backup store.
#[derive(Clone)]
pub struct ComplianceMonitor {
    evaluator: ComplianceEvaluator,
    policies: Arc<dyn PolicyDirectory>,
    store: Arc<dyn BackupStore>,
    cache: Arc<DashMap<WorkloadRef, ComplianceRecord>>,
}

impl ComplianceMonitor {
    /// Monitor evaluating with `evaluator` over `store` history.
    pub fn new(
        evaluator: ComplianceEvaluator,
        policies: Arc<dyn PolicyDirectory>,
        store: Arc<dyn BackupStore>,
    ) -> Self {
        Self {
            evaluator,
            policies,
            store,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Recompute and cache the record for one workload.
    pub async fn refresh(
        &self,
        workload: &WorkloadRef,
        now: DateTime<Utc>,
    ) -> Result<ComplianceRecord, ComplianceError> {
        let assignment = self.policies.assignment(workload).await?;
        let history = self.store.backups_for_workload(workload).await?;
        let record = self.evaluator.evaluate(workload, &assignment, &history, now);

        metrics::record_compliance(record.status);
        debug!(
            workload = %workload,
            status = record.status.as_str(),
            reason = %record.reason,
            "Evaluated compliance"
        );
        self.cache.insert(workload.clone(), record.clone());
        Ok(record)
    }

    /// Recompute every workload that has a schedule or a policy assignment.
    pub async fn refresh_all(&self, now: DateTime<Utc>) -> Result<Vec<ComplianceRecord>, ComplianceError> {
        let mut workloads: BTreeSet<String> = BTreeSet::new();
        let mut ordered = Vec::new();
        let scheduled = self.store.list_schedules().await?.into_iter().map(|s| s.workload);
        for workload in scheduled.chain(self.policies.workloads().await?) {
            if workloads.insert(workload.to_string()) {
                ordered.push(workload);
            }
        }

        let mut records = Vec::with_capacity(ordered.len());
        for workload in &ordered {
            records.push(self.refresh(workload, now).await?);
        }
        Ok(records)
    }

    /// Last computed record, if any. May lag committed backup history.
    pub fn cached(&self, workload: &WorkloadRef) -> Option<ComplianceRecord> {
        self.cache.get(workload).map(|entry| entry.value().clone())
    }
}

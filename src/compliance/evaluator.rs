// Compliance Evaluator - RPO status as a pure function of policy and history

use crate::chain::{Backup, WorkloadRef};
use crate::config::ComplianceConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Traffic-light RPO status of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    /// No policy applies
    Grey,
    /// Last successful backup is well inside the RPO
    Green,
    /// Aging towards the RPO
    Yellow,
    /// RPO breached or never backed up
    Red,
}

impl ComplianceStatus {
    /// Upper-case label, as shown to operators.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Grey => "GREY",
            ComplianceStatus::Green => "GREEN",
            ComplianceStatus::Yellow => "YELLOW",
            ComplianceStatus::Red => "RED",
        }
    }
}

/// Recovery objectives a workload is held to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompliancePolicy {
    /// Policy name.
    pub name: String,
    /// Maximum tolerated age of the newest successful backup.
    pub rpo_minutes: u32,
    /// Recorded for reporting; not evaluated.
    pub rto_minutes: Option<u32>,
}

impl CompliancePolicy {
    /// Policy with an RPO and no RTO.
    pub fn new(name: impl Into<String>, rpo_minutes: u32) -> Self {
        Self {
            name: name.into(),
            rpo_minutes,
            rto_minutes: None,
        }
    }

    /// Set the recovery time objective.
    pub fn with_rto_minutes(mut self, minutes: u32) -> Self {
        self.rto_minutes = Some(minutes);
        self
    }
}

/// Whether and how a workload is covered by a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "policy", rename_all = "snake_case")]
pub enum PolicyAssignment {
    /// No policy chosen yet.
    Unassigned,
    /// Deliberately left unprotected.
    Excluded,
    /// Held to this policy.
    Assigned(CompliancePolicy),
}

/// Derived compliance view. Always recomputable from policy and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceRecord {
    /// Workload the record describes.
    pub workload: WorkloadRef,
    /// Computed status.
    pub status: ComplianceStatus,
    /// Human-readable explanation of `status`.
    pub reason: String,
    /// Capture time of the newest completed backup.
    pub last_successful_backup: Option<DateTime<Utc>>,
    /// Evaluation time.
    pub checked_at: DateTime<Utc>,
}

/// Computes compliance from policy and history. Holds no state.
#[derive(Debug, Clone, Default)]
pub struct ComplianceEvaluator {
    config: ComplianceConfig,
}

impl ComplianceEvaluator {
    /// Evaluator with the given thresholds.
    pub fn new(config: ComplianceConfig) -> Self {
        Self { config }
    }

    /// Status of `workload` at `now`. Only completed backups count.
    pub fn evaluate(
        &self,
        workload: &WorkloadRef,
        assignment: &PolicyAssignment,
        history: &[Backup],
        now: DateTime<Utc>,
    ) -> ComplianceRecord {
        // Point in time of the newest successful backup.
        let last_successful_backup = history
            .iter()
            .filter(|b| b.is_successful())
            .map(|b| b.created_at)
            .max();

        let (status, reason) = match assignment {
            PolicyAssignment::Unassigned => {
                (ComplianceStatus::Grey, "No backup policy assigned".to_string())
            }
            PolicyAssignment::Excluded => {
                (ComplianceStatus::Grey, "Excluded from backup policy".to_string())
            }
            PolicyAssignment::Assigned(policy) => evaluate_rpo(
                policy.rpo_minutes,
                last_successful_backup,
                now,
                self.config.warning_ratio,
            ),
        };

        ComplianceRecord {
            workload: workload.clone(),
            status,
            reason,
            last_successful_backup,
            checked_at: now,
        }
    }
}

/// Status and reason for a workload under an RPO.
pub fn evaluate_rpo(
    rpo_minutes: u32,
    last_successful_backup: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    warning_ratio: f64,
) -> (ComplianceStatus, String) {
    let Some(last) = last_successful_backup else {
        return (
            ComplianceStatus::Red,
            format!("No successful backup recorded (RPO {}m)", rpo_minutes),
        );
    };

    let rpo_secs = i64::from(rpo_minutes) * 60;
    let warning_secs = (rpo_secs as f64 * warning_ratio) as i64;
    let age_secs = (now - last).num_seconds().max(0);
    let age_minutes = age_secs / 60;

    if age_secs > rpo_secs {
        (
            ComplianceStatus::Red,
            format!(
                "RPO breached: last successful backup {}m ago exceeds {}m RPO by {}m",
                age_minutes,
                rpo_minutes,
                (age_secs - rpo_secs) / 60
            ),
        )
    } else if age_secs >= warning_secs {
        (
            ComplianceStatus::Yellow,
            format!(
                "RPO at risk: last successful backup {}m ago, {}m left of {}m RPO",
                age_minutes,
                (rpo_secs - age_secs) / 60,
                rpo_minutes
            ),
        )
    } else {
        (
            ComplianceStatus::Green,
            format!(
                "Within RPO: last successful backup {}m ago, {}m left of {}m RPO",
                age_minutes,
                (rpo_secs - age_secs) / 60,
                rpo_minutes
            ),
        )
    }
}

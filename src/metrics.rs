//! Prometheus metrics for planning, key lifecycle and compliance

use crate::chain::{BackupType, PlanReason};
use crate::compliance::ComplianceStatus;
use crate::keys::KeyScope;
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    /// Plans issued by the chain planner
    static ref BACKUP_PLANS: IntCounterVec = register_int_counter_vec!(
        "vmbackup_plans_total",
        "Total number of backups planned",
        &["backup_type", "reason"]
    ).unwrap();

    /// Completion and failure reports applied
    static ref BACKUP_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "vmbackup_backup_outcomes_total",
        "Total number of backup outcome reports applied",
        &["backup_type", "outcome"]
    ).unwrap();

    /// Key lifecycle events
    static ref KEY_EVENTS: IntCounterVec = register_int_counter_vec!(
        "vmbackup_key_events_total",
        "Total number of encryption key lifecycle events",
        &["scope", "event"]
    ).unwrap();

    /// Compliance evaluations by resulting status
    static ref COMPLIANCE_EVALUATIONS: IntCounterVec = register_int_counter_vec!(
        "vmbackup_compliance_evaluations_total",
        "Total number of compliance evaluations",
        &["status"]
    ).unwrap();

    /// Errors surfaced to callers
    static ref ERRORS: IntCounterVec = register_int_counter_vec!(
        "vmbackup_errors_total",
        "Total number of errors surfaced by the core",
        &["kind", "component"]
    ).unwrap();
}

/// Count a planned backup.
pub fn record_plan(backup_type: BackupType, reason: PlanReason) {
    BACKUP_PLANS
        .with_label_values(&[backup_type.as_str(), reason.as_str()])
        .inc();
}

/// Count an applied outcome (`completed` or `failed`).
pub fn record_outcome(backup_type: BackupType, outcome: &str) {
    BACKUP_OUTCOMES
        .with_label_values(&[backup_type.as_str(), outcome])
        .inc();
}

/// Count a key lifecycle event.
pub fn record_key_event(scope: KeyScope, event: &str) {
    KEY_EVENTS.with_label_values(&[scope.as_str(), event]).inc();
}

/// Count a compliance evaluation by status.
pub fn record_compliance(status: ComplianceStatus) {
    COMPLIANCE_EVALUATIONS
        .with_label_values(&[status.as_str()])
        .inc();
}

/// Count an error by kind and component.
pub fn record_error(kind: &str, component: &str) {
    ERRORS.with_label_values(&[kind, component]).inc();
}

/// Text exposition of every registered metric.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

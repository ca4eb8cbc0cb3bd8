// Append-only compliance ledger. One entry per signal applied, timer
// fired, and activity outcome, written through the instance store with
// upsert-by-sequence semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Applied,
    Rejected,
    /// Transition committed but a non-critical effect exhausted its
    /// retries; flagged for manual remediation.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub instance_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub event_type: String,
    pub payload: Value,
    pub result_status: ResultStatus,
}

impl AuditEntry {
    pub fn new(
        instance_id: Uuid,
        sequence: u64,
        timestamp: DateTime<Utc>,
        actor_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        result_status: ResultStatus,
    ) -> Self {
        Self {
            instance_id,
            sequence,
            timestamp,
            actor_id: actor_id.into(),
            event_type: event_type.into(),
            payload,
            result_status,
        }
    }
}

/// Event type tags used in audit entries and effect dedupe keys.
pub mod event_types {
    pub const INSTANCE_STARTED: &str = "instance_started";
    pub const STAGE_TRANSITIONED: &str = "stage_transitioned";
    pub const REQUIREMENT_COMPLETED: &str = "requirement_completed";
    pub const DEADLINE_ADDED: &str = "deadline_added";
    pub const DEADLINE_REMOVED: &str = "deadline_removed";
    pub const COURT_DATE_ADDED: &str = "court_date_added";
    pub const COURT_DATE_REMOVED: &str = "court_date_removed";
    pub const PAUSED: &str = "paused";
    pub const RESUMED: &str = "resumed";
    pub const CANCELLED: &str = "cancelled";
    pub const COMPLETED: &str = "completed";
    pub const REMINDER_FIRED: &str = "reminder_fired";
    pub const SIGNAL_REJECTED: &str = "signal_rejected";
    pub const EFFECT_DEGRADED: &str = "effect_degraded";
}

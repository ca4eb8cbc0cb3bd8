use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::scheduler::PendingReminder;

/// Side effect computed by the engine, executed by the activity
/// executor after the transition is decided. Critical effects gate the
/// commit; non-critical effects are best-effort with retry.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Persist the post-transition instance state. Critical.
    PersistState,
    /// Append an entry to the audit ledger. Critical.
    AppendAudit(AuditEntry),
    /// Send a notification. Non-critical.
    Notify {
        recipient: String,
        subject: String,
        body: String,
    },
    /// Mirror the stage change onto the subject record. Non-critical.
    UpdateSubjectStage {
        subject_id: String,
        stage_name: String,
        entered_at: DateTime<Utc>,
    },
    /// Append a free-form note to the subject record. Non-critical.
    AppendSubjectNote { subject_id: String, text: String },
    /// Register reminder timers with the scheduler index.
    ScheduleReminders(Vec<PendingReminder>),
    /// Drop not-yet-fired reminders; `None` clears the whole instance.
    CancelReminders { item_id: Option<Uuid> },
}

impl Effect {
    pub fn is_critical(&self) -> bool {
        matches!(self, Effect::PersistState | Effect::AppendAudit(_))
    }
}

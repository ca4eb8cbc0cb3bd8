use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::instance::{OffsetLabel, ReminderKind};

/// External command mutating instance state. One enum, one dispatch
/// site in the engine — workflow kinds differ only by template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    CompleteRequirement {
        requirement_id: String,
        name: String,
        completed_by: String,
        metadata: Value,
    },
    TransitionStage {
        target_stage_id: String,
        notes: String,
        requested_by: String,
        force: bool,
    },
    AddDeadline {
        title: String,
        due_at: DateTime<Utc>,
        description: String,
        added_by: String,
    },
    RemoveDeadline {
        deadline_id: Uuid,
    },
    AddCourtDate {
        title: String,
        at: DateTime<Utc>,
        location: String,
        notes: String,
        added_by: String,
    },
    RemoveCourtDate {
        event_id: Uuid,
    },
    Pause,
    Resume,
    Cancel {
        reason: String,
    },
}

impl Signal {
    /// Schema validation, run by the gateway before the engine sees the
    /// signal. Malformed payloads never touch persisted state.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        fn required(field: &str, value: &str) -> Result<(), WorkflowError> {
            if value.trim().is_empty() {
                return Err(WorkflowError::Validation {
                    reason: format!("{field} must not be empty"),
                });
            }
            Ok(())
        }

        match self {
            Signal::CompleteRequirement {
                requirement_id,
                name,
                completed_by,
                ..
            } => {
                required("requirement_id", requirement_id)?;
                required("name", name)?;
                required("completed_by", completed_by)?;
            }
            Signal::TransitionStage {
                target_stage_id,
                requested_by,
                force,
                notes,
            } => {
                required("target_stage_id", target_stage_id)?;
                required("requested_by", requested_by)?;
                if *force {
                    // Forced overrides are recorded with a justification.
                    required("notes", notes)?;
                }
            }
            Signal::AddDeadline {
                title,
                due_at,
                added_by,
                ..
            } => {
                required("title", title)?;
                required("added_by", added_by)?;
                if *due_at <= now {
                    return Err(WorkflowError::Validation {
                        reason: "due_at must be in the future".to_string(),
                    });
                }
            }
            Signal::AddCourtDate {
                title,
                at,
                added_by,
                ..
            } => {
                required("title", title)?;
                required("added_by", added_by)?;
                if *at <= now {
                    return Err(WorkflowError::Validation {
                        reason: "court date must be in the future".to_string(),
                    });
                }
            }
            Signal::Cancel { reason } => {
                required("reason", reason)?;
            }
            Signal::RemoveDeadline { .. } | Signal::RemoveCourtDate { .. } | Signal::Pause | Signal::Resume => {}
        }
        Ok(())
    }

    /// Actor recorded in the audit ledger for this signal.
    pub fn actor(&self) -> &str {
        match self {
            Signal::CompleteRequirement { completed_by, .. } => completed_by,
            Signal::TransitionStage { requested_by, .. } => requested_by,
            Signal::AddDeadline { added_by, .. } => added_by,
            Signal::AddCourtDate { added_by, .. } => added_by,
            _ => "operator",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Signal::CompleteRequirement { .. } => "complete_requirement",
            Signal::TransitionStage { .. } => "transition_stage",
            Signal::AddDeadline { .. } => "add_deadline",
            Signal::RemoveDeadline { .. } => "remove_deadline",
            Signal::AddCourtDate { .. } => "add_court_date",
            Signal::RemoveCourtDate { .. } => "remove_court_date",
            Signal::Pause => "pause",
            Signal::Resume => "resume",
            Signal::Cancel { .. } => "cancel",
        }
    }
}

/// Everything the engine consumes: caller signals plus timer firings,
/// serialized through the same per-instance queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkflowEvent {
    Signal(Signal),
    ReminderElapsed {
        item_id: Uuid,
        kind: ReminderKind,
        label: OffsetLabel,
        title: String,
        target_at: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::Signal(signal) => signal.kind(),
            WorkflowEvent::ReminderElapsed { .. } => "reminder_elapsed",
        }
    }
}

/// Reply to an applied event. `AlreadyApplied` answers replays of
/// naturally-keyed signals without re-running effects; `Dropped` is a
/// timer firing filtered at delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAck {
    Applied { sequence: u64 },
    AlreadyApplied,
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_empty_requirement_id_rejected() {
        let signal = Signal::CompleteRequirement {
            requirement_id: "  ".to_string(),
            name: "Upload retainer".to_string(),
            completed_by: "paralegal".to_string(),
            metadata: serde_json::json!({}),
        };
        assert!(matches!(
            signal.validate(Utc::now()),
            Err(WorkflowError::Validation { .. })
        ));
    }

    #[test]
    fn test_past_deadline_rejected() {
        let now = Utc::now();
        let signal = Signal::AddDeadline {
            title: "File motion".to_string(),
            due_at: now - Duration::hours(1),
            description: String::new(),
            added_by: "attorney".to_string(),
        };
        assert!(matches!(
            signal.validate(now),
            Err(WorkflowError::Validation { .. })
        ));
    }

    #[test]
    fn test_forced_transition_requires_justification() {
        let signal = Signal::TransitionStage {
            target_stage_id: "trial".to_string(),
            notes: String::new(),
            requested_by: "attorney".to_string(),
            force: true,
        };
        assert!(signal.validate(Utc::now()).is_err());

        let signal = Signal::TransitionStage {
            target_stage_id: "trial".to_string(),
            notes: "client settled early".to_string(),
            requested_by: "attorney".to_string(),
            force: true,
        };
        assert!(signal.validate(Utc::now()).is_ok());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::template::WorkflowTemplate;

/// Run state of a workflow instance. Completed, Cancelled and Failed
/// are terminal; Failed requires operator intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Active,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

/// One visit to a stage. Entries are append-only; the open entry has
/// `exited_at = None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub stage_id: String,
    pub name: String,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub duration_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRequirement {
    pub requirement_id: String,
    pub name: String,
    pub completed_by: String,
    pub completed_at: DateTime<Utc>,
    pub metadata: Value,
}

/// Which calendar item a reminder belongs to. Deadlines and court
/// dates carry different offset schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderKind {
    Deadline,
    CourtDate,
}

/// Durable dedupe key for a reminder firing, together with
/// `(instance_id, item_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OffsetLabel {
    SevenDaysBefore,
    ThreeDaysBefore,
    OneDayBefore,
    FortyEightHoursBefore,
    TwentyFourHoursBefore,
    Overdue,
}

impl std::fmt::Display for OffsetLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OffsetLabel::SevenDaysBefore => "7d-before",
            OffsetLabel::ThreeDaysBefore => "3d-before",
            OffsetLabel::OneDayBefore => "1d-before",
            OffsetLabel::FortyEightHoursBefore => "48h-before",
            OffsetLabel::TwentyFourHoursBefore => "24h-before",
            OffsetLabel::Overdue => "overdue",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredReminder {
    pub label: OffsetLabel,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    pub deadline_id: Uuid,
    pub title: String,
    pub due_at: DateTime<Utc>,
    pub description: String,
    pub added_by: String,
    pub reminders_fired: Vec<FiredReminder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourtDate {
    pub event_id: Uuid,
    pub title: String,
    pub at: DateTime<Utc>,
    pub location: String,
    pub notes: String,
    pub added_by: String,
    pub reminders_fired: Vec<FiredReminder>,
}

/// Execution state of one running workflow. Mutated exclusively by the
/// engine, one event at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: Uuid,
    pub template_id: String,
    pub subject_id: String,
    pub current_stage_id: String,
    pub run_state: RunState,
    pub stage_history: Vec<StageHistoryEntry>,
    pub completed_requirements: Vec<CompletedRequirement>,
    pub deadlines: Vec<Deadline>,
    pub court_dates: Vec<CourtDate>,
    pub created_at: DateTime<Utc>,
    /// Count of events applied to this instance. Effects are deduped
    /// by `(instance_id, event_type, sequence)`.
    pub sequence: u64,
    pub cancel_reason: Option<String>,
    pub failure_reason: Option<String>,
}

impl WorkflowInstance {
    /// Create a fresh instance, Active at the template's first stage.
    pub fn start(template: &WorkflowTemplate, subject_id: String, now: DateTime<Utc>) -> Self {
        let first = template.first_stage();
        Self {
            instance_id: Uuid::new_v4(),
            template_id: template.template_id.clone(),
            subject_id,
            current_stage_id: first.stage_id.clone(),
            run_state: RunState::Active,
            stage_history: vec![StageHistoryEntry {
                stage_id: first.stage_id.clone(),
                name: first.name.clone(),
                entered_at: now,
                exited_at: None,
                duration_hours: None,
            }],
            completed_requirements: Vec::new(),
            deadlines: Vec::new(),
            court_dates: Vec::new(),
            created_at: now,
            sequence: 0,
            cancel_reason: None,
            failure_reason: None,
        }
    }

    pub fn has_completed_requirement(&self, requirement_id: &str) -> bool {
        self.completed_requirements
            .iter()
            .any(|r| r.requirement_id == requirement_id)
    }

    /// Required requirements of the given stage not yet completed.
    pub fn unmet_required<'a>(&self, template: &'a WorkflowTemplate, stage_id: &str) -> Vec<&'a str> {
        template
            .stage(stage_id)
            .map(|stage| {
                stage
                    .requirements
                    .iter()
                    .filter(|r| r.is_required && !self.has_completed_requirement(&r.requirement_id))
                    .map(|r| r.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn deadline(&self, deadline_id: Uuid) -> Option<&Deadline> {
        self.deadlines.iter().find(|d| d.deadline_id == deadline_id)
    }

    pub fn court_date(&self, event_id: Uuid) -> Option<&CourtDate> {
        self.court_dates.iter().find(|c| c.event_id == event_id)
    }

    /// Sanity check against the bound template. A violation here means
    /// the persisted state is corrupt, not that a signal was invalid.
    pub fn check_against(&self, template: &WorkflowTemplate) -> Result<(), String> {
        if self.template_id != template.template_id {
            return Err(format!(
                "instance bound to template '{}' but loaded '{}'",
                self.template_id, template.template_id
            ));
        }
        if template.stage(&self.current_stage_id).is_none() {
            return Err(format!(
                "current stage '{}' not present in template '{}'",
                self.current_stage_id, template.template_id
            ));
        }
        for entry in &self.stage_history {
            if let Some(exited_at) = entry.exited_at {
                if exited_at < entry.entered_at {
                    return Err(format!(
                        "stage history entry '{}' exited before it was entered",
                        entry.stage_id
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{Stage, StageRequirement};

    fn template() -> WorkflowTemplate {
        WorkflowTemplate {
            template_id: "case".to_string(),
            stages: vec![
                Stage {
                    stage_id: "intake".to_string(),
                    name: "Intake".to_string(),
                    requirements: vec![
                        StageRequirement {
                            requirement_id: "retainer".to_string(),
                            name: "Upload retainer".to_string(),
                            is_required: true,
                        },
                        StageRequirement {
                            requirement_id: "intake-form".to_string(),
                            name: "Intake form".to_string(),
                            is_required: false,
                        },
                    ],
                },
                Stage {
                    stage_id: "discovery".to_string(),
                    name: "Discovery".to_string(),
                    requirements: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_start_opens_first_stage() {
        let now = Utc::now();
        let instance = WorkflowInstance::start(&template(), "subject-1".to_string(), now);

        assert_eq!(instance.current_stage_id, "intake");
        assert_eq!(instance.run_state, RunState::Active);
        assert_eq!(instance.stage_history.len(), 1);
        assert_eq!(instance.stage_history[0].entered_at, now);
        assert!(instance.stage_history[0].exited_at.is_none());
    }

    #[test]
    fn test_unmet_required_ignores_optional() {
        let template = template();
        let mut instance = WorkflowInstance::start(&template, "subject-1".to_string(), Utc::now());

        assert_eq!(instance.unmet_required(&template, "intake"), vec!["Upload retainer"]);

        instance.completed_requirements.push(CompletedRequirement {
            requirement_id: "retainer".to_string(),
            name: "Upload retainer".to_string(),
            completed_by: "paralegal".to_string(),
            completed_at: Utc::now(),
            metadata: serde_json::json!({}),
        });
        assert!(instance.unmet_required(&template, "intake").is_empty());
    }

    #[test]
    fn test_check_against_detects_foreign_stage() {
        let template = template();
        let mut instance = WorkflowInstance::start(&template, "subject-1".to_string(), Utc::now());
        instance.current_stage_id = "appeal".to_string();

        assert!(instance.check_against(&template).is_err());
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{event_types, AuditEntry, ResultStatus};
use crate::engine::effects::Effect;
use crate::engine::signal::{Signal, SignalAck, WorkflowEvent};
use crate::errors::WorkflowError;
use crate::instance::{
    CompletedRequirement, CourtDate, Deadline, FiredReminder, OffsetLabel, ReminderKind, RunState,
    StageHistoryEntry, WorkflowInstance,
};
use crate::scheduler::pending_reminders;
use crate::template::WorkflowTemplate;

/// Result of applying one event: the post-transition state and the
/// effects the activity executor must run before the transition is
/// considered done.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub instance: WorkflowInstance,
    pub effects: Vec<Effect>,
    pub ack: SignalAck,
}

impl EngineOutcome {
    fn unchanged(instance: &WorkflowInstance, ack: SignalAck) -> Self {
        Self {
            instance: instance.clone(),
            effects: Vec::new(),
            ack,
        }
    }
}

/// Deterministic transition function over one instance, parameterized
/// by the bound template. `(state, event, now) -> (state', effects[])`
/// — no I/O, no hidden clock.
pub struct ExecutionEngine {
    template: Arc<WorkflowTemplate>,
}

impl ExecutionEngine {
    pub fn new(template: Arc<WorkflowTemplate>) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &Arc<WorkflowTemplate> {
        &self.template
    }

    /// Apply one event. Rejections leave the instance untouched; an
    /// `Ok` outcome is only durable once its critical effects have been
    /// executed.
    pub fn apply(
        &self,
        current: &WorkflowInstance,
        event: &WorkflowEvent,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        if let Err(reason) = current.check_against(&self.template) {
            return Err(WorkflowError::FatalEngine { reason });
        }

        match event {
            WorkflowEvent::ReminderElapsed {
                item_id,
                kind,
                label,
                title,
                target_at,
            } => self.reminder_elapsed(current, *item_id, *kind, *label, title, *target_at, now),
            WorkflowEvent::Signal(signal) => self.apply_signal(current, signal, now),
        }
    }

    fn apply_signal(
        &self,
        current: &WorkflowInstance,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        match current.run_state {
            RunState::Cancelled => return Err(WorkflowError::Cancelled),
            RunState::Completed => {
                return Err(WorkflowError::StateConflict {
                    run_state: current.run_state,
                    reason: "instance already completed".to_string(),
                })
            }
            RunState::Failed => {
                return Err(WorkflowError::StateConflict {
                    run_state: current.run_state,
                    reason: current
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "instance failed".to_string()),
                })
            }
            RunState::Active | RunState::Paused => {}
        }

        match signal {
            Signal::TransitionStage {
                target_stage_id,
                notes,
                requested_by,
                force,
            } => {
                if current.run_state == RunState::Paused {
                    return Err(WorkflowError::Paused);
                }
                self.transition_stage(current, target_stage_id, notes, requested_by, *force, now)
            }
            Signal::CompleteRequirement {
                requirement_id,
                name,
                completed_by,
                metadata,
            } => {
                if current.run_state == RunState::Paused {
                    return Err(WorkflowError::Paused);
                }
                self.complete_requirement(current, requirement_id, name, completed_by, metadata.clone(), now)
            }
            Signal::AddDeadline {
                title,
                due_at,
                description,
                added_by,
            } => self.add_deadline(current, title, *due_at, description, added_by, now),
            Signal::RemoveDeadline { deadline_id } => self.remove_deadline(current, *deadline_id, now),
            Signal::AddCourtDate {
                title,
                at,
                location,
                notes,
                added_by,
            } => self.add_court_date(current, title, *at, location, notes, added_by, now),
            Signal::RemoveCourtDate { event_id } => self.remove_court_date(current, *event_id, now),
            Signal::Pause => self.pause(current, now),
            Signal::Resume => self.resume(current, now),
            Signal::Cancel { reason } => self.cancel(current, reason, now),
        }
    }

    fn transition_stage(
        &self,
        current: &WorkflowInstance,
        target_stage_id: &str,
        notes: &str,
        requested_by: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        let template = self.template.as_ref();
        let target_pos = template.stage_position(target_stage_id).ok_or_else(|| {
            WorkflowError::Validation {
                reason: format!(
                    "target stage '{}' not present in template '{}'",
                    target_stage_id, template.template_id
                ),
            }
        })?;
        let target = &template.stages[target_pos];

        if target_stage_id == current.current_stage_id {
            // Replay of an already-applied transition.
            return Ok(EngineOutcome::unchanged(current, SignalAck::AlreadyApplied));
        }

        let current_pos = template
            .stage_position(&current.current_stage_id)
            .ok_or_else(|| WorkflowError::FatalEngine {
                reason: format!(
                    "current stage '{}' missing from template '{}'",
                    current.current_stage_id, template.template_id
                ),
            })?;

        if !force && target_pos != current_pos + 1 {
            return Err(WorkflowError::StateConflict {
                run_state: current.run_state,
                reason: format!(
                    "stage order only permits a transition from '{}' to '{}'; use force to override",
                    current.current_stage_id,
                    template.stages[current_pos + 1..]
                        .first()
                        .map(|s| s.stage_id.as_str())
                        .unwrap_or("<none>"),
                ),
            });
        }

        let current_stage = &template.stages[current_pos];
        let unmet: Vec<String> = current
            .unmet_required(template, &current.current_stage_id)
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        if !unmet.is_empty() && !force {
            return Err(WorkflowError::RequirementsIncomplete {
                stage: current_stage.name.clone(),
                missing: unmet,
            });
        }

        let mut instance = current.clone();
        if let Some(open) = instance.stage_history.last_mut() {
            open.exited_at = Some(now);
            open.duration_hours =
                Some(now.signed_duration_since(open.entered_at).num_minutes() as f64 / 60.0);
        }
        instance.stage_history.push(StageHistoryEntry {
            stage_id: target.stage_id.clone(),
            name: target.name.clone(),
            entered_at: now,
            exited_at: None,
            duration_hours: None,
        });
        instance.current_stage_id = target.stage_id.clone();
        instance.sequence += 1;

        info!(
            instance_id = %instance.instance_id,
            from_stage = %current.current_stage_id,
            to_stage = %target.stage_id,
            forced = %force,
            "Stage transition applied"
        );
        if force && !unmet.is_empty() {
            warn!(
                instance_id = %instance.instance_id,
                missing = ?unmet,
                "Forced transition past incomplete requirements"
            );
        }

        let mut effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                requested_by,
                event_types::STAGE_TRANSITIONED,
                json!({
                    "from_stage": current.current_stage_id,
                    "to_stage": target.stage_id,
                    "notes": notes,
                    "forced": force,
                    "overridden_requirements": unmet,
                }),
                ResultStatus::Applied,
            )),
            Effect::Notify {
                recipient: instance.subject_id.clone(),
                subject: format!("Stage changed: {}", target.name),
                body: format!(
                    "Workflow moved from '{}' to '{}'.",
                    current_stage.name, target.name
                ),
            },
            Effect::UpdateSubjectStage {
                subject_id: instance.subject_id.clone(),
                stage_name: target.name.clone(),
                entered_at: now,
            },
        ];
        if force && !unmet.is_empty() {
            effects.push(Effect::AppendSubjectNote {
                subject_id: instance.subject_id.clone(),
                text: format!(
                    "Forced transition to '{}' past incomplete requirements {:?}; justification: {}",
                    target.name, unmet, notes
                ),
            });
        }

        self.maybe_complete(&mut instance, &mut effects, now);

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    fn complete_requirement(
        &self,
        current: &WorkflowInstance,
        requirement_id: &str,
        name: &str,
        completed_by: &str,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        if current.has_completed_requirement(requirement_id) {
            return Ok(EngineOutcome::unchanged(current, SignalAck::AlreadyApplied));
        }

        let template = self.template.as_ref();
        let known = template
            .stages
            .iter()
            .any(|s| s.requirements.iter().any(|r| r.requirement_id == requirement_id));
        if !known {
            return Err(WorkflowError::Validation {
                reason: format!(
                    "requirement '{}' not present in template '{}'",
                    requirement_id, template.template_id
                ),
            });
        }

        let mut instance = current.clone();
        instance.completed_requirements.push(CompletedRequirement {
            requirement_id: requirement_id.to_string(),
            name: name.to_string(),
            completed_by: completed_by.to_string(),
            completed_at: now,
            metadata: metadata.clone(),
        });
        instance.sequence += 1;

        info!(
            instance_id = %instance.instance_id,
            requirement_id = %requirement_id,
            completed_by = %completed_by,
            "Requirement completed"
        );

        let mut effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                completed_by,
                event_types::REQUIREMENT_COMPLETED,
                json!({
                    "requirement_id": requirement_id,
                    "name": name,
                    "metadata": metadata,
                }),
                ResultStatus::Applied,
            )),
        ];

        self.maybe_complete(&mut instance, &mut effects, now);

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    fn add_deadline(
        &self,
        current: &WorkflowInstance,
        title: &str,
        due_at: DateTime<Utc>,
        description: &str,
        added_by: &str,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        let mut instance = current.clone();
        let deadline = Deadline {
            deadline_id: Uuid::new_v4(),
            title: title.to_string(),
            due_at,
            description: description.to_string(),
            added_by: added_by.to_string(),
            reminders_fired: Vec::new(),
        };
        let reminders = pending_reminders(
            instance.instance_id,
            deadline.deadline_id,
            ReminderKind::Deadline,
            due_at,
            title,
            &[],
            now,
        );
        instance.deadlines.push(deadline.clone());
        instance.sequence += 1;

        let effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                added_by,
                event_types::DEADLINE_ADDED,
                json!({
                    "deadline_id": deadline.deadline_id,
                    "title": title,
                    "due_at": due_at,
                    "description": description,
                }),
                ResultStatus::Applied,
            )),
            Effect::ScheduleReminders(reminders),
        ];

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    fn remove_deadline(
        &self,
        current: &WorkflowInstance,
        deadline_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        if current.deadline(deadline_id).is_none() {
            // Unknown or already removed — idempotent no-op.
            return Ok(EngineOutcome::unchanged(current, SignalAck::AlreadyApplied));
        }

        let mut instance = current.clone();
        instance.deadlines.retain(|d| d.deadline_id != deadline_id);
        instance.sequence += 1;

        let effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                "operator",
                event_types::DEADLINE_REMOVED,
                json!({ "deadline_id": deadline_id }),
                ResultStatus::Applied,
            )),
            Effect::CancelReminders {
                item_id: Some(deadline_id),
            },
        ];

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    fn add_court_date(
        &self,
        current: &WorkflowInstance,
        title: &str,
        at: DateTime<Utc>,
        location: &str,
        notes: &str,
        added_by: &str,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        let mut instance = current.clone();
        let court_date = CourtDate {
            event_id: Uuid::new_v4(),
            title: title.to_string(),
            at,
            location: location.to_string(),
            notes: notes.to_string(),
            added_by: added_by.to_string(),
            reminders_fired: Vec::new(),
        };
        let reminders = pending_reminders(
            instance.instance_id,
            court_date.event_id,
            ReminderKind::CourtDate,
            at,
            title,
            &[],
            now,
        );
        instance.court_dates.push(court_date.clone());
        instance.sequence += 1;

        let effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                added_by,
                event_types::COURT_DATE_ADDED,
                json!({
                    "event_id": court_date.event_id,
                    "title": title,
                    "at": at,
                    "location": location,
                    "notes": notes,
                }),
                ResultStatus::Applied,
            )),
            Effect::ScheduleReminders(reminders),
        ];

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    fn remove_court_date(
        &self,
        current: &WorkflowInstance,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        if current.court_date(event_id).is_none() {
            return Ok(EngineOutcome::unchanged(current, SignalAck::AlreadyApplied));
        }

        let mut instance = current.clone();
        instance.court_dates.retain(|c| c.event_id != event_id);
        instance.sequence += 1;

        let effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                "operator",
                event_types::COURT_DATE_REMOVED,
                json!({ "event_id": event_id }),
                ResultStatus::Applied,
            )),
            Effect::CancelReminders {
                item_id: Some(event_id),
            },
        ];

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    fn pause(&self, current: &WorkflowInstance, now: DateTime<Utc>) -> Result<EngineOutcome, WorkflowError> {
        if current.run_state == RunState::Paused {
            return Ok(EngineOutcome::unchanged(current, SignalAck::AlreadyApplied));
        }

        let mut instance = current.clone();
        instance.run_state = RunState::Paused;
        instance.sequence += 1;

        info!(instance_id = %instance.instance_id, "Instance paused");

        let effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                "operator",
                event_types::PAUSED,
                json!({}),
                ResultStatus::Applied,
            )),
        ];

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    fn resume(&self, current: &WorkflowInstance, now: DateTime<Utc>) -> Result<EngineOutcome, WorkflowError> {
        if current.run_state == RunState::Active {
            return Ok(EngineOutcome::unchanged(current, SignalAck::AlreadyApplied));
        }

        let mut instance = current.clone();
        instance.run_state = RunState::Active;
        instance.sequence += 1;

        info!(instance_id = %instance.instance_id, "Instance resumed");

        let effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                "operator",
                event_types::RESUMED,
                json!({}),
                ResultStatus::Applied,
            )),
        ];

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    fn cancel(
        &self,
        current: &WorkflowInstance,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        let mut instance = current.clone();
        instance.run_state = RunState::Cancelled;
        instance.cancel_reason = Some(reason.to_string());
        instance.sequence += 1;

        info!(
            instance_id = %instance.instance_id,
            reason = %reason,
            "Instance cancelled"
        );

        let effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                "operator",
                event_types::CANCELLED,
                json!({ "reason": reason }),
                ResultStatus::Applied,
            )),
            Effect::CancelReminders { item_id: None },
        ];

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    #[allow(clippy::too_many_arguments)]
    fn reminder_elapsed(
        &self,
        current: &WorkflowInstance,
        item_id: Uuid,
        kind: ReminderKind,
        label: OffsetLabel,
        title: &str,
        target_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EngineOutcome, WorkflowError> {
        if current.run_state.is_terminal() {
            return Ok(EngineOutcome::unchanged(current, SignalAck::Dropped));
        }

        let already_fired = match kind {
            ReminderKind::Deadline => current
                .deadline(item_id)
                .map(|d| d.reminders_fired.iter().any(|f| f.label == label)),
            ReminderKind::CourtDate => current
                .court_date(item_id)
                .map(|c| c.reminders_fired.iter().any(|f| f.label == label)),
        };
        match already_fired {
            // Item removed since the firing was scheduled, or label
            // already recorded — filtered at delivery.
            None | Some(true) => return Ok(EngineOutcome::unchanged(current, SignalAck::Dropped)),
            Some(false) => {}
        }

        let mut instance = current.clone();
        let fired = FiredReminder {
            label,
            fired_at: now,
        };
        match kind {
            ReminderKind::Deadline => {
                if let Some(deadline) = instance.deadlines.iter_mut().find(|d| d.deadline_id == item_id) {
                    deadline.reminders_fired.push(fired);
                }
            }
            ReminderKind::CourtDate => {
                if let Some(court_date) = instance.court_dates.iter_mut().find(|c| c.event_id == item_id) {
                    court_date.reminders_fired.push(fired);
                }
            }
        }
        instance.sequence += 1;

        let paused = instance.run_state == RunState::Paused;
        info!(
            instance_id = %instance.instance_id,
            item_id = %item_id,
            label = %label,
            paused = %paused,
            "Reminder fired"
        );

        let subject = match label {
            OffsetLabel::Overdue => format!("Overdue: {title}"),
            _ => format!("Reminder: {title}"),
        };
        let mut body = match label {
            OffsetLabel::Overdue => format!("'{title}' was due {target_at} and is not complete."),
            _ => format!("'{title}' is due {target_at} ({label})."),
        };
        if paused {
            body.push_str(" Note: the workflow is currently paused; this reminder is calendar-driven.");
        }

        let effects = vec![
            Effect::PersistState,
            Effect::AppendAudit(AuditEntry::new(
                instance.instance_id,
                instance.sequence,
                now,
                "scheduler",
                event_types::REMINDER_FIRED,
                json!({
                    "item_id": item_id,
                    "kind": kind,
                    "label": label.to_string(),
                    "title": title,
                    "target_at": target_at,
                    "paused": paused,
                }),
                ResultStatus::Applied,
            )),
            Effect::Notify {
                recipient: instance.subject_id.clone(),
                subject,
                body,
            },
        ];

        let ack = SignalAck::Applied {
            sequence: instance.sequence,
        };
        Ok(EngineOutcome { instance, effects, ack })
    }

    /// Terminal-stage check run after every successful transition and
    /// requirement completion.
    fn maybe_complete(&self, instance: &mut WorkflowInstance, effects: &mut Vec<Effect>, now: DateTime<Utc>) {
        let template = self.template.as_ref();
        if instance.run_state != RunState::Active
            || !template.is_terminal_stage(&instance.current_stage_id)
            || !instance
                .unmet_required(template, &instance.current_stage_id)
                .is_empty()
        {
            return;
        }

        instance.run_state = RunState::Completed;
        if let Some(open) = instance.stage_history.last_mut() {
            if open.exited_at.is_none() {
                open.exited_at = Some(now);
                open.duration_hours =
                    Some(now.signed_duration_since(open.entered_at).num_minutes() as f64 / 60.0);
            }
        }

        info!(instance_id = %instance.instance_id, "Workflow completed");

        effects.push(Effect::AppendAudit(AuditEntry::new(
            instance.instance_id,
            instance.sequence,
            now,
            "engine",
            event_types::COMPLETED,
            json!({ "final_stage": instance.current_stage_id }),
            ResultStatus::Applied,
        )));
        effects.push(Effect::Notify {
            recipient: instance.subject_id.clone(),
            subject: "Workflow completed".to_string(),
            body: format!(
                "All stages of workflow '{}' are complete.",
                instance.template_id
            ),
        });
        effects.push(Effect::CancelReminders { item_id: None });
    }
}

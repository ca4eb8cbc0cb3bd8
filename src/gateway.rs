//! Signal / query gateway
//!
//! Enforces single-writer-per-instance: every instance is owned by a
//! dedicated worker task fed by an mpsc queue, so signals for one
//! instance apply strictly one at a time while different instances
//! proceed in parallel. Queries never enter the queue — they read the
//! latest committed snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{event_types, AuditEntry, ResultStatus};
use crate::collaborators::{NotificationSender, SubjectRecordStore};
use crate::engine::{Effect, ExecutionEngine, Signal, SignalAck, WorkflowEvent};
use crate::errors::WorkflowError;
use crate::executor::{ActivityError, ActivityExecutor, EffectKey};
use crate::instance::{RunState, WorkflowInstance};
use crate::scheduler::{PendingReminder, ReminderScheduler};
use crate::store::InstanceStore;
use crate::template::{StageRequirement, WorkflowTemplate};

/// Latest committed view of an instance, readable without touching the
/// signal queue.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance: WorkflowInstance,
    pub template: Arc<WorkflowTemplate>,
    /// A non-critical effect exhausted its retries; flagged in the
    /// audit log for manual remediation.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentPhase {
    pub stage_id: String,
    pub name: String,
}

struct Envelope {
    event: WorkflowEvent,
    reply: oneshot::Sender<Result<SignalAck, WorkflowError>>,
}

struct WorkerHandle {
    tx: mpsc::Sender<Envelope>,
    join: tokio::task::JoinHandle<()>,
}

/// Shared collaborator bundle handed to each worker.
pub struct GatewayDeps {
    pub store: Arc<dyn InstanceStore>,
    pub executor: Arc<ActivityExecutor>,
    pub scheduler: Arc<ReminderScheduler>,
    pub subjects: Arc<dyn SubjectRecordStore>,
    pub notifier: Arc<dyn NotificationSender>,
}

pub struct SignalGateway {
    workers: RwLock<HashMap<Uuid, WorkerHandle>>,
    snapshots: Arc<RwLock<HashMap<Uuid, InstanceSnapshot>>>,
    deps: Arc<GatewayDeps>,
    queue_depth: usize,
}

impl SignalGateway {
    pub fn new(deps: GatewayDeps, queue_depth: usize) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            deps: Arc::new(deps),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Spawn the worker that owns this instance. The caller has already
    /// persisted the state at `version`.
    pub async fn register(
        &self,
        instance: WorkflowInstance,
        version: u64,
        template: Arc<WorkflowTemplate>,
    ) {
        let instance_id = instance.instance_id;
        {
            let mut snapshots = self.snapshots.write().await;
            snapshots.insert(
                instance_id,
                InstanceSnapshot {
                    instance: instance.clone(),
                    template: template.clone(),
                    degraded: false,
                },
            );
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let worker = Worker {
            engine: ExecutionEngine::new(template),
            instance,
            version,
            deps: self.deps.clone(),
            snapshots: self.snapshots.clone(),
        };
        let join = tokio::spawn(worker.run(rx));

        let mut workers = self.workers.write().await;
        workers.insert(instance_id, WorkerHandle { tx, join });
    }

    pub async fn is_registered(&self, instance_id: Uuid) -> bool {
        self.workers.read().await.contains_key(&instance_id)
    }

    /// Route a caller signal to its instance worker. Schema validation
    /// happens here, before anything touches persisted state.
    pub async fn signal(&self, instance_id: Uuid, signal: Signal) -> Result<SignalAck, WorkflowError> {
        signal.validate(Utc::now())?;
        self.dispatch(instance_id, WorkflowEvent::Signal(signal)).await
    }

    /// Route a due reminder through the same per-instance queue.
    pub async fn deliver_reminder(&self, reminder: PendingReminder) -> Result<SignalAck, WorkflowError> {
        let event = WorkflowEvent::ReminderElapsed {
            item_id: reminder.item_id,
            kind: reminder.kind,
            label: reminder.label,
            title: reminder.title.clone(),
            target_at: reminder.target_at,
        };
        self.dispatch(reminder.instance_id, event).await
    }

    async fn dispatch(&self, instance_id: Uuid, event: WorkflowEvent) -> Result<SignalAck, WorkflowError> {
        let tx = {
            let workers = self.workers.read().await;
            workers
                .get(&instance_id)
                .map(|w| w.tx.clone())
                .ok_or(WorkflowError::UnknownInstance(instance_id))?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Envelope {
            event,
            reply: reply_tx,
        })
        .await
        .map_err(|_| WorkflowError::UnknownInstance(instance_id))?;

        reply_rx.await.map_err(|_| WorkflowError::TransientInfra {
            reason: "instance worker dropped the reply".to_string(),
        })?
    }

    pub async fn get_state(&self, instance_id: Uuid) -> Result<WorkflowInstance, WorkflowError> {
        let snapshots = self.snapshots.read().await;
        snapshots
            .get(&instance_id)
            .map(|s| s.instance.clone())
            .ok_or(WorkflowError::UnknownInstance(instance_id))
    }

    pub async fn current_phase(&self, instance_id: Uuid) -> Result<CurrentPhase, WorkflowError> {
        let snapshots = self.snapshots.read().await;
        let snapshot = snapshots
            .get(&instance_id)
            .ok_or(WorkflowError::UnknownInstance(instance_id))?;
        let stage = snapshot
            .template
            .stage(&snapshot.instance.current_stage_id)
            .ok_or_else(|| WorkflowError::FatalEngine {
                reason: format!(
                    "current stage '{}' not in template",
                    snapshot.instance.current_stage_id
                ),
            })?;
        Ok(CurrentPhase {
            stage_id: stage.stage_id.clone(),
            name: stage.name.clone(),
        })
    }

    /// Unmet required requirements of the current stage.
    pub async fn pending_requirements(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StageRequirement>, WorkflowError> {
        let snapshots = self.snapshots.read().await;
        let snapshot = snapshots
            .get(&instance_id)
            .ok_or(WorkflowError::UnknownInstance(instance_id))?;
        let stage = snapshot
            .template
            .stage(&snapshot.instance.current_stage_id)
            .ok_or_else(|| WorkflowError::FatalEngine {
                reason: format!(
                    "current stage '{}' not in template",
                    snapshot.instance.current_stage_id
                ),
            })?;
        Ok(stage
            .requirements
            .iter()
            .filter(|r| r.is_required && !snapshot.instance.has_completed_requirement(&r.requirement_id))
            .cloned()
            .collect())
    }

    pub async fn snapshot(&self, instance_id: Uuid) -> Option<InstanceSnapshot> {
        self.snapshots.read().await.get(&instance_id).cloned()
    }

    pub async fn instance_ids(&self) -> Vec<Uuid> {
        self.snapshots.read().await.keys().copied().collect()
    }

    /// Graceful shutdown: close every queue and wait for workers to
    /// drain. In-flight critical activities finish; nothing is killed
    /// mid-write.
    pub async fn shutdown(&self) {
        let workers: Vec<(Uuid, WorkerHandle)> = {
            let mut map = self.workers.write().await;
            map.drain().collect()
        };
        for (instance_id, handle) in workers {
            drop(handle.tx);
            if let Err(e) = handle.join.await {
                error!(instance_id = %instance_id, error = ?e, "Instance worker panicked during shutdown");
            }
        }
        info!("Signal gateway shut down");
    }
}

/// Per-instance worker: the single writer for one instance's state.
struct Worker {
    engine: ExecutionEngine,
    instance: WorkflowInstance,
    version: u64,
    deps: Arc<GatewayDeps>,
    snapshots: Arc<RwLock<HashMap<Uuid, InstanceSnapshot>>>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            let result = self.process(&envelope.event).await;
            // Caller may have gone away; the transition is already
            // committed either way.
            let _ = envelope.reply.send(result);
        }
    }

    async fn process(&mut self, event: &WorkflowEvent) -> Result<SignalAck, WorkflowError> {
        let now = Utc::now();

        let outcome = match self.engine.apply(&self.instance, event, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let WorkflowError::FatalEngine { reason } = &e {
                    self.mark_failed(reason.clone()).await;
                } else {
                    self.audit_rejection(event, &e).await;
                }
                return Err(e);
            }
        };

        if matches!(outcome.ack, SignalAck::AlreadyApplied | SignalAck::Dropped) {
            return Ok(outcome.ack);
        }

        // Critical effects gate the commit: the in-memory state only
        // advances once persist + audit are confirmed.
        let mut new_version = self.version;
        for effect in outcome.effects.iter().filter(|e| e.is_critical()) {
            let result = match effect {
                Effect::PersistState => {
                    let store = self.deps.store.clone();
                    let instance = outcome.instance.clone();
                    let expected = self.version;
                    self.deps
                        .executor
                        .execute("persist_state", move || {
                            let store = store.clone();
                            let instance = instance.clone();
                            async move { store.save(&instance, expected).await.map_err(ActivityError::from) }
                        })
                        .await
                        .map(|version| new_version = version)
                }
                Effect::AppendAudit(entry) => {
                    let store = self.deps.store.clone();
                    let entry = entry.clone();
                    self.deps
                        .executor
                        .execute("append_audit", move || {
                            let store = store.clone();
                            let entry = entry.clone();
                            async move { store.append_audit(&entry).await.map_err(ActivityError::from) }
                        })
                        .await
                }
                _ => unreachable!("only persist and audit are critical"),
            };

            if let Err(e) = result {
                warn!(
                    instance_id = %self.instance.instance_id,
                    event = %event.kind(),
                    error = %e,
                    "Critical effect failed, rolling back transition"
                );
                return match e {
                    ActivityError::Transient(reason) => Err(WorkflowError::TransientInfra { reason }),
                    ActivityError::Permanent(reason) => {
                        self.mark_failed(reason.clone()).await;
                        Err(WorkflowError::FatalEngine { reason })
                    }
                };
            }
        }

        // Commit.
        self.version = new_version;
        self.instance = outcome.instance.clone();

        // Timer index updates are in-process and follow the commit.
        for effect in &outcome.effects {
            match effect {
                Effect::ScheduleReminders(reminders) => {
                    self.deps.scheduler.schedule(reminders.clone()).await;
                }
                Effect::CancelReminders { item_id: Some(item_id) } => {
                    self.deps
                        .scheduler
                        .cancel_item(self.instance.instance_id, *item_id)
                        .await;
                }
                Effect::CancelReminders { item_id: None } => {
                    self.deps
                        .scheduler
                        .cancel_instance(self.instance.instance_id)
                        .await;
                }
                _ => {}
            }
        }

        // Non-critical effects: best-effort with retry; exhaustion
        // degrades the transition instead of rolling it back.
        let mut degraded = false;
        for (idx, effect) in outcome.effects.iter().enumerate() {
            let key = EffectKey {
                instance_id: self.instance.instance_id,
                event_type: format!("{}#{idx}", event.kind()),
                sequence: self.instance.sequence,
            };
            let result = match effect {
                Effect::Notify {
                    recipient,
                    subject,
                    body,
                } => {
                    let notifier = self.deps.notifier.clone();
                    let (recipient, subject, body) =
                        (recipient.clone(), subject.clone(), body.clone());
                    self.deps
                        .executor
                        .execute_once(key, "notify", move || {
                            let notifier = notifier.clone();
                            let (recipient, subject, body) =
                                (recipient.clone(), subject.clone(), body.clone());
                            async move { notifier.send(&recipient, &subject, &body).await }
                        })
                        .await
                }
                Effect::UpdateSubjectStage {
                    subject_id,
                    stage_name,
                    entered_at,
                } => {
                    let subjects = self.deps.subjects.clone();
                    let (subject_id, stage_name, entered_at) =
                        (subject_id.clone(), stage_name.clone(), *entered_at);
                    self.deps
                        .executor
                        .execute_once(key, "update_subject_stage", move || {
                            let subjects = subjects.clone();
                            let (subject_id, stage_name) = (subject_id.clone(), stage_name.clone());
                            async move { subjects.update_stage(&subject_id, &stage_name, entered_at).await }
                        })
                        .await
                }
                Effect::AppendSubjectNote { subject_id, text } => {
                    let subjects = self.deps.subjects.clone();
                    let (subject_id, text) = (subject_id.clone(), text.clone());
                    self.deps
                        .executor
                        .execute_once(key, "append_subject_note", move || {
                            let subjects = subjects.clone();
                            let (subject_id, text) = (subject_id.clone(), text.clone());
                            async move { subjects.append_note(&subject_id, &text).await }
                        })
                        .await
                }
                _ => continue,
            };

            if let Err(e) = result {
                degraded = true;
                warn!(
                    instance_id = %self.instance.instance_id,
                    event = %event.kind(),
                    error = %e,
                    "Non-critical effect exhausted retries; transition committed degraded"
                );
                let entry = AuditEntry::new(
                    self.instance.instance_id,
                    self.instance.sequence,
                    now,
                    "executor",
                    event_types::EFFECT_DEGRADED,
                    json!({ "event": event.kind(), "error": e.to_string() }),
                    ResultStatus::Degraded,
                );
                if let Err(audit_err) = self.deps.store.append_audit(&entry).await {
                    error!(
                        instance_id = %self.instance.instance_id,
                        error = %audit_err,
                        "Failed to record degraded effect"
                    );
                }
            }
        }

        self.publish_snapshot(degraded).await;
        Ok(outcome.ack)
    }

    async fn publish_snapshot(&self, degraded: bool) {
        let mut snapshots = self.snapshots.write().await;
        if let Some(snapshot) = snapshots.get_mut(&self.instance.instance_id) {
            snapshot.instance = self.instance.clone();
            snapshot.degraded = snapshot.degraded || degraded;
        }
    }

    /// Corrupted or unreadable state: park the instance in Failed until
    /// an operator intervenes. Persistence here is best-effort — the
    /// snapshot is authoritative for monitoring either way.
    async fn mark_failed(&mut self, reason: String) {
        error!(
            instance_id = %self.instance.instance_id,
            reason = %reason,
            "Instance moved to Failed"
        );
        self.instance.run_state = RunState::Failed;
        self.instance.failure_reason = Some(reason);
        match self.deps.store.save(&self.instance, self.version).await {
            Ok(version) => self.version = version,
            Err(e) => warn!(
                instance_id = %self.instance.instance_id,
                error = %e,
                "Could not persist Failed state"
            ),
        }
        self.publish_snapshot(false).await;
    }

    async fn audit_rejection(&self, event: &WorkflowEvent, error: &WorkflowError) {
        let actor = match event {
            WorkflowEvent::Signal(signal) => signal.actor().to_string(),
            WorkflowEvent::ReminderElapsed { .. } => "scheduler".to_string(),
        };
        let entry = AuditEntry::new(
            self.instance.instance_id,
            self.instance.sequence,
            Utc::now(),
            actor,
            event_types::SIGNAL_REJECTED,
            json!({ "event": event.kind(), "error": error.to_string() }),
            ResultStatus::Rejected,
        );
        if let Err(e) = self.deps.store.append_audit(&entry).await {
            warn!(
                instance_id = %self.instance.instance_id,
                error = %e,
                "Failed to audit rejected signal"
            );
        }
    }
}

//! Instance lifecycle API
//!
//! The collaborator-facing surface wiring the components together:
//! `start` creates and registers an instance, `signal` routes commands
//! through the gateway, `describe` serves monitoring tooling, and
//! `recover` rebuilds workers and the reminder index after a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::audit::{event_types, AuditEntry, ResultStatus};
use crate::collaborators::{NotificationSender, SubjectRecordStore};
use crate::config::StageflowConfig;
use crate::engine::{Signal, SignalAck};
use crate::errors::WorkflowError;
use crate::executor::{ActivityError, ActivityExecutor};
use crate::gateway::{CurrentPhase, GatewayDeps, SignalGateway};
use crate::instance::{RunState, WorkflowInstance};
use crate::scheduler::ReminderScheduler;
use crate::store::{InstanceStore, PersistenceError};
use crate::telemetry::create_instance_span;
use crate::template::{StageRequirement, TemplateStore};

/// Returned by `start`: everything a caller needs to address the
/// instance later.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    pub instance_id: Uuid,
    pub template_id: String,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
}

/// Monitoring view of one instance.
#[derive(Debug, Clone)]
pub struct OperationalStatus {
    pub instance_id: Uuid,
    pub template_id: String,
    pub subject_id: String,
    pub run_state: RunState,
    pub current_stage: CurrentPhase,
    pub pending_requirements: Vec<String>,
    pub deadline_count: usize,
    pub court_date_count: usize,
    pub reminders_fired: usize,
    pub pending_reminders: usize,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the startup recovery scan.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub reminders_rescheduled: usize,
    /// Offsets whose fire time had already passed, delivered
    /// immediately during the scan.
    pub fired_on_recovery: usize,
    /// Instances whose persisted state could not be read; these need
    /// operator intervention.
    pub unreadable: Vec<Uuid>,
}

pub struct Orchestrator {
    templates: Arc<dyn TemplateStore>,
    store: Arc<dyn InstanceStore>,
    executor: Arc<ActivityExecutor>,
    scheduler: Arc<ReminderScheduler>,
    gateway: Arc<SignalGateway>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: &StageflowConfig,
        templates: Arc<dyn TemplateStore>,
        store: Arc<dyn InstanceStore>,
        subjects: Arc<dyn SubjectRecordStore>,
        notifier: Arc<dyn NotificationSender>,
    ) -> Self {
        let executor = Arc::new(ActivityExecutor::new(config.retry_policy()));
        let scheduler = Arc::new(ReminderScheduler::new(config.poll_interval()));
        let gateway = Arc::new(SignalGateway::new(
            GatewayDeps {
                store: store.clone(),
                executor: executor.clone(),
                scheduler: scheduler.clone(),
                subjects,
                notifier,
            },
            config.gateway.queue_depth,
        ));
        Self {
            templates,
            store,
            executor,
            scheduler,
            gateway,
            scheduler_handle: Mutex::new(None),
        }
    }

    pub fn gateway(&self) -> &Arc<SignalGateway> {
        &self.gateway
    }

    pub fn scheduler(&self) -> &Arc<ReminderScheduler> {
        &self.scheduler
    }

    /// Create a new instance: Active at the template's first stage,
    /// persisted before the caller gets the handle back.
    pub async fn start(
        &self,
        subject_id: &str,
        template_id: &str,
    ) -> Result<InstanceHandle, WorkflowError> {
        if subject_id.trim().is_empty() {
            return Err(WorkflowError::Validation {
                reason: "subject_id must not be empty".to_string(),
            });
        }

        let template = self.templates.load_template(template_id).await?;
        template.validate()?;

        let now = Utc::now();
        let instance = WorkflowInstance::start(&template, subject_id.to_string(), now);

        let store = self.store.clone();
        let to_save = instance.clone();
        let version = self
            .executor
            .execute("persist_state", move || {
                let store = store.clone();
                let instance = to_save.clone();
                async move { store.save(&instance, 0).await.map_err(ActivityError::from) }
            })
            .await?;

        let entry = AuditEntry::new(
            instance.instance_id,
            0,
            now,
            "operator",
            event_types::INSTANCE_STARTED,
            json!({
                "template_id": template_id,
                "subject_id": subject_id,
                "first_stage": instance.current_stage_id,
            }),
            ResultStatus::Applied,
        );
        let store = self.store.clone();
        self.executor
            .execute("append_audit", move || {
                let store = store.clone();
                let entry = entry.clone();
                async move { store.append_audit(&entry).await.map_err(ActivityError::from) }
            })
            .await?;

        info!(
            instance_id = %instance.instance_id,
            template_id = %template_id,
            subject_id = %subject_id,
            "Instance started"
        );

        let handle = InstanceHandle {
            instance_id: instance.instance_id,
            template_id: template_id.to_string(),
            subject_id: subject_id.to_string(),
            created_at: now,
        };
        self.gateway.register(instance, version, template).await;
        Ok(handle)
    }

    /// Route a caller signal to its instance.
    pub async fn signal(
        &self,
        instance_id: Uuid,
        signal: Signal,
    ) -> Result<SignalAck, WorkflowError> {
        let span = create_instance_span("signal", instance_id, None);
        self.gateway.signal(instance_id, signal).instrument(span).await
    }

    pub async fn get_state(&self, instance_id: Uuid) -> Result<WorkflowInstance, WorkflowError> {
        self.gateway.get_state(instance_id).await
    }

    pub async fn current_phase(&self, instance_id: Uuid) -> Result<CurrentPhase, WorkflowError> {
        self.gateway.current_phase(instance_id).await
    }

    pub async fn pending_requirements(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StageRequirement>, WorkflowError> {
        self.gateway.pending_requirements(instance_id).await
    }

    /// Operational status for monitoring tooling.
    pub async fn describe(&self, instance_id: Uuid) -> Result<OperationalStatus, WorkflowError> {
        let snapshot = self
            .gateway
            .snapshot(instance_id)
            .await
            .ok_or(WorkflowError::UnknownInstance(instance_id))?;
        let instance = &snapshot.instance;
        let stage = snapshot
            .template
            .stage(&instance.current_stage_id)
            .ok_or_else(|| WorkflowError::FatalEngine {
                reason: format!(
                    "current stage '{}' not in template",
                    instance.current_stage_id
                ),
            })?;

        let reminders_fired = instance
            .deadlines
            .iter()
            .map(|d| d.reminders_fired.len())
            .chain(instance.court_dates.iter().map(|c| c.reminders_fired.len()))
            .sum();

        Ok(OperationalStatus {
            instance_id,
            template_id: instance.template_id.clone(),
            subject_id: instance.subject_id.clone(),
            run_state: instance.run_state,
            current_stage: CurrentPhase {
                stage_id: stage.stage_id.clone(),
                name: stage.name.clone(),
            },
            pending_requirements: instance
                .unmet_required(&snapshot.template, &instance.current_stage_id)
                .into_iter()
                .map(|s| s.to_string())
                .collect(),
            deadline_count: instance.deadlines.len(),
            court_date_count: instance.court_dates.len(),
            reminders_fired,
            pending_reminders: self.scheduler.pending_count(instance_id).await,
            degraded: snapshot.degraded,
            created_at: instance.created_at,
        })
    }

    /// Startup scan: reload every persisted instance, spawn workers,
    /// rebuild the reminder index, and deliver any offset whose fire
    /// time passed while the process was down.
    pub async fn recover(&self) -> Result<RecoveryReport, WorkflowError> {
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        let ids = self.store.list_instances().await.map_err(persistence_to_workflow)?;
        for instance_id in ids {
            if self.gateway.is_registered(instance_id).await {
                continue;
            }

            let stored = match self.store.load(instance_id).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    error!(
                        instance_id = %instance_id,
                        error = %e,
                        "Could not read persisted instance during recovery"
                    );
                    report.unreadable.push(instance_id);
                    continue;
                }
            };

            let template = match self.templates.load_template(&stored.instance.template_id).await {
                Ok(template) => template,
                Err(e) => {
                    error!(
                        instance_id = %instance_id,
                        template_id = %stored.instance.template_id,
                        error = %e,
                        "Template missing for persisted instance"
                    );
                    report.unreadable.push(instance_id);
                    continue;
                }
            };

            report.reminders_rescheduled += self
                .scheduler
                .rebuild_for_instance(&stored.instance, now)
                .await;
            self.gateway
                .register(stored.instance, stored.version, template)
                .await;
            report.recovered += 1;
        }

        report.fired_on_recovery = self.scheduler.fire_due(&self.gateway, now).await;

        info!(
            recovered = %report.recovered,
            reminders = %report.reminders_rescheduled,
            fired = %report.fired_on_recovery,
            unreadable = %report.unreadable.len(),
            "Recovery scan complete"
        );
        Ok(report)
    }

    /// Start the reminder poll loop.
    pub async fn start_scheduler(&self) {
        let mut handle = self.scheduler_handle.lock().await;
        if handle.is_some() {
            return;
        }
        *handle = Some(self.scheduler.clone().spawn(self.gateway.clone()));
    }

    /// Graceful shutdown: stop the poll loop, then drain every instance
    /// worker. In-flight critical activities finish before workers exit.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = ?e, "Scheduler task panicked during shutdown");
            }
        }
        self.gateway.shutdown().await;
        info!("Orchestrator shut down");
    }
}

fn persistence_to_workflow(e: PersistenceError) -> WorkflowError {
    if e.is_transient() {
        WorkflowError::TransientInfra {
            reason: e.to_string(),
        }
    } else {
        WorkflowError::FatalEngine {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordingNotifier, RecordingSubjectStore};
    use crate::store::InMemoryInstanceStore;
    use crate::template::{InMemoryTemplateStore, Stage, StageRequirement, WorkflowTemplate};

    fn template() -> WorkflowTemplate {
        WorkflowTemplate {
            template_id: "onboarding".to_string(),
            stages: vec![
                Stage {
                    stage_id: "paperwork".to_string(),
                    name: "Paperwork".to_string(),
                    requirements: vec![StageRequirement {
                        requirement_id: "signed-offer".to_string(),
                        name: "Signed offer letter".to_string(),
                        is_required: true,
                    }],
                },
                Stage {
                    stage_id: "equipment".to_string(),
                    name: "Equipment".to_string(),
                    requirements: vec![],
                },
            ],
        }
    }

    async fn orchestrator() -> Orchestrator {
        let templates = Arc::new(InMemoryTemplateStore::new());
        templates.register(template()).await.expect("Failed to register template");
        Orchestrator::new(
            &StageflowConfig::default(),
            templates,
            Arc::new(InMemoryInstanceStore::new()),
            Arc::new(RecordingSubjectStore::new()),
            Arc::new(RecordingNotifier::new()),
        )
    }

    #[tokio::test]
    async fn test_start_creates_active_instance() {
        let orchestrator = orchestrator().await;
        let handle = orchestrator
            .start("employee-7", "onboarding")
            .await
            .expect("Start failed");

        let status = orchestrator.describe(handle.instance_id).await.expect("Describe failed");
        assert_eq!(status.run_state, RunState::Active);
        assert_eq!(status.current_stage.stage_id, "paperwork");
        assert_eq!(status.pending_requirements, vec!["Signed offer letter".to_string()]);
        assert!(!status.degraded);
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_template() {
        let orchestrator = orchestrator().await;
        let result = orchestrator.start("employee-7", "offboarding").await;
        assert!(matches!(result, Err(WorkflowError::UnknownTemplate(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_empty_subject() {
        let orchestrator = orchestrator().await;
        let result = orchestrator.start("  ", "onboarding").await;
        assert!(matches!(result, Err(WorkflowError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_describe_unknown_instance() {
        let orchestrator = orchestrator().await;
        let result = orchestrator.describe(Uuid::new_v4()).await;
        assert!(matches!(result, Err(WorkflowError::UnknownInstance(_))));
    }
}

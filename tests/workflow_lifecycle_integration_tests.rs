//! Integration tests for the full workflow lifecycle
//!
//! Drives the orchestrator end-to-end: starting instances, gating
//! stage exits on requirements, pause/resume, forced overrides,
//! automatic completion at the terminal stage, and cancellation.

use std::sync::Arc;

use serde_json::json;
use stageflow::collaborators::{RecordingNotifier, RecordingSubjectStore, SubjectUpdate};
use stageflow::store::InMemoryInstanceStore;
use stageflow::template::{InMemoryTemplateStore, Stage, StageRequirement, WorkflowTemplate};
use stageflow::{
    InstanceStore, Orchestrator, RunState, Signal, SignalAck, StageflowConfig, WorkflowError,
};

fn legal_case_template() -> WorkflowTemplate {
    WorkflowTemplate {
        template_id: "legal-case".to_string(),
        stages: vec![
            Stage {
                stage_id: "intake".to_string(),
                name: "Intake".to_string(),
                requirements: vec![StageRequirement {
                    requirement_id: "upload-retainer".to_string(),
                    name: "UploadRetainer".to_string(),
                    is_required: true,
                }],
            },
            Stage {
                stage_id: "discovery".to_string(),
                name: "Discovery".to_string(),
                requirements: vec![],
            },
            Stage {
                stage_id: "trial".to_string(),
                name: "Trial".to_string(),
                requirements: vec![],
            },
            Stage {
                stage_id: "closed".to_string(),
                name: "Closed".to_string(),
                requirements: vec![],
            },
        ],
    }
}

fn test_config() -> StageflowConfig {
    let mut config = StageflowConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter = false;
    config
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<InMemoryInstanceStore>,
    subjects: Arc<RecordingSubjectStore>,
    notifier: Arc<RecordingNotifier>,
}

async fn harness() -> Harness {
    let templates = Arc::new(InMemoryTemplateStore::new());
    templates
        .register(legal_case_template())
        .await
        .expect("Failed to register template");
    let store = Arc::new(InMemoryInstanceStore::new());
    let subjects = Arc::new(RecordingSubjectStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let orchestrator = Orchestrator::new(
        &test_config(),
        templates,
        store.clone(),
        subjects.clone(),
        notifier.clone(),
    );
    Harness {
        orchestrator,
        store,
        subjects,
        notifier,
    }
}

fn complete_retainer() -> Signal {
    Signal::CompleteRequirement {
        requirement_id: "upload-retainer".to_string(),
        name: "UploadRetainer".to_string(),
        completed_by: "paralegal".to_string(),
        metadata: json!({"document": "retainer.pdf"}),
    }
}

fn transition_to(stage: &str) -> Signal {
    Signal::TransitionStage {
        target_stage_id: stage.to_string(),
        notes: String::new(),
        requested_by: "attorney".to_string(),
        force: false,
    }
}

#[tokio::test]
async fn test_requirement_gates_stage_exit() {
    let h = harness().await;
    let handle = h
        .orchestrator
        .start("case-042", "legal-case")
        .await
        .expect("Start failed");
    let id = handle.instance_id;

    let phase = h.orchestrator.current_phase(id).await.expect("Query failed");
    assert_eq!(phase.stage_id, "intake");

    // Blocked: the required retainer upload is missing.
    let blocked = h.orchestrator.signal(id, transition_to("discovery")).await;
    match blocked {
        Err(WorkflowError::RequirementsIncomplete { missing, .. }) => {
            assert_eq!(missing, vec!["UploadRetainer".to_string()]);
        }
        other => panic!("Expected RequirementsIncomplete, got {other:?}"),
    }
    let state = h.orchestrator.get_state(id).await.expect("Query failed");
    assert_eq!(state.stage_history.len(), 1);

    // Complete the requirement, then the same transition succeeds.
    let ack = h
        .orchestrator
        .signal(id, complete_retainer())
        .await
        .expect("Completion failed");
    assert!(matches!(ack, SignalAck::Applied { .. }));

    h.orchestrator
        .signal(id, transition_to("discovery"))
        .await
        .expect("Transition failed");

    let state = h.orchestrator.get_state(id).await.expect("Query failed");
    assert_eq!(state.current_stage_id, "discovery");
    assert_eq!(state.stage_history.len(), 2);
    assert!(state.stage_history[0].exited_at.is_some());
    assert!(state.stage_history[1].exited_at.is_none());

    // The stage change was mirrored onto the subject record.
    let updates = h.subjects.updates().await;
    assert!(updates.iter().any(|u| matches!(
        u,
        SubjectUpdate::Stage { subject_id, stage_name, .. }
            if subject_id == "case-042" && stage_name == "Discovery"
    )));
}

#[tokio::test]
async fn test_completed_requirement_replay_is_idempotent() {
    let h = harness().await;
    let handle = h
        .orchestrator
        .start("case-042", "legal-case")
        .await
        .expect("Start failed");
    let id = handle.instance_id;

    let first = h
        .orchestrator
        .signal(id, complete_retainer())
        .await
        .expect("First completion failed");
    assert!(matches!(first, SignalAck::Applied { .. }));

    let replay = h
        .orchestrator
        .signal(id, complete_retainer())
        .await
        .expect("Replay should succeed");
    assert_eq!(replay, SignalAck::AlreadyApplied);

    let state = h.orchestrator.get_state(id).await.expect("Query failed");
    assert_eq!(state.completed_requirements.len(), 1);
}

#[tokio::test]
async fn test_pause_blocks_signals_until_resume() {
    let h = harness().await;
    let handle = h
        .orchestrator
        .start("case-042", "legal-case")
        .await
        .expect("Start failed");
    let id = handle.instance_id;
    h.orchestrator
        .signal(id, complete_retainer())
        .await
        .expect("Completion failed");

    h.orchestrator
        .signal(id, Signal::Pause)
        .await
        .expect("Pause failed");
    let status = h.orchestrator.describe(id).await.expect("Describe failed");
    assert_eq!(status.run_state, RunState::Paused);

    let rejected = h.orchestrator.signal(id, transition_to("discovery")).await;
    assert!(matches!(rejected, Err(WorkflowError::Paused)));

    h.orchestrator
        .signal(id, Signal::Resume)
        .await
        .expect("Resume failed");
    h.orchestrator
        .signal(id, transition_to("discovery"))
        .await
        .expect("Transition after resume failed");

    let phase = h.orchestrator.current_phase(id).await.expect("Query failed");
    assert_eq!(phase.stage_id, "discovery");
}

#[tokio::test]
async fn test_forced_transition_records_override_note() {
    let h = harness().await;
    let handle = h
        .orchestrator
        .start("case-042", "legal-case")
        .await
        .expect("Start failed");
    let id = handle.instance_id;

    let forced = Signal::TransitionStage {
        target_stage_id: "trial".to_string(),
        notes: "expedited by court order".to_string(),
        requested_by: "attorney".to_string(),
        force: true,
    };
    h.orchestrator.signal(id, forced).await.expect("Forced transition failed");

    let phase = h.orchestrator.current_phase(id).await.expect("Query failed");
    assert_eq!(phase.stage_id, "trial");

    let updates = h.subjects.updates().await;
    assert!(updates.iter().any(|u| matches!(
        u,
        SubjectUpdate::Note { text, .. } if text.contains("expedited by court order")
    )));
}

#[tokio::test]
async fn test_terminal_stage_completes_instance() {
    let h = harness().await;
    let handle = h
        .orchestrator
        .start("case-042", "legal-case")
        .await
        .expect("Start failed");
    let id = handle.instance_id;

    h.orchestrator
        .signal(id, complete_retainer())
        .await
        .expect("Completion failed");
    for stage in ["discovery", "trial", "closed"] {
        h.orchestrator
            .signal(id, transition_to(stage))
            .await
            .unwrap_or_else(|e| panic!("Transition to {stage} failed: {e}"));
    }

    let status = h.orchestrator.describe(id).await.expect("Describe failed");
    assert_eq!(status.run_state, RunState::Completed);
    assert_eq!(status.current_stage.stage_id, "closed");

    // Terminated instances accept no further signals.
    let rejected = h.orchestrator.signal(id, Signal::Pause).await;
    assert!(matches!(rejected, Err(WorkflowError::StateConflict { .. })));

    // The caller was told the workflow finished.
    let sent = h.notifier.sent().await;
    assert!(sent.iter().any(|n| n.subject == "Workflow completed"));
}

#[tokio::test]
async fn test_cancel_is_terminal_with_reason() {
    let h = harness().await;
    let handle = h
        .orchestrator
        .start("case-042", "legal-case")
        .await
        .expect("Start failed");
    let id = handle.instance_id;

    h.orchestrator
        .signal(
            id,
            Signal::Cancel {
                reason: "client withdrew".to_string(),
            },
        )
        .await
        .expect("Cancel failed");

    let state = h.orchestrator.get_state(id).await.expect("Query failed");
    assert_eq!(state.run_state, RunState::Cancelled);
    assert_eq!(state.cancel_reason.as_deref(), Some("client withdrew"));

    let rejected = h.orchestrator.signal(id, complete_retainer()).await;
    assert!(matches!(rejected, Err(WorkflowError::Cancelled)));
}

#[tokio::test]
async fn test_audit_ledger_records_every_outcome() {
    let h = harness().await;
    let handle = h
        .orchestrator
        .start("case-042", "legal-case")
        .await
        .expect("Start failed");
    let id = handle.instance_id;

    // One rejection, then an applied completion and transition.
    let _ = h.orchestrator.signal(id, transition_to("discovery")).await;
    h.orchestrator
        .signal(id, complete_retainer())
        .await
        .expect("Completion failed");
    h.orchestrator
        .signal(id, transition_to("discovery"))
        .await
        .expect("Transition failed");

    let log = h.store.audit_log(id).await.expect("Audit read failed");
    let types: Vec<&str> = log.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"instance_started"));
    assert!(types.contains(&"signal_rejected"));
    assert!(types.contains(&"requirement_completed"));
    assert!(types.contains(&"stage_transitioned"));

    // Sequences of applied entries are strictly increasing.
    let applied: Vec<u64> = log
        .iter()
        .filter(|e| e.event_type != "signal_rejected")
        .map(|e| e.sequence)
        .collect();
    let mut sorted = applied.clone();
    sorted.sort_unstable();
    assert_eq!(applied, sorted);
}

#[tokio::test]
async fn test_queries_do_not_mutate_state() {
    let h = harness().await;
    let handle = h
        .orchestrator
        .start("case-042", "legal-case")
        .await
        .expect("Start failed");
    let id = handle.instance_id;

    let before = h.orchestrator.get_state(id).await.expect("Query failed");
    let _ = h.orchestrator.current_phase(id).await.expect("Query failed");
    let pending = h
        .orchestrator
        .pending_requirements(id)
        .await
        .expect("Query failed");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].requirement_id, "upload-retainer");

    let after = h.orchestrator.get_state(id).await.expect("Query failed");
    assert_eq!(before, after);
}

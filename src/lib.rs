// Stageflow Library - Durable Workflow Orchestration
// This exposes the core components for testing and integration

pub mod audit;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod gateway;
pub mod instance;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod template;

// Re-export key types for easy access
pub use audit::{AuditEntry, ResultStatus};
pub use collaborators::{
    LoggingNotifier, NotificationSender, RateLimitedNotifier, SubjectRecordStore,
};
pub use config::{config, init_config, StageflowConfig};
pub use engine::{Effect, EngineOutcome, ExecutionEngine, Signal, SignalAck, WorkflowEvent};
pub use errors::WorkflowError;
pub use executor::{ActivityError, ActivityExecutor, EffectKey, RetryPolicy};
pub use gateway::{CurrentPhase, GatewayDeps, InstanceSnapshot, SignalGateway};
pub use instance::{
    CompletedRequirement, CourtDate, Deadline, FiredReminder, OffsetLabel, ReminderKind, RunState,
    StageHistoryEntry, WorkflowInstance,
};
pub use orchestrator::{InstanceHandle, OperationalStatus, Orchestrator, RecoveryReport};
pub use scheduler::{PendingReminder, ReminderScheduler};
pub use store::{
    FileInstanceStore, InMemoryInstanceStore, InstanceStore, PersistenceError, StoredInstance,
};
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use template::{
    CachedTemplateStore, InMemoryTemplateStore, Stage, StageRequirement, TemplateStore,
    WorkflowTemplate,
};

//! Durable instance store
//!
//! Key-value persistence keyed by instance id: the current execution
//! state blob (optimistically versioned) plus the append-only audit
//! ledger. The engine considers a transition committed only once the
//! store has acknowledged both writes.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::instance::WorkflowInstance;

pub use fs::FileInstanceStore;
pub use memory::InMemoryInstanceStore;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u64, found: u64 },

    #[error("state corruption detected: {reason}")]
    Corrupted { reason: String },
}

impl PersistenceError {
    /// Infrastructure hiccups are retried; corruption and version
    /// conflicts are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PersistenceError::Io(_) | PersistenceError::Serialization(_)
        )
    }
}

/// State blob plus the version to pass back on the next save.
#[derive(Debug, Clone)]
pub struct StoredInstance {
    pub instance: WorkflowInstance,
    pub version: u64,
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn load(&self, instance_id: Uuid) -> Result<Option<StoredInstance>, PersistenceError>;

    /// Save with optimistic versioning: `expected_version = 0` creates,
    /// otherwise the stored version must match. Returns the new
    /// version. Saves are upserts — replaying a save of the same state
    /// is harmless.
    async fn save(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> Result<u64, PersistenceError>;

    /// Upsert an audit entry keyed by `(instance_id, sequence,
    /// event_type)`; re-appending after a crash does not duplicate.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), PersistenceError>;

    async fn audit_log(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, PersistenceError>;

    /// Ids of every persisted instance, for the recovery scan.
    async fn list_instances(&self) -> Result<Vec<Uuid>, PersistenceError>;
}

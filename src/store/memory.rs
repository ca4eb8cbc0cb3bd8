use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::instance::WorkflowInstance;
use crate::store::{InstanceStore, PersistenceError, StoredInstance};

/// In-memory store for tests and embedded use. Same versioning and
/// upsert semantics as the durable implementations.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: Mutex<HashMap<Uuid, (WorkflowInstance, u64)>>,
    audit: Mutex<HashMap<Uuid, Vec<AuditEntry>>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn load(&self, instance_id: Uuid) -> Result<Option<StoredInstance>, PersistenceError> {
        let instances = self.instances.lock().await;
        Ok(instances.get(&instance_id).map(|(instance, version)| StoredInstance {
            instance: instance.clone(),
            version: *version,
        }))
    }

    async fn save(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> Result<u64, PersistenceError> {
        let mut instances = self.instances.lock().await;
        let found = instances
            .get(&instance.instance_id)
            .map(|(_, version)| *version)
            .unwrap_or(0);
        if found != expected_version {
            return Err(PersistenceError::VersionMismatch {
                expected: expected_version,
                found,
            });
        }
        let new_version = expected_version + 1;
        instances.insert(instance.instance_id, (instance.clone(), new_version));
        Ok(new_version)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), PersistenceError> {
        let mut audit = self.audit.lock().await;
        let log = audit.entry(entry.instance_id).or_default();
        if let Some(existing) = log
            .iter_mut()
            .find(|e| e.sequence == entry.sequence && e.event_type == entry.event_type)
        {
            *existing = entry.clone();
        } else {
            log.push(entry.clone());
        }
        Ok(())
    }

    async fn audit_log(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, PersistenceError> {
        let audit = self.audit.lock().await;
        Ok(audit.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn list_instances(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let instances = self.instances.lock().await;
        Ok(instances.keys().copied().collect())
    }
}

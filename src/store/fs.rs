use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::instance::WorkflowInstance;
use crate::store::{InstanceStore, PersistenceError, StoredInstance};

/// On-disk JSON envelope: version for optimistic locking, integrity
/// hash verified on load.
#[derive(Debug, Serialize, Deserialize)]
struct StateEnvelope {
    version: u64,
    integrity_hash: String,
    saved_at: DateTime<Utc>,
    instance: WorkflowInstance,
}

/// Filesystem instance store: one `<id>.state.json` and one
/// `<id>.audit.json` per instance. Writes go through a temp file and
/// an atomic rename so a crash mid-write never leaves a torn state
/// blob.
pub struct FileInstanceStore {
    root: PathBuf,
}

impl FileInstanceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn state_path(&self, instance_id: Uuid) -> PathBuf {
        self.root.join(format!("{instance_id}.state.json"))
    }

    fn audit_path(&self, instance_id: Uuid) -> PathBuf {
        self.root.join(format!("{instance_id}.audit.json"))
    }

    async fn ensure_root(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn integrity_hash(instance: &WorkflowInstance) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        instance.instance_id.hash(&mut hasher);
        instance.template_id.hash(&mut hasher);
        instance.current_stage_id.hash(&mut hasher);
        instance.sequence.hash(&mut hasher);
        instance.stage_history.len().hash(&mut hasher);
        instance.created_at.timestamp().hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    async fn read_envelope(&self, instance_id: Uuid) -> Result<Option<StateEnvelope>, PersistenceError> {
        let path = self.state_path(instance_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: StateEnvelope =
            serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupted {
                reason: format!("unreadable state file for {instance_id}: {e}"),
            })?;
        Ok(Some(envelope))
    }
}

#[async_trait]
impl InstanceStore for FileInstanceStore {
    async fn load(&self, instance_id: Uuid) -> Result<Option<StoredInstance>, PersistenceError> {
        let envelope = match self.read_envelope(instance_id).await? {
            Some(envelope) => envelope,
            None => return Ok(None),
        };

        let expected = Self::integrity_hash(&envelope.instance);
        if expected != envelope.integrity_hash {
            warn!(
                instance_id = %instance_id,
                "Integrity hash mismatch on load"
            );
            return Err(PersistenceError::Corrupted {
                reason: format!("integrity hash mismatch for {instance_id}"),
            });
        }

        Ok(Some(StoredInstance {
            instance: envelope.instance,
            version: envelope.version,
        }))
    }

    async fn save(
        &self,
        instance: &WorkflowInstance,
        expected_version: u64,
    ) -> Result<u64, PersistenceError> {
        self.ensure_root().await?;

        let found = self
            .read_envelope(instance.instance_id)
            .await?
            .map(|e| e.version)
            .unwrap_or(0);
        if found != expected_version {
            return Err(PersistenceError::VersionMismatch {
                expected: expected_version,
                found,
            });
        }

        let envelope = StateEnvelope {
            version: expected_version + 1,
            integrity_hash: Self::integrity_hash(instance),
            saved_at: Utc::now(),
            instance: instance.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        self.write_atomic(&self.state_path(instance.instance_id), &bytes)
            .await?;

        debug!(
            instance_id = %instance.instance_id,
            version = %envelope.version,
            "Persisted instance state"
        );
        Ok(envelope.version)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), PersistenceError> {
        self.ensure_root().await?;

        let path = self.audit_path(entry.instance_id);
        let mut log: Vec<AuditEntry> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupted {
                reason: format!("unreadable audit file for {}: {e}", entry.instance_id),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        if let Some(existing) = log
            .iter_mut()
            .find(|e| e.sequence == entry.sequence && e.event_type == entry.event_type)
        {
            *existing = entry.clone();
        } else {
            log.push(entry.clone());
        }

        let bytes = serde_json::to_vec_pretty(&log)?;
        self.write_atomic(&path, &bytes).await?;
        Ok(())
    }

    async fn audit_log(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, PersistenceError> {
        match fs::read(self.audit_path(instance_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupted {
                reason: format!("unreadable audit file for {instance_id}: {e}"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_instances(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".state.json") {
                if let Ok(id) = stem.parse::<Uuid>() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ResultStatus;
    use crate::template::{Stage, WorkflowTemplate};

    fn instance() -> WorkflowInstance {
        let template = WorkflowTemplate {
            template_id: "case".to_string(),
            stages: vec![Stage {
                stage_id: "intake".to_string(),
                name: "Intake".to_string(),
                requirements: vec![],
            }],
        };
        WorkflowInstance::start(&template, "subject-1".to_string(), Utc::now())
    }

    #[tokio::test]
    async fn test_round_trip_and_versioning() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileInstanceStore::new(dir.path());
        let instance = instance();

        let v1 = store.save(&instance, 0).await.expect("Create failed");
        assert_eq!(v1, 1);

        let loaded = store
            .load(instance.instance_id)
            .await
            .expect("Load failed")
            .expect("Instance missing");
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.instance, instance);

        let stale = store.save(&instance, 0).await;
        assert!(matches!(stale, Err(PersistenceError::VersionMismatch { .. })));

        assert_eq!(store.list_instances().await.unwrap(), vec![instance.instance_id]);
    }

    #[tokio::test]
    async fn test_corrupted_state_file_detected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileInstanceStore::new(dir.path());
        let instance = instance();
        store.save(&instance, 0).await.expect("Create failed");

        let path = dir.path().join(format!("{}.state.json", instance.instance_id));
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let result = store.load(instance.instance_id).await;
        assert!(matches!(result, Err(PersistenceError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_tampered_state_fails_integrity_check() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileInstanceStore::new(dir.path());
        let instance = instance();
        store.save(&instance, 0).await.expect("Create failed");

        let path = dir.path().join(format!("{}.state.json", instance.instance_id));
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let tampered = text.replace("\"intake\"", "\"appeal\"");
        assert_ne!(text, tampered);
        tokio::fs::write(&path, tampered).await.unwrap();

        let result = store.load(instance.instance_id).await;
        assert!(matches!(result, Err(PersistenceError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_audit_upsert_survives_replay() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FileInstanceStore::new(dir.path());
        let instance_id = Uuid::new_v4();
        let entry = AuditEntry::new(
            instance_id,
            3,
            Utc::now(),
            "scheduler",
            "reminder_fired",
            serde_json::json!({"label": "7d-before"}),
            ResultStatus::Applied,
        );

        store.append_audit(&entry).await.unwrap();
        store.append_audit(&entry).await.unwrap();

        let log = store.audit_log(instance_id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].sequence, 3);
    }
}

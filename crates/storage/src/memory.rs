//! In-memory store.
//!
//! The deployment used by tests and single-process runs. Persistent
//! engines plug in behind the same [`TaskStore`]/[`ServiceStore`] traits.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use lattice_core::{
    ProcedureKind, ServiceRecord, ServiceStatus, TaskId, TaskRecord, TaskSpec, TaskStatus,
};

use crate::error::StorageError;
use crate::store::{ServiceStore, SubmitOutcome, TaskStore};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    /// hash_index -> task id, the dedup index.
    task_hashes: HashMap<String, TaskId>,
    services: HashMap<String, ServiceRecord>,
    service_hashes: HashMap<String, String>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task records held (dedup means this can be smaller than
    /// the number of submissions).
    pub fn task_count(&self) -> usize {
        self.inner.read().map(|g| g.tasks.len()).unwrap_or(0)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StorageError> {
        self.inner
            .write()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StorageError> {
        self.inner
            .read()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn submit_task(
        &self,
        spec: TaskSpec,
        program: &str,
        procedure: ProcedureKind,
    ) -> Result<SubmitOutcome, StorageError> {
        let mut inner = self.write()?;
        let hash_index = spec.hash_index(program, procedure);

        if let Some(existing) = inner.task_hashes.get(&hash_index) {
            debug!(hash_index = %hash_index, id = %existing, "task submission deduplicated");
            return Ok(SubmitOutcome {
                id: existing.clone(),
                duplicate: true,
            });
        }

        let record = TaskRecord::new(spec, program, procedure);
        let id = record.id.clone();
        inner.task_hashes.insert(hash_index, id.clone());
        inner.tasks.insert(id.clone(), record);
        Ok(SubmitOutcome {
            id,
            duplicate: false,
        })
    }

    async fn get_tasks_by_id(&self, ids: &[TaskId]) -> Result<Vec<TaskRecord>, StorageError> {
        let inner = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn get_tasks_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<TaskRecord>, StorageError> {
        let inner = self.read()?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn mark_running(&self, ids: &[TaskId]) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        for id in ids {
            let task = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| StorageError::TaskNotFound(id.clone()))?;
            if task.status != TaskStatus::Waiting {
                return Err(StorageError::InvalidTransition(format!(
                    "task {id} is {} and cannot start running",
                    task.status
                )));
            }
            task.status = TaskStatus::Running;
            task.modified_on = Utc::now();
        }
        Ok(())
    }

    async fn complete_task(&self, id: &str, result: Value) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
        task.status = TaskStatus::Complete;
        task.result = Some(result);
        task.error_message = None;
        task.modified_on = Utc::now();
        Ok(())
    }

    async fn fail_task(&self, id: &str, error_message: String) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
        task.status = TaskStatus::Error;
        task.result = None;
        task.error_message = Some(error_message);
        task.modified_on = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn submit_service(&self, record: ServiceRecord) -> Result<SubmitOutcome, StorageError> {
        let mut inner = self.write()?;

        if let Some(existing) = inner.service_hashes.get(&record.hash_index) {
            debug!(hash_index = %record.hash_index, id = %existing, "service submission deduplicated");
            return Ok(SubmitOutcome {
                id: existing.clone(),
                duplicate: true,
            });
        }

        let id = record.id.clone();
        inner
            .service_hashes
            .insert(record.hash_index.clone(), id.clone());
        inner.services.insert(id.clone(), record);
        Ok(SubmitOutcome {
            id,
            duplicate: false,
        })
    }

    async fn update_service(&self, record: &ServiceRecord) -> Result<(), StorageError> {
        let mut inner = self.write()?;
        if !inner.services.contains_key(&record.id) {
            return Err(StorageError::ServiceNotFound(record.id.clone()));
        }
        let mut updated = record.clone();
        updated.modified_on = Utc::now();
        inner.services.insert(record.id.clone(), updated);
        Ok(())
    }

    async fn get_service(&self, id: &str) -> Result<ServiceRecord, StorageError> {
        let inner = self.read()?;
        inner
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ServiceNotFound(id.to_string()))
    }

    async fn get_services_by_status(
        &self,
        status: ServiceStatus,
    ) -> Result<Vec<ServiceRecord>, StorageError> {
        let inner = self.read()?;
        Ok(inner
            .services
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn find_service_by_hash(
        &self,
        hash_index: &str,
    ) -> Result<Option<ServiceRecord>, StorageError> {
        let inner = self.read()?;
        Ok(inner
            .service_hashes
            .get(hash_index)
            .and_then(|id| inner.services.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(function: &str) -> TaskSpec {
        let mut s = TaskSpec::new(function);
        s.kwargs.insert("method".into(), json!("uff"));
        s
    }

    #[tokio::test]
    async fn submit_task_dedups_on_hash() {
        let store = MemoryStore::new();
        let first = store
            .submit_task(spec("evaluate"), "mock", ProcedureKind::Single)
            .await
            .unwrap();
        let second = store
            .submit_task(spec("evaluate"), "mock", ProcedureKind::Single)
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.id, second.id);
        assert_eq!(store.task_count(), 1);
    }

    #[tokio::test]
    async fn different_specs_create_distinct_tasks() {
        let store = MemoryStore::new();
        let a = store
            .submit_task(spec("evaluate"), "mock", ProcedureKind::Single)
            .await
            .unwrap();
        let b = store
            .submit_task(spec("optimize"), "mock", ProcedureKind::Single)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.task_count(), 2);
    }

    #[tokio::test]
    async fn resolution_is_mutually_exclusive() {
        let store = MemoryStore::new();
        let out = store
            .submit_task(spec("evaluate"), "mock", ProcedureKind::Single)
            .await
            .unwrap();

        store.complete_task(&out.id, json!({"value": 1.0})).await.unwrap();
        let rec = &store.get_tasks_by_id(&[out.id.clone()]).await.unwrap()[0];
        assert_eq!(rec.status, TaskStatus::Complete);
        assert!(rec.result.is_some());
        assert!(rec.error_message.is_none());

        store.fail_task(&out.id, "boom".into()).await.unwrap();
        let rec = &store.get_tasks_by_id(&[out.id.clone()]).await.unwrap()[0];
        assert_eq!(rec.status, TaskStatus::Error);
        assert!(rec.result.is_none());
        assert_eq!(rec.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn mark_running_requires_waiting() {
        let store = MemoryStore::new();
        let out = store
            .submit_task(spec("evaluate"), "mock", ProcedureKind::Single)
            .await
            .unwrap();
        store.mark_running(&[out.id.clone()]).await.unwrap();
        assert!(store.mark_running(&[out.id.clone()]).await.is_err());
    }

    #[tokio::test]
    async fn service_submission_dedups_on_hash() {
        let store = MemoryStore::new();
        let rec = ServiceRecord::new("grid_exploration", "mock", "hash-a");
        let first = store.submit_service(rec.clone()).await.unwrap();
        let second = store
            .submit_service(ServiceRecord::new("grid_exploration", "mock", "hash-a"))
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.id, second.id);

        let found = store.find_service_by_hash("hash-a").await.unwrap();
        assert_eq!(found.unwrap().id, rec.id);
    }

    #[tokio::test]
    async fn unknown_ids_are_absent_not_errors() {
        let store = MemoryStore::new();
        let recs = store
            .get_tasks_by_id(&["missing".to_string()])
            .await
            .unwrap();
        assert!(recs.is_empty());
    }
}

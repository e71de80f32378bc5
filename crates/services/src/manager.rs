//! Round-local task tracking.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use lattice_core::{ProcedureKind, TaskId, TaskRecord, TaskStatus};
use lattice_storage::{StorageError, TaskStore};

use crate::error::ServiceError;
use crate::procedures::{submit_packets, TaskPacket};

/// Tracks the outstanding tasks of one service round.
///
/// Constructed empty, populated by [`submit_tasks`](Self::submit_tasks),
/// consumed through [`done`](Self::done)/[`get_tasks`](Self::get_tasks)
/// once the round resolves. The store is the single source of truth:
/// `done()` re-queries it on every call and never caches status.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    required_tasks: IndexMap<String, TaskId>,
}

impl TaskManager {
    /// A fresh manager with no outstanding round. Every service constructs
    /// its own; managers are never shared.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            required_tasks: IndexMap::new(),
        }
    }

    /// Whether a round is currently outstanding.
    pub fn has_outstanding(&self) -> bool {
        !self.required_tasks.is_empty()
    }

    /// Ids of the current round's required tasks, in submission order.
    pub fn required_ids(&self) -> Vec<TaskId> {
        self.required_tasks.values().cloned().collect()
    }

    /// Submit a round of task packets through the procedure-specific
    /// submission path. On success the previous round-key mapping is
    /// replaced wholesale.
    pub async fn submit_tasks(
        &mut self,
        procedure: ProcedureKind,
        tasks: IndexMap<String, TaskPacket>,
    ) -> Result<bool, ServiceError> {
        let required = submit_packets(self.store.as_ref(), procedure, tasks).await?;
        self.required_tasks = required;
        Ok(true)
    }

    /// Check whether the current round has fully resolved.
    ///
    /// Returns `Ok(false)` while any required task is missing from the
    /// store or still WAITING/RUNNING, `Ok(true)` once every task is
    /// COMPLETE. Any task in ERROR raises a round failure carrying the
    /// aggregated error detail of every erred task.
    pub async fn done(&self) -> Result<bool, ServiceError> {
        if self.required_tasks.is_empty() {
            return Ok(true);
        }

        let ids = self.required_ids();
        let records = self.store.get_tasks_by_id(&ids).await?;
        if records.len() != ids.len() {
            return Ok(false);
        }

        let errored: Vec<&TaskRecord> = records
            .iter()
            .filter(|r| r.status == TaskStatus::Error)
            .collect();
        if !errored.is_empty() {
            self.log_error_diagnostics().await;
            let messages = errored
                .iter()
                .map(|record| {
                    let key = self
                        .required_tasks
                        .iter()
                        .find(|(_, id)| **id == record.id)
                        .map(|(k, _)| k.as_str())
                        .unwrap_or("?");
                    format!(
                        "task '{key}' ({}): {}",
                        record.id,
                        record
                            .error_message
                            .as_deref()
                            .unwrap_or("no failure detail recorded")
                    )
                })
                .collect();
            return Err(ServiceError::RoundFailure { messages });
        }

        Ok(records.iter().all(|r| r.status == TaskStatus::Complete))
    }

    /// Pull the stored records for every required task. Meaningful only
    /// once `done()` has returned true.
    pub async fn get_tasks(&self) -> Result<IndexMap<String, TaskRecord>, ServiceError> {
        let ids = self.required_ids();
        let records = self.store.get_tasks_by_id(&ids).await?;
        let mut by_id: std::collections::HashMap<TaskId, TaskRecord> = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let mut ret = IndexMap::with_capacity(self.required_tasks.len());
        for (key, id) in &self.required_tasks {
            let record = by_id
                .remove(id)
                .ok_or_else(|| ServiceError::Storage(StorageError::TaskNotFound(id.clone())))?;
            ret.insert(key.clone(), record);
        }
        Ok(ret)
    }

    /// Store-wide ERROR diagnostics, logged when a round fails.
    async fn log_error_diagnostics(&self) {
        match self.store.get_tasks_by_status(TaskStatus::Error).await {
            Ok(tasks) => {
                for task in tasks {
                    warn!(
                        id = %task.id,
                        function = %task.spec.function,
                        error = task.error_message.as_deref().unwrap_or("unknown"),
                        "task in error state"
                    );
                }
            }
            Err(e) => warn!(error = %e, "could not fetch error diagnostics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_storage::MemoryStore;
    use serde_json::json;

    fn packet(function: &str, x: f64) -> TaskPacket {
        let mut p = TaskPacket::new("mock", function);
        p.kwargs.insert("x".into(), json!(x));
        p
    }

    fn round(packets: Vec<(&str, TaskPacket)>) -> IndexMap<String, TaskPacket> {
        packets
            .into_iter()
            .map(|(k, p)| (k.to_string(), p))
            .collect()
    }

    #[tokio::test]
    async fn empty_manager_is_done() {
        let store = Arc::new(MemoryStore::new());
        let manager = TaskManager::new(store);
        assert!(manager.done().await.unwrap());
        assert!(!manager.has_outstanding());
    }

    #[tokio::test]
    async fn done_is_false_until_every_task_completes() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = TaskManager::new(Arc::clone(&store) as Arc<dyn TaskStore>);
        manager
            .submit_tasks(
                ProcedureKind::Single,
                round(vec![("a", packet("f", 1.0)), ("b", packet("f", 2.0))]),
            )
            .await
            .unwrap();

        // Both waiting.
        assert!(!manager.done().await.unwrap());

        let ids = manager.required_ids();
        store.mark_running(&ids).await.unwrap();
        assert!(!manager.done().await.unwrap());

        store.complete_task(&ids[0], json!({"v": 1})).await.unwrap();
        assert!(!manager.done().await.unwrap());

        store.complete_task(&ids[1], json!({"v": 2})).await.unwrap();
        assert!(manager.done().await.unwrap());
    }

    #[tokio::test]
    async fn errored_task_raises_round_failure_naming_the_task() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = TaskManager::new(Arc::clone(&store) as Arc<dyn TaskStore>);
        manager
            .submit_tasks(
                ProcedureKind::Single,
                round(vec![("good", packet("f", 1.0)), ("bad", packet("f", 2.0))]),
            )
            .await
            .unwrap();

        let ids = manager.required_ids();
        store.complete_task(&ids[0], json!({"v": 1})).await.unwrap();
        store
            .fail_task(&ids[1], "method blew up".into())
            .await
            .unwrap();

        let err = manager.done().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("did not execute successfully"));
        assert!(message.contains("'bad'"));
        assert!(message.contains("method blew up"));
        assert!(!message.contains("'good'"));
    }

    #[tokio::test]
    async fn error_raises_even_while_siblings_run() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = TaskManager::new(Arc::clone(&store) as Arc<dyn TaskStore>);
        manager
            .submit_tasks(
                ProcedureKind::Single,
                round(vec![("a", packet("f", 1.0)), ("b", packet("f", 2.0))]),
            )
            .await
            .unwrap();

        let ids = manager.required_ids();
        store.fail_task(&ids[0], "boom".into()).await.unwrap();
        // Second task still WAITING: the failure surfaces anyway.
        assert!(manager.done().await.is_err());
    }

    #[tokio::test]
    async fn malformed_packets_surface_every_error() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = TaskManager::new(Arc::clone(&store) as Arc<dyn TaskStore>);

        let mut empty_function = TaskPacket::new("mock", "");
        empty_function.kwargs.insert("x".into(), json!(1.0));
        let empty_program = TaskPacket::new("", "f");

        let err = manager
            .submit_tasks(
                ProcedureKind::Single,
                round(vec![("p1", empty_function), ("p2", empty_program)]),
            )
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("'p1'"));
        assert!(message.contains("'p2'"));
        assert!(!manager.has_outstanding());
    }

    #[tokio::test]
    async fn resubmission_replaces_the_round_mapping() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = TaskManager::new(Arc::clone(&store) as Arc<dyn TaskStore>);
        manager
            .submit_tasks(ProcedureKind::Single, round(vec![("a", packet("f", 1.0))]))
            .await
            .unwrap();
        let first = manager.required_ids();

        manager
            .submit_tasks(ProcedureKind::Single, round(vec![("b", packet("f", 2.0))]))
            .await
            .unwrap();
        let second = manager.required_ids();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0], second[0]);
    }

    #[tokio::test]
    async fn get_tasks_returns_results_by_round_key() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = TaskManager::new(Arc::clone(&store) as Arc<dyn TaskStore>);
        manager
            .submit_tasks(ProcedureKind::Single, round(vec![("a", packet("f", 1.0))]))
            .await
            .unwrap();

        let ids = manager.required_ids();
        store
            .complete_task(&ids[0], json!({"value": 42}))
            .await
            .unwrap();

        let tasks = manager.get_tasks().await.unwrap();
        assert_eq!(tasks["a"].result, Some(json!({"value": 42})));
    }
}

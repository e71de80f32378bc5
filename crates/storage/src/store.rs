//! Narrow store interface consumed by the orchestration core.
//!
//! The store is the single source of truth for task and service state;
//! callers never cache status across polls. Implementations must provide
//! at least read-your-writes consistency.

use async_trait::async_trait;
use serde_json::Value;

use lattice_core::{
    ProcedureKind, ServiceRecord, ServiceStatus, TaskId, TaskRecord, TaskSpec, TaskStatus,
};

use crate::error::StorageError;

/// Outcome of a deduplicated insert: the record id plus whether an
/// existing record was reused.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub id: String,
    pub duplicate: bool,
}

/// Task-side store operations.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task record, deduplicating on `hash_index`: resubmitting a
    /// specification whose hash already exists returns the existing id
    /// instead of creating a new record.
    async fn submit_task(
        &self,
        spec: TaskSpec,
        program: &str,
        procedure: ProcedureKind,
    ) -> Result<SubmitOutcome, StorageError>;

    /// Fetch records for the given ids. Unknown ids are silently absent
    /// from the result, so callers can distinguish "not yet visible".
    async fn get_tasks_by_id(&self, ids: &[TaskId]) -> Result<Vec<TaskRecord>, StorageError>;

    /// Fetch every record currently in `status` (used for dispatch and
    /// error diagnostics).
    async fn get_tasks_by_status(&self, status: TaskStatus)
        -> Result<Vec<TaskRecord>, StorageError>;

    /// Mark WAITING tasks as RUNNING once handed to a backend.
    async fn mark_running(&self, ids: &[TaskId]) -> Result<(), StorageError>;

    /// Resolve a task successfully, storing its result payload.
    async fn complete_task(&self, id: &str, result: Value) -> Result<(), StorageError>;

    /// Resolve a task as failed, storing the backend's failure detail.
    async fn fail_task(&self, id: &str, error_message: String) -> Result<(), StorageError>;
}

/// Service-side store operations.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Insert a service record, deduplicating on the service-level
    /// `hash_index`.
    async fn submit_service(&self, record: ServiceRecord) -> Result<SubmitOutcome, StorageError>;

    /// Persist the current state of a service record.
    async fn update_service(&self, record: &ServiceRecord) -> Result<(), StorageError>;

    async fn get_service(&self, id: &str) -> Result<ServiceRecord, StorageError>;

    async fn get_services_by_status(
        &self,
        status: ServiceStatus,
    ) -> Result<Vec<ServiceRecord>, StorageError>;

    async fn find_service_by_hash(
        &self,
        hash_index: &str,
    ) -> Result<Option<ServiceRecord>, StorageError>;
}

/// Combined handle used by the reconciliation runner.
pub trait Store: TaskStore + ServiceStore {}

impl<T: TaskStore + ServiceStore> Store for T {}

//! Service capability interface.
//!
//! A service is the {build, iterate, status, output} capability set;
//! concrete procedures are a closed set of variants behind
//! [`build_service`]. Adding a procedure means a new [`ServiceInput`]
//! variant and a factory arm, never open dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lattice_core::{service_hash, ServiceRecord, ServiceStatus};
use lattice_storage::TaskStore;

use crate::error::ServiceError;
use crate::grid::{GridService, GridServiceInput};
use crate::manager::TaskManager;
use crate::scan::{ScanService, ScanServiceInput};

/// A long-running procedure that iterates rounds of tasks until it
/// converges or fails.
#[async_trait]
pub trait Service: Send {
    /// The persisted record: identification, status, accumulated output.
    fn record(&self) -> &ServiceRecord;

    /// Mutable record access, used by the runner to mark a service failed
    /// when iteration itself errors.
    fn record_mut(&mut self) -> &mut ServiceRecord;

    fn status(&self) -> ServiceStatus {
        self.record().status
    }

    fn output(&self) -> &Value {
        &self.record().output
    }

    /// Take one step. Returns true once the service is finished
    /// (COMPLETE or ERROR). While the current round is unresolved this is
    /// an idempotent poll: prompt, and free of side effects.
    async fn iterate(&mut self) -> Result<bool, ServiceError>;
}

/// Initial parameters for one service, tagged by procedure family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "procedure", rename_all = "snake_case")]
pub enum ServiceInput {
    GridExploration(GridServiceInput),
    SequentialScan(ScanServiceInput),
}

impl ServiceInput {
    pub fn procedure(&self) -> &'static str {
        match self {
            ServiceInput::GridExploration(_) => "grid_exploration",
            ServiceInput::SequentialScan(_) => "sequential_scan",
        }
    }

    pub fn program(&self) -> &str {
        match self {
            ServiceInput::GridExploration(input) => &input.program,
            ServiceInput::SequentialScan(input) => &input.program,
        }
    }

    /// Service-level content address over the full input, metadata
    /// included. Lives in a separate hash namespace from task hashes.
    pub fn hash_index(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        service_hash(self.procedure(), self.program(), &value)
    }
}

/// Shared per-service state: the persisted record plus the round-scoped
/// task manager. Every service owns a fresh manager from construction.
pub(crate) struct ServiceCore {
    pub record: ServiceRecord,
    pub manager: TaskManager,
}

impl ServiceCore {
    pub fn new(
        store: Arc<dyn TaskStore>,
        procedure: &str,
        program: &str,
        hash_index: String,
    ) -> Self {
        Self {
            record: ServiceRecord::new(procedure, program, hash_index),
            manager: TaskManager::new(store),
        }
    }

    /// Terminal failure: record the message, keep the status machine in
    /// exactly one state.
    pub fn fail(&mut self, err: &ServiceError) {
        self.record.status = ServiceStatus::Error;
        self.record.error_message = Some(err.to_string());
    }
}

/// Build the service for an input. Validation failures surface as
/// [`ServiceError::ServiceBuild`]; the caller records them as an ERROR
/// service that never submits a round.
pub fn build_service(
    store: Arc<dyn TaskStore>,
    input: ServiceInput,
) -> Result<Box<dyn Service>, ServiceError> {
    match input {
        ServiceInput::GridExploration(input) => Ok(Box::new(GridService::new(store, input)?)),
        ServiceInput::SequentialScan(input) => Ok(Box::new(ScanService::new(store, input)?)),
    }
}

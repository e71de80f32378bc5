//! Queue backend abstraction.
//!
//! One adapter per concrete execution backend. Adapters are long-lived,
//! shared across every service using the same backend, and owned by the
//! orchestration loop; services never talk to a backend directly. The only
//! adapter-local mutable state is the in-flight queue map, and it is
//! touched exclusively by the single reconciliation loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use lattice_core::{BackendConfig, BackendKind, ProcedureKind, TaskId, TaskSpec};

use crate::error::QueueError;
use crate::http::HttpAdapter;
use crate::local::{LocalAdapter, ProgramRegistry};
use crate::sqs::SqsAdapter;

/// One work item handed to an adapter: the stored task id, its spec, the
/// parser used to normalize the raw backend payload, and opaque hooks
/// returned unchanged on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterTask {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub parser: ProcedureKind,
    #[serde(default)]
    pub hooks: Value,
}

/// Raw terminal payload for one backend job. A failed job carries the
/// original task spec plus the backend's failure message so an error
/// record can be built without another backend round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBlob {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub task: Option<TaskSpec>,
}

impl ResultBlob {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error_message: None,
            task: None,
        }
    }

    pub fn failed(spec: TaskSpec, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error_message: Some(message.into()),
            task: Some(spec),
        }
    }
}

/// A resolved backend job: the blob plus the parser and hooks recorded at
/// submission time.
#[derive(Debug, Clone)]
pub struct CompletedTask {
    pub blob: ResultBlob,
    pub parser: ProcedureKind,
    pub hooks: Value,
}

/// Bookkeeping entry held in an adapter's queue while the backend job is
/// in flight. Removed exactly once, when the job is observed terminal.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub parser: ProcedureKind,
    pub hooks: Value,
}

impl QueueEntry {
    pub(crate) fn from_task(task: &AdapterTask) -> Self {
        Self {
            id: task.id.clone(),
            spec: task.spec.clone(),
            parser: task.parser,
            hooks: task.hooks.clone(),
        }
    }
}

/// Uniform interface over one concrete execution backend.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Translate each task into the backend's native job representation,
    /// submit it, and record the job handle in the adapter's queue.
    /// A task id already present in the queue is never submitted twice.
    async fn submit_tasks(&mut self, tasks: Vec<AdapterTask>) -> Result<Vec<TaskId>, QueueError>;

    /// Poll the backend for jobs in a terminal state, removing each from
    /// the adapter's queue exactly once. Results for jobs no longer in the
    /// queue (e.g. a withdrawn service) are drained and discarded.
    async fn acquire_complete(&mut self) -> Result<HashMap<TaskId, CompletedTask>, QueueError>;

    /// Block until the backend drains all currently queued jobs to a
    /// terminal state. Bounded by the configured deadline; overrun is
    /// [`QueueError::Timeout`]. Used only in synchronous deployments.
    async fn await_results(&mut self) -> Result<bool, QueueError>;

    /// Release backend-side resources and reset queue state. Idempotent.
    async fn close(&mut self) -> Result<bool, QueueError>;

    /// Number of jobs currently tracked in the adapter's queue.
    fn queued(&self) -> usize;
}

/// Construct the configured backend's adapter.
///
/// Backend selection is a closed set resolved at configuration time:
/// adding a backend means a new [`BackendKind`] variant and an arm here,
/// never runtime inspection of a client object. The registry is consumed
/// by the local backend only; remote backends bring their own workers.
pub async fn build_queue_adapter(
    config: &BackendConfig,
    registry: Arc<ProgramRegistry>,
) -> Result<Box<dyn QueueAdapter>, QueueError> {
    let adapter: Box<dyn QueueAdapter> = match config.kind {
        BackendKind::Local => Box::new(LocalAdapter::new(registry)),
        BackendKind::Http => Box::new(HttpAdapter::new(config)?),
        BackendKind::Sqs => Box::new(SqsAdapter::new(config).await?),
    };
    info!(kind = ?config.kind, "queue adapter built");
    Ok(adapter)
}

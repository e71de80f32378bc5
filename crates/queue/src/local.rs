//! In-process execution backend.
//!
//! Jobs run on the tokio blocking pool through a registry of named handler
//! functions. Completion is observed by draining a shared finished map, so
//! `acquire_complete` stays a point-in-time poll like the remote backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lattice_core::{TaskId, TaskSpec};

use crate::adapter::{AdapterTask, CompletedTask, QueueAdapter, QueueEntry, ResultBlob};
use crate::error::QueueError;

type JobHandle = u64;

/// Handler executed for one task spec: returns the result payload or a
/// failure message.
pub type ProgramHandler = dyn Fn(&TaskSpec) -> Result<Value, String> + Send + Sync;

/// Named handler functions the local backend can execute.
#[derive(Default)]
pub struct ProgramRegistry {
    handlers: HashMap<String, Box<ProgramHandler>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a function name. Later registrations for
    /// the same name replace earlier ones.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&TaskSpec) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    fn run(&self, spec: &TaskSpec) -> ResultBlob {
        match self.handlers.get(&spec.function) {
            Some(handler) => match handler(spec) {
                Ok(data) => ResultBlob::ok(data),
                Err(message) => ResultBlob::failed(spec.clone(), message),
            },
            None => ResultBlob::failed(
                spec.clone(),
                format!("unknown function '{}'", spec.function),
            ),
        }
    }
}

/// Adapter executing jobs inside the current process.
pub struct LocalAdapter {
    registry: Arc<ProgramRegistry>,
    queue: HashMap<JobHandle, QueueEntry>,
    running: HashMap<JobHandle, JoinHandle<()>>,
    finished: Arc<Mutex<HashMap<JobHandle, ResultBlob>>>,
    next_handle: JobHandle,
}

impl LocalAdapter {
    pub fn new(registry: Arc<ProgramRegistry>) -> Self {
        Self {
            registry,
            queue: HashMap::new(),
            running: HashMap::new(),
            finished: Arc::new(Mutex::new(HashMap::new())),
            next_handle: 0,
        }
    }
}

#[async_trait]
impl QueueAdapter for LocalAdapter {
    async fn submit_tasks(&mut self, tasks: Vec<AdapterTask>) -> Result<Vec<TaskId>, QueueError> {
        let mut ret = Vec::with_capacity(tasks.len());

        for task in tasks {
            if self.queue.values().any(|entry| entry.id == task.id) {
                debug!(id = %task.id, "task already queued, not re-submitting");
                ret.push(task.id);
                continue;
            }

            let handle = self.next_handle;
            self.next_handle += 1;

            let registry = Arc::clone(&self.registry);
            let finished = Arc::clone(&self.finished);
            let spec = task.spec.clone();
            let panic_spec = task.spec.clone();

            let join = tokio::spawn(async move {
                let outcome =
                    tokio::task::spawn_blocking(move || registry.run(&spec)).await;
                let blob = match outcome {
                    Ok(blob) => blob,
                    Err(e) => ResultBlob::failed(panic_spec, format!("job panicked: {e}")),
                };
                match finished.lock() {
                    Ok(mut guard) => {
                        guard.insert(handle, blob);
                    }
                    Err(e) => warn!(handle, error = %e, "finished map poisoned, result lost"),
                }
            });

            self.queue.insert(handle, QueueEntry::from_task(&task));
            self.running.insert(handle, join);
            ret.push(task.id);
        }

        Ok(ret)
    }

    async fn acquire_complete(&mut self) -> Result<HashMap<TaskId, CompletedTask>, QueueError> {
        let drained: HashMap<JobHandle, ResultBlob> = {
            let mut guard = self
                .finished
                .lock()
                .map_err(|e| QueueError::LockPoisoned(e.to_string()))?;
            std::mem::take(&mut *guard)
        };

        let mut ret = HashMap::new();
        for (handle, blob) in drained {
            self.running.remove(&handle);
            match self.queue.remove(&handle) {
                Some(entry) => {
                    ret.insert(
                        entry.id,
                        CompletedTask {
                            blob,
                            parser: entry.parser,
                            hooks: entry.hooks,
                        },
                    );
                }
                // Owner withdrawn; drain and discard.
                None => debug!(handle, "discarding result for unqueued job"),
            }
        }

        Ok(ret)
    }

    async fn await_results(&mut self) -> Result<bool, QueueError> {
        let handles: Vec<(JobHandle, JoinHandle<()>)> = self.running.drain().collect();
        for (handle, join) in handles {
            if let Err(e) = join.await {
                warn!(handle, error = %e, "job driver task failed");
            }
        }
        Ok(true)
    }

    async fn close(&mut self) -> Result<bool, QueueError> {
        for (_, join) in self.running.drain() {
            join.abort();
        }
        self.queue.clear();
        if let Ok(mut guard) = self.finished.lock() {
            guard.clear();
        }
        Ok(true)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

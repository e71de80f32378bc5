//! Reconciliation loop driving adapters and services.
//!
//! A single cooperative loop: fold completed backend jobs into the store,
//! take one `iterate()` step on every active service, then hand newly
//! created WAITING tasks to the backend. One service failing never stops
//! the loop from iterating the others.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use lattice_core::{RunnerConfig, ServiceId, ServiceRecord, ServiceStatus, TaskStatus};
use lattice_queue::{AdapterTask, QueueAdapter};
use lattice_storage::{Store, TaskStore};

use crate::error::ServiceError;
use crate::procedures::parse_result;
use crate::service::{build_service, Service, ServiceInput};

/// Owns the shared queue adapter and the active service set.
pub struct ServiceRunner<S: Store + 'static> {
    store: Arc<S>,
    adapter: Box<dyn QueueAdapter>,
    active: Vec<Box<dyn Service>>,
    config: RunnerConfig,
}

impl<S: Store + 'static> ServiceRunner<S> {
    pub fn new(store: Arc<S>, adapter: Box<dyn QueueAdapter>, config: RunnerConfig) -> Self {
        Self {
            store,
            adapter,
            active: Vec::new(),
            config,
        }
    }

    /// Number of services still iterating.
    pub fn active_services(&self) -> usize {
        self.active.len()
    }

    /// Submit a new service. Deduplicates on the service hash; a build
    /// failure is recorded as a terminal ERROR service that never ran.
    pub async fn submit_service(&mut self, input: ServiceInput) -> Result<ServiceId, ServiceError> {
        let task_store: Arc<dyn TaskStore> = Arc::clone(&self.store) as Arc<dyn TaskStore>;
        match build_service(task_store, input.clone()) {
            Ok(service) => {
                let outcome = self.store.submit_service(service.record().clone()).await?;
                if outcome.duplicate {
                    info!(id = %outcome.id, "service submission deduplicated");
                } else {
                    info!(
                        id = %outcome.id,
                        procedure = input.procedure(),
                        program = input.program(),
                        "service submitted"
                    );
                    self.active.push(service);
                }
                Ok(outcome.id)
            }
            Err(err @ ServiceError::ServiceBuild(_)) => {
                warn!(error = %err, "service failed to build");
                let mut record = ServiceRecord::new(
                    input.procedure(),
                    input.program(),
                    input.hash_index(),
                );
                record.status = ServiceStatus::Error;
                record.error_message = Some(err.to_string());
                let outcome = self.store.submit_service(record).await?;
                Ok(outcome.id)
            }
            Err(other) => Err(other),
        }
    }

    /// Withdraw a service from the active set. Its outstanding backend
    /// jobs stay in the adapter queue and are drained and discarded on a
    /// later `acquire_complete`.
    pub fn withdraw_service(&mut self, id: &str) -> bool {
        let before = self.active.len();
        self.active.retain(|service| service.record().id != id);
        before != self.active.len()
    }

    /// One reconciliation pass.
    pub async fn tick(&mut self) -> Result<(), ServiceError> {
        self.collect_completed().await?;
        self.iterate_services().await;
        self.dispatch_waiting().await?;
        Ok(())
    }

    /// Drive everything to quiescence: every active service terminal and
    /// the backend queue empty. Bounded by the configured round cap.
    pub async fn await_services(&mut self) -> Result<bool, ServiceError> {
        for _ in 0..self.config.max_drain_rounds {
            self.tick().await?;
            if self.active.is_empty() && self.adapter.queued() == 0 {
                return Ok(true);
            }
            self.adapter.await_results().await?;
        }
        Err(ServiceError::Other(format!(
            "services did not quiesce within {} drain rounds",
            self.config.max_drain_rounds
        )))
    }

    /// Release backend resources.
    pub async fn close(&mut self) -> Result<(), ServiceError> {
        self.adapter.close().await?;
        Ok(())
    }

    /// Fold completed backend jobs into the store. Per-task failures are
    /// data, not errors: they become ERROR task records.
    async fn collect_completed(&mut self) -> Result<(), ServiceError> {
        let completed = self.adapter.acquire_complete().await?;
        if completed.is_empty() {
            return Ok(());
        }
        debug!(count = completed.len(), "folding completed backend jobs");

        for (task_id, done) in completed {
            if done.blob.success {
                let data = parse_result(done.parser, done.blob.data);
                self.store.complete_task(&task_id, data).await?;
            } else {
                let message = done
                    .blob
                    .error_message
                    .unwrap_or_else(|| "backend reported failure without detail".to_string());
                self.store.fail_task(&task_id, message).await?;
            }
        }
        Ok(())
    }

    /// Take one step on every active service, retaining the unfinished
    /// ones. A failing service is marked ERROR and dropped; the loop
    /// continues with the rest.
    async fn iterate_services(&mut self) {
        let drained = std::mem::take(&mut self.active);
        let mut still_active = Vec::with_capacity(drained.len());

        for mut service in drained {
            let id = service.record().id.clone();
            match service.iterate().await {
                Ok(false) => {
                    self.persist(service.record()).await;
                    still_active.push(service);
                }
                Ok(true) => {
                    let record = service.record();
                    match record.status {
                        ServiceStatus::Error => warn!(
                            id = %id,
                            error = record.error_message.as_deref().unwrap_or("unknown"),
                            "service finished in error"
                        ),
                        _ => info!(id = %id, status = %record.status, "service finished"),
                    }
                    self.persist(record).await;
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "service iteration failed");
                    let record = service.record_mut();
                    record.status = ServiceStatus::Error;
                    record.error_message = Some(err.to_string());
                    self.persist(record).await;
                }
            }
        }

        self.active = still_active;
    }

    /// Hand WAITING store tasks to the backend and mark them RUNNING.
    async fn dispatch_waiting(&mut self) -> Result<(), ServiceError> {
        let waiting = self.store.get_tasks_by_status(TaskStatus::Waiting).await?;
        if waiting.is_empty() {
            return Ok(());
        }

        let tasks: Vec<AdapterTask> = waiting
            .iter()
            .map(|record| AdapterTask {
                id: record.id.clone(),
                spec: record.spec.clone(),
                parser: record.procedure,
                hooks: Value::Null,
            })
            .collect();

        let ids = self.adapter.submit_tasks(tasks).await?;
        self.store.mark_running(&ids).await?;
        debug!(count = ids.len(), "tasks dispatched to backend");
        Ok(())
    }

    /// Best-effort record persistence; a store hiccup must not kill the
    /// reconciliation loop.
    async fn persist(&self, record: &ServiceRecord) {
        if let Err(e) = self.store.update_service(record).await {
            warn!(id = %record.id, error = %e, "could not persist service record");
        }
    }
}

//! Remote-executor backend over HTTP.
//!
//! Talks to an executor service exposing a small job API:
//! `POST /api/v1/jobs` submits a job and returns the backend job id, and
//! `GET /api/v1/jobs/{id}` reports state plus the result or error once
//! terminal. The executor runs its own worker fleet; this adapter only
//! tracks the handle -> task bookkeeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use lattice_core::{BackendConfig, TaskId};

use crate::adapter::{AdapterTask, CompletedTask, QueueAdapter, QueueEntry, ResultBlob};
use crate::error::QueueError;

#[derive(Serialize)]
struct JobSubmission<'a> {
    task_id: &'a str,
    function: &'a str,
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
}

#[derive(Deserialize)]
struct JobCreated {
    job_id: String,
}

#[derive(Deserialize)]
struct JobStatus {
    /// One of "queued", "running", "complete", "error".
    state: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl JobStatus {
    fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "complete" | "error")
    }
}

/// Adapter for a remote executor's REST API.
pub struct HttpAdapter {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    await_timeout: Duration,
    queue: HashMap<String, QueueEntry>,
}

impl HttpAdapter {
    pub fn new(config: &BackendConfig) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| QueueError::Connection(format!("http client build failed: {e}")))?;

        let base_url = config.http.base_url.trim_end_matches('/').to_string();
        info!(base_url = %base_url, "http adapter initialized");

        Ok(Self {
            client,
            base_url,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            await_timeout: Duration::from_secs(config.await_timeout_secs),
            queue: HashMap::new(),
        })
    }

    async fn fetch_status(&self, job_id: &str) -> Result<JobStatus, QueueError> {
        let url = format!("{}/api/v1/jobs/{job_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("job status request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(QueueError::Provider(format!(
                "job status for {job_id} returned {}",
                resp.status()
            )));
        }

        resp.json::<JobStatus>()
            .await
            .map_err(|e| QueueError::Parse(format!("job status decode failed: {e}")))
    }

    /// Whether every queued job is in a terminal state on the executor.
    async fn all_terminal(&self) -> Result<bool, QueueError> {
        for job_id in self.queue.keys() {
            if !self.fetch_status(job_id).await?.is_terminal() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl QueueAdapter for HttpAdapter {
    async fn submit_tasks(&mut self, tasks: Vec<AdapterTask>) -> Result<Vec<TaskId>, QueueError> {
        let mut ret = Vec::with_capacity(tasks.len());
        let url = format!("{}/api/v1/jobs", self.base_url);

        for task in tasks {
            if self.queue.values().any(|entry| entry.id == task.id) {
                debug!(id = %task.id, "task already queued, not re-submitting");
                ret.push(task.id);
                continue;
            }

            let body = JobSubmission {
                task_id: &task.id,
                function: &task.spec.function,
                args: &task.spec.args,
                kwargs: &task.spec.kwargs,
            };
            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| QueueError::Connection(format!("job submit failed: {e}")))?;

            if !resp.status().is_success() {
                return Err(QueueError::Submit(format!(
                    "executor rejected task {}: {}",
                    task.id,
                    resp.status()
                )));
            }

            let created: JobCreated = resp
                .json()
                .await
                .map_err(|e| QueueError::Parse(format!("job submit decode failed: {e}")))?;

            debug!(id = %task.id, job_id = %created.job_id, "job submitted");
            self.queue.insert(created.job_id, QueueEntry::from_task(&task));
            ret.push(task.id);
        }

        Ok(ret)
    }

    async fn acquire_complete(&mut self) -> Result<HashMap<TaskId, CompletedTask>, QueueError> {
        let mut ret = HashMap::new();
        let job_ids: Vec<String> = self.queue.keys().cloned().collect();

        for job_id in job_ids {
            let status = self.fetch_status(&job_id).await?;
            if !status.is_terminal() {
                continue;
            }

            // Terminal: remove the entry exactly once.
            let entry = match self.queue.remove(&job_id) {
                Some(entry) => entry,
                None => continue,
            };

            let blob = if status.state == "complete" {
                ResultBlob::ok(status.result.unwrap_or(Value::Null))
            } else {
                let message = status
                    .error
                    .unwrap_or_else(|| "executor reported failure without detail".to_string());
                ResultBlob::failed(entry.spec.clone(), message)
            };

            ret.insert(
                entry.id,
                CompletedTask {
                    blob,
                    parser: entry.parser,
                    hooks: entry.hooks,
                },
            );
        }

        Ok(ret)
    }

    async fn await_results(&mut self) -> Result<bool, QueueError> {
        let started = Instant::now();
        while !self.all_terminal().await? {
            if started.elapsed() >= self.await_timeout {
                warn!(queued = self.queue.len(), "await_results deadline exceeded");
                return Err(QueueError::Timeout(self.await_timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(true)
    }

    async fn close(&mut self) -> Result<bool, QueueError> {
        let url = format!("{}/api/v1/jobs", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("executor reset failed: {e}")))?;

        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(QueueError::Provider(format!(
                "executor reset returned {}",
                resp.status()
            )));
        }

        self.queue.clear();
        Ok(true)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

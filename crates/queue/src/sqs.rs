//! AWS SQS backend.
//!
//! Task messages are sent to a task queue consumed by an external worker
//! fleet; workers post one completion message per job to a result queue.
//! The adapter correlates completions back to task ids through the job id
//! embedded in every message.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use lattice_core::{BackendConfig, SqsBackendConfig, TaskId, TaskSpec};

use crate::adapter::{AdapterTask, CompletedTask, QueueAdapter, QueueEntry, ResultBlob};
use crate::error::QueueError;

#[derive(Serialize)]
struct JobMessage<'a> {
    job_id: &'a str,
    task_id: &'a str,
    spec: &'a TaskSpec,
}

#[derive(Deserialize)]
struct ResultMessage {
    job_id: String,
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    task: Option<TaskSpec>,
}

/// Adapter over an SQS task/result queue pair.
pub struct SqsAdapter {
    client: Client,
    task_queue_url: String,
    result_queue_url: String,
    wait_time_secs: i32,
    poll_interval: Duration,
    await_timeout: Duration,
    queue: HashMap<String, QueueEntry>,
    /// Completions received from the result queue but not yet acquired.
    pending: HashMap<String, ResultBlob>,
}

impl SqsAdapter {
    pub async fn new(config: &BackendConfig) -> Result<Self, QueueError> {
        let sqs = &config.sqs;
        if sqs.task_queue_url.is_empty() || sqs.result_queue_url.is_empty() {
            return Err(QueueError::Connection(
                "sqs backend requires task and result queue urls".into(),
            ));
        }

        let client = build_client(sqs);

        info!(
            task_queue = %sqs.task_queue_url,
            result_queue = %sqs.result_queue_url,
            region = %sqs.region,
            "sqs adapter initialized"
        );

        Ok(Self {
            client,
            task_queue_url: sqs.task_queue_url.clone(),
            result_queue_url: sqs.result_queue_url.clone(),
            wait_time_secs: sqs.wait_time_secs as i32,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            await_timeout: Duration::from_secs(config.await_timeout_secs),
            queue: HashMap::new(),
            pending: HashMap::new(),
        })
    }

    /// Receive one batch from the result queue, buffering parsed
    /// completions and deleting each message. Queue entries are not
    /// touched here; `acquire_complete` removes them exactly once.
    async fn poll_results(&mut self) -> Result<(), QueueError> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.result_queue_url)
            .max_number_of_messages(10)
            .wait_time_seconds(self.wait_time_secs)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("sqs receive failed: {e:?}")))?;

        for msg in resp.messages.unwrap_or_default() {
            let body = msg.body().unwrap_or("");
            match serde_json::from_str::<ResultMessage>(body) {
                Ok(result) => {
                    debug!(job_id = %result.job_id, success = result.success, "result received");
                    self.pending.insert(
                        result.job_id.clone(),
                        ResultBlob {
                            success: result.success,
                            data: result.data,
                            error_message: result.error_message,
                            task: result.task,
                        },
                    );
                }
                Err(e) => warn!(error = %e, "dropping malformed result message"),
            }

            if let Some(receipt) = msg.receipt_handle() {
                self.client
                    .delete_message()
                    .queue_url(&self.result_queue_url)
                    .receipt_handle(receipt)
                    .send()
                    .await
                    .map_err(|e| QueueError::Provider(format!("sqs delete failed: {e:?}")))?;
            }
        }

        Ok(())
    }

    fn all_buffered(&self) -> bool {
        self.queue.keys().all(|job_id| self.pending.contains_key(job_id))
    }
}

fn build_client(sqs: &SqsBackendConfig) -> Client {
    let region = aws_sdk_sqs::config::Region::new(sqs.region.clone());

    let mut sqs_config = aws_sdk_sqs::Config::builder()
        .region(region)
        .behavior_version(BehaviorVersion::latest());

    // Static credentials for local dev / explicit config.
    if let (Some(key_id), Some(secret)) = (&sqs.access_key_id, &sqs.secret_access_key) {
        let creds = Credentials::new(
            key_id,
            secret,
            sqs.session_token.clone(),
            None,
            "lattice-queue-static",
        );
        sqs_config = sqs_config.credentials_provider(creds);
    }

    // Endpoint override only for emulators.
    if let Some(ref endpoint) = sqs.endpoint_url {
        if !endpoint.is_empty() {
            let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("https://{endpoint}")
            };
            sqs_config = sqs_config.endpoint_url(&url);
        }
    }

    Client::from_conf(sqs_config.build())
}

#[async_trait]
impl QueueAdapter for SqsAdapter {
    async fn submit_tasks(&mut self, tasks: Vec<AdapterTask>) -> Result<Vec<TaskId>, QueueError> {
        let mut ret = Vec::with_capacity(tasks.len());

        for task in tasks {
            if self.queue.values().any(|entry| entry.id == task.id) {
                debug!(id = %task.id, "task already queued, not re-submitting");
                ret.push(task.id);
                continue;
            }

            let job_id = uuid::Uuid::new_v4().to_string();
            let message = JobMessage {
                job_id: &job_id,
                task_id: &task.id,
                spec: &task.spec,
            };
            let body = serde_json::to_string(&message)
                .map_err(|e| QueueError::Parse(format!("job message encode failed: {e}")))?;

            self.client
                .send_message()
                .queue_url(&self.task_queue_url)
                .message_body(body)
                .send()
                .await
                .map_err(|e| QueueError::Submit(format!("sqs send failed: {e:?}")))?;

            debug!(id = %task.id, job_id = %job_id, "job message sent");
            self.queue.insert(job_id, QueueEntry::from_task(&task));
            ret.push(task.id);
        }

        Ok(ret)
    }

    async fn acquire_complete(&mut self) -> Result<HashMap<TaskId, CompletedTask>, QueueError> {
        self.poll_results().await?;

        let mut ret = HashMap::new();
        let job_ids: Vec<String> = self.pending.keys().cloned().collect();

        for job_id in job_ids {
            match self.queue.remove(&job_id) {
                Some(entry) => {
                    let mut blob = match self.pending.remove(&job_id) {
                        Some(blob) => blob,
                        None => continue,
                    };
                    // Guarantee the failure blob carries the original spec
                    // even when the worker omitted it.
                    if !blob.success && blob.task.is_none() {
                        blob.task = Some(entry.spec.clone());
                    }
                    ret.insert(
                        entry.id,
                        CompletedTask {
                            blob,
                            parser: entry.parser,
                            hooks: entry.hooks,
                        },
                    );
                }
                None => {
                    // Owner withdrawn; drain and discard.
                    self.pending.remove(&job_id);
                    debug!(job_id = %job_id, "discarding result for unqueued job");
                }
            }
        }

        Ok(ret)
    }

    async fn await_results(&mut self) -> Result<bool, QueueError> {
        let started = Instant::now();
        while !self.all_buffered() {
            if started.elapsed() >= self.await_timeout {
                warn!(queued = self.queue.len(), "await_results deadline exceeded");
                return Err(QueueError::Timeout(self.await_timeout.as_millis() as u64));
            }
            self.poll_results().await?;
            if self.all_buffered() {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(true)
    }

    async fn close(&mut self) -> Result<bool, QueueError> {
        self.client
            .purge_queue()
            .queue_url(&self.task_queue_url)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("sqs purge failed: {e:?}")))?;

        self.queue.clear();
        self.pending.clear();
        Ok(true)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

//! Sequential scan procedure.
//!
//! Walks an ordered parameter path one round at a time, seeding every
//! step from the previous step's result. An optional convergence
//! criterion stops the walk early; a round cap turns a non-converging
//! walk into a terminal failure.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use lattice_core::{ProcedureKind, ServiceStatus};
use lattice_storage::TaskStore;

use crate::error::ServiceError;
use crate::procedures::TaskPacket;
use crate::service::{Service, ServiceCore, ServiceInput};

/// Early-stop criterion: the scan converges once the metric moves less
/// than `tolerance` between consecutive steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceCriteria {
    /// Top-level result field compared between consecutive steps.
    pub metric: String,
    pub tolerance: f64,
    /// Cap on resolved rounds before the scan is declared non-converging.
    pub max_rounds: u32,
}

/// Initial parameters for a sequential scan service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanServiceInput {
    pub program: String,
    /// Handler the backend runs at every step.
    pub function: String,
    /// Parameter swept by the scan.
    pub parameter: String,
    /// Ordered values the scan walks through.
    pub values: Vec<f64>,
    /// Index of the first step taken.
    #[serde(default)]
    pub start_index: usize,
    /// Payload template merged into every task's kwargs.
    #[serde(default)]
    pub base: Map<String, Value>,
    #[serde(default)]
    pub convergence: Option<ConvergenceCriteria>,
    /// Free-form metadata folded into the service hash only.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Sequential/convergence-style service: at most one task per round.
pub struct ScanService {
    core: ServiceCore,
    input: ScanServiceInput,
    /// Index of the step currently outstanding (or next to submit).
    index: usize,
    rounds_run: u32,
    last_metric: Option<f64>,
    last_result: Value,
    /// step key -> stored result, in walk order.
    steps: Map<String, Value>,
}

impl std::fmt::Debug for ScanService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanService")
            .field("index", &self.index)
            .field("rounds_run", &self.rounds_run)
            .field("last_metric", &self.last_metric)
            .field("last_result", &self.last_result)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl ScanService {
    /// Validate the input and build a WAITING service. No round is
    /// submitted here.
    pub fn new(store: Arc<dyn TaskStore>, input: ScanServiceInput) -> Result<Self, ServiceError> {
        if input.function.trim().is_empty() {
            return Err(ServiceError::ServiceBuild("function must not be empty".into()));
        }
        if input.program.trim().is_empty() {
            return Err(ServiceError::ServiceBuild("program must not be empty".into()));
        }
        if input.values.is_empty() {
            return Err(ServiceError::ServiceBuild("scan requires at least one value".into()));
        }
        if input.start_index >= input.values.len() {
            return Err(ServiceError::ServiceBuild(format!(
                "scan start index {} is outside [0, {})",
                input.start_index,
                input.values.len()
            )));
        }
        if let Some(criteria) = &input.convergence {
            if criteria.metric.trim().is_empty() {
                return Err(ServiceError::ServiceBuild("convergence metric must not be empty".into()));
            }
            if !(criteria.tolerance > 0.0) {
                return Err(ServiceError::ServiceBuild(format!(
                    "convergence tolerance must be positive, got {}",
                    criteria.tolerance
                )));
            }
            if criteria.max_rounds == 0 {
                return Err(ServiceError::ServiceBuild(
                    "convergence round cap must be at least 1".into(),
                ));
            }
        }

        let start_index = input.start_index;
        let hash_index = ServiceInput::SequentialScan(input.clone()).hash_index();
        let core = ServiceCore::new(store, "sequential_scan", &input.program, hash_index);

        Ok(Self {
            core,
            input,
            index: start_index,
            rounds_run: 0,
            last_metric: None,
            last_result: Value::Null,
            steps: Map::new(),
        })
    }

    fn step_key(index: usize) -> String {
        format!("step_{index}")
    }

    fn step_packet(&self, index: usize) -> IndexMap<String, TaskPacket> {
        let mut packet = TaskPacket::new(&self.input.program, &self.input.function);
        packet.kwargs = self.input.base.clone();

        let mut parameters = Map::new();
        parameters.insert(self.input.parameter.clone(), json!(self.input.values[index]));
        packet.kwargs.insert("parameters".into(), Value::Object(parameters));
        packet.kwargs.insert("initial".into(), self.last_result.clone());

        let mut packets = IndexMap::with_capacity(1);
        packets.insert(Self::step_key(index), packet);
        packets
    }

    async fn submit_step(&mut self, index: usize) -> Result<(), ServiceError> {
        let packets = self.step_packet(index);
        self.core
            .manager
            .submit_tasks(ProcedureKind::Optimization, packets)
            .await?;
        self.core.record.status = ServiceStatus::Running;
        Ok(())
    }

    fn sync_output(&mut self) {
        self.core.record.output = json!({
            "parameter": self.input.parameter,
            "steps": Value::Object(self.steps.clone()),
        });
    }

    /// Final build step, taken one iterate after convergence.
    fn finalize(&mut self) {
        self.core.record.output = json!({
            "parameter": self.input.parameter,
            "steps": Value::Object(self.steps.clone()),
            "num_steps": self.steps.len(),
            "final": self.last_result,
        });
        self.core.record.status = ServiceStatus::Complete;
    }

    /// Whether the metric has settled within tolerance of the previous
    /// step. A missing or non-numeric metric is a convergence failure.
    fn converged(&mut self, result: &Value) -> Result<bool, ServiceError> {
        let Some(criteria) = &self.input.convergence else {
            return Ok(false);
        };

        let metric = result
            .get(&criteria.metric)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                ServiceError::Convergence(format!(
                    "step result has no numeric '{}' metric",
                    criteria.metric
                ))
            })?;

        let settled = match self.last_metric {
            Some(prev) => (metric - prev).abs() <= criteria.tolerance,
            None => false,
        };
        self.last_metric = Some(metric);
        Ok(settled)
    }
}

#[async_trait::async_trait]
impl Service for ScanService {
    fn record(&self) -> &lattice_core::ServiceRecord {
        &self.core.record
    }

    fn record_mut(&mut self) -> &mut lattice_core::ServiceRecord {
        &mut self.core.record
    }

    async fn iterate(&mut self) -> Result<bool, ServiceError> {
        if self.core.record.status.is_terminal() {
            return Ok(true);
        }

        if self.core.record.status == ServiceStatus::Ready {
            self.finalize();
            return Ok(true);
        }

        if !self.core.manager.has_outstanding() {
            let index = self.index;
            self.submit_step(index).await?;
            return Ok(false);
        }

        let done = match self.core.manager.done().await {
            Ok(done) => done,
            Err(err @ ServiceError::RoundFailure { .. }) => {
                self.core.fail(&err);
                return Ok(true);
            }
            Err(other) => return Err(other),
        };
        if !done {
            return Ok(false);
        }

        // Round resolved: fold the step result.
        let results = self.core.manager.get_tasks().await?;
        let key = Self::step_key(self.index);
        let result = results
            .get(&key)
            .and_then(|record| record.result.clone())
            .unwrap_or(Value::Null);
        self.steps.insert(key, result.clone());
        self.last_result = result.clone();
        self.rounds_run += 1;
        self.sync_output();

        match self.converged(&result) {
            Ok(true) => {
                debug!(id = %self.core.record.id, rounds = self.rounds_run, "scan converged");
                self.core.record.status = ServiceStatus::Ready;
                return Ok(false);
            }
            Ok(false) => {}
            Err(err) => {
                self.core.fail(&err);
                return Ok(true);
            }
        }

        if let Some(criteria) = &self.input.convergence {
            if self.rounds_run >= criteria.max_rounds && self.index + 1 < self.input.values.len() {
                let err = ServiceError::Convergence(format!(
                    "scan did not converge within {} rounds",
                    criteria.max_rounds
                ));
                self.core.fail(&err);
                return Ok(true);
            }
        }

        // Advance the walk.
        if self.index + 1 >= self.input.values.len() {
            self.core.record.status = ServiceStatus::Ready;
            return Ok(false);
        }
        self.index += 1;
        let index = self.index;
        self.submit_step(index).await?;
        Ok(false)
    }
}

//! Environment-based configuration.
//!
//! Every knob is an env var with a sensible default; call [`load_dotenv`]
//! first to pick up a local `.env` file. Backend selection is a
//! configuration-time choice producing one concrete adapter.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LatticeError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatticeConfig {
    pub backend: BackendConfig,
    pub runner: RunnerConfig,
}

impl LatticeConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, LatticeError> {
        Ok(Self {
            backend: BackendConfig::from_env()?,
            runner: RunnerConfig::from_env(),
        })
    }
}

/// Which concrete execution backend to build. Closed set: adding a
/// backend means adding a variant here and an arm in the adapter factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process executor over a registry of named functions.
    Local,
    /// Remote executor reached over its REST API.
    Http,
    /// AWS SQS task/result queue pair.
    Sqs,
}

impl FromStr for BackendKind {
    type Err = LatticeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "http" => Ok(BackendKind::Http),
            "sqs" => Ok(BackendKind::Sqs),
            other => Err(LatticeError::Config(format!(
                "unknown backend kind '{other}' (expected local, http, or sqs)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Poll interval for adapters that wait on remote state.
    pub poll_interval_ms: u64,
    /// Deadline for `await_results` drains; overrun is a timeout error.
    pub await_timeout_secs: u64,
    pub http: HttpBackendConfig,
    pub sqs: SqsBackendConfig,
}

impl BackendConfig {
    pub fn from_env() -> Result<Self, LatticeError> {
        Ok(Self {
            kind: env_or("LATTICE_BACKEND", "local").parse()?,
            poll_interval_ms: env_u64("LATTICE_BACKEND_POLL_INTERVAL_MS", 250),
            await_timeout_secs: env_u64("LATTICE_BACKEND_AWAIT_TIMEOUT_SECS", 300),
            http: HttpBackendConfig::from_env(),
            sqs: SqsBackendConfig::from_env(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    /// Base URL of the remote executor, e.g. `http://executor:8089`.
    pub base_url: String,
}

impl HttpBackendConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_or("LATTICE_HTTP_BASE_URL", "http://127.0.0.1:8089"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqsBackendConfig {
    pub region: String,
    /// Queue the backend's workers consume task messages from.
    pub task_queue_url: String,
    /// Queue the backend's workers post completion messages to.
    pub result_queue_url: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Only set to point at a local SQS emulator.
    pub endpoint_url: Option<String>,
    pub wait_time_secs: u32,
}

impl SqsBackendConfig {
    pub fn from_env() -> Self {
        Self {
            region: env_or("LATTICE_SQS_REGION", "us-east-1"),
            task_queue_url: env_or("LATTICE_SQS_TASK_QUEUE_URL", ""),
            result_queue_url: env_or("LATTICE_SQS_RESULT_QUEUE_URL", ""),
            access_key_id: env_opt("LATTICE_SQS_ACCESS_KEY_ID"),
            secret_access_key: env_opt("LATTICE_SQS_SECRET_ACCESS_KEY"),
            session_token: env_opt("LATTICE_SQS_SESSION_TOKEN"),
            endpoint_url: env_opt("LATTICE_SQS_ENDPOINT_URL"),
            wait_time_secs: env_u32("LATTICE_SQS_WAIT_TIME_SECS", 1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound on drain rounds in `await_services`.
    pub max_drain_rounds: u32,
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        Self {
            max_drain_rounds: env_u32("LATTICE_RUNNER_MAX_DRAIN_ROUNDS", 1000),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_drain_rounds: 1000,
        }
    }
}

//! Batch execution of one operation across many devices.
//!
//! Each device runs under one concurrency-controller permit and one pooled
//! session. Transient failures are retried with exponential backoff; terminal
//! failures are recorded against the device and never leak into a sibling's
//! result. A batch always completes with a full [`BatchOperation`].
//!
//! # Main Components
//!
//! - [`BatchExecutor`] - runs batches, synchronously or as a spawned task
//! - [`BatchHandle`] - progress observation and cancellation of a spawned batch
//! - [`PinnedSession`] - one session held across consecutive operations
//! - [`HealthTracker`] - consecutive failed batches per device

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::concurrency::ConcurrencyController;
use crate::config::ExecutorConfig;
use crate::credential::CredentialOverrides;
use crate::device::{DeviceId, DeviceIdentity};
use crate::error::FleetError;
use crate::parser::{HybridParser, ParsedOutput};
use crate::session::{ConnectionPool, SessionLease};
use crate::templates::{self, PlatformProfile};

pub use health::{DeviceHealth, HealthTracker};

/// What to do on each device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Open (or reuse) a session and wait for a prompt.
    Ping,
    ExecuteCommand { command: String },
    ExecuteCommands { commands: Vec<String> },
    /// Dump the running configuration.
    Backup,
    /// Push configuration lines inside a config-mode session.
    Deploy { commands: Vec<String> },
    /// Version and facts commands of the platform.
    DeviceInfo,
    HealthCheck,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Ping => "ping",
            Operation::ExecuteCommand { .. } => "execute_command",
            Operation::ExecuteCommands { .. } => "execute_commands",
            Operation::Backup => "backup",
            Operation::Deploy { .. } => "deploy",
            Operation::DeviceInfo => "device_info",
            Operation::HealthCheck => "health_check",
        }
    }

    /// Whether the operation changes device configuration.
    pub fn is_change(&self) -> bool {
        matches!(self, Operation::Deploy { .. })
    }

    /// Whether command output goes through the hybrid parser.
    pub fn parses_output(&self) -> bool {
        !matches!(self, Operation::Ping | Operation::Backup | Operation::Deploy { .. })
    }

    /// Command lines sent for this operation in the dialect of `profile`.
    pub fn commands(&self, profile: &PlatformProfile) -> Vec<String> {
        match self {
            Operation::Ping => vec![String::new()],
            Operation::ExecuteCommand { command } => vec![command.clone()],
            Operation::ExecuteCommands { commands } => commands.clone(),
            Operation::Backup => vec![profile.config_command.to_string()],
            Operation::Deploy { commands } => profile.config_session(commands),
            Operation::DeviceInfo => std::iter::once(profile.version_command)
                .chain(profile.facts_commands.iter().copied())
                .map(str::to_string)
                .collect(),
            Operation::HealthCheck => vec![String::new(), profile.version_command.to_string()],
        }
    }
}

/// How devices of one batch are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// All devices at once, bounded by the concurrency controller.
    #[default]
    Parallel,
    /// One device at a time in submission order.
    Sequential,
    /// Sequential; the first failure cancels every device not yet started.
    FailFast,
    /// Parallel; every device runs whatever happens to the others.
    ContinueOnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl DeviceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeviceStatus::Success | DeviceStatus::Failed | DeviceStatus::Cancelled
        )
    }
}

/// Per-request options of a batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub strategy: BatchStrategy,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Timeout of each command.
    pub command_timeout: Duration,
    pub credentials: CredentialOverrides,
}

impl BatchOptions {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            strategy: BatchStrategy::default(),
            max_retries: config.default_max_retries,
            command_timeout: config.default_timeout(),
            credentials: CredentialOverrides::none(),
        }
    }

    pub fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialOverrides) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Output of one command on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommandOutput {
    pub command: String,
    pub output: String,
    /// Absent for prompt probes, configuration dumps and config-mode lines.
    pub parsed: Option<ParsedOutput>,
    /// Set when the device rejected this command.
    pub error: Option<DeviceError>,
}

impl CommandOutput {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceError {
    /// Stable tag from [`FleetError::kind`].
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&FleetError> for DeviceError {
    fn from(err: &FleetError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceResult {
    pub device: DeviceId,
    pub status: DeviceStatus,
    pub attempts: u32,
    pub outputs: Vec<CommandOutput>,
    pub error: Option<DeviceError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl DeviceResult {
    fn pending(device: DeviceId) -> Self {
        Self {
            device,
            status: DeviceStatus::Pending,
            attempts: 0,
            outputs: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    fn cancelled(device: DeviceId) -> Self {
        Self {
            status: DeviceStatus::Cancelled,
            finished_at: Some(Utc::now()),
            ..Self::pending(device)
        }
    }

    /// Output of the first command whose text equals `command`.
    pub fn output_of(&self, command: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.command == command)
            .map(|o| o.output.as_str())
    }
}

/// Device and timing of the fastest or slowest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceTiming {
    pub device: DeviceId,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub completion_percent: f64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub fastest: Option<DeviceTiming>,
    pub slowest: Option<DeviceTiming>,
    pub error_kinds: BTreeMap<String, usize>,
    /// Devices over the consecutive-failure threshold across batches.
    pub unhealthy_devices: Vec<DeviceId>,
}

/// Counters published while a batch runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub completion_percent: f64,
    pub finished: bool,
}

impl BatchProgress {
    fn new(total: usize) -> Self {
        Self {
            total,
            pending: total,
            ..Self::default()
        }
    }

    fn started(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.running += 1;
    }

    fn settled(&mut self, status: DeviceStatus, was_running: bool) {
        if was_running {
            self.running = self.running.saturating_sub(1);
        } else {
            self.pending = self.pending.saturating_sub(1);
        }
        match status {
            DeviceStatus::Success => self.succeeded += 1,
            DeviceStatus::Failed => self.failed += 1,
            DeviceStatus::Cancelled => self.cancelled += 1,
            DeviceStatus::Pending | DeviceStatus::Running => {}
        }
        let done = self.succeeded + self.failed + self.cancelled;
        self.completion_percent = percent(done, self.total);
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// One batch invocation and its per-device results in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchOperation {
    pub id: Uuid,
    pub operation: Operation,
    pub strategy: BatchStrategy,
    pub max_retries: u32,
    pub results: Vec<DeviceResult>,
    pub summary: BatchSummary,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchOperation {
    pub fn result(&self, device: &DeviceId) -> Option<&DeviceResult> {
        self.results.iter().find(|r| &r.device == device)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DeviceResult> {
        self.results
            .iter()
            .filter(|r| r.status == DeviceStatus::Success)
    }

    fn summarize(&self, unhealthy_devices: Vec<DeviceId>) -> BatchSummary {
        let count = |status| self.results.iter().filter(|r| r.status == status).count();
        let total = self.results.len();
        let succeeded = count(DeviceStatus::Success);
        let failed = count(DeviceStatus::Failed);
        let cancelled = count(DeviceStatus::Cancelled);

        let timings: Vec<DeviceTiming> = self
            .results
            .iter()
            .filter(|r| r.status != DeviceStatus::Cancelled)
            .filter_map(|r| {
                r.duration_ms.map(|duration_ms| DeviceTiming {
                    device: r.device.clone(),
                    duration_ms,
                })
            })
            .collect();
        let average_duration_ms = if timings.is_empty() {
            0.0
        } else {
            timings.iter().map(|t| t.duration_ms as f64).sum::<f64>() / timings.len() as f64
        };

        let mut error_kinds = BTreeMap::new();
        for error in self.results.iter().filter_map(|r| r.error.as_ref()) {
            *error_kinds.entry(error.kind.clone()).or_insert(0) += 1;
        }

        BatchSummary {
            total,
            succeeded,
            failed,
            cancelled,
            completion_percent: percent(succeeded + failed + cancelled, total),
            success_rate: percent(succeeded, total),
            average_duration_ms,
            fastest: timings.iter().min_by_key(|t| t.duration_ms).cloned(),
            slowest: timings.iter().max_by_key(|t| t.duration_ms).cloned(),
            error_kinds,
            unhealthy_devices,
        }
    }
}

/// A batch running in the background.
pub struct BatchHandle {
    id: Uuid,
    progress: watch::Receiver<BatchProgress>,
    cancel: CancellationToken,
    task: JoinHandle<BatchOperation>,
}

/// One pooled session kept across consecutive operations on a device.
///
/// The first operation run through it opens (or reuses) a session; later ones
/// send over the same channel until the pin is released. A one-time password
/// therefore logs in once for the whole sequence. A failed attempt drops the
/// session and the next operation has to connect again.
#[derive(Default)]
pub struct PinnedSession {
    lease: Option<SessionLease>,
}

impl PinnedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands the session back to the pool.
    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

struct ExecutorInner {
    config: ExecutorConfig,
    pool: ConnectionPool,
    controller: ConcurrencyController,
    parser: Arc<HybridParser>,
    health: HealthTracker,
}

/// Fans operations out across devices.
#[derive(Clone)]
pub struct BatchExecutor {
    inner: Arc<ExecutorInner>,
}

mod executor;
mod health;

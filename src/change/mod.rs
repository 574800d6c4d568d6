//! Configuration snapshots, diffs and rollback.
//!
//! Snapshots are immutable captures of a device configuration. A diff
//! compares two captures line by line, keeping each line's section so that
//! children of different sections never match each other, and classifies
//! every changed region into a risk category. Rollback plans invert a diff
//! into dialect commands, or fall back to replaying the full target
//! configuration when a line cannot be negated.
//!
//! # Main Components
//!
//! - [`ChangeManager`] - snapshot, compare, plan, execute and deploy
//! - [`SnapshotStore`] - bounded per-device snapshot history
//! - [`diff_configs`] - the diff engine
//! - [`RollbackPlan`] - inverse or full-restore plan with offline simulation

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::{Algorithm, DiffOp, capture_diff_slices};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{
    BatchExecutor, BatchOptions, BatchStrategy, DeviceStatus, Operation, PinnedSession,
};
use crate::config::ChangeConfig;
use crate::credential::CredentialOverrides;
use crate::device::{DeviceId, DeviceIdentity};
use crate::error::FleetError;
use crate::templates::{self, PlatformProfile};

pub use diff::{ConfigModel, diff_configs, normalize_config};
pub use snapshot::SnapshotStore;

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Backup,
    PreChange,
    PostChange,
    Scheduled,
}

/// Immutable capture of one device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigSnapshot {
    pub id: Uuid,
    pub device: DeviceId,
    pub platform: String,
    pub snapshot_type: SnapshotType,
    pub config: String,
    /// SHA-256 of `config`, lowercase hex.
    pub checksum: String,
    pub size: usize,
    pub line_count: usize,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn new(
        device: DeviceId,
        platform: impl Into<String>,
        snapshot_type: SnapshotType,
        config: impl Into<String>,
    ) -> Self {
        let config = config.into();
        Self {
            id: Uuid::new_v4(),
            device,
            platform: platform.into(),
            snapshot_type,
            checksum: checksum(&config),
            size: config.len(),
            line_count: config.lines().count(),
            config,
            description: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub fn checksum(config: &str) -> String {
    let digest = Sha256::digest(config.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    Unchanged,
}

/// Risk tier. Ordered from harmless to critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One tier up, saturating at critical.
    pub fn escalate(self) -> Self {
        match self {
            Severity::None => Severity::None,
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    fn marker(self) -> &'static str {
        match self {
            Severity::Critical => "[!]",
            Severity::High => "[H]",
            Severity::Medium => "[M]",
            Severity::Low | Severity::None => "[L]",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Fixed taxonomy of configuration areas.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Interface,
    Routing,
    AccessControl,
    Vlan,
    Security,
    Snmp,
    Logging,
    Comment,
    Other,
}

impl Category {
    pub fn severity(self) -> Severity {
        match self {
            Category::Routing | Category::AccessControl | Category::Security | Category::Snmp => {
                Severity::Critical
            }
            Category::Interface => Severity::High,
            Category::Vlan => Severity::Medium,
            Category::Logging | Category::Comment | Category::Other => Severity::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Interface => "interface",
            Category::Routing => "routing",
            Category::AccessControl => "access_control",
            Category::Vlan => "vlan",
            Category::Security => "security",
            Category::Snmp => "snmp",
            Category::Logging => "logging",
            Category::Comment => "comment",
            Category::Other => "other",
        }
    }
}

/// One line of a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiffLine {
    pub kind: ChangeKind,
    /// Line as it appears in the new configuration, or the removed line.
    pub line: String,
    /// Previous text of a modified line.
    pub old_line: Option<String>,
    /// Top-level header of the section holding an indented line.
    pub section: Option<String>,
    pub old_number: Option<usize>,
    pub new_number: Option<usize>,
    pub category: Category,
    pub severity: Severity,
}

impl DiffLine {
    pub fn is_change(&self) -> bool {
        self.kind != ChangeKind::Unchanged
    }
}

/// Changes grouped under one top-level section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiffRegion {
    /// Section header, or `global` for stand-alone top-level lines.
    pub section: String,
    pub category: Category,
    pub severity: Severity,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub by_category: BTreeMap<Category, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

impl DiffSummary {
    pub fn changed(&self) -> usize {
        self.added + self.removed + self.modified
    }
}

/// Derived comparison of two configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigDiff {
    pub id: Uuid,
    pub device: Option<DeviceId>,
    pub platform: String,
    pub before: Option<Uuid>,
    pub after: Option<Uuid>,
    pub lines: Vec<DiffLine>,
    pub regions: Vec<DiffRegion>,
    pub summary: DiffSummary,
    pub change_percent: f64,
    pub risk: Severity,
    pub recommendations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.summary.changed() == 0
    }

    pub fn changes(&self) -> impl Iterator<Item = &DiffLine> {
        self.lines.iter().filter(|l| l.is_change())
    }

    pub fn categories(&self) -> BTreeSet<Category> {
        self.changes().map(|l| l.category).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Put a line of the target configuration back.
    Restore,
    /// Take a line the target configuration does not have away.
    Withdraw,
}

/// One structural rollback action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RollbackStep {
    pub kind: StepKind,
    /// Section the line lives in; `None` for top-level lines.
    pub section: Option<String>,
    pub line: String,
    /// Dialect command carrying out the step.
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RollbackStrategy {
    Inverse { steps: Vec<RollbackStep> },
    /// Replays the target configuration. Top-level hierarchies named in
    /// `cleared` are deleted first; with none cleared the replay merges.
    FullRestore { config: String, cleared: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Partial,
}

impl RollbackStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RollbackStatus::Success | RollbackStatus::Failed | RollbackStatus::Partial
        )
    }
}

/// Risk of running the rollback commands themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RollbackRisk {
    Minimal,
    Low,
    Medium,
    High,
}

/// Result of validating a plan against the live device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DryRunReport {
    pub live_checksum: String,
    /// The live configuration no longer matches the plan's source.
    pub drift: bool,
    /// Lines the plan withdraws that the device does not have.
    pub missing_withdrawals: Vec<String>,
    /// Lines the plan restores that the device already has.
    pub already_present: Vec<String>,
    pub commands: Vec<String>,
    pub valid: bool,
    pub checked_at: DateTime<Utc>,
}

/// What an executed plan did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RollbackOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub pre_snapshot: Option<Uuid>,
    pub post_snapshot: Option<Uuid>,
}

/// How to bring a device back to a target snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RollbackPlan {
    pub id: Uuid,
    pub device: DeviceId,
    pub platform: String,
    pub target_snapshot: Uuid,
    /// Snapshot the diff was taken against; the state being undone.
    pub source_snapshot: Option<Uuid>,
    pub source_checksum: Option<String>,
    pub strategy: RollbackStrategy,
    /// Configuration lines sent inside the config-mode session.
    pub commands: Vec<String>,
    /// Lines the plan leaves on the device although the target lacks them.
    pub warnings: Vec<String>,
    pub estimated_seconds: u64,
    pub risk: RollbackRisk,
    /// Risk of the change being undone.
    pub change_risk: Severity,
    pub status: RollbackStatus,
    pub dry_run: Option<DryRunReport>,
    pub outcome: Option<RollbackOutcome>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of a change pushed through [`ChangeManager::deploy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeployReport {
    pub device: DeviceId,
    pub status: DeviceStatus,
    pub error: Option<String>,
    pub pre_snapshot: Option<Uuid>,
    pub post_snapshot: Option<Uuid>,
    pub diff: Option<ConfigDiff>,
}

struct ChangeState {
    plans: HashMap<Uuid, RollbackPlan>,
    /// Executed plan ids per device, oldest first.
    history: HashMap<DeviceId, VecDeque<Uuid>>,
}

/// Snapshot, diff and rollback on top of the batch executor.
#[derive(Clone)]
pub struct ChangeManager {
    config: ChangeConfig,
    executor: BatchExecutor,
    snapshots: SnapshotStore,
    state: Arc<Mutex<ChangeState>>,
}

mod diff;
mod manager;
mod rollback;
mod snapshot;

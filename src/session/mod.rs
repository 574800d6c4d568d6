//! Bounded pool of live device sessions.
//!
//! The pool owns every transport session in an index keyed by device id.
//! Callers borrow a session through a [`SessionLease`]; dropping or releasing
//! the lease hands it back. Two counting permits bound the pool: one global
//! semaphore of `max_total_sessions` and one semaphore of
//! `max_sessions_per_device` per device. A live session holds one permit of
//! each, taken global first.
//!
//! # Main Components
//!
//! - [`ConnectionPool`] - acquire/release, background sweep, statistics
//! - [`SessionLease`] - exclusive use of one session by one caller
//! - [`PoolStats`] - counters exposed to callers

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::credential::{CredentialOverrides, CredentialResolver, CredentialSource};
use crate::device::{DeviceId, DeviceIdentity};
use crate::error::{FleetError, TransportError};
use crate::transport::{TransportDriver, TransportHandle};

/// Lifecycle of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Checking,
    Failed,
    Expired,
    Closed,
}

/// Read-only view of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    pub id: u64,
    pub device: DeviceId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
    pub consecutive_failures: u32,
}

/// Session counts of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceSessionCounts {
    pub active: usize,
    pub idle: usize,
    pub checking: usize,
}

/// Pool-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub idle_sessions: usize,
    pub checking_sessions: usize,
    pub peak_sessions: usize,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    /// Sessions closed after a failed probe or too many failures.
    pub sessions_failed: u64,
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub connection_errors: u64,
    pub available_global_permits: usize,
    pub per_device: BTreeMap<DeviceId, DeviceSessionCounts>,
}

/// The two permits a live session holds. Dropping them frees the slot.
struct Permits {
    _global: OwnedSemaphorePermit,
    _device: OwnedSemaphorePermit,
}

/// One pooled transport connection. Owned by the pool, leased to at most
/// one caller at a time.
struct Session {
    id: u64,
    device: DeviceId,
    handle: Box<dyn TransportHandle>,
    created: Instant,
    created_at: DateTime<Utc>,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    last_checked: Option<Instant>,
    use_count: u64,
    consecutive_failures: u32,
    /// Authenticated with a one-time password; never reused.
    one_time: bool,
    permits: Permits,
}

/// How a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseOutcome {
    Healthy,
    /// Unknown CLI state after a timeout, cancellation or broken channel.
    Poisoned,
}

/// Why a session left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Expired,
    Failed,
    OneTime,
    Poisoned,
    Reclaimed,
    Shutdown,
}

#[derive(Default)]
struct DeviceSlot {
    /// Most recently used at the back.
    idle: VecDeque<Session>,
    /// Leased sessions plus connections being established.
    active: usize,
    checking: usize,
    permits: Option<Arc<Semaphore>>,
}

#[derive(Default)]
struct Counters {
    peak: usize,
    created: u64,
    destroyed: u64,
    failed: u64,
    requests: u64,
    hits: u64,
    misses: u64,
    connection_errors: u64,
}

#[derive(Default)]
struct PoolState {
    devices: HashMap<DeviceId, DeviceSlot>,
    counters: Counters,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    driver: Arc<dyn TransportDriver>,
    resolver: CredentialResolver,
    global: Arc<Semaphore>,
    state: Mutex<PoolState>,
    notify: Notify,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Per-device and global bounded session pool.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Exclusive use of one pooled session.
///
/// Dropping the lease returns the session to the pool. A lease that saw a
/// timeout, a cancellation or a broken channel closes its session instead.
pub struct SessionLease {
    pool: Arc<PoolInner>,
    session: Option<Session>,
    outcome: LeaseOutcome,
    reused: bool,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session.as_ref().map(|s| s.id))
            .field("device", &self.session.as_ref().map(|s| &s.device))
            .field("outcome", &self.outcome)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

mod maintenance;
mod pool;

//! Error types for device sessions, batch execution and change management.
//!
//! Every failure is attributed to one device and one operation. Whether a
//! failure is worth retrying is decided here, in one place, by
//! [`FleetError::is_retryable`].

use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by a transport driver.
///
/// Drivers must keep timeout, refusal and authentication failures
/// distinguishable so the executor can apply the right retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The operation did not complete in time. Carries any partial output.
    #[error("transport timeout: {0}")]
    Timeout(String),

    /// The remote end actively refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The host could not be reached at all.
    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// The device rejected the supplied credential.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The channel was closed underneath the caller.
    #[error("transport closed")]
    Closed,

    /// The device answered with an error for this command.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// Anything else the driver could not classify.
    #[error("transport error: {0}")]
    Other(String),
}

/// Errors raised by the engine.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Timeout, refusal or an unreachable host. Retryable.
    #[error("connection to {device} failed: {reason}")]
    Connection { device: String, reason: String },

    /// The device rejected the credential.
    ///
    /// Retryable only when another credential source could still be tried.
    #[error("authentication to {device} failed: {reason}")]
    Authentication {
        device: String,
        reason: String,
        alternate_source: bool,
    },

    /// No usable password could be resolved. Never retried.
    #[error("credential missing for {device}: {reason}")]
    CredentialMissing { device: String, reason: String },

    /// No pool slot became free before the deadline.
    #[error("connection pool exhausted for {device} after {waited:?}")]
    PoolExhausted { device: String, waited: Duration },

    /// The device rejected a command. Terminal for that command only.
    #[error("command '{command}' rejected by {device}: {output}")]
    CommandExecution {
        device: String,
        command: String,
        output: String,
    },

    /// A command or operation exceeded its deadline.
    #[error("operation on {device} timed out: {detail}")]
    Timeout { device: String, detail: String },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration comparison could not be produced.
    #[error("config diff failed: {0}")]
    ConfigDiff(String),

    /// A rollback could not be carried out.
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// Structured parsing failed. Always degraded to raw text by the parser.
    #[error("parsing failed: {0}")]
    Parsing(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("rollback plan not found: {0}")]
    PlanNotFound(String),

    /// Rollback plans are executed once, then terminal.
    #[error("rollback plan {0} was already executed")]
    PlanAlreadyExecuted(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("template render failed: {0}")]
    TemplateRender(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The inventory collaborator failed a lookup.
    #[error("inventory error: {0}")]
    Inventory(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Whether the batch executor may retry the failed attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::Connection { .. }
            | FleetError::PoolExhausted { .. }
            | FleetError::Timeout { .. }
            | FleetError::Ssh2Error(_)
            | FleetError::RusshError(_) => true,
            FleetError::Authentication {
                alternate_source, ..
            } => *alternate_source,
            _ => false,
        }
    }

    /// Stable tag used in error histograms and batch results.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Connection { .. } => "connection_error",
            FleetError::Authentication { .. } => "authentication_error",
            FleetError::CredentialMissing { .. } => "credential_missing_error",
            FleetError::PoolExhausted { .. } => "pool_exhausted_error",
            FleetError::CommandExecution { .. } => "command_execution_error",
            FleetError::Timeout { .. } => "timeout_error",
            FleetError::Cancelled => "cancelled",
            FleetError::ConfigDiff(_) => "config_diff_error",
            FleetError::RollbackFailed(_) => "rollback_failed_error",
            FleetError::Parsing(_) => "parsing_error",
            FleetError::DeviceNotFound(_) => "device_not_found",
            FleetError::SnapshotNotFound(_) => "snapshot_not_found",
            FleetError::PlanNotFound(_) => "plan_not_found",
            FleetError::PlanAlreadyExecuted(_) => "plan_already_executed",
            FleetError::TemplateNotFound(_) => "template_not_found",
            FleetError::TemplateRender(_) => "template_render_error",
            FleetError::InvalidConfig(_) => "invalid_config",
            FleetError::Inventory(_) => "inventory_error",
            FleetError::Internal(_) => "internal_error",
            FleetError::Ssh2Error(_) | FleetError::RusshError(_) => "connection_error",
            FleetError::Json(_) => "serialization_error",
        }
    }

    /// Maps a driver failure into the engine taxonomy for one device.
    ///
    /// `alternate_source` tells whether an authentication failure could be
    /// retried with a different credential source.
    pub fn from_transport(
        device: &str,
        command: Option<&str>,
        err: TransportError,
        alternate_source: bool,
    ) -> Self {
        let device = device.to_string();
        match err {
            TransportError::Timeout(detail) => FleetError::Timeout { device, detail },
            TransportError::Refused(reason)
            | TransportError::Unreachable(reason)
            | TransportError::Other(reason) => FleetError::Connection { device, reason },
            TransportError::Closed => FleetError::Connection {
                device,
                reason: "transport closed".to_string(),
            },
            TransportError::AuthFailed(reason) => FleetError::Authentication {
                device,
                reason,
                alternate_source,
            },
            TransportError::Rejected(output) => FleetError::CommandExecution {
                device,
                command: command.unwrap_or_default().to_string(),
                output,
            },
        }
    }
}

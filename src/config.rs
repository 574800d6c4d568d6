//! Engine tunables and SSH algorithm profiles.
//!
//! Every option struct carries the defaults the engine ships with and can be
//! loaded from JSON by the host process. Durations are stored as whole
//! seconds (or milliseconds where sub-second values make sense) so the
//! structures stay trivially serializable; accessor methods hand out
//! [`Duration`] values.

use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Connection pool limits and maintenance timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PoolConfig {
    /// Per-device session cap (N).
    pub max_sessions_per_device: usize,
    /// Global session cap across all devices (M).
    pub max_total_sessions: usize,
    /// Idle sessions older than this are expired by the sweeper.
    pub max_idle_secs: u64,
    /// Sessions older than this are never handed out again.
    pub max_lifetime_secs: u64,
    /// Idle sessions untouched for this long get a health probe.
    pub health_check_interval_secs: u64,
    /// Period of the background sweep.
    pub sweep_interval_secs: u64,
    /// Consecutive failures after which a session is discarded.
    pub failure_threshold: u32,
    pub connect_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Command sent by health probes. Empty sends a bare newline.
    pub probe_command: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_device: 3,
            max_total_sessions: 50,
            max_idle_secs: 300,
            max_lifetime_secs: 3600,
            health_check_interval_secs: 60,
            sweep_interval_secs: 120,
            failure_threshold: 3,
            connect_timeout_secs: 30,
            probe_timeout_secs: 10,
            probe_command: String::new(),
        }
    }
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.max_sessions_per_device == 0 || self.max_total_sessions == 0 {
            return Err(FleetError::InvalidConfig(
                "pool session caps must be greater than zero".to_string(),
            ));
        }
        if self.max_sessions_per_device > self.max_total_sessions {
            return Err(FleetError::InvalidConfig(format!(
                "per-device cap {} exceeds global cap {}",
                self.max_sessions_per_device, self.max_total_sessions
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(FleetError::InvalidConfig(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(FleetError::InvalidConfig(
                "failure threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Adaptive concurrency limits and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ControllerConfig {
    pub initial_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    /// Number of samples kept in the rolling window.
    pub window_size: usize,
    pub adjust_interval_secs: u64,
    /// Error rate above which the limit shrinks.
    pub error_rate_high: f64,
    /// Error rate below which the limit may grow.
    pub error_rate_low: f64,
    /// Mean latency under which the limit may grow.
    pub good_latency_ms: u64,
    /// Mean latency over which the limit shrinks gently.
    pub slow_latency_ms: u64,
    pub down_factor: f64,
    pub up_factor: f64,
    pub slow_factor: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            initial_limit: 20,
            min_limit: 5,
            max_limit: 100,
            window_size: 100,
            adjust_interval_secs: 30,
            error_rate_high: 0.10,
            error_rate_low: 0.02,
            good_latency_ms: 2_000,
            slow_latency_ms: 5_000,
            down_factor: 0.8,
            up_factor: 1.2,
            slow_factor: 0.9,
        }
    }
}

impl ControllerConfig {
    pub fn adjust_interval(&self) -> Duration {
        Duration::from_secs(self.adjust_interval_secs)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.min_limit == 0 {
            return Err(FleetError::InvalidConfig(
                "controller minimum must be greater than zero".to_string(),
            ));
        }
        if self.min_limit > self.max_limit {
            return Err(FleetError::InvalidConfig(format!(
                "controller minimum {} exceeds maximum {}",
                self.min_limit, self.max_limit
            )));
        }
        if self.initial_limit < self.min_limit || self.initial_limit > self.max_limit {
            return Err(FleetError::InvalidConfig(format!(
                "initial limit {} outside [{}, {}]",
                self.initial_limit, self.min_limit, self.max_limit
            )));
        }
        if self.window_size == 0 {
            return Err(FleetError::InvalidConfig(
                "sample window must hold at least one sample".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.down_factor) || self.down_factor == 0.0 {
            return Err(FleetError::InvalidConfig(format!(
                "down factor {} must be in (0, 1)",
                self.down_factor
            )));
        }
        if self.up_factor <= 1.0 {
            return Err(FleetError::InvalidConfig(format!(
                "up factor {} must be greater than 1",
                self.up_factor
            )));
        }
        if self.error_rate_low > self.error_rate_high {
            return Err(FleetError::InvalidConfig(
                "low error-rate threshold exceeds high threshold".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry, backoff and health-tracking policy of the batch executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExecutorConfig {
    /// First retry waits this long; each further retry doubles it.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failed batches before a device is flagged unhealthy.
    pub unhealthy_threshold: u32,
    /// Health records untouched for this long are forgotten.
    pub health_idle_ttl_secs: u64,
    pub default_timeout_secs: u64,
    pub default_max_retries: u32,
    /// Pool acquire deadline per attempt.
    pub acquire_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            unhealthy_threshold: 3,
            health_idle_ttl_secs: 3600,
            default_timeout_secs: 60,
            default_max_retries: 3,
            acquire_timeout_secs: 30,
        }
    }
}

impl ExecutorConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let millis = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(millis.min(self.backoff_max_ms))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn health_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.health_idle_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(FleetError::InvalidConfig(
                "backoff base exceeds backoff ceiling".to_string(),
            ));
        }
        if self.unhealthy_threshold == 0 {
            return Err(FleetError::InvalidConfig(
                "unhealthy threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot retention, risk escalation and rollback time estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ChangeConfig {
    /// Change percentage past which the overall risk is raised one tier.
    pub risk_escalation_percent: f64,
    pub max_snapshots_per_device: usize,
    pub base_rollback_secs: u64,
    pub per_command_secs: u64,
    /// Extra time for commands touching interfaces, routing, ACLs or crypto.
    pub complex_command_secs: u64,
    /// Per-command timeout used while executing rollback commands.
    pub command_timeout_secs: u64,
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            risk_escalation_percent: 50.0,
            max_snapshots_per_device: 50,
            base_rollback_secs: 10,
            per_command_secs: 2,
            complex_command_secs: 5,
            command_timeout_secs: 60,
        }
    }
}

impl ChangeConfig {
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.max_snapshots_per_device == 0 {
            return Err(FleetError::InvalidConfig(
                "snapshot retention must keep at least one snapshot".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.risk_escalation_percent) {
            return Err(FleetError::InvalidConfig(format!(
                "risk escalation threshold {} is not a percentage",
                self.risk_escalation_percent
            )));
        }
        Ok(())
    }
}

/// Aggregate configuration handed to the service facade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub controller: ControllerConfig,
    pub executor: ExecutorConfig,
    pub change: ChangeConfig,
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, FleetError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        self.pool.validate()?;
        self.controller.validate()?;
        self.executor.validate()?;
        self.change.validate()
    }
}

/// Key exchange algorithms for the secure profile.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

pub const SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

/// Secure profile plus SHA-1 group exchange and CBC ciphers still common on
/// switch firmware.
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::DH_G14_SHA1,
];

pub const BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_128_CBC,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1,
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
];

/// Everything russh can negotiate, for devices that predate modern SSH.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::NONE,
];

pub const LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CHACHA20_POLY1305,
    cipher::CLEAR,
    cipher::NONE,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA1,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::NONE,
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Dsa,
];

pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        EngineConfig::default()
            .validate()
            .expect("default configuration should be valid");
    }

    #[test]
    fn controller_rejects_inverted_bounds() {
        let config = ControllerConfig {
            min_limit: 50,
            max_limit: 10,
            initial_limit: 20,
            ..ControllerConfig::default()
        };
        let err = config.validate().expect_err("min > max must be rejected");
        assert!(matches!(err, FleetError::InvalidConfig(_)));
    }

    #[test]
    fn pool_rejects_device_cap_above_global_cap() {
        let config = PoolConfig {
            max_sessions_per_device: 10,
            max_total_sessions: 4,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ExecutorConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 5_000,
            ..ExecutorConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(4), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config = EngineConfig::from_json(r#"{"pool": {"max_sessions_per_device": 2}}"#)
            .expect("partial config should load");
        assert_eq!(config.pool.max_sessions_per_device, 2);
        assert_eq!(config.pool.max_total_sessions, 50);
        assert_eq!(config.controller.initial_limit, 20);
    }

    #[test]
    fn secure_profile_has_no_null_algorithms() {
        assert!(!SECURE_KEX_ORDER.contains(&kex::NONE));
        assert!(!SECURE_CIPHERS.contains(&cipher::NONE));
        assert!(!SECURE_MAC_ALGORITHMS.contains(&mac::NONE));
    }
}

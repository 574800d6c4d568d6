//! # netfleet - Network Device Fleet Automation
//!
//! `netfleet` drives command execution and configuration changes across
//! fleets of routers and switches. It pools live CLI sessions per device,
//! bounds fleet-wide parallelism with an adaptive limit, retries transient
//! failures, parses command output into records and wraps every
//! configuration change in snapshots that can be diffed and rolled back.
//!
//! ## Features
//!
//! - **Connection Pooling**: per-device and global session caps, reuse of idle
//!   sessions, background expiry and health probes
//! - **Credential Resolution**: request overrides, stored encrypted records and
//!   region/group defaults, with one-time passwords never reused
//! - **Adaptive Concurrency**: a global limit that follows the observed error
//!   rate and latency
//! - **Batch Execution**: parallel, sequential, fail-fast and continue-on-error
//!   strategies with progress observation
//! - **Change Management**: snapshots, risk-classified diffs and inverse or
//!   full-restore rollback plans
//! - **Hybrid Parsing**: custom templates, a pluggable template corpus and
//!   regex fallbacks, degrading to raw text
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use netfleet::config::EngineConfig;
//! use netfleet::credential::{Cipher, Secret};
//! use netfleet::device::{DeviceIdentity, StaticInventory};
//! use netfleet::error::FleetError;
//! use netfleet::parser::HybridParser;
//! use netfleet::service::{NetworkAutomation, RequestOptions, Target};
//! use netfleet::transport::SshDriver;
//!
//! struct Plain;
//!
//! impl Cipher for Plain {
//!     fn encrypt(&self, plaintext: &str) -> Result<String, FleetError> {
//!         Ok(plaintext.to_string())
//!     }
//!     fn decrypt(&self, ciphertext: &str) -> Result<Secret, FleetError> {
//!         Ok(Secret::new(ciphertext))
//!     }
//!     fn is_ciphertext(&self, _value: &str) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FleetError> {
//!     let inventory = StaticInventory::new();
//!     inventory.add_device(DeviceIdentity::new("core-1", "192.0.2.1", "cisco_ios"));
//!
//!     let engine = NetworkAutomation::new(
//!         EngineConfig::default(),
//!         Arc::new(inventory),
//!         Arc::new(Plain),
//!         Arc::new(SshDriver::default()),
//!         Arc::new(HybridParser::new()),
//!     )?;
//!     engine.start();
//!
//!     let target = Target::Devices(vec!["core-1".into()]);
//!     let batch = engine
//!         .execute_command(&target, "show ip interface brief", &RequestOptions::default())
//!         .await?;
//!     println!("{} of {} succeeded", batch.summary.succeeded, batch.summary.total);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`service::NetworkAutomation`] - Facade owning every component and its lifecycle
//! - [`session::ConnectionPool`] - Bounded pool of live device sessions
//! - [`credential::CredentialResolver`] - Per-operation credential resolution
//! - [`concurrency::ConcurrencyController`] - Adaptive fleet-wide parallelism limit
//! - [`batch::BatchExecutor`] - Runs one operation across many devices
//! - [`change::ChangeManager`] - Snapshots, diffs and rollbacks
//! - [`parser::HybridParser`] - Structured extraction from command output
//! - [`templates`] - Per-platform dialect table
//! - [`error::FleetError`] - Error type shared by every component

pub mod batch;
pub mod change;
pub mod concurrency;
pub mod config;
pub mod credential;
pub mod device;
pub mod error;
pub mod parser;
pub mod service;
pub mod session;
pub mod templates;
pub mod transport;

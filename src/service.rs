//! The facade a CLI, terminal or HTTP layer drives.
//!
//! [`NetworkAutomation`] wires the resolver, pool, controller, executor,
//! parser and change manager together around injected collaborators and owns
//! their background tasks between [`NetworkAutomation::start`] and
//! [`NetworkAutomation::shutdown`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{
    BatchExecutor, BatchOperation, BatchOptions, BatchStrategy, DeviceHealth, DeviceResult,
    DeviceStatus, Operation,
};
use crate::change::{
    ChangeManager, ConfigDiff, ConfigSnapshot, DeployReport, RollbackPlan, RollbackStatus,
    SnapshotType,
};
use crate::concurrency::{ConcurrencyController, ControllerStats};
use crate::config::EngineConfig;
use crate::credential::{Cipher, CredentialOverrides, CredentialRequirements, CredentialResolver};
use crate::device::{DeviceId, DeviceIdentity, InventoryStore};
use crate::error::FleetError;
use crate::parser::HybridParser;
use crate::session::{ConnectionPool, PoolStats};
use crate::transport::TransportDriver;

/// Renders configuration templates into command text.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, variables: &Value) -> Result<String, FleetError>;
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}") {
        Ok(re) => re,
        Err(err) => panic!("invalid placeholder pattern: {err}"),
    }
});

/// `{{ name }}` substitution with dotted paths into nested objects. A
/// placeholder without a value is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, variables: &Value) -> Result<String, FleetError> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = path
                .as_str()
                .split('.')
                .try_fold(variables, |v, key| v.get(key))
                .ok_or_else(|| {
                    FleetError::TemplateRender(format!("no value for '{}'", path.as_str()))
                })?;
            out.push_str(&template[last..whole.start()]);
            match value {
                Value::String(s) => out.push_str(s),
                Value::Null => {}
                other => out.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }
}

/// Which devices a request addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    Devices(Vec<DeviceId>),
    Region(String),
    Group(String),
}

/// Options recognised by every batch operation.
#[derive(Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RequestOptions {
    pub strategy: Option<BatchStrategy>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    #[serde(skip)]
    pub credentials: CredentialOverrides,
}

impl RequestOptions {
    pub fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialOverrides) -> Self {
        self.credentials = credentials;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionStats {
    pub pool: PoolStats,
    pub controller: ControllerStats,
    pub unhealthy_devices: Vec<DeviceHealth>,
}

/// Network automation engine.
pub struct NetworkAutomation {
    inventory: Arc<dyn InventoryStore>,
    resolver: CredentialResolver,
    pool: ConnectionPool,
    controller: ConcurrencyController,
    parser: Arc<HybridParser>,
    executor: BatchExecutor,
    changes: ChangeManager,
    renderer: Arc<dyn TemplateRenderer>,
    shutdown: CancellationToken,
}

impl NetworkAutomation {
    pub fn new(
        config: EngineConfig,
        inventory: Arc<dyn InventoryStore>,
        cipher: Arc<dyn Cipher>,
        driver: Arc<dyn TransportDriver>,
        parser: Arc<HybridParser>,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let resolver = CredentialResolver::new(Arc::clone(&inventory), cipher);
        let pool = ConnectionPool::new(config.pool, driver, resolver.clone())?;
        let controller = ConcurrencyController::new(config.controller)?;
        let executor = BatchExecutor::new(
            config.executor,
            pool.clone(),
            controller.clone(),
            Arc::clone(&parser),
        )?;
        let changes = ChangeManager::new(config.change, executor.clone())?;
        Ok(Self {
            inventory,
            resolver,
            pool,
            controller,
            parser,
            executor,
            changes,
            renderer: Arc::new(PlaceholderRenderer),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Starts the pool sweeper and the controller's adjustment task.
    pub fn start(&self) {
        self.pool.start();
        self.controller.start();
        info!("network automation started");
    }

    /// Cancels in-flight requests, stops background tasks and closes every
    /// pooled session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.controller.shutdown().await;
        self.pool.shutdown().await;
        info!("network automation stopped");
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    pub fn executor(&self) -> &BatchExecutor {
        &self.executor
    }

    pub fn changes(&self) -> &ChangeManager {
        &self.changes
    }

    pub fn parser(&self) -> &HybridParser {
        &self.parser
    }

    /// Expands a target into device identities, in inventory order and
    /// without duplicates.
    pub async fn resolve_targets(&self, target: &Target) -> Result<Vec<DeviceIdentity>, FleetError> {
        let ids = match target {
            Target::Devices(ids) => ids.clone(),
            Target::Region(region) => self.inventory.devices_in_region(region).await?,
            Target::Group(group) => self.inventory.devices_in_group(group).await?,
        };
        let mut seen = HashSet::new();
        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            if seen.insert(id.clone()) {
                devices.push(self.inventory.device(&id).await?);
            }
        }
        debug!("target {:?} resolved to {} devices", target, devices.len());
        Ok(devices)
    }

    fn batch_options(&self, options: &RequestOptions) -> BatchOptions {
        let mut batch = BatchOptions::from_config(self.executor.config())
            .with_credentials(options.credentials.clone());
        if let Some(strategy) = options.strategy {
            batch = batch.with_strategy(strategy);
        }
        if let Some(retries) = options.max_retries {
            batch = batch.with_max_retries(retries);
        }
        if let Some(secs) = options.timeout_secs {
            batch = batch.with_command_timeout(Duration::from_secs(secs));
        }
        batch
    }

    async fn run(
        &self,
        target: &Target,
        operation: Operation,
        options: &RequestOptions,
    ) -> Result<BatchOperation, FleetError> {
        let devices = self.resolve_targets(target).await?;
        Ok(self
            .executor
            .run(devices, operation, self.batch_options(options), &self.shutdown)
            .await)
    }

    pub async fn ping(&self, target: &Target, options: &RequestOptions) -> Result<BatchOperation, FleetError> {
        self.run(target, Operation::Ping, options).await
    }

    pub async fn execute_command(
        &self,
        target: &Target,
        command: &str,
        options: &RequestOptions,
    ) -> Result<BatchOperation, FleetError> {
        let operation = Operation::ExecuteCommand {
            command: command.to_string(),
        };
        self.run(target, operation, options).await
    }

    pub async fn execute_commands(
        &self,
        target: &Target,
        commands: Vec<String>,
        options: &RequestOptions,
    ) -> Result<BatchOperation, FleetError> {
        self.run(target, Operation::ExecuteCommands { commands }, options).await
    }

    /// Runs one command on one device.
    ///
    /// A missing credential is raised as an error; every other failure is
    /// reported in the returned result.
    pub async fn execute_command_on(
        &self,
        device: &DeviceId,
        command: &str,
        options: &RequestOptions,
    ) -> Result<DeviceResult, FleetError> {
        let device = self.inventory.device(device).await?;
        let operation = Operation::ExecuteCommand {
            command: command.to_string(),
        };
        let (result, error) = self
            .executor
            .run_one(&device, operation, &self.batch_options(options), &self.shutdown)
            .await;
        match error {
            Some(err @ FleetError::CredentialMissing { .. }) => Err(err),
            _ => Ok(result),
        }
    }

    /// Dumps configurations and stores a `backup` snapshot for every device
    /// that returned one.
    pub async fn backup(&self, target: &Target, options: &RequestOptions) -> Result<BatchOperation, FleetError> {
        let devices = self.resolve_targets(target).await?;
        let batch = self
            .executor
            .run(devices.clone(), Operation::Backup, self.batch_options(options), &self.shutdown)
            .await;
        for result in batch.results.iter().filter(|r| r.status == DeviceStatus::Success) {
            let (Some(device), Some(output)) = (
                devices.iter().find(|d| d.id == result.device),
                result.outputs.first(),
            ) else {
                continue;
            };
            self.changes
                .record_snapshot(device, SnapshotType::Backup, output.output.clone(), None);
        }
        Ok(batch)
    }

    /// Applies configuration text between pre- and post-change snapshots.
    pub async fn deploy(
        &self,
        target: &Target,
        config: &str,
        options: &RequestOptions,
    ) -> Result<Vec<DeployReport>, FleetError> {
        let commands: Vec<String> = config
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        if commands.is_empty() {
            return Err(FleetError::InvalidConfig("nothing to deploy".to_string()));
        }
        let devices = self.resolve_targets(target).await?;
        Ok(self
            .changes
            .deploy(devices, commands, &self.batch_options(options), &self.shutdown)
            .await)
    }

    /// Renders a stored template for `platform`.
    pub async fn render_template(
        &self,
        template_id: &str,
        platform: &str,
        variables: &Value,
    ) -> Result<String, FleetError> {
        let template = self
            .inventory
            .config_template(template_id, platform)
            .await?
            .ok_or_else(|| FleetError::TemplateNotFound(format!("{template_id} ({platform})")))?;
        self.renderer.render(&template, variables)
    }

    pub async fn device_info(&self, target: &Target, options: &RequestOptions) -> Result<BatchOperation, FleetError> {
        self.run(target, Operation::DeviceInfo, options).await
    }

    pub async fn health_check(
        &self,
        target: &Target,
        options: &RequestOptions,
    ) -> Result<BatchOperation, FleetError> {
        self.run(target, Operation::HealthCheck, options).await
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            pool: self.pool.stats(),
            controller: self.controller.stats(),
            unhealthy_devices: self
                .executor
                .health()
                .report()
                .into_iter()
                .filter(|h| h.unhealthy)
                .collect(),
        }
    }

    pub async fn credential_requirements(&self, device: &DeviceId) -> Result<CredentialRequirements, FleetError> {
        let device = self.inventory.device(device).await?;
        self.resolver.requirements(&device).await
    }

    pub async fn create_snapshot(
        &self,
        device: &DeviceId,
        kind: SnapshotType,
        description: Option<String>,
        credentials: &CredentialOverrides,
    ) -> Result<Arc<ConfigSnapshot>, FleetError> {
        let device = self.inventory.device(device).await?;
        self.changes
            .snapshot(&device, kind, description, credentials, &self.shutdown)
            .await
    }

    pub fn compare_snapshots(&self, before: &Uuid, after: &Uuid) -> Result<ConfigDiff, FleetError> {
        self.changes.compare(before, after)
    }

    /// Plans a rollback of `device` from its live state to `target`.
    pub async fn plan_rollback(
        &self,
        device: &DeviceId,
        target: &Uuid,
        credentials: &CredentialOverrides,
    ) -> Result<RollbackPlan, FleetError> {
        let device = self.inventory.device(device).await?;
        self.changes
            .plan_rollback_from_live(&device, target, credentials, &self.shutdown)
            .await
    }

    pub async fn execute_rollback(
        &self,
        plan_id: &Uuid,
        dry_run: bool,
        credentials: &CredentialOverrides,
    ) -> Result<RollbackPlan, FleetError> {
        let plan = self.changes.plan(plan_id)?;
        let device = self.inventory.device(&plan.device).await?;
        let plan = self
            .changes
            .execute_rollback(&device, plan_id, dry_run, credentials, &self.shutdown)
            .await?;
        if !dry_run && plan.status != RollbackStatus::Success {
            warn!("{}: rollback {} finished {:?}", device.id, plan.id, plan.status);
        }
        Ok(plan)
    }
}

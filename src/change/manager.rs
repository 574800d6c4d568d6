use super::*;

impl ChangeManager {
    pub fn new(config: ChangeConfig, executor: BatchExecutor) -> Result<Self, FleetError> {
        config.validate()?;
        Ok(Self {
            snapshots: SnapshotStore::new(config.max_snapshots_per_device),
            config,
            executor,
            state: Arc::new(Mutex::new(ChangeState {
                plans: HashMap::new(),
                history: HashMap::new(),
            })),
        })
    }

    pub fn config(&self) -> &ChangeConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    fn lock(&self) -> MutexGuard<'_, ChangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self, credentials: &CredentialOverrides) -> BatchOptions {
        BatchOptions::from_config(self.executor.config())
            .with_strategy(BatchStrategy::Sequential)
            .with_command_timeout(Duration::from_secs(self.config.command_timeout_secs))
            .with_credentials(credentials.clone())
    }

    /// Reads the running configuration of one device.
    pub async fn fetch_config(
        &self,
        device: &DeviceIdentity,
        credentials: &CredentialOverrides,
        cancel: &CancellationToken,
    ) -> Result<String, FleetError> {
        let mut pinned = PinnedSession::new();
        let config = self
            .capture(device, &self.options(credentials), &mut pinned, cancel)
            .await;
        pinned.release().await;
        config
    }

    async fn capture(
        &self,
        device: &DeviceIdentity,
        options: &BatchOptions,
        pinned: &mut PinnedSession,
        cancel: &CancellationToken,
    ) -> Result<String, FleetError> {
        let result = self
            .executor
            .run_pinned(device, Operation::Backup, options, pinned, cancel)
            .await?;
        let output = result.outputs.into_iter().next().ok_or_else(|| {
            FleetError::Internal(format!("{}: backup produced no output", device.id))
        })?;
        match output.error {
            Some(err) => Err(FleetError::CommandExecution {
                device: device.id.to_string(),
                command: output.command,
                output: err.message,
            }),
            None => Ok(output.output),
        }
    }

    /// Stores an already captured configuration.
    pub fn record_snapshot(
        &self,
        device: &DeviceIdentity,
        kind: SnapshotType,
        config: impl Into<String>,
        description: Option<String>,
    ) -> Arc<ConfigSnapshot> {
        let mut snapshot = ConfigSnapshot::new(device.id.clone(), device.platform.clone(), kind, config);
        snapshot.description = description;
        let snapshot = self.snapshots.insert(snapshot);
        info!(
            "{}: stored {:?} snapshot {} ({} lines, sha256 {})",
            device.id, kind, snapshot.id, snapshot.line_count, snapshot.checksum
        );
        snapshot
    }

    /// Captures and stores the running configuration.
    pub async fn snapshot(
        &self,
        device: &DeviceIdentity,
        kind: SnapshotType,
        description: Option<String>,
        credentials: &CredentialOverrides,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConfigSnapshot>, FleetError> {
        let config = self.fetch_config(device, credentials, cancel).await?;
        Ok(self.record_snapshot(device, kind, config, description))
    }

    async fn snapshot_pinned(
        &self,
        device: &DeviceIdentity,
        kind: SnapshotType,
        description: String,
        options: &BatchOptions,
        pinned: &mut PinnedSession,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConfigSnapshot>, FleetError> {
        let config = self.capture(device, options, pinned, cancel).await?;
        Ok(self.record_snapshot(device, kind, config, Some(description)))
    }

    pub fn snapshot_by_id(&self, id: &Uuid) -> Result<Arc<ConfigSnapshot>, FleetError> {
        self.snapshots
            .get(id)
            .ok_or_else(|| FleetError::SnapshotNotFound(id.to_string()))
    }

    /// Diffs two stored snapshots.
    pub fn compare(&self, before: &Uuid, after: &Uuid) -> Result<ConfigDiff, FleetError> {
        let before = self.snapshot_by_id(before)?;
        let after = self.snapshot_by_id(after)?;
        Ok(self.diff(&before, &after))
    }

    pub fn diff(&self, before: &ConfigSnapshot, after: &ConfigSnapshot) -> ConfigDiff {
        let profile = templates::profile_for(&before.platform);
        let mut diff = diff_configs(&before.config, &after.config, profile, &self.config);
        diff.device = (before.device == after.device).then(|| before.device.clone());
        diff.platform = before.platform.clone();
        diff.before = Some(before.id);
        diff.after = Some(after.id);
        diff
    }

    /// Plans a rollback to `target` from a diff of the target snapshot
    /// against the state being undone, and stores the plan.
    pub fn plan_rollback(&self, target: &Uuid, diff: &ConfigDiff) -> Result<RollbackPlan, FleetError> {
        let target = self.snapshot_by_id(target)?;
        if diff.before.is_some_and(|id| id != target.id) {
            return Err(FleetError::ConfigDiff(format!(
                "diff {} does not start from snapshot {}",
                diff.id, target.id
            )));
        }
        let source = diff.after.and_then(|id| self.snapshots.get(&id));
        let profile = templates::profile_for(&target.platform);
        let plan = RollbackPlan::build(&target, source.as_deref(), diff, profile, &self.config)?;
        info!(
            "{}: rollback plan {} to snapshot {} with {} commands, risk {:?}, ~{}s",
            plan.device,
            plan.id,
            target.id,
            plan.commands.len(),
            plan.risk,
            plan.estimated_seconds
        );
        for warning in &plan.warnings {
            warn!("{}: rollback plan {}: {}", plan.device, plan.id, warning);
        }
        self.lock().plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    /// Snapshots the device as it is now and plans a rollback to `target`.
    pub async fn plan_rollback_from_live(
        &self,
        device: &DeviceIdentity,
        target: &Uuid,
        credentials: &CredentialOverrides,
        cancel: &CancellationToken,
    ) -> Result<RollbackPlan, FleetError> {
        let target = self.snapshot_by_id(target)?;
        if target.device != device.id {
            return Err(FleetError::SnapshotNotFound(format!(
                "{} is not a snapshot of {}",
                target.id, device.id
            )));
        }
        let current = self
            .snapshot(
                device,
                SnapshotType::Backup,
                Some(format!("rollback source for {}", target.id)),
                credentials,
                cancel,
            )
            .await?;
        let diff = self.diff(&target, &current);
        self.plan_rollback(&target.id, &diff)
    }

    pub fn plan(&self, id: &Uuid) -> Result<RollbackPlan, FleetError> {
        self.lock()
            .plans
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::PlanNotFound(id.to_string()))
    }

    /// Executed plans of a device, newest first.
    pub fn history(&self, device: &DeviceId, limit: Option<usize>) -> Vec<RollbackPlan> {
        let state = self.lock();
        let Some(ids) = state.history.get(device) else {
            return Vec::new();
        };
        ids.iter()
            .rev()
            .filter_map(|id| state.plans.get(id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    fn update_plan(&self, id: &Uuid, update: impl FnOnce(&mut RollbackPlan)) -> Result<RollbackPlan, FleetError> {
        let mut state = self.lock();
        let plan = state
            .plans
            .get_mut(id)
            .ok_or_else(|| FleetError::PlanNotFound(id.to_string()))?;
        update(plan);
        Ok(plan.clone())
    }

    /// Validates (`dry_run`) or executes a stored plan on its device.
    ///
    /// Execution runs once. It is wrapped in `pre_change` and `post_change`
    /// snapshots, and the returned plan carries the terminal status.
    pub async fn execute_rollback(
        &self,
        device: &DeviceIdentity,
        plan_id: &Uuid,
        dry_run: bool,
        credentials: &CredentialOverrides,
        cancel: &CancellationToken,
    ) -> Result<RollbackPlan, FleetError> {
        let plan = self.plan(plan_id)?;
        if plan.device != device.id {
            return Err(FleetError::RollbackFailed(format!(
                "plan {} targets {}, not {}",
                plan.id, plan.device, device.id
            )));
        }
        let profile = templates::profile_for(&plan.platform);

        if dry_run {
            let live = self.fetch_config(device, credentials, cancel).await?;
            let report = plan.validate_against(&live, profile);
            if report.drift {
                warn!("{}: configuration drifted since plan {} was made", device.id, plan.id);
            }
            debug!(
                "{}: dry run of plan {}: {} missing withdrawals, {} restores already present",
                device.id,
                plan.id,
                report.missing_withdrawals.len(),
                report.already_present.len()
            );
            return self.update_plan(plan_id, |p| p.dry_run = Some(report));
        }

        {
            let mut state = self.lock();
            let stored = state
                .plans
                .get_mut(plan_id)
                .ok_or_else(|| FleetError::PlanNotFound(plan_id.to_string()))?;
            if stored.status != RollbackStatus::Pending {
                return Err(FleetError::PlanAlreadyExecuted(plan_id.to_string()));
            }
            stored.status = RollbackStatus::InProgress;
            stored.executed_at = Some(Utc::now());
            state.history.entry(device.id.clone()).or_default().push_back(*plan_id);
        }
        info!(
            "{}: executing rollback plan {} ({} commands)",
            device.id,
            plan_id,
            plan.commands.len()
        );

        // one session for snapshot, push and snapshot
        let mut pinned = PinnedSession::new();
        let snapshot_options = self.options(credentials);
        let mut outcome = RollbackOutcome::default();
        let pre = self
            .snapshot_pinned(
                device,
                SnapshotType::PreChange,
                format!("before rollback {plan_id}"),
                &snapshot_options,
                &mut pinned,
                cancel,
            )
            .await;
        let pre = match pre {
            Ok(pre) => pre,
            Err(err) => {
                warn!("{}: pre-change snapshot failed, rollback not attempted: {}", device.id, err);
                outcome.errors.push(err.to_string());
                return self.update_plan(plan_id, |p| {
                    p.status = RollbackStatus::Failed;
                    p.outcome = Some(outcome);
                    p.completed_at = Some(Utc::now());
                });
            }
        };
        outcome.pre_snapshot = Some(pre.id);

        let options = self.options(credentials).with_max_retries(0);
        let operation = Operation::Deploy {
            commands: plan.commands.clone(),
        };
        match self
            .executor
            .run_pinned(device, operation, &options, &mut pinned, cancel)
            .await
        {
            Ok(result) => {
                // outputs: enter config, one per plan command, then commit/exit
                let entered = result.outputs.first().is_some_and(|o| o.is_ok());
                for (index, command) in plan.commands.iter().enumerate() {
                    match result.outputs.get(index + 1) {
                        Some(output) if entered && output.is_ok() => outcome.succeeded += 1,
                        Some(output) => {
                            outcome.failed += 1;
                            let reason = output.error.as_ref().map_or("not applied", |e| e.message.as_str());
                            outcome.errors.push(format!("{command}: {reason}"));
                        }
                        None => outcome.failed += 1,
                    }
                }
            }
            Err(err) => {
                outcome.failed = plan.commands.len();
                outcome.errors.push(err.to_string());
            }
        }

        // post-change capture ignores cancellation
        match self
            .snapshot_pinned(
                device,
                SnapshotType::PostChange,
                format!("after rollback {plan_id}"),
                &snapshot_options,
                &mut pinned,
                &CancellationToken::new(),
            )
            .await
        {
            Ok(post) => outcome.post_snapshot = Some(post.id),
            Err(err) => {
                warn!("{}: post-change snapshot failed: {}", device.id, err);
                outcome.errors.push(format!("post-change snapshot: {err}"));
            }
        }
        pinned.release().await;

        let status = match (outcome.succeeded, outcome.failed) {
            (_, 0) => RollbackStatus::Success,
            (0, _) => RollbackStatus::Failed,
            _ => RollbackStatus::Partial,
        };
        match status {
            RollbackStatus::Success => info!("{}: rollback plan {} succeeded", device.id, plan_id),
            _ => warn!(
                "{}: rollback plan {} ended {:?}: {} of {} commands failed",
                device.id,
                plan_id,
                status,
                outcome.failed,
                plan.commands.len()
            ),
        }
        self.update_plan(plan_id, |p| {
            p.status = status;
            p.outcome = Some(outcome);
            p.completed_at = Some(Utc::now());
        })
    }

    /// Pushes configuration lines to each device between a `pre_change`
    /// and a `post_change` snapshot and reports the resulting diff.
    ///
    /// `fail_fast` and `sequential` run devices in order; `fail_fast` skips
    /// every device after the first failure.
    pub async fn deploy(
        &self,
        devices: Vec<DeviceIdentity>,
        commands: Vec<String>,
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> Vec<DeployReport> {
        match options.strategy {
            BatchStrategy::Sequential | BatchStrategy::FailFast => {
                let mut reports = Vec::with_capacity(devices.len());
                let mut failed = false;
                for device in devices {
                    if failed && options.strategy == BatchStrategy::FailFast {
                        reports.push(DeployReport {
                            device: device.id,
                            status: DeviceStatus::Cancelled,
                            error: Some("skipped after an earlier failure".to_string()),
                            pre_snapshot: None,
                            post_snapshot: None,
                            diff: None,
                        });
                        continue;
                    }
                    let report = self.deploy_one(&device, &commands, options, cancel).await;
                    failed |= report.status != DeviceStatus::Success;
                    reports.push(report);
                }
                reports
            }
            BatchStrategy::Parallel | BatchStrategy::ContinueOnError => {
                let total = devices.len();
                let mut tasks = JoinSet::new();
                for (index, device) in devices.into_iter().enumerate() {
                    let this = self.clone();
                    let commands = commands.clone();
                    let options = options.clone();
                    let cancel = cancel.clone();
                    tasks.spawn(async move {
                        let report = this.deploy_one(&device, &commands, &options, &cancel).await;
                        (index, report)
                    });
                }
                let mut slots: Vec<Option<DeployReport>> = (0..total).map(|_| None).collect();
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((index, report)) => slots[index] = Some(report),
                        Err(err) => warn!("deploy task aborted: {}", err),
                    }
                }
                slots.into_iter().flatten().collect()
            }
        }
    }

    async fn deploy_one(
        &self,
        device: &DeviceIdentity,
        commands: &[String],
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> DeployReport {
        let mut report = DeployReport {
            device: device.id.clone(),
            status: DeviceStatus::Failed,
            error: None,
            pre_snapshot: None,
            post_snapshot: None,
            diff: None,
        };
        let snapshot_options = self.options(&options.credentials);
        let mut pinned = PinnedSession::new();
        let pre = match self
            .snapshot_pinned(
                device,
                SnapshotType::PreChange,
                "before deploy".to_string(),
                &snapshot_options,
                &mut pinned,
                cancel,
            )
            .await
        {
            Ok(pre) => pre,
            Err(err) => {
                warn!("{}: pre-change snapshot failed, nothing deployed: {}", device.id, err);
                report.status = match err {
                    FleetError::Cancelled => DeviceStatus::Cancelled,
                    _ => DeviceStatus::Failed,
                };
                report.error = Some(err.to_string());
                return report;
            }
        };
        report.pre_snapshot = Some(pre.id);

        let operation = Operation::Deploy {
            commands: commands.to_vec(),
        };
        match self
            .executor
            .run_pinned(device, operation, options, &mut pinned, cancel)
            .await
        {
            Ok(result) => {
                report.status = result.status;
                report.error = result.error.map(|e| e.message);
            }
            Err(err) => {
                report.status = match err {
                    FleetError::Cancelled => DeviceStatus::Cancelled,
                    _ => DeviceStatus::Failed,
                };
                report.error = Some(err.to_string());
            }
        }

        match self
            .snapshot_pinned(
                device,
                SnapshotType::PostChange,
                "after deploy".to_string(),
                &snapshot_options,
                &mut pinned,
                &CancellationToken::new(),
            )
            .await
        {
            Ok(post) => {
                report.post_snapshot = Some(post.id);
                report.diff = Some(self.diff(&pre, &post));
            }
            Err(err) => warn!("{}: post-change snapshot failed: {}", device.id, err),
        }
        pinned.release().await;
        report
    }
}

use super::*;

type ProgressSender = Arc<watch::Sender<BatchProgress>>;

impl BatchHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// A receiver of progress counters; `finished` flips once all devices
    /// have settled.
    pub fn progress(&self) -> watch::Receiver<BatchProgress> {
        self.progress.clone()
    }

    /// Cancels devices that have not settled yet. Sessions they were using
    /// are closed, not returned to the pool.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<BatchOperation, FleetError> {
        self.task
            .await
            .map_err(|err| FleetError::Internal(format!("batch {} task failed: {err}", self.id)))
    }
}

impl BatchExecutor {
    pub fn new(
        config: ExecutorConfig,
        pool: ConnectionPool,
        controller: ConcurrencyController,
        parser: Arc<HybridParser>,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let health = HealthTracker::new(config.unhealthy_threshold, config.health_idle_ttl());
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                config,
                pool,
                controller,
                parser,
                health,
            }),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub fn health(&self) -> &HealthTracker {
        &self.inner.health
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.inner.controller
    }

    /// Runs `operation` on every device and waits for all of them.
    pub async fn run(
        &self,
        devices: Vec<DeviceIdentity>,
        operation: Operation,
        options: BatchOptions,
        cancel: &CancellationToken,
    ) -> BatchOperation {
        let (progress, _) = watch::channel(BatchProgress::new(devices.len()));
        self.execute(
            Uuid::new_v4(),
            devices,
            operation,
            options,
            cancel.clone(),
            Arc::new(progress),
        )
        .await
    }

    /// Starts a batch in the background and returns a handle to observe it.
    pub fn spawn(
        &self,
        devices: Vec<DeviceIdentity>,
        operation: Operation,
        options: BatchOptions,
    ) -> BatchHandle {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (sender, progress) = watch::channel(BatchProgress::new(devices.len()));
        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            this.execute(id, devices, operation, options, token, Arc::new(sender))
                .await
        });
        BatchHandle {
            id,
            progress,
            cancel,
            task,
        }
    }

    async fn execute(
        &self,
        id: Uuid,
        devices: Vec<DeviceIdentity>,
        operation: Operation,
        options: BatchOptions,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> BatchOperation {
        let created_at = Utc::now();
        info!(
            "batch {} started: {} on {} devices ({:?}, max retries {})",
            id,
            operation.name(),
            devices.len(),
            options.strategy,
            options.max_retries
        );
        let operation = Arc::new(operation);
        let options = Arc::new(options);
        let mut results: Vec<DeviceResult> = devices
            .iter()
            .map(|d| DeviceResult::pending(d.id.clone()))
            .collect();

        match options.strategy {
            BatchStrategy::Parallel | BatchStrategy::ContinueOnError => {
                let mut set = JoinSet::new();
                for (index, device) in devices.into_iter().enumerate() {
                    let this = self.clone();
                    let operation = operation.clone();
                    let options = options.clone();
                    let cancel = cancel.clone();
                    let progress = progress.clone();
                    set.spawn(async move {
                        let (result, _) = this
                            .run_device(&device, &operation, &options, &cancel, &progress, None)
                            .await;
                        (index, result)
                    });
                }
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((index, result)) => results[index] = result,
                        Err(err) => warn!("batch {} device task aborted: {}", id, err),
                    }
                }
            }
            BatchStrategy::Sequential | BatchStrategy::FailFast => {
                let mut halted = false;
                for (index, device) in devices.iter().enumerate() {
                    if halted || cancel.is_cancelled() {
                        results[index] = DeviceResult::cancelled(device.id.clone());
                        progress.send_modify(|p| p.settled(DeviceStatus::Cancelled, false));
                        continue;
                    }
                    let (result, _) = self
                        .run_device(device, &operation, &options, &cancel, &progress, None)
                        .await;
                    if options.strategy == BatchStrategy::FailFast
                        && result.status == DeviceStatus::Failed
                    {
                        warn!(
                            "batch {} halted after failure on {}; {} devices cancelled",
                            id,
                            device.id,
                            devices.len() - index - 1
                        );
                        halted = true;
                    }
                    results[index] = result;
                }
            }
        }

        for result in results.iter_mut().filter(|r| !r.status.is_terminal()) {
            let was_running = result.status == DeviceStatus::Running;
            result.status = DeviceStatus::Failed;
            result.finished_at = Some(Utc::now());
            result.error = Some(DeviceError::from(&FleetError::Internal(
                "device task aborted".to_string(),
            )));
            progress.send_modify(|p| p.settled(DeviceStatus::Failed, was_running));
        }

        let health = &self.inner.health;
        for result in &results {
            match result.status {
                DeviceStatus::Success => health.record_success(&result.device).await,
                DeviceStatus::Failed => {
                    health.record_failure(&result.device).await;
                }
                _ => {}
            }
        }
        let unhealthy = health
            .unhealthy_among(results.iter().map(|r| &r.device).collect::<Vec<_>>())
            .await;

        let mut batch = BatchOperation {
            id,
            operation: Operation::clone(&operation),
            strategy: options.strategy,
            max_retries: options.max_retries,
            results,
            summary: BatchSummary::default(),
            created_at,
            completed_at: Some(Utc::now()),
        };
        batch.summary = batch.summarize(unhealthy);
        progress.send_modify(|p| p.finished = true);
        info!(
            "batch {} finished: {}/{} succeeded, {} failed, {} cancelled",
            id,
            batch.summary.succeeded,
            batch.summary.total,
            batch.summary.failed,
            batch.summary.cancelled
        );
        batch
    }

    /// Runs `operation` on a single device.
    ///
    /// Unlike a batch, an attempt that failed comes back as the underlying
    /// error. Commands rejected by the device are reported in the result.
    pub async fn run_single(
        &self,
        device: &DeviceIdentity,
        operation: Operation,
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> Result<DeviceResult, FleetError> {
        match self.run_one(device, operation, options, cancel).await {
            (_, Some(err)) => Err(err),
            (result, None) => Ok(result),
        }
    }

    /// Like [`run_single`](Self::run_single), over the session held by
    /// `pinned`. The session stays leased after the operation.
    pub async fn run_pinned(
        &self,
        device: &DeviceIdentity,
        operation: Operation,
        options: &BatchOptions,
        pinned: &mut PinnedSession,
        cancel: &CancellationToken,
    ) -> Result<DeviceResult, FleetError> {
        match self.run_tracked(device, &operation, options, cancel, Some(pinned)).await {
            (_, Some(err)) => Err(err),
            (result, None) => Ok(result),
        }
    }

    /// Runs `operation` on a single device, returning the result together
    /// with the error that ended the last attempt.
    pub async fn run_one(
        &self,
        device: &DeviceIdentity,
        operation: Operation,
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> (DeviceResult, Option<FleetError>) {
        self.run_tracked(device, &operation, options, cancel, None).await
    }

    async fn run_tracked(
        &self,
        device: &DeviceIdentity,
        operation: &Operation,
        options: &BatchOptions,
        cancel: &CancellationToken,
        pinned: Option<&mut PinnedSession>,
    ) -> (DeviceResult, Option<FleetError>) {
        let (progress, _) = watch::channel(BatchProgress::new(1));
        let (result, error) = self
            .run_device(device, operation, options, cancel, &Arc::new(progress), pinned)
            .await;
        match result.status {
            DeviceStatus::Success => self.inner.health.record_success(&device.id).await,
            DeviceStatus::Failed => {
                self.inner.health.record_failure(&device.id).await;
            }
            _ => {}
        }
        (result, error)
    }

    /// Runs one device to completion, retrying transient failures. The error
    /// that ended the last attempt is returned next to the result.
    ///
    /// A device whose one-time password was already sent is not retried.
    async fn run_device(
        &self,
        device: &DeviceIdentity,
        operation: &Operation,
        options: &BatchOptions,
        cancel: &CancellationToken,
        progress: &ProgressSender,
        mut pinned: Option<&mut PinnedSession>,
    ) -> (DeviceResult, Option<FleetError>) {
        let mut result = DeviceResult::pending(device.id.clone());
        if cancel.is_cancelled() {
            progress.send_modify(|p| p.settled(DeviceStatus::Cancelled, false));
            return (
                DeviceResult::cancelled(device.id.clone()),
                Some(FleetError::Cancelled),
            );
        }

        let permit = match self.inner.controller.acquire(cancel).await {
            Ok(permit) => permit,
            Err(err) => {
                result.status = match err {
                    FleetError::Cancelled => DeviceStatus::Cancelled,
                    _ => DeviceStatus::Failed,
                };
                result.error = Some(DeviceError::from(&err));
                result.finished_at = Some(Utc::now());
                progress.send_modify(|p| p.settled(result.status, false));
                return (result, Some(err));
            }
        };
        progress.send_modify(BatchProgress::started);
        result.status = DeviceStatus::Running;
        result.started_at = Some(Utc::now());
        let started = Instant::now();

        let mut overrides = options.credentials.clone();
        let outcome = loop {
            result.attempts += 1;
            let attempt_started = Instant::now();
            let outcome = self
                .attempt(
                    device,
                    operation,
                    &overrides,
                    options.command_timeout,
                    cancel,
                    pinned.as_deref_mut(),
                )
                .await;
            if !matches!(
                outcome,
                Err(FleetError::Cancelled | FleetError::CredentialMissing { .. })
            ) {
                self.inner
                    .controller
                    .record(attempt_started.elapsed(), outcome.is_ok());
            }

            match outcome {
                Ok(outputs) => break Ok(outputs),
                Err(err) if err.is_retryable() && result.attempts <= options.max_retries => {
                    if matches!(
                        err,
                        FleetError::Authentication {
                            alternate_source: true,
                            ..
                        }
                    ) {
                        debug!("{} retrying without the request password", device.id);
                        overrides.password = None;
                        overrides.otp = None;
                    } else if overrides.otp_spent(&device.id) {
                        warn!(
                            "{} attempt {} failed: {}; one-time password already used, not retrying",
                            device.id, result.attempts, err
                        );
                        break Err(err);
                    }
                    let delay = self.inner.config.backoff(result.attempts);
                    warn!(
                        "{} attempt {} failed: {}; retrying in {:?}",
                        device.id, result.attempts, err, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break Err(FleetError::Cancelled),
                    }
                }
                Err(err) => break Err(err),
            }
        };
        drop(permit);

        result.duration_ms = Some(started.elapsed().as_millis() as u64);
        result.finished_at = Some(Utc::now());
        let mut failure = None;
        match outcome {
            Ok(outputs) => {
                result.error = outputs.iter().find_map(|o| o.error.clone());
                result.status = if result.error.is_none() {
                    DeviceStatus::Success
                } else {
                    DeviceStatus::Failed
                };
                result.outputs = outputs;
            }
            Err(err) => {
                result.status = match err {
                    FleetError::Cancelled => DeviceStatus::Cancelled,
                    _ => DeviceStatus::Failed,
                };
                result.error = Some(DeviceError::from(&err));
                failure = Some(err);
            }
        }
        debug!(
            "{} {} after {} attempts in {:?}",
            device.id,
            match result.status {
                DeviceStatus::Success => "succeeded",
                DeviceStatus::Cancelled => "cancelled",
                _ => "failed",
            },
            result.attempts,
            started.elapsed()
        );
        progress.send_modify(|p| p.settled(result.status, true));
        (result, failure)
    }

    /// One attempt: lease a session and send every command of the operation.
    ///
    /// Commands the device rejects are recorded and the rest still run.
    /// Any other failure ends the attempt and drops the session.
    async fn attempt(
        &self,
        device: &DeviceIdentity,
        operation: &Operation,
        overrides: &CredentialOverrides,
        timeout: Duration,
        cancel: &CancellationToken,
        mut pinned: Option<&mut PinnedSession>,
    ) -> Result<Vec<CommandOutput>, FleetError> {
        let profile = templates::profile_for(&device.platform);
        let held = pinned.as_mut().and_then(|p| p.lease.take());
        let mut lease = match held {
            Some(lease) => lease,
            None => {
                self.inner
                    .pool
                    .acquire(device, overrides, self.inner.config.acquire_timeout(), cancel)
                    .await?
            }
        };

        let commands = operation.commands(profile);
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            match lease.send(&command, timeout, cancel).await {
                Ok(output) => {
                    let parsed = (operation.parses_output() && !command.is_empty())
                        .then(|| self.inner.parser.parse(&output, &command, &device.platform));
                    outputs.push(CommandOutput {
                        command,
                        output,
                        parsed,
                        error: None,
                    });
                }
                Err(err @ FleetError::CommandExecution { .. }) => {
                    debug!("{} rejected '{}'", device.id, command);
                    let output = match &err {
                        FleetError::CommandExecution { output, .. } => output.clone(),
                        _ => String::new(),
                    };
                    outputs.push(CommandOutput {
                        command,
                        output,
                        parsed: None,
                        error: Some(DeviceError::from(&err)),
                    });
                }
                Err(err) => {
                    if operation.is_change() {
                        lease.mark_unhealthy();
                    }
                    return Err(err);
                }
            }
        }
        match pinned {
            Some(pinned) => pinned.lease = Some(lease),
            None => lease.release().await,
        }
        Ok(outputs)
    }
}

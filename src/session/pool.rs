use super::*;

use std::sync::PoisonError;

/// Result of one attempt to take a session under the pool lock.
enum Take {
    Reuse(Session),
    Connect(Permits),
    Wait,
}

impl Session {
    pub(super) fn is_expired(&self, config: &PoolConfig, now: Instant) -> bool {
        now.duration_since(self.created) >= config.max_lifetime()
            || now.duration_since(self.last_used) >= config.max_idle()
    }

    pub(super) fn info(&self, state: SessionState) -> SessionInfo {
        SessionInfo {
            id: self.id,
            device: self.device.clone(),
            state,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            use_count: self.use_count,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Removes a session from accounting and frees both permits. The returned
/// handle still has to be closed.
pub(super) fn retire(
    counters: &mut Counters,
    session: Session,
    reason: CloseReason,
) -> Box<dyn TransportHandle> {
    counters.destroyed += 1;
    if reason == CloseReason::Failed {
        counters.failed += 1;
    }
    debug!(
        "closing session {} to {} ({:?}, used {} times)",
        session.id, session.device, reason, session.use_count
    );
    let Session {
        handle, permits, ..
    } = session;
    drop(permits);
    handle
}

pub(super) fn total_sessions(devices: &HashMap<DeviceId, DeviceSlot>) -> usize {
    devices
        .values()
        .map(|slot| slot.idle.len() + slot.active + slot.checking)
        .sum()
}

/// Drops the slot of a device with nothing left in it.
pub(super) fn prune(devices: &mut HashMap<DeviceId, DeviceSlot>, id: &DeviceId) {
    if devices
        .get(id)
        .is_some_and(|slot| slot.idle.is_empty() && slot.active == 0 && slot.checking == 0)
    {
        devices.remove(id);
    }
}

/// Least recently used idle session of any device other than `except`.
fn reclaim_lru(devices: &mut HashMap<DeviceId, DeviceSlot>, except: &DeviceId) -> Option<Session> {
    let victim = devices
        .iter()
        .filter(|(id, _)| *id != except)
        .filter_map(|(id, slot)| slot.idle.front().map(|s| (id.clone(), s.last_used)))
        .min_by_key(|(_, last_used)| *last_used)
        .map(|(id, _)| id)?;
    let session = devices.get_mut(&victim)?.idle.pop_front();
    prune(devices, &victim);
    session
}

pub(super) fn close_in_background(handles: Vec<Box<dyn TransportHandle>>) {
    if handles.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                for mut handle in handles {
                    handle.close().await;
                }
            });
        }
        Err(_) => debug!(
            "no runtime available to close {} sessions; dropping them",
            handles.len()
        ),
    }
}

impl PoolInner {
    pub(super) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_take(&self, id: &DeviceId) -> Result<(Take, Vec<Box<dyn TransportHandle>>), FleetError> {
        let mut state = self.lock();
        if state.closed {
            return Err(FleetError::Internal("connection pool is shut down".to_string()));
        }
        let PoolState {
            devices, counters, ..
        } = &mut *state;
        let now = Instant::now();
        let mut retired = Vec::new();

        let slot = devices.entry(id.clone()).or_default();
        while let Some(mut session) = slot.idle.pop_back() {
            if session.is_expired(&self.config, now) || !session.handle.is_alive() {
                retired.push(retire(counters, session, CloseReason::Expired));
                continue;
            }
            session.use_count += 1;
            slot.active += 1;
            counters.hits += 1;
            return Ok((Take::Reuse(session), retired));
        }

        let device_permits = slot
            .permits
            .get_or_insert_with(|| Arc::new(Semaphore::new(self.config.max_sessions_per_device)))
            .clone();
        if device_permits.available_permits() == 0 {
            return Ok((Take::Wait, retired));
        }

        let global = match self.global.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => match reclaim_lru(devices, id) {
                Some(victim) => {
                    retired.push(retire(counters, victim, CloseReason::Reclaimed));
                    match self.global.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => return Ok((Take::Wait, retired)),
                    }
                }
                None => return Ok((Take::Wait, retired)),
            },
        };

        let device = match device_permits.try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Ok((Take::Wait, retired)),
        };

        devices.entry(id.clone()).or_default().active += 1;
        counters.misses += 1;
        counters.peak = counters.peak.max(total_sessions(devices));
        Ok((
            Take::Connect(Permits {
                _global: global,
                _device: device,
            }),
            retired,
        ))
    }

    /// Returns a session after a lease. Yields the handle when the session
    /// must be closed instead of kept.
    fn checkin(&self, mut session: Session, outcome: LeaseOutcome) -> Option<Box<dyn TransportHandle>> {
        let mut state = self.lock();
        let PoolState {
            devices,
            counters,
            closed,
        } = &mut *state;
        let now = Instant::now();
        let id = session.device.clone();

        let reason = if *closed {
            Some(CloseReason::Shutdown)
        } else if outcome == LeaseOutcome::Poisoned {
            Some(CloseReason::Poisoned)
        } else if session.one_time {
            Some(CloseReason::OneTime)
        } else if session.consecutive_failures >= self.config.failure_threshold
            || !session.handle.is_alive()
        {
            Some(CloseReason::Failed)
        } else if now.duration_since(session.created) >= self.config.max_lifetime() {
            Some(CloseReason::Expired)
        } else {
            None
        };

        let slot = devices.entry(id.clone()).or_default();
        slot.active = slot.active.saturating_sub(1);
        let handle = match reason {
            Some(reason) => Some(retire(counters, session, reason)),
            None => {
                session.last_used = now;
                session.last_used_at = Utc::now();
                trace!("session {} to {} back to idle", session.id, id);
                slot.idle.push_back(session);
                None
            }
        };
        prune(devices, &id);
        drop(state);
        self.notify.notify_waiters();
        handle
    }

    /// Undo the bookkeeping of a connection attempt that failed.
    fn abandon_connect(&self, id: &DeviceId, count_error: bool) {
        let mut state = self.lock();
        if count_error {
            state.counters.connection_errors += 1;
        }
        if let Some(slot) = state.devices.get_mut(id) {
            slot.active = slot.active.saturating_sub(1);
        }
        prune(&mut state.devices, id);
        drop(state);
        self.notify.notify_waiters();
    }
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        driver: Arc<dyn TransportDriver>,
        resolver: CredentialResolver,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let global = Arc::new(Semaphore::new(config.max_total_sessions));
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                driver,
                resolver,
                global,
                state: Mutex::new(PoolState::default()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Leases a session for `device`, reusing an idle one when possible.
    ///
    /// Blocks until a slot frees up, `timeout` elapses
    /// ([`FleetError::PoolExhausted`]) or `cancel` fires
    /// ([`FleetError::Cancelled`]). Opening a new session resolves
    /// credentials with `overrides` and connects through the driver.
    pub async fn acquire(
        &self,
        device: &DeviceIdentity,
        overrides: &CredentialOverrides,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, FleetError> {
        let started = Instant::now();
        let deadline = started + timeout;
        self.inner.lock().counters.requests += 1;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (take, retired) = self.inner.try_take(&device.id)?;
            if !retired.is_empty() {
                self.inner.notify.notify_waiters();
                close_in_background(retired);
            }
            match take {
                Take::Reuse(session) => {
                    debug!("reusing session {} for {}", session.id, device.id);
                    return Ok(SessionLease::new(self.inner.clone(), session, true));
                }
                Take::Connect(permits) => {
                    return self.connect(device, overrides, permits, cancel).await;
                }
                Take::Wait => {}
            }

            trace!("waiting for a free session slot for {}", device.id);
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("connection pool exhausted for {} after {:?}", device.id, started.elapsed());
                    return Err(FleetError::PoolExhausted {
                        device: device.id.to_string(),
                        waited: started.elapsed(),
                    });
                }
                _ = cancel.cancelled() => return Err(FleetError::Cancelled),
            }
        }
    }

    async fn connect(
        &self,
        device: &DeviceIdentity,
        overrides: &CredentialOverrides,
        permits: Permits,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, FleetError> {
        match self.open(device, overrides, cancel).await {
            Ok((handle, one_time)) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                self.inner.lock().counters.created += 1;
                info!("opened session {} to {} ({})", id, device.id, device.address());
                let now = Instant::now();
                let stamp = Utc::now();
                let session = Session {
                    id,
                    device: device.id.clone(),
                    handle,
                    created: now,
                    created_at: stamp,
                    last_used: now,
                    last_used_at: stamp,
                    last_checked: None,
                    use_count: 1,
                    consecutive_failures: 0,
                    one_time,
                    permits,
                };
                Ok(SessionLease::new(self.inner.clone(), session, false))
            }
            Err(err) => {
                drop(permits);
                let count_error = !matches!(
                    err,
                    FleetError::Cancelled | FleetError::CredentialMissing { .. }
                );
                self.inner.abandon_connect(&device.id, count_error);
                warn!("failed to open session to {}: {}", device.id, err);
                Err(err)
            }
        }
    }

    async fn open(
        &self,
        device: &DeviceIdentity,
        overrides: &CredentialOverrides,
        cancel: &CancellationToken,
    ) -> Result<(Box<dyn TransportHandle>, bool), FleetError> {
        let credential = self.inner.resolver.resolve(device, overrides).await?;
        let one_time = credential.is_one_time();
        if one_time && credential.source() == CredentialSource::Request {
            overrides.spend_otp(&device.id);
        }
        let alternate = credential.has_fallback();
        let connecting = self
            .inner
            .driver
            .connect(device, &credential, self.inner.config.connect_timeout());
        let result = tokio::select! {
            res = connecting => Some(res),
            _ = cancel.cancelled() => None,
        };
        drop(credential);
        match result {
            Some(Ok(handle)) => Ok((handle, one_time)),
            Some(Err(err)) => Err(FleetError::from_transport(
                device.id.as_str(),
                None,
                err,
                alternate,
            )),
            None => Err(FleetError::Cancelled),
        }
    }
}

impl SessionLease {
    fn new(pool: Arc<PoolInner>, session: Session, reused: bool) -> Self {
        Self {
            pool,
            session: Some(session),
            outcome: LeaseOutcome::Healthy,
            reused,
        }
    }

    /// Whether the session came from the idle set instead of a new connect.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn info(&self) -> Option<SessionInfo> {
        self.session
            .as_ref()
            .map(|session| session.info(SessionState::Active))
    }

    /// Marks the session as untrustworthy; it is closed on release.
    pub fn mark_unhealthy(&mut self) {
        self.outcome = LeaseOutcome::Poisoned;
    }

    /// Sends one command over the leased session.
    ///
    /// A timeout, cancellation or broken channel poisons the lease. A command
    /// the device rejected leaves the session healthy.
    pub async fn send(
        &mut self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, FleetError> {
        let Some(session) = self.session.as_mut() else {
            return Err(FleetError::Internal("session lease already released".to_string()));
        };
        let result = tokio::select! {
            res = session.handle.send(command, timeout) => Some(res),
            _ = cancel.cancelled() => None,
        };
        let Some(result) = result else {
            self.outcome = LeaseOutcome::Poisoned;
            return Err(FleetError::Cancelled);
        };
        match result {
            Ok(output) => {
                session.consecutive_failures = 0;
                Ok(output)
            }
            Err(err) => {
                match err {
                    TransportError::Rejected(_) => {}
                    TransportError::Timeout(_) | TransportError::Closed => {
                        session.consecutive_failures += 1;
                        self.outcome = LeaseOutcome::Poisoned;
                    }
                    _ => session.consecutive_failures += 1,
                }
                Err(FleetError::from_transport(
                    session.device.as_str(),
                    Some(command),
                    err,
                    false,
                ))
            }
        }
    }

    /// Returns the session and waits for it to close if it is not kept.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take()
            && let Some(mut handle) = self.pool.checkin(session, self.outcome)
        {
            handle.close().await;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take()
            && let Some(handle) = self.pool.checkin(session, self.outcome)
        {
            close_in_background(vec![handle]);
        }
    }
}

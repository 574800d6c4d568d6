use super::*;

use std::sync::PoisonError;

use super::pool::{close_in_background, prune, retire, total_sessions};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SweepReport {
    pub expired: usize,
    pub probed: usize,
    pub failed_probes: usize,
}

impl ConnectionPool {
    /// Starts the background sweeper. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut guard = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let period = self.inner.config.sweep_interval();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let report = ConnectionPool { inner }.sweep().await;
                        if report != SweepReport::default() {
                            debug!("pool sweep: {:?}", report);
                        }
                    }
                }
            }
            debug!("pool sweeper stopped");
        }));
        info!("connection pool sweeper started every {:?}", period);
    }

    /// Stops the sweeper, closes every idle session and rejects new
    /// acquisitions. Leased sessions close when their lease ends.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let task = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!("pool sweeper ended abnormally: {}", err);
        }

        let handles = {
            let mut state = self.inner.lock();
            state.closed = true;
            let PoolState {
                devices, counters, ..
            } = &mut *state;
            let mut handles = Vec::new();
            for slot in devices.values_mut() {
                while let Some(session) = slot.idle.pop_front() {
                    handles.push(retire(counters, session, CloseReason::Shutdown));
                }
            }
            devices.retain(|_, slot| slot.active > 0 || slot.checking > 0);
            handles
        };
        self.inner.notify.notify_waiters();
        let closed = handles.len();
        for mut handle in handles {
            handle.close().await;
        }
        info!("connection pool shut down, closed {} idle sessions", closed);
    }

    /// One maintenance pass: drops expired or dead idle sessions and probes
    /// sessions that have been idle longer than the health check interval.
    pub async fn sweep(&self) -> SweepReport {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut report = SweepReport::default();

        let (retired, mut probing) = {
            let mut state = self.inner.lock();
            let PoolState {
                devices, counters, ..
            } = &mut *state;
            let mut retired = Vec::new();
            let mut probing = Vec::new();
            let ids: Vec<DeviceId> = devices.keys().cloned().collect();
            for id in ids {
                let Some(slot) = devices.get_mut(&id) else {
                    continue;
                };
                let mut keep = VecDeque::with_capacity(slot.idle.len());
                while let Some(session) = slot.idle.pop_front() {
                    if session.is_expired(config, now) {
                        report.expired += 1;
                        retired.push(retire(counters, session, CloseReason::Expired));
                    } else if !session.handle.is_alive() {
                        retired.push(retire(counters, session, CloseReason::Failed));
                    } else if now.duration_since(session.last_checked.unwrap_or(session.last_used).max(session.last_used))
                        >= config.health_check_interval()
                    {
                        slot.checking += 1;
                        probing.push(session);
                    } else {
                        keep.push_back(session);
                    }
                }
                slot.idle = keep;
                prune(devices, &id);
            }
            (retired, probing)
        };
        if !retired.is_empty() {
            self.inner.notify.notify_waiters();
            close_in_background(retired);
        }

        report.probed = probing.len();
        let mut failed = Vec::new();
        let mut healthy = Vec::new();
        for mut session in probing.drain(..) {
            trace!("probing session {} to {}", session.id, session.device);
            let probe = session
                .handle
                .send(&config.probe_command, config.probe_timeout());
            let outcome = tokio::select! {
                res = probe => res.is_ok(),
                _ = self.inner.shutdown.cancelled() => false,
            };
            session.last_checked = Some(Instant::now());
            if outcome {
                session.consecutive_failures = 0;
                healthy.push(session);
            } else {
                warn!("health probe failed for session {} to {}", session.id, session.device);
                failed.push(session);
            }
        }
        report.failed_probes = failed.len();

        let handles = {
            let mut state = self.inner.lock();
            let PoolState {
                devices,
                counters,
                closed,
            } = &mut *state;
            let mut handles = Vec::new();
            for session in failed {
                let id = session.device.clone();
                if let Some(slot) = devices.get_mut(&id) {
                    slot.checking = slot.checking.saturating_sub(1);
                }
                handles.push(retire(counters, session, CloseReason::Failed));
                prune(devices, &id);
            }
            for session in healthy {
                let id = session.device.clone();
                let slot = devices.entry(id.clone()).or_default();
                slot.checking = slot.checking.saturating_sub(1);
                if *closed {
                    handles.push(retire(counters, session, CloseReason::Shutdown));
                    prune(devices, &id);
                } else {
                    slot.idle.push_front(session);
                }
            }
            handles
        };
        self.inner.notify.notify_waiters();
        for mut handle in handles {
            handle.close().await;
        }
        report
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let counters = &state.counters;
        let mut stats = PoolStats {
            total_sessions: total_sessions(&state.devices),
            peak_sessions: counters.peak,
            sessions_created: counters.created,
            sessions_destroyed: counters.destroyed,
            sessions_failed: counters.failed,
            requests: counters.requests,
            cache_hits: counters.hits,
            cache_misses: counters.misses,
            hit_rate: if counters.requests == 0 {
                0.0
            } else {
                counters.hits as f64 / counters.requests as f64
            },
            connection_errors: counters.connection_errors,
            available_global_permits: self.inner.global.available_permits(),
            ..PoolStats::default()
        };
        for (id, slot) in &state.devices {
            stats.active_sessions += slot.active;
            stats.idle_sessions += slot.idle.len();
            stats.checking_sessions += slot.checking;
            stats.per_device.insert(
                id.clone(),
                DeviceSessionCounts {
                    active: slot.active,
                    idle: slot.idle.len(),
                    checking: slot.checking,
                },
            );
        }
        stats
    }

    /// Idle sessions, least recently used first.
    pub fn idle_sessions(&self) -> Vec<SessionInfo> {
        let state = self.inner.lock();
        let mut sessions: Vec<SessionInfo> = state
            .devices
            .values()
            .flat_map(|slot| slot.idle.iter().map(|s| s.info(SessionState::Idle)))
            .collect();
        sessions.sort_by_key(|s| s.last_used_at);
        sessions
    }

    /// Closes the idle sessions of one device.
    pub async fn close_device(&self, id: &DeviceId) -> usize {
        let handles = {
            let mut state = self.inner.lock();
            let PoolState {
                devices, counters, ..
            } = &mut *state;
            let mut handles = Vec::new();
            if let Some(slot) = devices.get_mut(id) {
                while let Some(session) = slot.idle.pop_front() {
                    handles.push(retire(counters, session, CloseReason::Reclaimed));
                }
            }
            prune(devices, id);
            handles
        };
        self.inner.notify.notify_waiters();
        let closed = handles.len();
        for mut handle in handles {
            handle.close().await;
        }
        closed
    }
}

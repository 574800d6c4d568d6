//! Adaptive concurrency control.
//!
//! A single counting permit pool, independent of the connection pool, bounds
//! how many device operations run at once. The limit is re-evaluated on a
//! fixed interval from a rolling window of latency/success samples. Growing
//! the limit adds permits; shrinking forgets free permits and records the
//! rest as debt that is paid back as in-flight permits are returned, so
//! running operations are never interrupted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::error::FleetError;

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ControllerStats {
    pub limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    pub available: usize,
    pub in_flight: usize,
    pub samples: usize,
    pub error_rate: f64,
    pub mean_latency_ms: f64,
    pub adjustments: u64,
}

/// A limit change made by one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitChange {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    success: bool,
}

#[derive(Debug, Default)]
struct ControllerState {
    limit: usize,
    /// Permits still to be withheld after a shrink.
    debt: usize,
    in_flight: usize,
    samples: VecDeque<Sample>,
    adjustments: u64,
}

impl ControllerState {
    fn window(&self) -> Option<(f64, Duration)> {
        if self.samples.is_empty() {
            return None;
        }
        let count = self.samples.len();
        let failures = self.samples.iter().filter(|s| !s.success).count();
        let total: Duration = self.samples.iter().map(|s| s.latency).sum();
        Some((failures as f64 / count as f64, total / count as u32))
    }
}

struct ControllerInner {
    config: ControllerConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<ControllerState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerInner {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resize(&self, state: &mut ControllerState, target: usize) {
        if target > state.limit {
            let mut grow = target - state.limit;
            let repaid = grow.min(state.debt);
            state.debt -= repaid;
            grow -= repaid;
            if grow > 0 {
                self.semaphore.add_permits(grow);
            }
        } else if target < state.limit {
            let shrink = state.limit - target;
            let forgotten = self.semaphore.forget_permits(shrink);
            state.debt += shrink - forgotten;
        }
        state.limit = target;
    }
}

/// Global, adaptively sized permit pool for device operations.
#[derive(Clone)]
pub struct ConcurrencyController {
    inner: Arc<ControllerInner>,
}

/// Permission to run one device operation. Returned on drop.
pub struct ControllerPermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<ControllerInner>,
}

impl Drop for ControllerPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut state = self.inner.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.debt > 0 {
            state.debt -= 1;
            permit.forget();
        }
    }
}

impl ConcurrencyController {
    pub fn new(config: ControllerConfig) -> Result<Self, FleetError> {
        config.validate()?;
        let limit = config.initial_limit;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                semaphore: Arc::new(Semaphore::new(limit)),
                state: Mutex::new(ControllerState {
                    limit,
                    samples: VecDeque::with_capacity(config.window_size),
                    ..ControllerState::default()
                }),
                config,
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        })
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().limit
    }

    /// Waits for a permit. The permit must be held for the whole device
    /// operation and dropped right after.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ControllerPermit, FleetError> {
        let permit = tokio::select! {
            res = self.inner.semaphore.clone().acquire_owned() => res.map_err(|_| {
                FleetError::Internal("concurrency controller is shut down".to_string())
            })?,
            _ = cancel.cancelled() => return Err(FleetError::Cancelled),
        };
        self.inner.lock().in_flight += 1;
        Ok(ControllerPermit {
            permit: Some(permit),
            inner: self.inner.clone(),
        })
    }

    /// Adds one performance sample to the rolling window.
    pub fn record(&self, latency: Duration, success: bool) {
        let mut state = self.inner.lock();
        if state.samples.len() == self.inner.config.window_size {
            state.samples.pop_front();
        }
        state.samples.push_back(Sample { latency, success });
    }

    /// Evaluates the adaptive rules once against the current window.
    pub fn adjust_now(&self) -> Option<LimitChange> {
        let config = &self.inner.config;
        let mut state = self.inner.lock();
        let (error_rate, mean) = state.window()?;
        let current = state.limit as f64;
        let mean_ms = mean.as_millis() as u64;

        let proposed = if error_rate > config.error_rate_high {
            (current * config.down_factor + 1e-9).floor()
        } else if error_rate < config.error_rate_low && mean_ms < config.good_latency_ms {
            (current * config.up_factor - 1e-9).ceil()
        } else if mean_ms > config.slow_latency_ms {
            (current * config.slow_factor + 1e-9).floor()
        } else {
            current
        };
        let target = (proposed.max(0.0) as usize).clamp(config.min_limit, config.max_limit);
        if target == state.limit {
            return None;
        }

        let change = LimitChange {
            from: state.limit,
            to: target,
        };
        self.inner.resize(&mut state, target);
        state.adjustments += 1;
        info!(
            "concurrency limit {} -> {} (error rate {:.1}%, mean latency {}ms)",
            change.from,
            change.to,
            error_rate * 100.0,
            mean_ms
        );
        Some(change)
    }

    /// Overrides the limit, clamped to the configured bounds.
    pub fn set_limit(&self, limit: usize) -> usize {
        let config = &self.inner.config;
        let target = limit.clamp(config.min_limit, config.max_limit);
        let mut state = self.inner.lock();
        self.inner.resize(&mut state, target);
        target
    }

    pub fn stats(&self) -> ControllerStats {
        let config = &self.inner.config;
        let state = self.inner.lock();
        let (error_rate, mean) = state.window().unwrap_or((0.0, Duration::ZERO));
        ControllerStats {
            limit: state.limit,
            min_limit: config.min_limit,
            max_limit: config.max_limit,
            available: self.inner.semaphore.available_permits(),
            in_flight: state.in_flight,
            samples: state.samples.len(),
            error_rate,
            mean_latency_ms: mean.as_secs_f64() * 1000.0,
            adjustments: state.adjustments,
        }
    }

    /// Spawns the periodic adjustment task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut guard = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }
        let weak: Weak<ControllerInner> = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let period = self.inner.config.adjust_interval();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        ConcurrencyController { inner }.adjust_now();
                    }
                }
            }
            debug!("concurrency adjuster stopped");
        }));
        info!("concurrency controller started, adjusting every {:?}", period);
    }

    /// Stops adjustments and fails pending and future acquisitions.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.semaphore.close();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!("concurrency adjuster ended abnormally: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn feed(controller: &ConcurrencyController, total: usize, failures: usize, latency_ms: u64) {
        for i in 0..total {
            controller.record(Duration::from_millis(latency_ms), i >= failures);
        }
    }

    #[test]
    fn high_error_rate_scales_down() {
        let controller = ConcurrencyController::new(ControllerConfig::default()).expect("config");
        feed(&controller, 100, 15, 500);
        let change = controller.adjust_now().expect("limit should change");
        assert_eq!(change, LimitChange { from: 20, to: 16 });
        assert_eq!(controller.stats().available, 16);
    }

    #[test]
    fn healthy_fast_window_scales_up() {
        let controller = ConcurrencyController::new(ControllerConfig::default()).expect("config");
        feed(&controller, 100, 1, 300);
        assert_eq!(controller.adjust_now(), Some(LimitChange { from: 20, to: 24 }));
    }

    #[test]
    fn slow_window_scales_down_gently() {
        let controller = ConcurrencyController::new(ControllerConfig::default()).expect("config");
        feed(&controller, 100, 5, 6_000);
        assert_eq!(controller.adjust_now(), Some(LimitChange { from: 20, to: 18 }));
    }

    #[test]
    fn moderate_window_leaves_limit_alone() {
        let controller = ConcurrencyController::new(ControllerConfig::default()).expect("config");
        feed(&controller, 100, 5, 3_000);
        assert_eq!(controller.adjust_now(), None);
        assert_eq!(controller.limit(), 20);
    }

    #[test]
    fn limit_never_drops_below_minimum() {
        let config = ControllerConfig {
            initial_limit: 5,
            ..ControllerConfig::default()
        };
        let controller = ConcurrencyController::new(config).expect("config");
        feed(&controller, 100, 50, 500);
        assert_eq!(controller.adjust_now(), None);
        assert_eq!(controller.limit(), 5);
    }

    #[tokio::test]
    async fn shrinking_waits_for_in_flight_permits() {
        let config = ControllerConfig {
            initial_limit: 5,
            min_limit: 1,
            max_limit: 10,
            ..ControllerConfig::default()
        };
        let controller = ConcurrencyController::new(config).expect("config");
        let cancel = CancellationToken::new();
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(controller.acquire(&cancel).await.expect("permit"));
        }
        assert_eq!(controller.set_limit(3), 3);
        assert_eq!(controller.stats().available, 0);

        held.pop();
        held.pop();
        assert_eq!(controller.stats().available, 0);
        held.pop();
        assert_eq!(controller.stats().available, 1);
        assert_eq!(controller.stats().in_flight, 2);
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_cancelled() {
        let config = ControllerConfig {
            initial_limit: 1,
            min_limit: 1,
            ..ControllerConfig::default()
        };
        let controller = ConcurrencyController::new(config).expect("config");
        let cancel = CancellationToken::new();
        let _held = controller.acquire(&cancel).await.expect("permit");
        cancel.cancel();
        let err = controller.acquire(&cancel).await.err().expect("cancelled");
        assert!(matches!(err, FleetError::Cancelled));
    }

    #[test]
    fn limit_stays_within_bounds_for_random_windows() {
        let config = ControllerConfig::default();
        let (min, max) = (config.min_limit, config.max_limit);
        let controller = ConcurrencyController::new(config).expect("config");
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let samples = rng.gen_range(1..50);
            for _ in 0..samples {
                let latency = Duration::from_millis(rng.gen_range(10..8_000));
                controller.record(latency, rng.gen_bool(0.85));
            }
            controller.adjust_now();
            let limit = controller.limit();
            assert!((min..=max).contains(&limit), "limit {limit} escaped bounds");
        }
    }
}

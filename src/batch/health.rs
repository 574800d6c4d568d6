use super::*;

use moka::future::Cache;

/// Failure streak of one device across batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceHealth {
    pub device: DeviceId,
    pub consecutive_failures: u32,
    pub unhealthy: bool,
}

/// Counts consecutive failed batches per device.
///
/// Devices over the threshold are reported, never excluded. Records of
/// devices that have not run for the idle TTL are forgotten.
#[derive(Clone)]
pub struct HealthTracker {
    failures: Cache<DeviceId, u32>,
    threshold: u32,
}

impl HealthTracker {
    pub fn new(threshold: u32, idle_ttl: Duration) -> Self {
        let failures = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(idle_ttl)
            .build();
        Self {
            failures,
            threshold,
        }
    }

    pub async fn record_success(&self, device: &DeviceId) {
        self.failures.invalidate(device).await;
    }

    /// Returns the new streak length.
    pub async fn record_failure(&self, device: &DeviceId) -> u32 {
        let entry = self
            .failures
            .entry(device.clone())
            .and_upsert_with(|existing| {
                let next = existing.map_or(1, |e| e.into_value().saturating_add(1));
                std::future::ready(next)
            })
            .await;
        let streak = entry.into_value();
        if streak == self.threshold {
            warn!(
                "{} flagged unhealthy after {} consecutive failed batches",
                device, streak
            );
        }
        streak
    }

    pub async fn consecutive_failures(&self, device: &DeviceId) -> u32 {
        self.failures.get(device).await.unwrap_or(0)
    }

    pub async fn is_unhealthy(&self, device: &DeviceId) -> bool {
        self.consecutive_failures(device).await >= self.threshold
    }

    pub async fn unhealthy_among<'a>(
        &self,
        devices: impl IntoIterator<Item = &'a DeviceId>,
    ) -> Vec<DeviceId> {
        let mut unhealthy = Vec::new();
        for device in devices {
            if self.is_unhealthy(device).await && !unhealthy.contains(device) {
                unhealthy.push(device.clone());
            }
        }
        unhealthy
    }

    /// Every tracked device with a failure streak, worst first.
    pub fn report(&self) -> Vec<DeviceHealth> {
        let mut report: Vec<DeviceHealth> = self
            .failures
            .iter()
            .map(|(device, streak)| DeviceHealth {
                device: DeviceId::clone(&device),
                consecutive_failures: streak,
                unhealthy: streak >= self.threshold,
            })
            .collect();
        report.sort_by(|a, b| {
            b.consecutive_failures
                .cmp(&a.consecutive_failures)
                .then_with(|| a.device.cmp(&b.device))
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streak_resets_on_success() {
        let tracker = HealthTracker::new(3, Duration::from_secs(3600));
        let device = DeviceId::new("sw1");
        for expected in 1..=3 {
            assert_eq!(tracker.record_failure(&device).await, expected);
        }
        assert!(tracker.is_unhealthy(&device).await);
        assert_eq!(
            tracker.unhealthy_among([&device, &device]).await,
            vec![device.clone()]
        );

        tracker.record_success(&device).await;
        assert_eq!(tracker.consecutive_failures(&device).await, 0);
        assert!(!tracker.is_unhealthy(&device).await);
    }

    #[tokio::test]
    async fn below_threshold_is_not_unhealthy() {
        let tracker = HealthTracker::new(3, Duration::from_secs(3600));
        let device = DeviceId::new("r9");
        tracker.record_failure(&device).await;
        tracker.record_failure(&device).await;
        assert!(!tracker.is_unhealthy(&device).await);
        assert!(tracker.unhealthy_among([&device]).await.is_empty());
    }
}

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use netfleet::config::PoolConfig;
use netfleet::credential::{CredentialOverrides, CredentialResolver, CredentialSource};
use netfleet::device::{DeviceIdentity, StaticInventory};
use netfleet::error::FleetError;
use netfleet::session::ConnectionPool;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use common::{FakeFleet, PrefixCipher, Script};

fn pool_with(
    config: PoolConfig,
    inventory: StaticInventory,
    fleet: Arc<FakeFleet>,
) -> (ConnectionPool, CredentialResolver) {
    let resolver = CredentialResolver::new(Arc::new(inventory), Arc::new(PrefixCipher));
    let pool = ConnectionPool::new(config, fleet, resolver.clone()).expect("valid pool config");
    (pool, resolver)
}

fn device(name: &str) -> DeviceIdentity {
    DeviceIdentity::new(name, name, "cisco_ios").with_credential_ref("static")
}

#[tokio::test(start_paused = true)]
async fn third_acquire_waits_for_a_release() {
    let fleet = Arc::new(FakeFleet::default());
    let fake = fleet.add("sw1", Script::default(), common::RUNNING_CONFIG);
    let config = PoolConfig {
        max_sessions_per_device: 2,
        ..PoolConfig::default()
    };
    let (pool, _) = pool_with(config, common::inventory(&["sw1"]), fleet);
    let sw1 = device("sw1");
    let none = CredentialOverrides::none();
    let cancel = CancellationToken::new();

    let first = pool
        .acquire(&sw1, &none, Duration::from_secs(5), &cancel)
        .await
        .expect("first lease");
    let _second = pool
        .acquire(&sw1, &none, Duration::from_secs(5), &cancel)
        .await
        .expect("second lease");

    let waiter = {
        let pool = pool.clone();
        let sw1 = sw1.clone();
        tokio::spawn(async move {
            pool.acquire(
                &sw1,
                &CredentialOverrides::none(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished(), "third acquire must block at the cap");

    first.release().await;
    let third = waiter.await.expect("join").expect("third lease");
    assert!(third.is_reused());
    assert_eq!(fake.connect_count(), 2);

    let stats = pool.stats();
    assert_eq!(stats.active_sessions, 2);
    assert!(stats.cache_hits >= 1);
}

#[tokio::test(start_paused = true)]
async fn acquire_times_out_with_pool_exhausted() {
    let fleet = Arc::new(FakeFleet::default());
    fleet.add("sw1", Script::default(), common::RUNNING_CONFIG);
    let config = PoolConfig {
        max_sessions_per_device: 1,
        ..PoolConfig::default()
    };
    let (pool, _) = pool_with(config, common::inventory(&["sw1"]), fleet);
    let sw1 = device("sw1");
    let cancel = CancellationToken::new();
    let _held = pool
        .acquire(&sw1, &CredentialOverrides::none(), Duration::from_secs(1), &cancel)
        .await
        .expect("lease");

    let err = pool
        .acquire(&sw1, &CredentialOverrides::none(), Duration::from_secs(1), &cancel)
        .await
        .expect_err("cap reached");
    assert!(matches!(err, FleetError::PoolExhausted { .. }));
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn cancelled_acquire_returns_promptly() {
    let fleet = Arc::new(FakeFleet::default());
    fleet.add("sw1", Script::default(), common::RUNNING_CONFIG);
    let config = PoolConfig {
        max_sessions_per_device: 1,
        ..PoolConfig::default()
    };
    let (pool, _) = pool_with(config, common::inventory(&["sw1"]), fleet);
    let sw1 = device("sw1");
    let _held = pool
        .acquire(&sw1, &CredentialOverrides::none(), Duration::from_secs(60), &CancellationToken::new())
        .await
        .expect("lease");

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    let err = pool
        .acquire(&sw1, &CredentialOverrides::none(), Duration::from_secs(60), &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, FleetError::Cancelled));
}

#[tokio::test]
async fn otp_resolves_once_and_is_not_reused() {
    let fleet = Arc::new(FakeFleet::default());
    let fake = fleet.add("fw1", Script::default(), common::RUNNING_CONFIG);
    let inventory = common::inventory(&[]);
    let fw1 = DeviceIdentity::new("fw1", "fw1", "cisco_ios").with_credential_ref("otp");
    inventory.add_device(fw1.clone());
    let (pool, resolver) = pool_with(PoolConfig::default(), inventory, fleet);

    let with_otp = CredentialOverrides::none().with_otp("123456");
    let resolved = resolver.resolve(&fw1, &with_otp).await.expect("otp resolves");
    assert_eq!(resolved.source(), CredentialSource::Request);
    assert!(resolved.is_one_time());
    drop(resolved);

    let err = resolver
        .resolve(&fw1, &CredentialOverrides::none())
        .await
        .expect_err("no otp supplied");
    assert!(matches!(err, FleetError::CredentialMissing { .. }));

    let cancel = CancellationToken::new();
    let lease = pool
        .acquire(&fw1, &with_otp, Duration::from_secs(5), &cancel)
        .await
        .expect("lease with otp");
    lease.release().await;
    assert_eq!(pool.stats().idle_sessions, 0, "otp session must not go idle");
    assert_eq!(fake.passwords(), vec!["123456".to_string()]);

    let err = pool
        .acquire(&fw1, &CredentialOverrides::none(), Duration::from_secs(5), &cancel)
        .await
        .expect_err("second use needs a new otp");
    assert!(matches!(err, FleetError::CredentialMissing { .. }));
    assert!(with_otp.otp_spent(&fw1.id));
    let err = pool
        .acquire(&fw1, &with_otp, Duration::from_secs(5), &cancel)
        .await
        .expect_err("the same otp is not sent twice");
    assert!(matches!(err, FleetError::CredentialMissing { .. }));
    assert_eq!(fake.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn random_acquire_release_respects_caps() {
    const DEVICES: usize = 4;
    const PER_DEVICE: usize = 2;
    const TOTAL: usize = 3;

    let fleet = Arc::new(FakeFleet::default());
    let names: Vec<String> = (0..DEVICES).map(|i| format!("sw{i}")).collect();
    for name in &names {
        fleet.add(name, Script::default(), common::RUNNING_CONFIG);
    }
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let config = PoolConfig {
        max_sessions_per_device: PER_DEVICE,
        max_total_sessions: TOTAL,
        ..PoolConfig::default()
    };
    let (pool, _) = pool_with(config, common::inventory(&refs), fleet);

    let total = Arc::new(AtomicUsize::new(0));
    let total_peak = Arc::new(AtomicUsize::new(0));
    let per_device: Arc<Vec<AtomicUsize>> = Arc::new((0..DEVICES).map(|_| AtomicUsize::new(0)).collect());
    let per_device_peak = Arc::new(AtomicUsize::new(0));

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut tasks = Vec::new();
    for _ in 0..60 {
        let index = rng.gen_range(0..DEVICES);
        let hold = Duration::from_millis(rng.gen_range(1..40));
        let pool = pool.clone();
        let target = device(&names[index]);
        let total = Arc::clone(&total);
        let total_peak = Arc::clone(&total_peak);
        let per_device = Arc::clone(&per_device);
        let per_device_peak = Arc::clone(&per_device_peak);
        tasks.push(tokio::spawn(async move {
            let lease = pool
                .acquire(
                    &target,
                    &CredentialOverrides::none(),
                    Duration::from_secs(60),
                    &CancellationToken::new(),
                )
                .await
                .expect("lease within timeout");
            let now_total = total.fetch_add(1, Ordering::SeqCst) + 1;
            let now_device = per_device[index].fetch_add(1, Ordering::SeqCst) + 1;
            total_peak.fetch_max(now_total, Ordering::SeqCst);
            per_device_peak.fetch_max(now_device, Ordering::SeqCst);

            tokio::time::sleep(hold).await;

            per_device[index].fetch_sub(1, Ordering::SeqCst);
            total.fetch_sub(1, Ordering::SeqCst);
            lease.release().await;
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    assert!(total_peak.load(Ordering::SeqCst) <= TOTAL);
    assert!(per_device_peak.load(Ordering::SeqCst) <= PER_DEVICE);
    let stats = pool.stats();
    assert_eq!(stats.active_sessions, 0);
    assert!(stats.total_sessions <= TOTAL);
    assert_eq!(stats.requests, 60);
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use netfleet::batch::{BatchOptions, BatchStrategy, DeviceStatus, Operation};
use netfleet::credential::CredentialOverrides;
use netfleet::device::{DeviceId, DeviceIdentity};
use netfleet::error::{FleetError, TransportError};
use netfleet::parser::ParseTier;
use netfleet::service::{RequestOptions, Target};

use common::{FakeFleet, Script};

fn ids(names: &[&str]) -> Target {
    Target::Devices(names.iter().map(|n| DeviceId::new(*n)).collect())
}

fn fleet_of(names: &[&str]) -> Arc<FakeFleet> {
    let fleet = Arc::new(FakeFleet::default());
    for name in names {
        fleet.add(name, Script::default(), common::RUNNING_CONFIG);
    }
    fleet
}

#[tokio::test(start_paused = true)]
async fn continue_on_error_runs_every_device() {
    let names = ["d1", "d2", "d3", "d4", "d5"];
    let fleet = fleet_of(&names);
    fleet.device("d3").set_script(Script {
        connect_error: Some(TransportError::Timeout("no banner".to_string())),
        ..Script::default()
    });
    let engine = common::engine(common::inventory(&names), Arc::clone(&fleet));

    let options = RequestOptions::default()
        .with_strategy(BatchStrategy::ContinueOnError)
        .with_max_retries(3);
    let batch = engine
        .execute_command(&ids(&names), "show version", &options)
        .await
        .expect("batch");

    assert_eq!(batch.summary.total, 5);
    assert_eq!(batch.summary.succeeded, 4);
    assert_eq!(batch.summary.failed, 1);
    assert_eq!(batch.summary.completion_percent, 100.0);
    assert_eq!(batch.summary.error_kinds.get("timeout_error"), Some(&1));

    let d3 = batch.result(&DeviceId::new("d3")).expect("d3 result");
    assert_eq!(d3.status, DeviceStatus::Failed);
    assert_eq!(d3.attempts, 4);
    assert_eq!(fleet.device("d3").connect_count(), 4);
    for name in ["d1", "d2", "d4", "d5"] {
        let result = batch.result(&DeviceId::new(name)).expect("result");
        assert_eq!(result.status, DeviceStatus::Success, "{name}");
        assert_eq!(result.attempts, 1);
        assert!(result.output_of("show version").is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn fail_fast_skips_devices_after_first_failure() {
    let names = ["a1", "a2", "a3", "a4"];
    let fleet = fleet_of(&names);
    fleet.device("a2").set_script(Script {
        connect_error: Some(TransportError::Refused("port 22".to_string())),
        ..Script::default()
    });
    let engine = common::engine(common::inventory(&names), Arc::clone(&fleet));

    let options = RequestOptions::default()
        .with_strategy(BatchStrategy::FailFast)
        .with_max_retries(0);
    let batch = engine.ping(&ids(&names), &options).await.expect("batch");

    let statuses: Vec<DeviceStatus> = batch.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            DeviceStatus::Success,
            DeviceStatus::Failed,
            DeviceStatus::Cancelled,
            DeviceStatus::Cancelled,
        ]
    );
    assert_eq!(fleet.device("a3").connect_count(), 0);
    assert_eq!(fleet.device("a4").connect_count(), 0);
    assert_eq!(batch.summary.cancelled, 2);
}

#[tokio::test(start_paused = true)]
async fn command_output_is_parsed() {
    let fleet = fleet_of(&["sw1"]);
    let engine = common::engine(common::inventory(&["sw1"]), fleet);

    let batch = engine
        .execute_command(&Target::Region("lab".to_string()), "show interface brief", &RequestOptions::default())
        .await
        .expect("batch");
    let result = batch.result(&DeviceId::new("sw1")).expect("result");
    let output = result
        .outputs
        .iter()
        .find(|o| o.command == "show interface brief")
        .expect("output");
    let parsed = output.parsed.as_ref().expect("parsed");
    assert!(parsed.is_structured());
    assert_eq!(parsed.metadata.tier, ParseTier::Regex);
    assert_eq!(parsed.records.len(), 2);
    assert_eq!(parsed.records[0].get("interface").map(String::as_str), Some("Eth1/1"));
    assert_eq!(parsed.records[1].get("link").map(String::as_str), Some("down"));
}

#[tokio::test(start_paused = true)]
async fn rejected_command_does_not_stop_the_device() {
    let fleet = fleet_of(&["sw1"]);
    fleet.device("sw1").set_script(Script {
        rejected: vec!["show bogus".to_string()],
        ..Script::default()
    });
    let engine = common::engine(common::inventory(&["sw1"]), Arc::clone(&fleet));

    let commands = vec!["show bogus".to_string(), "show version".to_string()];
    let batch = engine
        .execute_commands(&ids(&["sw1"]), commands, &RequestOptions::default())
        .await
        .expect("batch");
    let result = batch.result(&DeviceId::new("sw1")).expect("result");
    assert_eq!(result.status, DeviceStatus::Failed);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.outputs.len(), 2);
    assert!(!result.outputs[0].is_ok());
    assert!(result.outputs[1].is_ok());
    assert_eq!(
        result.error.as_ref().map(|e| e.kind.as_str()),
        Some("command_execution_error")
    );
}

#[tokio::test(start_paused = true)]
async fn single_device_call_raises_missing_credential() {
    let fleet = fleet_of(&["fw1", "gone"]);
    fleet.device("gone").set_script(Script {
        connect_error: Some(TransportError::Unreachable("no route".to_string())),
        ..Script::default()
    });
    let inventory = common::inventory(&["gone"]);
    inventory.add_device(DeviceIdentity::new("fw1", "fw1", "cisco_ios").with_credential_ref("otp"));
    let engine = common::engine(inventory, fleet);
    let options = RequestOptions::default().with_max_retries(0);

    let err = engine
        .execute_command_on(&DeviceId::new("fw1"), "show version", &options)
        .await
        .expect_err("otp required");
    assert!(matches!(err, FleetError::CredentialMissing { .. }));

    let result = engine
        .execute_command_on(&DeviceId::new("gone"), "show version", &options)
        .await
        .expect("failure is reported in the result");
    assert_eq!(result.status, DeviceStatus::Failed);
    assert_eq!(result.error.as_ref().map(|e| e.kind.as_str()), Some("connection_error"));
}

#[tokio::test(start_paused = true)]
async fn otp_device_is_not_retried_after_login() {
    let fleet = fleet_of(&["fw1"]);
    let fake = fleet.device("fw1");
    fake.set_script(Script {
        latency: Duration::from_secs(30),
        ..Script::default()
    });
    let inventory = common::inventory(&[]);
    inventory.add_device(DeviceIdentity::new("fw1", "fw1", "cisco_ios").with_credential_ref("otp"));
    let engine = common::engine(inventory, fleet);
    let options = RequestOptions::default()
        .with_max_retries(3)
        .with_timeout_secs(1)
        .with_credentials(CredentialOverrides::none().with_otp("123456"));

    let result = engine
        .execute_command_on(&DeviceId::new("fw1"), "show version", &options)
        .await
        .expect("failure is reported in the result");
    assert_eq!(result.status, DeviceStatus::Failed);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.error.as_ref().map(|e| e.kind.as_str()), Some("timeout_error"));
    assert_eq!(fake.passwords(), vec!["123456".to_string()]);
    assert_eq!(fake.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_flag_device_unhealthy() {
    let fleet = fleet_of(&["ok", "flaky"]);
    fleet.device("flaky").set_script(Script {
        connect_error: Some(TransportError::Refused("closed".to_string())),
        ..Script::default()
    });
    let engine = common::engine(common::inventory(&["ok", "flaky"]), Arc::clone(&fleet));
    let options = RequestOptions::default().with_max_retries(0);
    let target = ids(&["ok", "flaky"]);

    let first = engine.ping(&target, &options).await.expect("batch");
    assert!(first.summary.unhealthy_devices.is_empty());
    engine.ping(&target, &options).await.expect("batch");
    let third = engine.ping(&target, &options).await.expect("batch");

    assert_eq!(third.summary.unhealthy_devices, vec![DeviceId::new("flaky")]);
    assert_eq!(fleet.device("flaky").connect_count(), 3, "unhealthy devices still run");
    let stats = engine.connection_stats();
    assert_eq!(stats.unhealthy_devices.len(), 1);
    assert_eq!(stats.unhealthy_devices[0].consecutive_failures, 3);
}

#[tokio::test(start_paused = true)]
async fn spawned_batch_publishes_progress() {
    let names = ["p1", "p2", "p3"];
    let fleet = fleet_of(&names);
    let inventory = common::inventory(&names);
    let engine = common::engine(inventory, fleet);
    let devices = engine
        .resolve_targets(&Target::Region("lab".to_string()))
        .await
        .expect("targets");
    assert_eq!(devices.len(), 3);

    let executor = engine.executor();
    let handle = executor.spawn(
        devices,
        Operation::HealthCheck,
        BatchOptions::from_config(executor.config()).with_strategy(BatchStrategy::Sequential),
    );
    let progress = handle.progress();
    let batch = handle.join().await.expect("batch");

    let last = progress.borrow().clone();
    assert!(last.finished);
    assert_eq!(last.succeeded, 3);
    assert_eq!(last.pending, 0);
    assert_eq!(batch.summary.success_rate, 100.0);
    let result = &batch.results[0];
    assert_eq!(result.outputs.len(), 2);
    assert!(result.output_of("show version").is_some());
}

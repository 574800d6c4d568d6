#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netfleet::change::ConfigModel;
use netfleet::config::EngineConfig;
use netfleet::credential::{Cipher, ResolvedCredential, Secret};
use netfleet::device::{CredentialRecord, DeviceIdentity, StaticInventory};
use netfleet::error::{FleetError, TransportError};
use netfleet::parser::HybridParser;
use netfleet::service::NetworkAutomation;
use netfleet::templates::{self, NegationStyle, PlatformProfile};
use netfleet::transport::{TransportDriver, TransportHandle};

pub const RUNNING_CONFIG: &str = "\
Building configuration...

Current configuration : 512 bytes
!
hostname edge
!
interface GigabitEthernet0/1
 description uplink
 ip address 10.0.0.1 255.255.255.0
!
snmp-server community public RO
ip route 0.0.0.0 0.0.0.0 10.0.0.254
end
";

pub const INTERFACE_BRIEF: &str = "\
Interface   Link   Protocol Description
Eth1/1      up     up       uplink
Eth1/2      down   down
";

/// Values starting with `enc:` are ciphertext; anything else is legacy
/// plaintext.
pub struct PrefixCipher;

impl Cipher for PrefixCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, FleetError> {
        Ok(format!("enc:{plaintext}"))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Secret, FleetError> {
        ciphertext
            .strip_prefix("enc:")
            .map(Secret::new)
            .ok_or_else(|| FleetError::Internal("not ciphertext".to_string()))
    }

    fn is_ciphertext(&self, value: &str) -> bool {
        value.starts_with("enc:")
    }
}

/// How one fake device behaves.
#[derive(Clone, Default)]
pub struct Script {
    /// Every connect attempt fails with this error.
    pub connect_error: Option<TransportError>,
    /// Configuration lines the device refuses.
    pub rejected: Vec<String>,
    /// Time each command takes.
    pub latency: Duration,
}

/// A device keeping its running configuration in memory and speaking the
/// CLI dialect of the platform it is connected as.
pub struct FakeDevice {
    script: Mutex<Script>,
    running: Mutex<String>,
    pub connects: AtomicUsize,
    pub open: AtomicUsize,
    sent: Mutex<Vec<String>>,
    passwords: Mutex<Vec<String>>,
}

impl FakeDevice {
    fn new(script: Script, running: &str) -> Self {
        Self {
            script: Mutex::new(script),
            running: Mutex::new(running.to_string()),
            connects: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            passwords: Mutex::new(Vec::new()),
        }
    }

    pub fn running_config(&self) -> String {
        self.running.lock().expect("running").clone()
    }

    pub fn set_running_config(&self, config: &str) {
        *self.running.lock().expect("running") = config.to_string();
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().expect("script") = script;
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent").clone()
    }

    pub fn passwords(&self) -> Vec<String> {
        self.passwords.lock().expect("passwords").clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Routes connections by host to scripted devices.
#[derive(Default)]
pub struct FakeFleet {
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
}

impl FakeFleet {
    pub fn add(&self, host: &str, script: Script, running: &str) -> Arc<FakeDevice> {
        let device = Arc::new(FakeDevice::new(script, running));
        self.devices
            .lock()
            .expect("devices")
            .insert(host.to_string(), Arc::clone(&device));
        device
    }

    pub fn device(&self, host: &str) -> Arc<FakeDevice> {
        Arc::clone(self.devices.lock().expect("devices").get(host).expect("known host"))
    }
}

#[async_trait]
impl TransportDriver for FakeFleet {
    async fn connect(
        &self,
        device: &DeviceIdentity,
        credential: &ResolvedCredential,
        _timeout: Duration,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let fake = self
            .devices
            .lock()
            .expect("devices")
            .get(&device.host)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(device.host.clone()))?;
        fake.connects.fetch_add(1, Ordering::SeqCst);
        let script = fake.script.lock().expect("script").clone();
        if let Some(err) = script.connect_error {
            return Err(err);
        }
        fake.passwords
            .lock()
            .expect("passwords")
            .push(credential.password().expose().to_string());
        fake.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeHandle {
            device: fake,
            platform: device.platform.clone(),
            config: None,
            closed: false,
        }))
    }
}

/// Headers that open a nested section on section-based dialects.
const SECTION_OPENERS: &[&str] = &[
    "interface ",
    "router ",
    "vlan ",
    "ip access-list ",
    "line ",
    "ospf ",
    "bgp ",
    "acl ",
    "user-interface ",
];

/// Config-mode line handling of the fake CLI.
pub struct ConfigMode {
    profile: &'static PlatformProfile,
    section: Option<String>,
}

impl ConfigMode {
    pub fn new(platform: &str) -> Self {
        Self {
            profile: templates::profile_for(platform),
            section: None,
        }
    }

    pub fn apply(&mut self, model: &mut ConfigModel, line: &str) {
        let profile = self.profile;
        if profile.section_exit == Some(line) {
            self.section = None;
            return;
        }
        if profile.commit_command == Some(line) {
            return;
        }
        let negation = match profile.negation {
            NegationStyle::SetDelete => {
                match line.strip_prefix("delete ") {
                    // deleting a statement path deletes everything below it
                    Some(path) => {
                        let path: Vec<&str> = path.split_whitespace().collect();
                        model.remove_where(|stored| {
                            let words: Vec<&str> = stored.split_whitespace().collect();
                            let body = match words.first() {
                                Some(&("set" | "protect" | "deactivate")) => &words[1..],
                                _ => &words[..],
                            };
                            body.starts_with(&path)
                        });
                    }
                    None => model.insert(None, line),
                }
                return;
            }
            NegationStyle::NoPrefix => "no ",
            NegationStyle::UndoPrefix => "undo ",
        };
        if let Some(negated) = line.strip_prefix(negation) {
            model.remove(self.section.as_deref(), negated);
        } else if SECTION_OPENERS.iter().any(|p| line.starts_with(p)) {
            model.insert(None, line);
            self.section = Some(line.to_string());
        } else {
            model.insert(self.section.as_deref(), line);
        }
    }
}

/// Replays config-mode lines against `running` the way a fake device would.
pub fn apply_commands(platform: &str, running: &str, commands: &[String]) -> String {
    let mut mode = ConfigMode::new(platform);
    let mut model = ConfigModel::parse(running, templates::profile_for(platform));
    for command in commands {
        mode.apply(&mut model, command.trim());
    }
    model.render()
}

fn version_banner(profile: &PlatformProfile) -> &'static str {
    match profile.key {
        "huawei" => "Huawei Versatile Routing Platform Software\nVRP (R) software, Version 8.180",
        "juniper" => "Hostname: r1\nModel: mx204\nJunos: 21.4R3-S5",
        _ => "Cisco IOS Software, Version 15.2(4)M",
    }
}

pub struct FakeHandle {
    device: Arc<FakeDevice>,
    platform: String,
    config: Option<ConfigMode>,
    closed: bool,
}

impl FakeHandle {
    fn configure(&mut self, line: &str) {
        let profile = templates::profile_for(&self.platform);
        let mut running = self.device.running.lock().expect("running");
        let mut model = ConfigModel::parse(&running, profile);
        if let Some(mode) = self.config.as_mut() {
            mode.apply(&mut model, line);
        }
        *running = model.render();
    }
}

#[async_trait]
impl TransportHandle for FakeHandle {
    async fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        let script = self.device.script.lock().expect("script").clone();
        if !script.latency.is_zero() {
            if script.latency > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout(String::new()));
            }
            tokio::time::sleep(script.latency).await;
        }
        self.device
            .sent
            .lock()
            .expect("sent")
            .push(command.to_string());
        let line = command.trim();
        if script.rejected.iter().any(|r| r == line) {
            return Err(TransportError::Rejected(format!(
                "% Invalid input detected at '^' marker: {line}"
            )));
        }
        let profile = templates::profile_for(&self.platform);
        match line {
            "" => Ok(String::new()),
            l if l == profile.config_command => Ok(self.device.running_config()),
            l if l == profile.version_command => Ok(version_banner(profile).to_string()),
            "show interface brief" => Ok(INTERFACE_BRIEF.to_string()),
            l if l == profile.enter_config => {
                self.config = Some(ConfigMode::new(&self.platform));
                Ok(String::new())
            }
            l if self.config.is_some() && l == profile.exit_config => {
                self.config = None;
                Ok(String::new())
            }
            _ if self.config.is_some() => {
                self.configure(line);
                Ok(String::new())
            }
            other => Ok(format!("output of {other}")),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.device.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.device.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub fn static_record() -> CredentialRecord {
    CredentialRecord {
        username: Some("admin".to_string()),
        password_encrypted: Some("enc:secret".to_string()),
        enable_password_encrypted: None,
        uses_dynamic_password: false,
    }
}

pub fn otp_record() -> CredentialRecord {
    CredentialRecord {
        username: Some("ops".to_string()),
        password_encrypted: Some(String::new()),
        enable_password_encrypted: None,
        uses_dynamic_password: true,
    }
}

/// Inventory with one `cisco_ios` device per name, host equal to the name
/// and the shared static credential record.
pub fn inventory(names: &[&str]) -> StaticInventory {
    let inventory = StaticInventory::new();
    inventory.add_credential("static", static_record());
    inventory.add_credential("otp", otp_record());
    for name in names {
        inventory.add_device(
            DeviceIdentity::new(*name, *name, "cisco_ios")
                .with_region("lab")
                .with_credential_ref("static"),
        );
    }
    inventory
}

/// Engine config with short backoff so paused-clock tests stay readable.
pub fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.executor.backoff_base_ms = 100;
    config.executor.backoff_max_ms = 1_000;
    config.executor.acquire_timeout_secs = 5;
    config
}

pub fn engine(inventory: StaticInventory, fleet: Arc<FakeFleet>) -> NetworkAutomation {
    NetworkAutomation::new(
        engine_config(),
        Arc::new(inventory),
        Arc::new(PrefixCipher),
        fleet,
        Arc::new(HybridParser::new()),
    )
    .expect("valid engine config")
}

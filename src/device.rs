//! Device identities and the read-only inventory seam.
//!
//! The engine never owns inventory data. It looks devices, stored credential
//! records and region/group defaults up through [`InventoryStore`] and keeps
//! only the [`DeviceId`] around while an operation runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Stable identifier of a device in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What the engine needs to know to reach a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    /// Hostname as known to operators.
    pub name: String,
    /// Management address.
    pub host: String,
    pub port: u16,
    /// Platform tag, e.g. `cisco_ios` or `huawei_vrp`.
    pub platform: String,
    pub region: Option<String>,
    pub group: Option<String>,
    /// Key of the stored credential record, if any.
    pub credential_ref: Option<String>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<DeviceId>, host: impl Into<String>, platform: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            host: host.into(),
            port: 22,
            platform: platform.into(),
            region: None,
            group: None,
            credential_ref: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_credential_ref(mut self, credential_ref: impl Into<String>) -> Self {
        self.credential_ref = Some(credential_ref.into());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Stored secrets for one device. Values are ciphertext as written by the
/// encryption primitive; legacy rows may still hold plaintext.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CredentialRecord {
    pub username: Option<String>,
    pub password_encrypted: Option<String>,
    pub enable_password_encrypted: Option<String>,
    /// The device authenticates with one-time passwords supplied per request.
    pub uses_dynamic_password: bool,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("username", &self.username)
            .field("has_password", &self.password_encrypted.is_some())
            .field("has_enable_password", &self.enable_password_encrypted.is_some())
            .field("uses_dynamic_password", &self.uses_dynamic_password)
            .finish()
    }
}

/// Region or group level fallbacks.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ScopeDefaults {
    pub username: Option<String>,
    pub enable_password_encrypted: Option<String>,
}

impl fmt::Debug for ScopeDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeDefaults")
            .field("username", &self.username)
            .field("has_enable_password", &self.enable_password_encrypted.is_some())
            .finish()
    }
}

/// Read-only lookups against the external inventory.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn device(&self, id: &DeviceId) -> Result<DeviceIdentity, FleetError>;

    /// Stored credential record referenced by the device, if any.
    async fn credential_record(
        &self,
        device: &DeviceIdentity,
    ) -> Result<Option<CredentialRecord>, FleetError>;

    /// Region/group defaults applying to the device. Group wins over region.
    async fn scope_defaults(&self, device: &DeviceIdentity) -> Result<ScopeDefaults, FleetError>;

    async fn devices_in_region(&self, region: &str) -> Result<Vec<DeviceId>, FleetError>;

    async fn devices_in_group(&self, group: &str) -> Result<Vec<DeviceId>, FleetError>;

    /// Template text for a template id, specialised for one platform.
    async fn config_template(
        &self,
        template_id: &str,
        platform: &str,
    ) -> Result<Option<String>, FleetError>;
}

#[derive(Default)]
struct InventoryData {
    devices: Vec<DeviceIdentity>,
    credentials: HashMap<String, CredentialRecord>,
    regions: HashMap<String, ScopeDefaults>,
    groups: HashMap<String, ScopeDefaults>,
    templates: HashMap<(String, String), String>,
}

/// In-process inventory for embedding hosts and tests.
///
/// Devices keep insertion order so region and group expansion is
/// deterministic.
#[derive(Clone, Default)]
pub struct StaticInventory {
    data: Arc<RwLock<InventoryData>>,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: DeviceIdentity) {
        if let Ok(mut data) = self.data.write() {
            data.devices.retain(|d| d.id != device.id);
            data.devices.push(device);
        }
    }

    pub fn add_credential(&self, key: impl Into<String>, record: CredentialRecord) {
        if let Ok(mut data) = self.data.write() {
            data.credentials.insert(key.into(), record);
        }
    }

    pub fn set_region_defaults(&self, region: impl Into<String>, defaults: ScopeDefaults) {
        if let Ok(mut data) = self.data.write() {
            data.regions.insert(region.into(), defaults);
        }
    }

    pub fn set_group_defaults(&self, group: impl Into<String>, defaults: ScopeDefaults) {
        if let Ok(mut data) = self.data.write() {
            data.groups.insert(group.into(), defaults);
        }
    }

    pub fn add_template(
        &self,
        template_id: impl Into<String>,
        platform: impl Into<String>,
        text: impl Into<String>,
    ) {
        if let Ok(mut data) = self.data.write() {
            data.templates
                .insert((template_id.into(), platform.into()), text.into());
        }
    }

    fn read<T>(&self, f: impl FnOnce(&InventoryData) -> T) -> Result<T, FleetError> {
        self.data
            .read()
            .map(|data| f(&data))
            .map_err(|_| FleetError::Inventory("inventory lock poisoned".to_string()))
    }
}

#[async_trait]
impl InventoryStore for StaticInventory {
    async fn device(&self, id: &DeviceId) -> Result<DeviceIdentity, FleetError> {
        self.read(|data| data.devices.iter().find(|d| &d.id == id).cloned())?
            .ok_or_else(|| FleetError::DeviceNotFound(id.to_string()))
    }

    async fn credential_record(
        &self,
        device: &DeviceIdentity,
    ) -> Result<Option<CredentialRecord>, FleetError> {
        let Some(key) = device.credential_ref.as_ref() else {
            return Ok(None);
        };
        self.read(|data| data.credentials.get(key).cloned())
    }

    async fn scope_defaults(&self, device: &DeviceIdentity) -> Result<ScopeDefaults, FleetError> {
        self.read(|data| {
            let region = device
                .region
                .as_ref()
                .and_then(|r| data.regions.get(r))
                .cloned()
                .unwrap_or_default();
            let group = device
                .group
                .as_ref()
                .and_then(|g| data.groups.get(g))
                .cloned()
                .unwrap_or_default();
            ScopeDefaults {
                username: group.username.or(region.username),
                enable_password_encrypted: group
                    .enable_password_encrypted
                    .or(region.enable_password_encrypted),
            }
        })
    }

    async fn devices_in_region(&self, region: &str) -> Result<Vec<DeviceId>, FleetError> {
        self.read(|data| {
            data.devices
                .iter()
                .filter(|d| d.region.as_deref() == Some(region))
                .map(|d| d.id.clone())
                .collect()
        })
    }

    async fn devices_in_group(&self, group: &str) -> Result<Vec<DeviceId>, FleetError> {
        self.read(|data| {
            data.devices
                .iter()
                .filter(|d| d.group.as_deref() == Some(group))
                .map(|d| d.id.clone())
                .collect()
        })
    }

    async fn config_template(
        &self,
        template_id: &str,
        platform: &str,
    ) -> Result<Option<String>, FleetError> {
        self.read(|data| {
            data.templates
                .get(&(template_id.to_string(), platform.to_string()))
                .cloned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn group_defaults_override_region_defaults() {
        let inventory = StaticInventory::new();
        inventory.add_device(
            DeviceIdentity::new("sw1", "10.0.0.1", "huawei_vrp")
                .with_region("east")
                .with_group("core"),
        );
        inventory.set_region_defaults(
            "east",
            ScopeDefaults {
                username: Some("region-user".to_string()),
                enable_password_encrypted: Some("region-enable".to_string()),
            },
        );
        inventory.set_group_defaults(
            "core",
            ScopeDefaults {
                username: Some("group-user".to_string()),
                enable_password_encrypted: None,
            },
        );

        let device = inventory.device(&"sw1".into()).await.expect("device exists");
        let defaults = inventory
            .scope_defaults(&device)
            .await
            .expect("defaults lookup");
        assert_eq!(defaults.username.as_deref(), Some("group-user"));
        assert_eq!(
            defaults.enable_password_encrypted.as_deref(),
            Some("region-enable")
        );
    }

    #[tokio::test]
    async fn unknown_device_is_reported() {
        let inventory = StaticInventory::new();
        let err = inventory
            .device(&"missing".into())
            .await
            .expect_err("lookup must fail");
        assert!(matches!(err, FleetError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn region_expansion_keeps_insertion_order() {
        let inventory = StaticInventory::new();
        for name in ["a", "b", "c"] {
            inventory.add_device(DeviceIdentity::new(name, "10.0.0.1", "cisco_ios").with_region("west"));
        }
        inventory.add_device(DeviceIdentity::new("d", "10.0.0.2", "cisco_ios").with_region("east"));

        let ids = inventory.devices_in_region("west").await.expect("expansion");
        let names: Vec<_> = ids.iter().map(DeviceId::as_str).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn credential_record_debug_hides_secrets() {
        let record = CredentialRecord {
            username: Some("admin".to_string()),
            password_encrypted: Some("s3cret".to_string()),
            enable_password_encrypted: None,
            uses_dynamic_password: false,
        };
        let rendered = format!("{record:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("has_password: true"));
    }
}

//! Credential resolution.
//!
//! Decides which username, password and enable password are used for one
//! operation against one device. Secrets are decrypted at the moment of use,
//! held in [`Secret`] buffers that are zeroed on drop, and never cached across
//! calls.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::device::{DeviceId, DeviceIdentity, InventoryStore};
use crate::error::FleetError;

/// A string secret that zeroes its buffer when dropped.
#[derive(Clone, Default, ZeroizeOnDrop)]
pub struct Secret {
    inner: String,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// Borrow the plaintext. Do not copy it into long-lived storage.
    pub fn expose(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret::new(value)
    }
}

/// The external encryption primitive. Key material and rotation live with
/// the implementation.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, FleetError>;

    fn decrypt(&self, ciphertext: &str) -> Result<Secret, FleetError>;

    /// Whether `value` looks like output of [`Cipher::encrypt`]. Stored values
    /// failing this check are treated as legacy plaintext.
    fn is_ciphertext(&self, value: &str) -> bool;
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Request,
    Stored,
    Default,
}

/// Per-request credential material supplied by the caller.
///
/// `otp` and `password` are both request-level password sources; `otp` wins
/// when both are set.
///
/// Clones share one ledger of devices a one-time request password has been
/// sent to. A spent value is skipped on the next resolve for that device.
#[derive(Clone, Default)]
pub struct CredentialOverrides {
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub otp: Option<Secret>,
    pub enable_password: Option<Secret>,
    spent: Arc<Mutex<HashSet<DeviceId>>>,
}

impl CredentialOverrides {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<Secret>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets a fresh one-time password; devices it was spent on are forgotten.
    pub fn with_otp(mut self, otp: impl Into<Secret>) -> Self {
        self.otp = Some(otp.into());
        self.spent = Arc::default();
        self
    }

    pub fn with_enable_password(mut self, enable: impl Into<Secret>) -> Self {
        self.enable_password = Some(enable.into());
        self
    }

    fn request_password(&self) -> Option<&Secret> {
        self.request_otp()
            .or_else(|| self.password.as_ref().filter(|s| !s.is_empty()))
    }

    fn request_otp(&self) -> Option<&Secret> {
        self.otp.as_ref().filter(|s| !s.is_empty())
    }

    /// Whether the one-time request password already logged in to `device`.
    pub fn otp_spent(&self, device: &DeviceId) -> bool {
        self.spent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device)
    }

    /// Records that the one-time request password was sent to `device`.
    pub fn spend_otp(&self, device: &DeviceId) {
        self.spent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.clone());
    }
}

impl fmt::Debug for CredentialOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialOverrides")
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .field("has_otp", &self.otp.is_some())
            .field("has_enable_password", &self.enable_password.is_some())
            .finish_non_exhaustive()
    }
}

/// Credential material for exactly one operation.
///
/// Not `Clone` and not serializable; dropping it zeroes every secret.
pub struct ResolvedCredential {
    device: DeviceId,
    username: String,
    password: Secret,
    enable_password: Option<Secret>,
    source: CredentialSource,
    username_source: CredentialSource,
    one_time: bool,
    fallback: bool,
}

impl ResolvedCredential {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &Secret {
        &self.password
    }

    pub fn enable_password(&self) -> Option<&Secret> {
        self.enable_password.as_ref()
    }

    /// Source of the password.
    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn username_source(&self) -> CredentialSource {
        self.username_source
    }

    /// The password is a one-time value and must not serve a second operation.
    pub fn is_one_time(&self) -> bool {
        self.one_time
    }

    /// A request password was used while a stored one also exists, so a
    /// failed login may be retried without the override.
    pub fn has_fallback(&self) -> bool {
        self.fallback
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("device", &self.device)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("has_enable_password", &self.enable_password.is_some())
            .field("source", &self.source)
            .field("one_time", &self.one_time)
            .finish()
    }
}

/// Which fields a caller must supply for a device, computed without
/// decrypting anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CredentialRequirements {
    pub requires_username: bool,
    pub requires_password: bool,
    pub requires_enable_password: bool,
    pub is_dynamic: bool,
}

/// Resolves credentials from request overrides, stored records and
/// region/group defaults, in that order.
#[derive(Clone)]
pub struct CredentialResolver {
    inventory: Arc<dyn InventoryStore>,
    cipher: Arc<dyn Cipher>,
}

impl CredentialResolver {
    pub fn new(inventory: Arc<dyn InventoryStore>, cipher: Arc<dyn Cipher>) -> Self {
        Self { inventory, cipher }
    }

    /// Resolve by device id.
    pub async fn resolve_id(
        &self,
        id: &DeviceId,
        overrides: &CredentialOverrides,
    ) -> Result<ResolvedCredential, FleetError> {
        let device = self.inventory.device(id).await?;
        self.resolve(&device, overrides).await
    }

    pub async fn resolve(
        &self,
        device: &DeviceIdentity,
        overrides: &CredentialOverrides,
    ) -> Result<ResolvedCredential, FleetError> {
        let record = self
            .inventory
            .credential_record(device)
            .await?
            .unwrap_or_default();
        let defaults = self.inventory.scope_defaults(device).await?;
        let dynamic = record.uses_dynamic_password;

        let (username, username_source) = if let Some(user) =
            overrides.username.as_ref().filter(|u| !u.is_empty())
        {
            (user.clone(), CredentialSource::Request)
        } else if let Some(user) = record
            .username
            .as_ref()
            .filter(|u| !dynamic && !u.is_empty())
        {
            (user.clone(), CredentialSource::Stored)
        } else if let Some(user) = defaults.username.as_ref().filter(|u| !u.is_empty()) {
            (user.clone(), CredentialSource::Default)
        } else {
            return Err(FleetError::CredentialMissing {
                device: device.id.to_string(),
                reason: "no username supplied, stored or defaulted".to_string(),
            });
        };

        let spent = overrides.otp_spent(&device.id);
        let request = overrides.request_password().filter(|_| !spent);
        let (password, source) = if let Some(secret) = request {
            (secret.clone(), CredentialSource::Request)
        } else if let Some(stored) = record
            .password_encrypted
            .as_deref()
            .filter(|v| !dynamic && !v.is_empty())
            .and_then(|v| self.open_stored(device, "password", v))
        {
            (stored, CredentialSource::Stored)
        } else if dynamic && spent {
            return Err(FleetError::CredentialMissing {
                device: device.id.to_string(),
                reason: "one-time password already used; a new one is required".to_string(),
            });
        } else if dynamic {
            return Err(FleetError::CredentialMissing {
                device: device.id.to_string(),
                reason: "device uses dynamic passwords; a one-time password is required"
                    .to_string(),
            });
        } else {
            return Err(FleetError::CredentialMissing {
                device: device.id.to_string(),
                reason: "no password supplied or stored".to_string(),
            });
        };

        let enable_password = if let Some(secret) =
            overrides.enable_password.as_ref().filter(|s| !s.is_empty())
        {
            Some(secret.clone())
        } else if let Some(stored) = record
            .enable_password_encrypted
            .as_deref()
            .filter(|v| !v.is_empty())
            .and_then(|v| self.open_stored(device, "enable password", v))
        {
            Some(stored)
        } else {
            defaults
                .enable_password_encrypted
                .as_deref()
                .filter(|v| !v.is_empty())
                .and_then(|v| self.open_stored(device, "default enable password", v))
        };

        let from_otp = source == CredentialSource::Request && overrides.request_otp().is_some();
        let fallback = source == CredentialSource::Request
            && !dynamic
            && record
                .password_encrypted
                .as_deref()
                .is_some_and(|v| !v.is_empty());

        info!(
            "resolved credentials for {} (user: {}, source: {:?})",
            device.id, username, source
        );

        Ok(ResolvedCredential {
            device: device.id.clone(),
            username,
            password,
            enable_password,
            source,
            username_source,
            one_time: dynamic || from_otp,
            fallback,
        })
    }

    /// Reports what a caller has to supply for `device`.
    pub async fn requirements(
        &self,
        device: &DeviceIdentity,
    ) -> Result<CredentialRequirements, FleetError> {
        let record = self
            .inventory
            .credential_record(device)
            .await?
            .unwrap_or_default();
        let defaults = self.inventory.scope_defaults(device).await?;
        let dynamic = record.uses_dynamic_password;
        let has_username = (!dynamic && record.username.as_deref().is_some_and(|u| !u.is_empty()))
            || defaults.username.as_deref().is_some_and(|u| !u.is_empty());
        let has_password = record
            .password_encrypted
            .as_deref()
            .is_some_and(|p| !p.is_empty());
        Ok(CredentialRequirements {
            requires_username: !has_username,
            requires_password: dynamic || !has_password,
            requires_enable_password: false,
            is_dynamic: dynamic,
        })
    }

    fn open_stored(&self, device: &DeviceIdentity, what: &str, value: &str) -> Option<Secret> {
        if !self.cipher.is_ciphertext(value) {
            warn!(
                "stored {} for {} is not encrypted; re-save it to encrypt",
                what, device.id
            );
            return Some(Secret::new(value));
        }
        match self.cipher.decrypt(value) {
            Ok(secret) if !secret.is_empty() => {
                debug!("using stored {} for {}", what, device.id);
                Some(secret)
            }
            Ok(_) => None,
            Err(err) => {
                warn!("failed to decrypt stored {} for {}: {}", what, device.id, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CredentialRecord, ScopeDefaults, StaticInventory};

    struct PrefixCipher;

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

    fn resolver(record: CredentialRecord, defaults: ScopeDefaults) -> (CredentialResolver, DeviceIdentity) {
        let inventory = StaticInventory::new();
        let device = DeviceIdentity::new("r1", "10.0.0.1", "cisco_ios")
            .with_region("east")
            .with_credential_ref("r1-cred");
        inventory.add_device(device.clone());
        inventory.add_credential("r1-cred", record);
        inventory.set_region_defaults("east", defaults);
        (
            CredentialResolver::new(Arc::new(inventory), Arc::new(PrefixCipher)),
            device,
        )
    }

    #[tokio::test]
    async fn stored_credentials_are_decrypted() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: Some("admin".to_string()),
                password_encrypted: Some("enc:hunter2".to_string()),
                enable_password_encrypted: Some("enc:en4ble".to_string()),
                uses_dynamic_password: false,
            },
            ScopeDefaults::default(),
        );
        let cred = resolver
            .resolve(&device, &CredentialOverrides::none())
            .await
            .expect("stored credential should resolve");
        assert_eq!(cred.username(), "admin");
        assert_eq!(cred.password().expose(), "hunter2");
        assert_eq!(cred.enable_password().map(Secret::expose), Some("en4ble"));
        assert_eq!(cred.source(), CredentialSource::Stored);
        assert!(!cred.is_one_time());
    }

    #[tokio::test]
    async fn request_overrides_win() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: Some("admin".to_string()),
                password_encrypted: Some("enc:hunter2".to_string()),
                enable_password_encrypted: None,
                uses_dynamic_password: false,
            },
            ScopeDefaults::default(),
        );
        let overrides = CredentialOverrides::none()
            .with_username("operator")
            .with_password("override");
        let cred = resolver
            .resolve(&device, &overrides)
            .await
            .expect("override should resolve");
        assert_eq!(cred.username(), "operator");
        assert_eq!(cred.password().expose(), "override");
        assert_eq!(cred.source(), CredentialSource::Request);
        assert_eq!(cred.username_source(), CredentialSource::Request);
        assert!(cred.has_fallback());
    }

    #[tokio::test]
    async fn dynamic_device_without_otp_is_missing_credentials() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: None,
                password_encrypted: None,
                enable_password_encrypted: None,
                uses_dynamic_password: true,
            },
            ScopeDefaults {
                username: Some("netops".to_string()),
                enable_password_encrypted: None,
            },
        );
        let err = resolver
            .resolve(&device, &CredentialOverrides::none())
            .await
            .expect_err("dynamic device needs an otp");
        assert!(matches!(err, FleetError::CredentialMissing { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn dynamic_device_ignores_stored_username_and_password() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: Some("stale".to_string()),
                password_encrypted: Some("enc:stale".to_string()),
                enable_password_encrypted: None,
                uses_dynamic_password: true,
            },
            ScopeDefaults {
                username: Some("netops".to_string()),
                enable_password_encrypted: Some("enc:region-enable".to_string()),
            },
        );
        let cred = resolver
            .resolve(&device, &CredentialOverrides::none().with_otp("123456"))
            .await
            .expect("otp should resolve");
        assert_eq!(cred.username(), "netops");
        assert_eq!(cred.username_source(), CredentialSource::Default);
        assert_eq!(cred.password().expose(), "123456");
        assert_eq!(cred.enable_password().map(Secret::expose), Some("region-enable"));
        assert!(cred.is_one_time());
    }

    #[tokio::test]
    async fn spent_otp_is_not_offered_again() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: None,
                password_encrypted: None,
                enable_password_encrypted: None,
                uses_dynamic_password: true,
            },
            ScopeDefaults {
                username: Some("netops".to_string()),
                enable_password_encrypted: None,
            },
        );
        let overrides = CredentialOverrides::none().with_otp("123456");
        let shared = overrides.clone();
        resolver.resolve(&device, &overrides).await.expect("fresh otp");
        overrides.spend_otp(&device.id);

        assert!(shared.otp_spent(&device.id));
        let err = resolver
            .resolve(&device, &shared)
            .await
            .expect_err("spent otp");
        assert!(matches!(
            err,
            FleetError::CredentialMissing { ref reason, .. } if reason.contains("already used")
        ));

        let renewed = shared.with_otp("654321");
        let cred = resolver.resolve(&device, &renewed).await.expect("new otp");
        assert_eq!(cred.password().expose(), "654321");
    }

    #[tokio::test]
    async fn otp_override_is_one_time_on_static_devices() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: Some("admin".to_string()),
                password_encrypted: Some("enc:hunter2".to_string()),
                enable_password_encrypted: None,
                uses_dynamic_password: false,
            },
            ScopeDefaults::default(),
        );
        let overrides = CredentialOverrides::none().with_otp("123456");
        let cred = resolver.resolve(&device, &overrides).await.expect("otp");
        assert!(cred.is_one_time());
        assert_eq!(cred.source(), CredentialSource::Request);

        overrides.spend_otp(&device.id);
        let cred = resolver.resolve(&device, &overrides).await.expect("stored");
        assert_eq!(cred.password().expose(), "hunter2");
        assert_eq!(cred.source(), CredentialSource::Stored);
        assert!(!cred.is_one_time());
    }

    #[tokio::test]
    async fn legacy_plaintext_is_accepted() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: Some("admin".to_string()),
                password_encrypted: Some("plain-old".to_string()),
                enable_password_encrypted: None,
                uses_dynamic_password: false,
            },
            ScopeDefaults::default(),
        );
        let cred = resolver
            .resolve(&device, &CredentialOverrides::none())
            .await
            .expect("legacy plaintext should resolve");
        assert_eq!(cred.password().expose(), "plain-old");
    }

    #[tokio::test]
    async fn empty_override_does_not_mask_missing_password() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: Some("admin".to_string()),
                password_encrypted: None,
                enable_password_encrypted: None,
                uses_dynamic_password: false,
            },
            ScopeDefaults::default(),
        );
        let err = resolver
            .resolve(&device, &CredentialOverrides::none().with_password(""))
            .await
            .expect_err("empty password must not resolve");
        assert!(matches!(err, FleetError::CredentialMissing { .. }));
    }

    #[tokio::test]
    async fn requirements_reflect_dynamic_flag() {
        let (resolver, device) = resolver(
            CredentialRecord {
                username: None,
                password_encrypted: None,
                enable_password_encrypted: None,
                uses_dynamic_password: true,
            },
            ScopeDefaults {
                username: Some("netops".to_string()),
                enable_password_encrypted: None,
            },
        );
        let req = resolver.requirements(&device).await.expect("requirements");
        assert!(!req.requires_username);
        assert!(req.requires_password);
        assert!(req.is_dynamic);
    }

    #[test]
    fn debug_output_is_redacted() {
        let cred = ResolvedCredential {
            device: DeviceId::new("r1"),
            username: "admin".to_string(),
            password: Secret::new("hunter2"),
            enable_password: Some(Secret::new("en4ble")),
            source: CredentialSource::Request,
            username_source: CredentialSource::Request,
            one_time: true,
            fallback: false,
        };
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("en4ble"));
        let overrides = CredentialOverrides::none().with_otp("123456");
        assert!(!format!("{overrides:?}").contains("123456"));
    }
}

use super::*;

/// SSH algorithm policy applied to every device the driver connects to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    #[default]
    Secure,
    /// Adds SHA-1 exchange and CBC ciphers still found on switch firmware.
    Balanced,
    /// Everything russh can negotiate, host keys unchecked.
    LegacyCompatible,
}

impl SecurityLevel {
    fn algorithms(
        self,
    ) -> (
        &'static [russh::kex::Name],
        &'static [russh::keys::Algorithm],
        &'static [russh::cipher::Name],
        &'static [russh::mac::Name],
    ) {
        match self {
            SecurityLevel::Secure => (
                config::SECURE_KEX_ORDER,
                config::SECURE_KEY_TYPES,
                config::SECURE_CIPHERS,
                config::SECURE_MAC_ALGORITHMS,
            ),
            SecurityLevel::Balanced => (
                config::BALANCED_KEX_ORDER,
                config::BALANCED_KEY_TYPES,
                config::BALANCED_CIPHERS,
                config::BALANCED_MAC_ALGORITHMS,
            ),
            SecurityLevel::LegacyCompatible => (
                config::LEGACY_KEX_ORDER,
                config::LEGACY_KEY_TYPES,
                config::LEGACY_CIPHERS,
                config::LEGACY_MAC_ALGORITHMS,
            ),
        }
    }
}

/// Algorithm policy and host key checking used by [`SshDriver`].
#[derive(Debug, Clone)]
pub struct ConnectionSecurityOptions {
    pub level: SecurityLevel,
    pub server_check: ServerCheckMethod,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        Self::for_level(SecurityLevel::Secure)
    }
}

impl ConnectionSecurityOptions {
    /// Host keys are checked against the user's known-hosts file except on
    /// the legacy level.
    pub fn for_level(level: SecurityLevel) -> Self {
        let server_check = match level {
            SecurityLevel::LegacyCompatible => ServerCheckMethod::NoCheck,
            _ => ServerCheckMethod::DefaultKnownHostsFile,
        };
        Self {
            level,
            server_check,
        }
    }

    pub fn balanced() -> Self {
        Self::for_level(SecurityLevel::Balanced)
    }

    pub fn legacy_compatible() -> Self {
        Self::for_level(SecurityLevel::LegacyCompatible)
    }

    /// Checks host keys against a fleet-wide known-hosts file.
    pub fn with_known_hosts_file(mut self, path: impl Into<String>) -> Self {
        self.server_check = ServerCheckMethod::KnownHostsFile(path.into());
        self
    }

    pub(super) fn preferred(&self) -> Preferred {
        let (kex, key, cipher, mac) = self.level.algorithms();
        Preferred {
            kex: Cow::Borrowed(kex),
            key: Cow::Borrowed(key),
            cipher: Cow::Borrowed(cipher),
            mac: Cow::Borrowed(mac),
            compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
        }
    }
}

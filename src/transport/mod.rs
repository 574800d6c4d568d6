//! Transport driver seam.
//!
//! The engine consumes an interactive CLI transport through two traits:
//! [`TransportDriver`] opens a channel to a device, [`TransportHandle`] sends
//! one command at a time over it. The bundled [`SshDriver`] drives an SSH
//! shell with prompt detection taken from the platform table.

use std::borrow::Cow;
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use async_trait::async_trait;
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use russh::{ChannelMsg, Preferred};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::config;
use crate::credential::ResolvedCredential;
use crate::device::DeviceIdentity;
use crate::error::TransportError;
use crate::templates::{self, PlatformProfile};

pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use ssh::{SshDriver, SshHandle};

/// Opens transport channels to devices.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Connects and authenticates. The credential is only borrowed for the
    /// duration of the call.
    async fn connect(
        &self,
        device: &DeviceIdentity,
        credential: &ResolvedCredential,
        timeout: Duration,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// One live, authenticated channel. At most one command is in flight.
#[async_trait]
pub trait TransportHandle: Send {
    /// Sends one command and returns its output without echo or prompt.
    async fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    async fn close(&mut self);

    fn is_alive(&self) -> bool;
}

mod security;
mod ssh;

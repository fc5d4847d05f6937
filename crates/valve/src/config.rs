//! Configuration loading and validation for the valve service.
//!
//! Configuration comes from an optional TOML file plus `VALVE_`-prefixed
//! environment overrides. Every entry is validated at load time; the
//! process refuses to start on the first invalid value, before any socket
//! is bound.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use common::ValveError;
use serde::Deserialize;

use crate::address::{AddressSet, AddressSpec};

/// Validated valve service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Relay entry points. At least one is required.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// The control channel. Required when any listener is controlled.
    pub control: Option<ControlConfig>,

    /// Named TLS security contexts referenced by listeners and the control
    /// channel.
    #[serde(default)]
    pub security: HashMap<String, SecurityConfig>,

    /// Relay chunk buffer size in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Outbound server connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// TLS handshake timeout in milliseconds (either side).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How long `stop` waits for live connections before force-closing.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Whether controlled listeners start paused.
    #[serde(default = "default_start_paused")]
    pub start_paused: bool,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One relay entry point: a set of bind addresses forwarding to one server.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Bind addresses (`"host:port"`, `":port"`; port 0 for ephemeral).
    pub addresses: Vec<String>,

    /// Target server address relayed connections are paired with.
    pub server_address: String,

    /// Whether admission is gated by the pause/resume state.
    pub mode: ListenerMode,

    /// Security context wrapping accepted client sockets in TLS.
    #[serde(default)]
    pub security: Option<String>,

    /// Security context for the outbound connection to the server.
    #[serde(default)]
    pub server_security: Option<String>,

    /// Ordered filter identifiers applied to relayed data.
    #[serde(default)]
    pub filters: Vec<String>,

    /// Cap on simultaneously active relayed connections.
    #[serde(default)]
    pub connections_limit: Option<usize>,
}

/// Admission mode of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Always admits; ignores the gate.
    Direct,
    /// Admits only while the gate is resumed.
    Controlled,
}

/// The control channel's bind address and options.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Bind address of the control listener.
    pub address: String,

    /// Security context wrapping control connections in TLS.
    #[serde(default)]
    pub security: Option<String>,

    /// How long a PAUSE/RESUME waits for listeners to apply the transition
    /// before acknowledging anyway.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

/// PEM material for one named security context.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Certificate chain (server contexts; optional client auth for
    /// outbound contexts).
    #[serde(default)]
    pub cert_path: Option<String>,

    /// Private key matching `cert_path`.
    #[serde(default)]
    pub key_path: Option<String>,

    /// CA bundle: trust anchors for outbound contexts, or the client
    /// certificate issuers when `certified` is set.
    #[serde(default)]
    pub ca_path: Option<String>,

    /// Require client certificates on a server context.
    #[serde(default)]
    pub certified: bool,
}

fn default_buffer_size() -> usize {
    2048
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_handshake_timeout_ms() -> u64 {
    60_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_ack_timeout_ms() -> u64 {
    5_000
}
fn default_start_paused() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Loads and validates configuration from an optional TOML file plus
    /// `VALVE_`-prefixed environment variables (nested keys separated by
    /// `__`).
    ///
    /// # Errors
    ///
    /// Returns an error when a source cannot be read or any entry fails
    /// validation.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let cfg = builder
            .add_source(config::Environment::with_prefix("VALVE").separator("__"))
            .build()
            .context("failed to build valve configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise valve configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validates all entries, returning a descriptive error on the first
    /// failure.
    pub fn validate(&self) -> Result<(), ValveError> {
        if self.listeners.is_empty() {
            return Err(ValveError::Config("no listeners configured".into()));
        }
        if self.buffer_size == 0 {
            return Err(ValveError::Config("buffer_size must be > 0".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ValveError::Config("connect_timeout_ms must be > 0".into()));
        }

        for (index, listener) in self.listeners.iter().enumerate() {
            let addresses = AddressSet::parse_all(&listener.addresses)?;
            if addresses.is_empty() {
                return Err(ValveError::Config(format!(
                    "listener {index}: no bind addresses"
                )));
            }
            AddressSpec::parse(&listener.server_address)?;

            if listener.mode == ListenerMode::Controlled && self.control.is_none() {
                return Err(ValveError::Config(format!(
                    "listener {index} is controlled but no control channel is configured"
                )));
            }

            self.check_security_ref(listener.security.as_deref())?;
            self.check_security_ref(listener.server_security.as_deref())?;

            if listener.connections_limit == Some(0) {
                return Err(ValveError::Config(format!(
                    "listener {index}: connections_limit must be > 0"
                )));
            }
        }

        if let Some(control) = &self.control {
            AddressSpec::parse(&control.address)?;
            self.check_security_ref(control.security.as_deref())?;
        }

        Ok(())
    }

    fn check_security_ref(&self, name: Option<&str>) -> Result<(), ValveError> {
        if let Some(name) = name {
            if !self.security.contains_key(name) {
                return Err(ValveError::Config(format!(
                    "security context {name:?} is not defined"
                )));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl ControlConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

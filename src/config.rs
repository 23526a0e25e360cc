//! Global configuration parsing, validation, and runtime settings derivation.

use std::env;
use std::fs;
use std::net::{IpAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::bridge::{BridgeSettings, DisconnectPolicy};
use crate::client::ClientSettings;
use crate::registry::{Backoff, SessionRegistry, SqliteStore};
use crate::{AppError, Result};

/// Environment variable enabling post-mortem breakpoints.
pub const POST_MORTEM_ENV: &str = "BDB_DEBUG_POST_MORTEM";

/// Breakpoint behaviour on worker nodes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BreakpointConfig {
    /// Whether explicit breakpoints suspend traced units.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// What a client disconnect does to the paused unit.
    #[serde(default)]
    pub disconnect: DisconnectPolicy,
    /// Bound on waiting for a nested call to publish its session.
    #[serde(default = "default_descend_timeout")]
    pub descend_timeout_seconds: u64,
    /// Registry publish attempts before a breakpoint fails.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
}

impl Default for BreakpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disconnect: DisconnectPolicy::default(),
            descend_timeout_seconds: default_descend_timeout(),
            publish_attempts: default_publish_attempts(),
        }
    }
}

/// Registry polling and maintenance.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RegistryConfig {
    /// First delay when polling for a just-published session.
    #[serde(default = "default_poll_initial")]
    pub poll_initial_millis: u64,
    /// Largest delay between polls.
    #[serde(default = "default_poll_max")]
    pub poll_max_millis: u64,
    /// Bound on the client waiting for an announced successor session.
    #[serde(default = "default_follow_timeout")]
    pub follow_timeout_seconds: u64,
    /// Interval of the background reaper.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_initial_millis: default_poll_initial(),
            poll_max_millis: default_poll_max(),
            follow_timeout_seconds: default_follow_timeout(),
            reaper_interval_seconds: default_reaper_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_descend_timeout() -> u64 {
    10
}

fn default_publish_attempts() -> u32 {
    5
}

fn default_poll_initial() -> u64 {
    50
}

fn default_poll_max() -> u64 {
    1000
}

fn default_follow_timeout() -> u64 {
    10
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_registry_path() -> PathBuf {
    env::temp_dir().join("breakpoint-relay").join("registry.db")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` file backing the shared session directory.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    /// Publish sessions reachable from other nodes instead of loopback only.
    #[serde(default)]
    pub debugger_external: bool,
    /// Address advertised when `debugger_external` is set; detected when absent.
    #[serde(default)]
    pub node_ip: Option<IpAddr>,
    /// Listener bind address override.
    #[serde(default)]
    pub bind_ip: Option<IpAddr>,
    /// Breakpoint behaviour.
    #[serde(default)]
    pub breakpoints: BreakpointConfig,
    /// Registry polling and maintenance.
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            debugger_external: false,
            node_ip: None,
            bind_ip: None,
            breakpoints: BreakpointConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults pointing at a specific registry file.
    #[must_use]
    pub fn for_registry(path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: path.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let checks = [
            (
                self.breakpoints.descend_timeout_seconds,
                "breakpoints.descend_timeout_seconds",
            ),
            (
                u64::from(self.breakpoints.publish_attempts),
                "breakpoints.publish_attempts",
            ),
            (self.registry.poll_initial_millis, "registry.poll_initial_millis"),
            (self.registry.poll_max_millis, "registry.poll_max_millis"),
            (
                self.registry.follow_timeout_seconds,
                "registry.follow_timeout_seconds",
            ),
            (
                self.registry.reaper_interval_seconds,
                "registry.reaper_interval_seconds",
            ),
        ];
        if let Some((_, name)) = checks.iter().find(|(value, _)| *value == 0) {
            return Err(AppError::Config(format!("{name} must be greater than zero")));
        }

        if self.registry.poll_max_millis < self.registry.poll_initial_millis {
            return Err(AppError::Config(
                "registry.poll_max_millis must not be below poll_initial_millis".into(),
            ));
        }
        Ok(())
    }

    /// Registry polling backoff.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.registry.poll_initial_millis),
            max: Duration::from_millis(self.registry.poll_max_millis),
        }
    }

    /// Bridge settings for this node.
    ///
    /// External sessions advertise `node_ip`, falling back to the address
    /// of the interface holding the default route.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if external visibility is requested and no
    /// routable address can be determined.
    pub fn bridge_settings(&self) -> Result<BridgeSettings> {
        let mut settings = if self.debugger_external {
            let node_ip = match self.node_ip {
                Some(ip) => ip,
                None => detect_node_ip()?,
            };
            BridgeSettings::external(node_ip)
        } else {
            BridgeSettings::loopback()
        };

        if let Some(bind_ip) = self.bind_ip {
            settings.bind_ip = bind_ip;
        }
        settings.disconnect = self.breakpoints.disconnect;
        settings.descend_timeout = Duration::from_secs(self.breakpoints.descend_timeout_seconds);
        settings.publish_attempts = self.breakpoints.publish_attempts;
        settings.backoff = self.backoff();
        Ok(settings)
    }

    /// Debugger client settings.
    #[must_use]
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            follow_timeout: Duration::from_secs(self.registry.follow_timeout_seconds),
            backoff: self.backoff(),
        }
    }

    /// Reaper interval.
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.registry.reaper_interval_seconds)
    }

    /// Open the shared session directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the database cannot be opened.
    pub async fn open_registry(&self) -> Result<SessionRegistry> {
        let store = SqliteStore::connect(&self.registry_path).await?;
        Ok(SessionRegistry::new(Arc::new(store)))
    }
}

/// Whether post-mortem breakpoints are enabled (`BDB_DEBUG_POST_MORTEM=1`).
#[must_use]
pub fn post_mortem_enabled() -> bool {
    env::var(POST_MORTEM_ENV).is_ok_and(|value| value == "1")
}

/// Address of the interface holding the default route.
///
/// Connecting a UDP socket sends no packets; it only selects a route.
fn detect_node_ip() -> Result<IpAddr> {
    let probe = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.connect("192.0.2.1:9").map(|()| socket))
        .and_then(|socket| socket.local_addr());
    match probe {
        Ok(addr) if !addr.ip().is_unspecified() => Ok(addr.ip()),
        Ok(_) => Err(AppError::Config(
            "cannot determine node address; set node_ip".into(),
        )),
        Err(err) => {
            warn!(%err, "node address detection failed");
            Err(AppError::Config(format!(
                "cannot determine node address ({err}); set node_ip"
            )))
        }
    }
}

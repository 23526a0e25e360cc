//! Breakpoint bridge: turns one breakpoint hit into one network-reachable,
//! single-client debug session.
//!
//! ## State machine
//!
//! ```text
//! (publish) → Awaiting → Active ⇄ Recursing → Terminated
//! ```
//!
//! Binding the listener and writing the descriptor happen inside
//! [`Bridge::publish`], which returns only once the session is listed, so a
//! bridge value always starts in `Awaiting`.
//!
//! The paused unit awaits [`Bridge::stop`] for the whole Awaiting → Active
//! span. The bridge outlives a single stop: stepping commands release the
//! unit until its next stop, which reuses the attached client.

pub mod frame;
pub mod session;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::Deserialize;

use crate::models::session::SessionKey;
use crate::registry::Backoff;

pub use self::frame::Frame;
pub use self::session::Bridge;

/// What happens to a paused unit when its client disconnects without a
/// continuation-class command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Treat the disconnect as an implicit `continue`.
    #[default]
    Continue,
    /// Keep the unit paused and the session published; wait for a new client.
    AwaitReattach,
}

/// Lifecycle state of a [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Waiting for a client to connect.
    Awaiting,
    /// Serving commands from the attached client.
    Active,
    /// Waiting for a nested call to publish its own session.
    Recursing,
    /// Entry removed, unit released.
    Terminated,
}

/// Stepping granularity requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Next line in the current scope.
    Next,
    /// Very next line, entering scopes.
    Into,
    /// First line after the current scope returns.
    Out,
}

/// How the paused unit should proceed once [`Bridge::stop`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Client sent a continue command.
    Continue,
    /// Client sent a quit command.
    Quit,
    /// Client went away; treated as continue.
    Disconnected,
    /// Run until the next matching stop; the session stays attached.
    Step(StepKind),
    /// Run until the next nested call, which must suspend under the given key.
    Descend(SessionKey),
}

impl Resume {
    /// Whether the session ends with this resumption.
    #[must_use]
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::Continue | Self::Quit | Self::Disconnected)
    }
}

/// Why the unit stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit breakpoint statement.
    Breakpoint,
    /// Stepping reached a new line.
    Step,
    /// The unit issued the nested call a `descend` was waiting for.
    Descended {
        /// Key the nested call will publish under if it suspends.
        successor: SessionKey,
        /// Name of the nested call.
        call: String,
    },
    /// The unit failed with an uncaught error.
    PostMortem(String),
}

/// Per-node bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Address the listener binds to.
    pub bind_ip: IpAddr,
    /// Host component published in descriptors.
    pub advertised_host: String,
    /// Disconnect handling.
    pub disconnect: DisconnectPolicy,
    /// Bound on waiting for a nested call to publish its session.
    pub descend_timeout: Duration,
    /// Registry publish attempts before the breakpoint fails.
    pub publish_attempts: u32,
    /// Registry polling backoff.
    pub backoff: Backoff,
}

impl BridgeSettings {
    /// Loopback-only sessions.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertised_host: Ipv4Addr::LOCALHOST.to_string(),
            disconnect: DisconnectPolicy::default(),
            descend_timeout: Duration::from_secs(10),
            publish_attempts: 5,
            backoff: Backoff::default(),
        }
    }

    /// Sessions reachable from other nodes at `node_ip`.
    #[must_use]
    pub fn external(node_ip: IpAddr) -> Self {
        let advertised_host = match node_ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        let bind_ip = match node_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        Self {
            bind_ip,
            advertised_host,
            ..Self::loopback()
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::loopback()
    }
}

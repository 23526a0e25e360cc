//! Session descriptor model and key derivation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Literal marker every session key starts with.
pub const SESSION_KEY_PREFIX: &str = "BDB_";

/// Number of hex characters following the prefix.
const KEY_HEX_LEN: usize = 32;

/// Opaque, cluster-unique identifier of one breakpoint session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derive a fresh key from the owning job, the unit of work, and randomness.
    #[must_use]
    pub fn generate(job_id: &str, task_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(job_id.as_bytes());
        hasher.update(b"|");
        hasher.update(task_id.as_bytes());
        hasher.update(b"|");
        hasher.update(Uuid::new_v4().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(format!("{SESSION_KEY_PREFIX}{}", &digest[..KEY_HEX_LEN]))
    }

    /// Wrap a raw directory key, rejecting keys without the session marker.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        raw.starts_with(SESSION_KEY_PREFIX)
            .then(|| Self(raw.to_owned()))
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source position a unit of work is paused at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointLocation {
    /// Source file path.
    pub file: String,
    /// One-based line number.
    pub line: u32,
    /// Enclosing function name.
    pub function: String,
}

impl fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.file, self.line, self.function)
    }
}

/// Identity of the paused unit of work that owns a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Owning job (driver) identifier.
    pub job_id: String,
    /// Unit-of-work identifier.
    pub task_id: String,
}

/// Directory record describing one live breakpoint hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Directory key of this session.
    pub session_key: SessionKey,
    /// Owning job; consulted by the reaper.
    pub job_id: String,
    /// Owning unit of work.
    pub task_id: String,
    /// `host:port` of the bridge listener.
    pub address: String,
    /// Where the unit is paused.
    pub location: BreakpointLocation,
    /// Publication time.
    pub created_at: DateTime<Utc>,
}

impl SessionDescriptor {
    /// Split `address` into host and port.
    #[must_use]
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let (host, port) = self.address.rsplit_once(':')?;
        port.parse().ok().map(|port| (host, port))
    }

    /// Encode as the JSON wire format stored in the directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedDescriptor` if serialization fails.
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|err| crate::AppError::MalformedDescriptor(format!("encode failed: {err}")))
    }

    /// Decode the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedDescriptor` when `raw` is not a descriptor.
    pub fn from_json(raw: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|err| crate::AppError::MalformedDescriptor(err.to_string()))
    }
}

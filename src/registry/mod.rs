//! Session registry: a narrow client over the cluster-wide directory.
//!
//! All breakpoint sessions live under the fixed [`SESSION_NAMESPACE`] with
//! keys carrying the [`SESSION_KEY_PREFIX`] marker, so listings never pick
//! up unrelated entries sharing the same backing store.

pub mod jobs;
pub mod sqlite;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::session::{SessionDescriptor, SessionKey, SESSION_KEY_PREFIX};
use crate::{AppError, Result};

pub use self::jobs::JobTable;
pub use self::sqlite::SqliteStore;
pub use self::store::{KvStore, MemoryStore};

/// Directory namespace scoping every breakpoint session.
pub const SESSION_NAMESPACE: &str = "bdb";

/// Exponential backoff used when polling the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// First delay.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl Backoff {
    /// Delay following `current`.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
        }
    }
}

/// Snapshot of the registry taken by [`SessionRegistry::list_sessions`].
#[derive(Debug, Default)]
pub struct Listing {
    /// Decodable sessions ordered by creation time, then key.
    pub sessions: Vec<SessionDescriptor>,
    /// Keys whose values could not be decoded.
    pub malformed: Vec<String>,
}

/// Handle on the session directory, passed explicitly to every bridge,
/// client and reaper.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn KvStore>,
}

impl SessionRegistry {
    /// Wrap a backing store.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Registry over a fresh in-process store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// The backing store, shared with the job table.
    #[must_use]
    pub fn store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }

    /// Store a descriptor under its session key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the directory cannot be reached.
    pub async fn publish(&self, descriptor: &SessionDescriptor) -> Result<()> {
        let value = descriptor.to_json()?;
        self.store
            .put(SESSION_NAMESPACE, descriptor.session_key.as_str(), &value)
            .await
    }

    /// Publish, retrying transient failures up to `attempts` times.
    ///
    /// # Errors
    ///
    /// Returns the last error once all attempts fail, or immediately for
    /// non-transient errors.
    pub async fn publish_with_retry(
        &self,
        descriptor: &SessionDescriptor,
        attempts: u32,
        backoff: Backoff,
    ) -> Result<()> {
        let mut delay = backoff.initial;
        let mut attempt = 1;
        loop {
            match self.publish(descriptor).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(
                        session_key = %descriptor.session_key,
                        attempt,
                        %err,
                        "registry publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = backoff.next(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetch and decode one descriptor.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` when the key is absent,
    /// `AppError::MalformedDescriptor` when the value cannot be decoded, and
    /// `AppError::StoreUnavailable` on directory failure.
    pub async fn get(&self, key: &SessionKey) -> Result<SessionDescriptor> {
        let raw = self
            .store
            .get(SESSION_NAMESPACE, key.as_str())
            .await?
            .ok_or_else(|| AppError::SessionNotFound(key.to_string()))?;
        decode_entry(key.as_str(), &raw)
    }

    /// Point-in-time snapshot of all session keys.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` on directory failure.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        self.store.list(SESSION_NAMESPACE, SESSION_KEY_PREFIX).await
    }

    /// List and decode every session, skipping entries that cannot be decoded
    /// or whose stored key differs from the key they are listed under.
    ///
    /// Entries deleted between the key listing and the fetch are silently
    /// omitted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` on directory failure.
    pub async fn list_sessions(&self) -> Result<Listing> {
        let mut listing = Listing::default();
        for raw_key in self.list_keys().await? {
            let Some(value) = self.store.get(SESSION_NAMESPACE, &raw_key).await? else {
                continue;
            };
            match decode_entry(&raw_key, &value) {
                Ok(descriptor) => listing.sessions.push(descriptor),
                Err(err) => {
                    debug!(key = %raw_key, %err, "skipping malformed session entry");
                    listing.malformed.push(raw_key);
                }
            }
        }
        listing
            .sessions
            .sort_by(|a, b| (a.created_at, &a.session_key).cmp(&(b.created_at, &b.session_key)));
        Ok(listing)
    }

    /// Delete a session entry. Returns whether it was still present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` on directory failure.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.store.delete(SESSION_NAMESPACE, key).await
    }

    /// Poll for `key` until it is published or `timeout` elapses.
    ///
    /// Transient directory failures count as "not yet visible".
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedDescriptor` if the entry appears but
    /// cannot be decoded.
    pub async fn wait_for(
        &self,
        key: &SessionKey,
        timeout: Duration,
        backoff: Backoff,
    ) -> Result<Option<SessionDescriptor>> {
        let deadline = Instant::now() + timeout;
        let mut delay = backoff.initial;
        loop {
            match self.get(key).await {
                Ok(descriptor) => return Ok(Some(descriptor)),
                Err(AppError::SessionNotFound(_) | AppError::StoreUnavailable(_)) => {}
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = backoff.next(delay);
        }
    }
}

/// Decode the value stored under `raw_key`. A descriptor naming a different
/// key is malformed: deleting by its own key would miss the entry.
fn decode_entry(raw_key: &str, value: &[u8]) -> Result<SessionDescriptor> {
    let descriptor = SessionDescriptor::from_json(value)?;
    if descriptor.session_key.as_str() != raw_key {
        return Err(AppError::MalformedDescriptor(format!(
            "{raw_key}: stored under a different key than {}",
            descriptor.session_key
        )));
    }
    Ok(descriptor)
}

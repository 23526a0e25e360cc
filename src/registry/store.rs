//! Namespaced key-value directory abstraction and the in-process backend.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use crate::Result;

/// Boxed future returned by [`KvStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Cluster-visible namespaced key-value directory.
///
/// Implementations may fail any call with `AppError::StoreUnavailable`;
/// callers treat that as "retry later", never as "entry absent".
pub trait KvStore: Send + Sync {
    /// Insert or overwrite `key` in `namespace`.
    fn put<'a>(&'a self, namespace: &'a str, key: &'a str, value: &'a [u8])
        -> StoreFuture<'a, ()>;

    /// Fetch the value stored under `key`, if any.
    fn get<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>>;

    /// Point-in-time snapshot of keys in `namespace` starting with `prefix`.
    fn list<'a>(&'a self, namespace: &'a str, prefix: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Remove `key`. Returns whether it existed; deleting an absent key is not an error.
    fn delete<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, bool>;
}

/// In-process directory, visible to every task sharing the same handle.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries
                .write()
                .await
                .insert((namespace.to_owned(), key.to_owned()), value.to_vec());
            Ok(())
        })
    }

    fn get<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries
                .get(&(namespace.to_owned(), key.to_owned()))
                .cloned())
        })
    }

    fn list<'a>(&'a self, namespace: &'a str, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            let start = (namespace.to_owned(), prefix.to_owned());
            Ok(entries
                .range(start..)
                .take_while(|((ns, key), _)| ns == namespace && key.starts_with(prefix))
                .map(|((_, key), _)| key.clone())
                .collect())
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .entries
                .write()
                .await
                .remove(&(namespace.to_owned(), key.to_owned()))
                .is_some())
        })
    }
}

//! Namespace locks keyed by `(bucket, object)`.
//!
//! Metadata mutations on a single object are serialized by these advisory
//! locks. Acquisition is bounded: callers pass a timeout and get
//! [`ObjectError::LockTimeout`] instead of waiting forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::ObjectError;

/// Default bound for namespace lock acquisition.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide table of per-key advisory locks.
///
/// Entries are created lazily and kept for the lifetime of the map; the
/// per-key mutex is tiny and the namespace of concurrently hot keys is
/// bounded by in-flight requests.
#[derive(Clone, Default)]
pub struct NsLockMap {
    inner: Arc<Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>>,
}

impl NsLockMap {
    /// Create an empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the lock on `(bucket, object)`.
    pub fn lock_for(&self, bucket: &str, object: &str) -> NsLock {
        let key = (bucket.to_string(), object.to_string());
        let cell = {
            let mut inner = self.inner.lock().expect("ns lock map poisoned");
            inner.entry(key.clone()).or_default().clone()
        };
        NsLock { key, cell }
    }
}

impl std::fmt::Debug for NsLockMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("ns lock map poisoned");
        f.debug_struct("NsLockMap")
            .field("keys", &inner.len())
            .finish()
    }
}

/// Handle for one `(bucket, object)` lock.
pub struct NsLock {
    key: (String, String),
    cell: Arc<tokio::sync::Mutex<()>>,
}

impl NsLock {
    /// Acquire the lock, waiting at most `timeout`.
    pub async fn get_lock(&self, timeout: Duration) -> Result<NsLockGuard, ObjectError> {
        match tokio::time::timeout(timeout, self.cell.clone().lock_owned()).await {
            Ok(guard) => Ok(NsLockGuard { _guard: guard }),
            Err(_) => Err(ObjectError::LockTimeout {
                bucket: self.key.0.clone(),
                object: self.key.1.clone(),
            }),
        }
    }
}

/// RAII guard; the lock is released on drop.
#[derive(Debug)]
pub struct NsLockGuard {
    _guard: OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let map = NsLockMap::new();
        let lock = map.lock_for("b", "o");
        let guard = lock.get_lock(OPERATION_TIMEOUT).await.unwrap();

        let contended = map.lock_for("b", "o");
        let err = contended
            .get_lock(Duration::from_millis(50))
            .await
            .expect_err("second acquisition must time out");
        assert!(matches!(err, ObjectError::LockTimeout { .. }));

        drop(guard);
        contended
            .get_lock(Duration::from_millis(50))
            .await
            .expect("lock must be free after guard drop");
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let map = NsLockMap::new();
        let g1 = map.lock_for("b", "o1").get_lock(OPERATION_TIMEOUT).await.unwrap();
        let _g2 = map.lock_for("b", "o2").get_lock(Duration::from_millis(50)).await.unwrap();
        drop(g1);
    }
}

//! TTL-bounded value cell.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::StorageError;

/// A cached value refreshed at most once per TTL.
///
/// On a refresh failure the previous value is served stale until the next
/// refresh succeeds, so transient network hiccups on hot paths (disk-info)
/// do not cascade.
pub struct TtlCell<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> TtlCell<T> {
    /// Cell with the given refresh interval.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Current value, refreshing through `update` when the TTL has lapsed.
    pub async fn get_with<F, Fut>(&self, update: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some((at, value)) = slot.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(value.clone());
            }
        }
        match update().await {
            Ok(value) => {
                *slot = Some((Instant::now(), value.clone()));
                Ok(value)
            }
            // Serve stale on refresh failure; the next caller retries.
            Err(err) => match slot.take() {
                Some((_, value)) => {
                    *slot = Some((Instant::now(), value.clone()));
                    Ok(value)
                }
                None => Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caches_within_ttl() {
        let cell = TtlCell::new(Duration::from_secs(60));
        let v1 = cell.get_with(|| async { Ok(1u32) }).await.unwrap();
        let v2 = cell
            .get_with(|| async { Err(StorageError::DiskNotFound) })
            .await
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 1, "second read must come from cache");
    }

    #[tokio::test]
    async fn serves_stale_after_failed_refresh() {
        let cell = TtlCell::new(Duration::from_millis(0));
        cell.get_with(|| async { Ok(7u32) }).await.unwrap();
        let stale = cell
            .get_with(|| async { Err(StorageError::DiskNotFound) })
            .await
            .unwrap();
        assert_eq!(stale, 7);
    }

    #[tokio::test]
    async fn propagates_error_without_prior_value() {
        let cell: TtlCell<u32> = TtlCell::new(Duration::from_secs(1));
        let err = cell
            .get_with(|| async { Err(StorageError::DiskNotFound) })
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::DiskNotFound);
    }
}

//! Job progress checkpoints.
//!
//! Progress is persisted as MessagePack under `batch-rotate.bin`, one
//! file per job ID, rewritten atomically (write to a temp name, then
//! rename). Writes are debounced to at most one per ten seconds except
//! for the forced flush at completion.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::BatchError;

/// Checkpoint file name within a job's directory.
pub const CHECKPOINT_FILE: &str = "batch-rotate.bin";

/// Minimum interval between unforced checkpoint writes.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);

/// On-disk format version.
const CHECKPOINT_VERSION: u32 = 1;

/// Mutable job progress, persisted after every processed object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchJobInfo {
    /// Format version.
    pub version: u32,
    /// Job ID this progress belongs to.
    pub job_id: String,
    /// Job type tag (`keyrotate`).
    pub job_type: String,
    /// When the job first started.
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    /// When this record was last written.
    pub last_update: Option<chrono::DateTime<chrono::Utc>>,
    /// Per-object attempt counter of the most recent object.
    pub retry_attempts: usize,
    /// Whether the job finished with zero failures.
    pub complete: bool,
    /// Whether the job finished with failures.
    pub failed: bool,
    /// Bucket being processed.
    pub bucket: String,
    /// Resume cursor: the last object dispatched. Never regresses across
    /// restarts.
    pub object: String,
    /// Objects processed successfully.
    pub objects: u64,
    /// Objects that exhausted their retries.
    pub objects_failed: u64,
}

impl BatchJobInfo {
    /// Fresh progress for a job.
    pub fn new(job_id: &str, job_type: &str) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
            start_time: Some(chrono::Utc::now()),
            ..Default::default()
        }
    }

    /// Advance the resume cursor. Called at dispatch, in walk order, so
    /// the cursor never regresses.
    pub fn advance_cursor(&mut self, bucket: &str, object: &str) {
        self.bucket = bucket.to_string();
        self.object = object.to_string();
    }

    /// Count one object's final outcome.
    pub fn count_object(&mut self, success: bool) {
        if success {
            self.objects += 1;
        } else {
            self.objects_failed += 1;
        }
    }
}

/// Debounced checkpoint writer for one job.
pub struct CheckpointStore {
    dir: PathBuf,
    last_write: Mutex<Option<Instant>>,
}

impl CheckpointStore {
    /// Store rooted at `dir/<job-id>/batch-rotate.bin`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_write: Mutex::new(None),
        }
    }

    fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(job_id).join(CHECKPOINT_FILE)
    }

    /// Load the prior checkpoint, if any.
    pub async fn load(&self, job_id: &str) -> Result<Option<BatchJobInfo>, BatchError> {
        match tokio::fs::read(self.path(job_id)).await {
            Ok(raw) => {
                let info: BatchJobInfo =
                    rmp_serde::from_slice(&raw).map_err(|e| BatchError::Checkpoint(e.to_string()))?;
                Ok(Some(info))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BatchError::Checkpoint(e.to_string())),
        }
    }

    /// Persist `info` if at least `wait` has passed since the last write
    /// (`Duration::ZERO` forces).
    pub async fn update_after(
        &self,
        info: &mut BatchJobInfo,
        wait: Duration,
    ) -> Result<(), BatchError> {
        let mut last_write = self.last_write.lock().await;
        if let Some(at) = *last_write {
            if !wait.is_zero() && at.elapsed() < wait {
                return Ok(());
            }
        }

        info.last_update = Some(chrono::Utc::now());
        let raw =
            rmp_serde::to_vec(info).map_err(|e| BatchError::Checkpoint(e.to_string()))?;

        let path = self.path(&info.job_id);
        let parent = path.parent().expect("checkpoint path has a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BatchError::Checkpoint(e.to_string()))?;

        // Atomic replace: temp file in the same directory, then rename.
        let tmp = parent.join(format!("{CHECKPOINT_FILE}.tmp"));
        tokio::fs::write(&tmp, &raw)
            .await
            .map_err(|e| BatchError::Checkpoint(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BatchError::Checkpoint(e.to_string()))?;

        *last_write = Some(Instant::now());
        debug!(job_id = %info.job_id, object = %info.object, "checkpoint written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_and_debounces() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        assert!(store.load("job-1").await.unwrap().is_none());

        let mut info = BatchJobInfo::new("job-1", "keyrotate");
        info.advance_cursor("photos", "a");
        info.count_object(true);
        store.update_after(&mut info, Duration::ZERO).await.unwrap();

        let loaded = store.load("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.object, "a");
        assert_eq!(loaded.objects, 1);

        // Within the debounce window, unforced writes are skipped.
        info.advance_cursor("photos", "b");
        info.count_object(true);
        store
            .update_after(&mut info, CHECKPOINT_INTERVAL)
            .await
            .unwrap();
        let loaded = store.load("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.object, "a", "debounced write must be skipped");

        // A forced write always lands.
        store.update_after(&mut info, Duration::ZERO).await.unwrap();
        let loaded = store.load("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.object, "b");
    }

    #[tokio::test]
    async fn jobs_checkpoint_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store_a = CheckpointStore::new(dir.path());
        let store_b = CheckpointStore::new(dir.path());

        let mut a = BatchJobInfo::new("job-a", "keyrotate");
        let mut b = BatchJobInfo::new("job-b", "keyrotate");
        a.advance_cursor("x", "1");
        a.count_object(true);
        b.advance_cursor("y", "2");
        b.count_object(false);
        store_a.update_after(&mut a, Duration::ZERO).await.unwrap();
        store_b.update_after(&mut b, Duration::ZERO).await.unwrap();

        assert_eq!(store_a.load("job-a").await.unwrap().unwrap().objects, 1);
        assert_eq!(
            store_b.load("job-b").await.unwrap().unwrap().objects_failed,
            1
        );
    }
}

//! The key-rotation engine: resumable walk, worker pool, per-object
//! rotation under the namespace lock, checkpointing and notification.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng as _;
use skerry_io::{rotate_key, strip_arn, SseKind};
use skerry_object::lock::OPERATION_TIMEOUT;
use skerry_object::services::{CoreServices, KmsContext, VersioningSys};
use skerry_object::{
    ObjectError, ObjectInfo, ObjectLayer, ObjectOptions, WalkFilter, WalkOptions,
    WALK_CHANNEL_CAPACITY,
};
use skerry_types::{FileInfo, RESERVED_METADATA_PREFIX};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::checkpoint::{BatchJobInfo, CheckpointStore, CHECKPOINT_INTERVAL};
use crate::job::{KeyRotateJob, KeyRotationType};
use crate::metrics::BatchJobsMetrics;
use crate::BatchError;

/// Environment variable overriding the worker pool size.
pub const WORKERS_ENV: &str = "_SKERRY_BATCH_KEYROTATION_WORKERS";

/// Timeout for the completion notification POST.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// A submitted batch job: the immutable definition plus its identity.
#[derive(Debug, Clone)]
pub struct BatchJobRequest {
    /// Job ID, unique across the deployment.
    pub id: String,
    /// When the job was submitted.
    pub started: chrono::DateTime<Utc>,
    /// The rotation definition.
    pub job: KeyRotateJob,
}

/// Worker pool size: the env override, or half the hardware parallelism.
fn worker_count() -> usize {
    if let Ok(raw) = std::env::var(WORKERS_ENV) {
        if let Ok(n) = raw.parse::<usize>() {
            return n.max(1);
        }
    }
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cores / 2).max(1)
}

impl KeyRotateJob {
    /// Rotate the encryption envelope of one object, exactly once, under
    /// the namespace lock.
    ///
    /// Idempotent: re-rotating an already-rotated object rewraps the same
    /// data key and is a no-op transition. This is what makes the
    /// dispatch-time resume cursor safe.
    pub async fn key_rotate(
        &self,
        layer: &Arc<dyn ObjectLayer>,
        services: &CoreServices,
        obj: &ObjectInfo,
    ) -> Result<(), BatchError> {
        if obj.delete_marker || !obj.purge_status.is_empty() {
            return Ok(());
        }

        let sse_kms = skerry_io::is_sse_kms(&obj.user_defined);
        let sse_s3 = skerry_io::is_sse_s3(&obj.user_defined);
        if !sse_kms && !sse_s3 {
            return Err(BatchError::Object(ObjectError::InvalidEncryptionParameters));
        }
        // Walking back from KMS-managed to internal keys is forbidden.
        if sse_kms && self.encryption.kind == KeyRotationType::SseS3 {
            return Err(BatchError::Object(ObjectError::InvalidEncryptionParameters));
        }

        let versioned = services.versioning.prefix_enabled(&self.bucket, &obj.name);
        let version_suspended = services.versioning.prefix_suspended(&self.bucket, &obj.name);

        let lock = layer.new_ns_lock(&self.bucket, &obj.name);
        let _guard = lock
            .get_lock(OPERATION_TIMEOUT)
            .await
            .map_err(BatchError::Object)?;

        let opts = ObjectOptions {
            version_id: obj.version_id.clone(),
            versioned,
            version_suspended,
            no_lock: true,
            ..Default::default()
        };
        let mut oi = layer
            .get_object_info(&self.bucket, &obj.name, &opts)
            .await
            .map_err(BatchError::Object)?;
        if oi.delete_marker || !oi.purge_status.is_empty() {
            return Ok(());
        }

        // Only the reserved-prefix entries participate in the rewrap.
        let mut enc_metadata: std::collections::BTreeMap<String, String> = oi
            .user_defined
            .iter()
            .filter(|(k, _)| k.to_ascii_lowercase().starts_with(RESERVED_METADATA_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let kms = services
            .kms
            .as_ref()
            .ok_or(BatchError::KmsNotConfigured)?;

        let (target, new_key_id, new_context) = match self.encryption.kind {
            KeyRotationType::SseKms => {
                self.encryption.validate(Some(kms)).await?;
                (
                    SseKind::Kms,
                    strip_arn(&self.encryption.key).to_string(),
                    self.encryption.kms_context()?,
                )
            }
            KeyRotationType::SseS3 => (SseKind::S3, String::new(), KmsContext::new()),
        };

        rotate_key(kms.as_ref(), &mut enc_metadata, target, &new_key_id, &new_context)
            .await
            .map_err(BatchError::Crypto)?;

        for (k, v) in enc_metadata {
            oi.user_defined.insert(k, v);
        }

        let src_opts = ObjectOptions {
            version_id: oi.version_id.clone(),
            ..Default::default()
        };
        let dst_opts = ObjectOptions {
            version_id: oi.version_id.clone(),
            // The outer namespace lock is held for the whole rotation.
            no_lock: true,
            metadata_only: true,
            key_rotation: true,
            ..Default::default()
        };
        layer
            .copy_object(
                &self.bucket,
                &oi.name,
                &self.bucket,
                &oi.name,
                &oi,
                &src_opts,
                &dst_opts,
            )
            .await
            .map_err(BatchError::Object)?;
        Ok(())
    }

    /// POST the final job info to the configured notification endpoint.
    pub async fn notify(&self, body: &[u8]) -> Result<(), BatchError> {
        let target = &self.flags.notify;
        if target.endpoint.is_empty() {
            return Ok(());
        }

        let client = reqwest::Client::new();
        let mut request = client
            .post(&target.endpoint)
            .timeout(NOTIFY_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if !target.token.is_empty() {
            request = request.header(reqwest::header::AUTHORIZATION, target.token.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BatchError::Notify(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BatchError::Notify(response.status().to_string()));
        }
        Ok(())
    }

    /// Run the job to completion, resuming from the prior checkpoint if
    /// one exists.
    pub async fn start(
        &self,
        layer: Arc<dyn ObjectLayer>,
        services: CoreServices,
        request: &BatchJobRequest,
        store: Arc<CheckpointStore>,
        metrics: Arc<BatchJobsMetrics>,
    ) -> Result<(), BatchError> {
        let loaded = store.load(&request.id).await?;
        let info = loaded.unwrap_or_else(|| BatchJobInfo::new(&request.id, "keyrotate"));
        metrics.save(&request.id, &info);
        let last_object = info.object.clone();
        let attempts = self.retry_attempts();
        let delay = self.retry_delay();

        let filter = self.flags.filter.clone();
        let skip: WalkFilter = Arc::new(move |fi: &FileInfo| filter.matches(fi, Utc::now()));

        let workers = worker_count();
        let semaphore = Arc::new(Semaphore::new(workers));
        let (tx, mut rx) = mpsc::channel::<ObjectInfo>(WALK_CHANNEL_CAPACITY);

        info!(
            job_id = %request.id,
            bucket = %self.bucket,
            prefix = %self.prefix,
            workers,
            resume_from = %last_object,
            "key rotation job started"
        );

        let walk = {
            let layer = layer.clone();
            let bucket = self.bucket.clone();
            let prefix = self.prefix.clone();
            tokio::spawn(async move {
                layer
                    .walk(
                        &bucket,
                        &prefix,
                        tx,
                        WalkOptions {
                            marker: last_object,
                            filter: Some(skip),
                        },
                    )
                    .await
            })
        };

        let info = Arc::new(Mutex::new(info));
        let mut tasks = JoinSet::new();

        while let Some(object) = rx.recv().await {
            // The filter already excluded non-matching objects; anything
            // not SSE-encrypted is silently skipped.
            if !Self::is_candidate(&object.user_defined) {
                continue;
            }

            // The cursor advances at dispatch, not completion: a crash
            // between the two re-rotates the in-flight object, which the
            // idempotent rewrap absorbs.
            {
                let mut info = info.lock().await;
                info.advance_cursor(&self.bucket, &object.name);
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("worker semaphore never closes");

            let job = self.clone();
            let layer = layer.clone();
            let services = services.clone();
            let info = info.clone();
            let store = store.clone();
            let metrics = metrics.clone();
            let job_id = request.id.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let mut success = false;
                for attempt in 1..=attempts {
                    let trace = metrics.trace(&job_id, attempt, &object.name);
                    match job.key_rotate(&layer, &services, &object).await {
                        Ok(()) => {
                            trace.done(None);
                            success = true;
                        }
                        Err(e) => trace.done(Some(&e as &dyn std::fmt::Display)),
                    }
                    {
                        let mut info = info.lock().await;
                        info.retry_attempts = attempt;
                        metrics.save(&job_id, &info);
                    }
                    if success {
                        break;
                    }
                }

                let mut info = info.lock().await;
                info.count_object(success);
                metrics.save(&job_id, &info);
                if let Err(e) = store.update_after(&mut info, CHECKPOINT_INTERVAL).await {
                    warn!(job_id = %job_id, error = %e, "checkpoint write failed");
                }
            });
        }

        // Drain barrier: every dispatched object finishes, success or
        // exhausted retries, before completion is decided.
        while tasks.join_next().await.is_some() {}

        match walk.await {
            Ok(Ok(())) => {}
            // A failed listing is not retried; the source is unreadable.
            Ok(Err(e)) => return Err(BatchError::Object(e)),
            Err(e) => return Err(BatchError::Internal(e.to_string())),
        }

        let (body, failed) = {
            let mut info = info.lock().await;
            info.complete = info.objects_failed == 0;
            info.failed = info.objects_failed > 0;
            metrics.save(&request.id, &info);
            store.update_after(&mut info, Duration::ZERO).await?;
            (
                serde_json::to_vec(&*info).map_err(|e| BatchError::Notify(e.to_string()))?,
                info.failed,
            )
        };

        if let Err(e) = self.notify(&body).await {
            warn!(job_id = %request.id, error = %e, "unable to notify");
        }

        if failed {
            // Back off before the scheduler re-invokes the job.
            let jitter: f64 = rand::rng().random_range(0.0..1.0);
            tokio::time::sleep(delay + delay.mul_f64(jitter)).await;
        }

        info!(job_id = %request.id, failed, "key rotation job finished");
        Ok(())
    }
}

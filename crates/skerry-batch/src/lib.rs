//! Batch key-rotation engine.
//!
//! A long-running, resumable, worker-pooled job that walks a bucket,
//! filters candidate objects and rotates each object's encryption
//! envelope under a per-object namespace lock, with retry, progress
//! checkpointing and remote notification.
//!
//! Jobs are defined in YAML ([`KeyRotateJob::from_yaml`]), validated
//! against the live deployment ([`KeyRotateJob::validate`]), and run with
//! [`KeyRotateJob::start`]. Progress persists through
//! [`CheckpointStore`]; re-running a completed job is a no-op pass over
//! already-rotated objects.

mod checkpoint;
mod job;
mod metrics;
mod runner;

#[cfg(test)]
mod tests;

pub use checkpoint::{BatchJobInfo, CheckpointStore, CHECKPOINT_FILE, CHECKPOINT_INTERVAL};
pub use job::{
    KeyRotateEncryption, KeyRotateFilter, KeyRotateFlags, KeyRotateJob, KeyRotateKV,
    KeyRotateNotification, KeyRotateRetry, KeyRotationType, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_RETRY_DELAY, KEY_ROTATE_API_VERSION,
};
pub use metrics::{AttemptTrace, BatchJobsMetrics};
pub use runner::{BatchJobRequest, WORKERS_ENV};

use skerry_object::services::KmsError;
use skerry_object::ObjectError;

/// Batch engine failures.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// A malformed or out-of-range argument in the job definition.
    #[error("invalid argument")]
    InvalidArgument,

    /// The job YAML failed to parse.
    #[error("invalid job definition: {0}")]
    Definition(String),

    /// A KMS key ID that cannot be used (padding, unknown).
    #[error("invalid KMS key id: {0:?}")]
    InvalidKmsKeyId(String),

    /// No KMS is configured.
    #[error("KMS not configured")]
    KmsNotConfigured,

    /// A job-level failure with S3-style wire fields.
    #[error("{description}")]
    JobError {
        /// Wire error code.
        code: &'static str,
        /// Human-readable description.
        description: String,
        /// HTTP status for the job API.
        status: u16,
    },

    /// The object layer refused an operation.
    #[error(transparent)]
    Object(#[from] ObjectError),

    /// The envelope rewrap failed.
    #[error(transparent)]
    Crypto(#[from] skerry_io::CryptoError),

    /// The KMS refused an operation.
    #[error(transparent)]
    Kms(#[from] KmsError),

    /// Reading or writing the checkpoint failed.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// The notification endpoint rejected the completion report.
    #[error("notify: {0}")]
    Notify(String),

    /// An engine-internal failure (worker panic, join error).
    #[error("internal: {0}")]
    Internal(String),
}

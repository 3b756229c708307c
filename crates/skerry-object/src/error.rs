//! Object-layer error sum.
//!
//! A closed set at the module boundary; the string mapping for the RPC
//! wire lives in `skerry-storage`, and the S3 XML rendering lives in
//! `skerry-s3`.

use skerry_storage::StorageError;

/// Errors returned by [`ObjectLayer`](crate::ObjectLayer) operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectError {
    /// The requested bucket does not exist.
    #[error("bucket not found: {bucket}")]
    BucketNotFound {
        /// Bucket name.
        bucket: String,
    },

    /// The bucket already exists.
    #[error("bucket already exists: {bucket}")]
    BucketExists {
        /// Bucket name.
        bucket: String,
    },

    /// The bucket still contains objects (or versions).
    #[error("bucket not empty: {bucket}")]
    BucketNotEmpty {
        /// Bucket name.
        bucket: String,
    },

    /// The requested object does not exist.
    #[error("object not found: {bucket}/{object}")]
    ObjectNotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        object: String,
    },

    /// The requested object version does not exist.
    #[error("version not found: {bucket}/{object} ({version_id})")]
    VersionNotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        object: String,
        /// Requested version.
        version_id: String,
    },

    /// A malformed or out-of-range argument.
    #[error("invalid argument")]
    InvalidArgument,

    /// A version ID that does not parse as a UUID.
    #[error("invalid version id: {version_id}")]
    InvalidVersionId {
        /// The rejected version ID.
        version_id: String,
    },

    /// The requested encryption transition is not allowed.
    #[error("invalid encryption parameters")]
    InvalidEncryptionParameters,

    /// SSE-C together with bucket replication is forbidden.
    #[error("SSE-C encryption is not supported with replication")]
    InvalidEncryptionParametersSsec,

    /// No KMS is configured for an operation that requires one.
    #[error("KMS not configured")]
    KmsNotConfigured,

    /// Failed to acquire the namespace lock within the timeout.
    #[error("operation timed out acquiring lock on {bucket}/{object}")]
    LockTimeout {
        /// Bucket name.
        bucket: String,
        /// Object key.
        object: String,
    },

    /// An error surfaced from the storage layer.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ObjectError {
    /// Whether the error means "the thing to delete was already gone" —
    /// treated as success on the delete path.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ObjectError::ObjectNotFound { .. }
                | ObjectError::VersionNotFound { .. }
                | ObjectError::Storage(StorageError::FileNotFound)
                | ObjectError::Storage(StorageError::FileVersionNotFound)
        )
    }
}

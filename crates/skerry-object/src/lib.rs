//! The object-layer capability set and the service container.
//!
//! Protocol adapters (the S3 surface, the batch engine, the federation
//! reconciler) depend on the [`ObjectLayer`] trait instead of a concrete
//! storage backend, making backends interchangeable — the erasure-set
//! layer and a cache-fronted variant are the two known implementations.
//!
//! The external collaborators the core calls into (KMS, the IAM policy
//! engine, the DNS federation directory, bucket metadata and versioning)
//! are modeled as traits in [`services`] and threaded through constructors
//! via [`services::CoreServices`] rather than process globals.

mod error;
pub mod lock;
pub mod memory;
pub mod services;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use skerry_types::{FileInfo, ObjectToDelete, VersionPurgeStatus};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

pub use error::ObjectError;
pub use lock::{NsLockGuard, NsLockMap};

/// Soft cap on the number of buckets; creation past this logs a warning
/// but still succeeds.
pub const MAX_BUCKETS: usize = 500;

/// Version count past which an `ObjectManyVersions` event is emitted.
pub const EXCESSIVE_VERSIONS_THRESHOLD: usize = 1000;

/// Capacity of the bounded channel used by [`ObjectLayer::walk`]; a slow
/// consumer applies backpressure to the walker.
pub const WALK_CHANNEL_CAPACITY: usize = 100;

/// A streaming body handed to [`ObjectLayer::put_object`].
pub type PutReader<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

/// Metadata describing a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketInfo {
    /// Bucket name.
    pub name: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Whether object lock was enabled at creation.
    pub object_lock_enabled: bool,
}

/// Metadata describing one object version, as returned by the object layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectInfo {
    /// Bucket the object lives in.
    pub bucket: String,
    /// Object key.
    pub name: String,
    /// Version ID; empty when unversioned.
    pub version_id: String,
    /// Modification time.
    pub mod_time: Option<DateTime<Utc>>,
    /// Size in bytes.
    pub size: i64,
    /// ETag over the stored content.
    pub etag: String,
    /// Whether this version is a delete marker.
    pub delete_marker: bool,
    /// User-defined metadata, including reserved-prefix entries.
    pub user_defined: BTreeMap<String, String>,
    /// Total number of versions of this object after the operation.
    pub num_versions: usize,
    /// Replication purge state of this version.
    pub purge_status: VersionPurgeStatus,
    /// Remote name when the data has been transitioned to another tier.
    pub transitioned_object: String,
}

impl ObjectInfo {
    /// Build an `ObjectInfo` view over walked [`FileInfo`] metadata.
    pub fn from_file_info(fi: &FileInfo, bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            name: fi.name.clone(),
            version_id: fi.version_id.clone(),
            mod_time: fi.mod_time,
            size: fi.size,
            etag: fi
                .metadata
                .get("etag")
                .cloned()
                .unwrap_or_default(),
            delete_marker: fi.delete_marker,
            user_defined: fi.metadata.clone(),
            num_versions: 0,
            purge_status: VersionPurgeStatus::Empty,
            transitioned_object: fi.transitioned_obj_name.clone(),
        }
    }
}

/// Per-call options for object operations.
#[derive(Clone, Default)]
pub struct ObjectOptions {
    /// Version to operate on; empty selects the latest.
    pub version_id: String,
    /// Whether versioning is enabled for this prefix.
    pub versioned: bool,
    /// Whether versioning is suspended for the bucket.
    pub version_suspended: bool,
    /// Caller already holds the namespace lock.
    pub no_lock: bool,
    /// Metadata-only update: the data is untouched.
    pub metadata_only: bool,
    /// This update is a key rotation; reserved encryption entries are
    /// expected to change while everything else is preserved.
    pub key_rotation: bool,
    /// Metadata to store with the object.
    pub user_defined: BTreeMap<String, String>,
}

impl std::fmt::Debug for ObjectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectOptions")
            .field("version_id", &self.version_id)
            .field("versioned", &self.versioned)
            .field("no_lock", &self.no_lock)
            .field("metadata_only", &self.metadata_only)
            .finish_non_exhaustive()
    }
}

/// Options for bucket metadata reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketOptions {
    /// Include buckets that are deleted but not yet purged.
    pub deleted: bool,
}

/// Options for bucket creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeBucketOptions {
    /// Enable object lock (and thus versioning) at creation.
    pub lock_enabled: bool,
    /// Bypass the federation existence check.
    pub force_create: bool,
}

/// Options for bucket deletion.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteBucketOptions {
    /// Delete even when the bucket is not empty.
    pub force: bool,
}

/// Push-down filter for [`ObjectLayer::walk`]: return `true` to keep the
/// entry, `false` to skip it before it is materialized.
pub type WalkFilter = Arc<dyn Fn(&FileInfo) -> bool + Send + Sync>;

/// Options for a namespace walk.
#[derive(Clone, Default)]
pub struct WalkOptions {
    /// Resume from this object key, inclusive: the marker object itself
    /// is walked again, so resumed work must be idempotent.
    pub marker: String,
    /// Push-down filter applied before entries are sent.
    pub filter: Option<WalkFilter>,
}

/// One in-progress multipart upload, as listed by
/// [`ObjectLayer::list_multipart_uploads`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartUploadInfo {
    /// Object key the upload targets.
    pub object: String,
    /// Upload ID.
    pub upload_id: String,
    /// When the upload was initiated.
    pub initiated: Option<DateTime<Utc>>,
}

/// Result of listing multipart uploads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListMultipartsInfo {
    /// Uploads in lexical (key, upload id) order.
    pub uploads: Vec<MultipartUploadInfo>,
    /// Echoed request prefix.
    pub prefix: String,
    /// Echoed key marker.
    pub key_marker: String,
    /// Whether the listing was truncated at `max_uploads`.
    pub is_truncated: bool,
    /// Echoed maximum.
    pub max_uploads: usize,
}

/// The data-plane capability set the core dispatches on.
///
/// Two known implementations: the erasure-set backend and a cache-fronted
/// wrapper. The handler layer is polymorphic over this trait.
#[async_trait::async_trait]
pub trait ObjectLayer: Send + Sync {
    /// Create a bucket.
    async fn make_bucket(
        &self,
        bucket: &str,
        opts: MakeBucketOptions,
    ) -> Result<(), ObjectError>;

    /// Delete a bucket. Fails with [`ObjectError::BucketNotEmpty`] unless
    /// `opts.force` is set.
    async fn delete_bucket(
        &self,
        bucket: &str,
        opts: DeleteBucketOptions,
    ) -> Result<(), ObjectError>;

    /// Fetch bucket metadata.
    async fn get_bucket_info(
        &self,
        bucket: &str,
        opts: BucketOptions,
    ) -> Result<BucketInfo, ObjectError>;

    /// List all buckets.
    async fn list_buckets(&self, opts: BucketOptions) -> Result<Vec<BucketInfo>, ObjectError>;

    /// Store an object from a streaming body.
    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        data: PutReader<'_>,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo, ObjectError>;

    /// Server-side copy. With `metadata_only` set in `dst_opts` the data is
    /// left in place and only the metadata record is rewritten.
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        src_info: &ObjectInfo,
        src_opts: &ObjectOptions,
        dst_opts: &ObjectOptions,
    ) -> Result<ObjectInfo, ObjectError>;

    /// Bulk delete. Returns one entry per input, in input order; the error
    /// slot is `None` on success.
    async fn delete_objects(
        &self,
        bucket: &str,
        objects: Vec<ObjectToDelete>,
        opts: &ObjectOptions,
    ) -> Vec<(skerry_types::DeletedObject, Option<ObjectError>)>;

    /// Fetch object metadata.
    async fn get_object_info(
        &self,
        bucket: &str,
        object: &str,
        opts: &ObjectOptions,
    ) -> Result<ObjectInfo, ObjectError>;

    /// List in-progress multipart uploads.
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        delimiter: &str,
        max_uploads: usize,
    ) -> Result<ListMultipartsInfo, ObjectError>;

    /// Walk the bucket namespace in lexical order, sending matching entries
    /// to `sink`. Returns once the walk is fully dispatched; the sink is
    /// dropped (closing the channel) when the walk ends or errors.
    async fn walk(
        &self,
        bucket: &str,
        prefix: &str,
        sink: mpsc::Sender<ObjectInfo>,
        opts: WalkOptions,
    ) -> Result<(), ObjectError>;

    /// Obtain the namespace-lock handle for `(bucket, object)`.
    fn new_ns_lock(&self, bucket: &str, object: &str) -> lock::NsLock;
}

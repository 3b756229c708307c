//! Shared types for the Skerry object store.
//!
//! This crate defines the core wire and disk types used across the Skerry
//! workspace: disk [`Endpoint`]s and their set coordinates, per-version
//! file metadata ([`FileInfo`]), disk and volume descriptors ([`DiskInfo`],
//! [`VolInfo`]), multi-delete bookkeeping ([`ObjectToDelete`],
//! [`DeletedObject`]) and the intra-node [`events`] bus.

pub mod events;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel version ID for the unversioned incarnation of an object.
///
/// An empty version ID and `NULL_VERSION_ID` are equivalent on the delete
/// path and must be normalized to `NULL_VERSION_ID` before any storage call.
pub const NULL_VERSION_ID: &str = "null";

/// Prefix for internal metadata entries (encryption envelope, replication
/// state). Entries under this prefix must round-trip unchanged through any
/// metadata-only update.
pub const RESERVED_METADATA_PREFIX: &str = "x-skerry-internal-";

/// Reserved metadata keys carrying the server-side encryption envelope.
pub const META_SSE_ALGORITHM: &str = "x-skerry-internal-sse-algorithm";
/// Sealed per-object data key, base64.
pub const META_SSE_SEALED_KEY: &str = "x-skerry-internal-sse-sealed-key";
/// KMS key ID the data key is sealed under (sse-kms only).
pub const META_SSE_KMS_KEY_ID: &str = "x-skerry-internal-sse-kms-key-id";
/// Base64 JSON KMS encryption context (sse-kms only).
pub const META_SSE_KMS_CONTEXT: &str = "x-skerry-internal-sse-kms-context";

/// Metadata key carrying the URL-encoded object tag set.
pub const META_OBJECT_TAGGING: &str = "x-amz-tagging";

/// HTTP headers that count as object metadata for filtering purposes,
/// alongside `x-amz-meta-*` entries.
pub const STANDARD_HEADERS: &[&str] = &[
    "content-type",
    "cache-control",
    "content-language",
    "content-encoding",
    "content-disposition",
    "expires",
];

/// Whether `name` is one of the standard headers stored in object metadata.
pub fn is_standard_header(name: &str) -> bool {
    STANDARD_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Location of a disk within the cluster topology: pool, erasure set and
/// slot within the set. All `-1` until the disk joins a set, immutable
/// thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLoc {
    /// Server-pool index.
    pub pool: i32,
    /// Erasure-set index within the pool.
    pub set: i32,
    /// Disk index within the set.
    pub disk: i32,
}

impl Default for DiskLoc {
    fn default() -> Self {
        Self {
            pool: -1,
            set: -1,
            disk: -1,
        }
    }
}

/// Identifies one disk on one node: URL pieces plus the set coordinates
/// assigned after the cluster format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// URL scheme (`http` or `https`).
    pub scheme: String,
    /// `host:port` of the owning node.
    pub host: String,
    /// Path of the disk mount on the node, with a leading slash.
    pub path: String,
    /// Set coordinates, `-1` until assigned.
    pub loc: DiskLoc,
}

impl Endpoint {
    /// Build an endpoint with unassigned set coordinates.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            path: path.into(),
            loc: DiskLoc::default(),
        }
    }

    /// Base URL of the node hosting this disk.
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)
    }
}

// ---------------------------------------------------------------------------
// Disk and volume descriptors
// ---------------------------------------------------------------------------

/// Information about a single disk, as reported by the `disk-info` RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Total capacity in bytes.
    pub total: u64,
    /// Free space in bytes.
    pub free: u64,
    /// Bytes in use.
    pub used: u64,
    /// Inodes free.
    pub free_inodes: u64,
    /// Filesystem type.
    pub fs_type: String,
    /// Whether the disk is part of the root partition.
    pub root_disk: bool,
    /// Whether the disk is currently healing.
    pub healing: bool,
    /// Opaque disk ID assigned at format time.
    pub id: String,
    /// Error text, non-empty when the remote side failed to stat the disk.
    pub error: String,
}

/// Information about a volume (bucket namespace) on a disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolInfo {
    /// Volume name.
    pub name: String,
    /// Creation time.
    pub created: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Per-version file metadata
// ---------------------------------------------------------------------------

/// A single erasure-coded part of an object version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPart {
    /// Part number, 1-based.
    pub number: usize,
    /// Part size in bytes.
    pub size: i64,
    /// Actual (decompressed/decrypted) size in bytes.
    pub actual_size: i64,
    /// ETag of the part.
    pub etag: String,
    /// Optional composite checksum of the part.
    pub checksum: Option<String>,
}

/// Per-version metadata for an object, serialized on the wire and on disk
/// with MessagePack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Volume (bucket) the version lives in.
    pub volume: String,
    /// Object name.
    pub name: String,
    /// Version ID: a UUID string, or [`NULL_VERSION_ID`], or empty.
    pub version_id: String,
    /// Whether this version is a delete marker.
    pub delete_marker: bool,
    /// Modification time of this version.
    pub mod_time: Option<DateTime<Utc>>,
    /// Object size in bytes.
    pub size: i64,
    /// User-defined metadata, including reserved-prefix encryption entries.
    pub metadata: BTreeMap<String, String>,
    /// Parts of the object in part-number order.
    pub parts: Vec<ObjectPart>,
    /// Erasure distribution signature, used by bitrot verification.
    pub erasure_index: usize,
    /// Tier name when the version data has been transitioned.
    pub transition_tier: String,
    /// Remote object name on the transition tier.
    pub transitioned_obj_name: String,
}

impl FileInfo {
    /// Normalize the version ID for the delete path: empty means the null
    /// version.
    pub fn normalized_version_id(&self) -> &str {
        if self.version_id.is_empty() {
            NULL_VERSION_ID
        } else {
            &self.version_id
        }
    }
}

/// A set of versions of one object, as consumed by the bulk version delete
/// RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfoVersions {
    /// Volume the versions live in.
    pub volume: String,
    /// Object name.
    pub name: String,
    /// Versions to delete, latest first.
    pub versions: Vec<FileInfo>,
}

// ---------------------------------------------------------------------------
// Multi-delete bookkeeping
// ---------------------------------------------------------------------------

/// Version purge state carried on replicated deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionPurgeStatus {
    /// No purge in flight.
    #[default]
    Empty,
    /// Purge scheduled on the remote target.
    Pending,
    /// Purge confirmed on all targets.
    Complete,
    /// Purge failed and will be retried.
    Failed,
}

impl VersionPurgeStatus {
    /// Whether no purge is tracked for this version.
    pub fn is_empty(&self) -> bool {
        matches!(self, VersionPurgeStatus::Empty)
    }
}

/// One entry of a multi-delete request plus the replication decision
/// computed for it. Used as the deduplication key in multi-delete; two
/// entries collide iff `(name, version_id)` collide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectToDelete {
    /// Object name, leading slash trimmed.
    pub name: String,
    /// Requested version ID; empty selects the latest version.
    pub version_id: String,
    /// Purge state stamped when replication applies to this delete.
    pub purge_status: VersionPurgeStatus,
    /// Serialized replication decision, opaque to the core.
    pub replicate_decision: String,
}

/// Outcome of one successfully deleted entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletedObject {
    /// Object name.
    pub name: String,
    /// Version ID that was removed, if versioned.
    pub version_id: String,
    /// Whether a delete marker was created instead of a removal.
    pub delete_marker: bool,
    /// Version ID of the created delete marker.
    pub delete_marker_version_id: String,
    /// Purge state after the delete, for replication scheduling.
    pub purge_status: VersionPurgeStatus,
}

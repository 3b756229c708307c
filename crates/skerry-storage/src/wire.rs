//! Request/response payloads specific to the storage RPC wire.

use serde::{Deserialize, Serialize};
use skerry_types::FileInfo;

/// RPC method names, appended to [`STORAGE_REST_PREFIX`](crate::client::STORAGE_REST_PREFIX).
pub mod method {
    pub const HEALTH: &str = "health";
    pub const DISK_INFO: &str = "disk-info";
    pub const MAKE_VOL: &str = "make-vol";
    pub const MAKE_VOL_BULK: &str = "make-vol-bulk";
    pub const LIST_VOLS: &str = "list-vols";
    pub const STAT_VOL: &str = "stat-vol";
    pub const DELETE_VOL: &str = "delete-vol";
    pub const APPEND_FILE: &str = "append-file";
    pub const CREATE_FILE: &str = "create-file";
    pub const WRITE_ALL: &str = "write-all";
    pub const READ_ALL: &str = "read-all";
    pub const READ_FILE: &str = "read-file";
    pub const READ_FILE_STREAM: &str = "read-file-stream";
    pub const READ_VERSION: &str = "read-version";
    pub const WRITE_METADATA: &str = "write-metadata";
    pub const UPDATE_METADATA: &str = "update-metadata";
    pub const DELETE_VERSION: &str = "delete-version";
    pub const DELETE_VERSIONS: &str = "delete-versions";
    pub const CHECK_PARTS: &str = "check-parts";
    pub const VERIFY_FILE: &str = "verify-file";
    pub const RENAME_FILE: &str = "rename-file";
    pub const RENAME_DATA: &str = "rename-data";
    pub const LIST_DIR: &str = "list-dir";
    pub const STAT_INFO_FILE: &str = "stat-info-file";
    pub const READ_MULTIPLE: &str = "read-multiple";
    pub const NS_SCANNER: &str = "ns-scanner";
    pub const DELETE_FILE: &str = "delete-file";
    pub const CLEAN_ABANDONED: &str = "clean-abandoned";
}

/// Query parameter names.
pub mod param {
    pub const DISK_ID: &str = "disk-id";
    pub const VOLUME: &str = "volume";
    pub const VOLUMES: &str = "volumes";
    pub const FILE_PATH: &str = "file-path";
    pub const SRC_VOLUME: &str = "src-volume";
    pub const SRC_PATH: &str = "src-path";
    pub const DST_VOLUME: &str = "dst-volume";
    pub const DST_PATH: &str = "dst-path";
    pub const VERSION_ID: &str = "version-id";
    pub const READ_DATA: &str = "read-data";
    pub const OFFSET: &str = "offset";
    pub const LENGTH: &str = "length";
    pub const COUNT: &str = "count";
    pub const DIR_PATH: &str = "dir-path";
    pub const GLOB: &str = "glob";
    pub const RECURSIVE: &str = "recursive";
    pub const FORCE_DELETE: &str = "force-delete";
    pub const FORCE_DEL_MARKER: &str = "force-del-marker";
    pub const BITROT_ALGO: &str = "bitrot-algo";
    pub const BITROT_HASH: &str = "bitrot-hash";
    pub const SCAN_MODE: &str = "scan-mode";
    pub const TOTAL_VERSIONS: &str = "total-versions";
}

/// Options for the plain file delete RPC.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Delete the path recursively.
    pub recursive: bool,
    /// Delete even when cleanup checks fail.
    pub force: bool,
}

/// Bitrot verification request for sectioned reads.
#[derive(Debug, Clone)]
pub struct BitrotVerifier {
    /// Hash algorithm name (`blake2b`, `sha256`, …).
    pub algorithm: String,
    /// Expected digest.
    pub sum: Vec<u8>,
}

/// Result of the atomic data+metadata rename.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenameDataResp {
    /// Signature over the renamed version set, for cross-disk agreement.
    pub signature: u64,
    /// Error string, empty on success.
    pub err: Option<String>,
}

/// Result of the bitrot verify RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyFileResp {
    /// Error string, empty on success.
    pub err: Option<String>,
}

/// Result of the bulk version delete RPC: one slot per requested version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVersionsResp {
    /// Per-version error strings, `None` on success.
    pub errs: Vec<Option<String>>,
}

/// One entry of the stat-with-glob response stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatInfo {
    /// Matched path, relative to the volume.
    pub name: String,
    /// Size in bytes.
    pub size: i64,
    /// Modification time, unix seconds.
    pub mod_time: i64,
    /// Whether the match is a directory.
    pub dir: bool,
}

/// Multi-read request: fetch several files in one round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadMultipleReq {
    /// Volume to read from.
    pub bucket: String,
    /// Common prefix of all requested files.
    pub prefix: String,
    /// Files to read, order preserved in the response stream.
    pub files: Vec<String>,
    /// Skip files larger than this (0 = no limit).
    pub max_size: i64,
    /// Stop at the first missing file.
    pub abort_on_first_missing: bool,
}

/// One entry of the multi-read response stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadMultipleResp {
    /// Volume the file was read from.
    pub bucket: String,
    /// Common prefix echoed back.
    pub prefix: String,
    /// File name.
    pub file: String,
    /// Whether the file existed.
    pub exists: bool,
    /// Error string when the read failed.
    pub error: String,
    /// File contents when `exists` and no error.
    pub data: Vec<u8>,
    /// Modification time, unix seconds.
    pub mod_time: i64,
}

/// Namespace scanner aggregate for one prefix subtree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataUsageEntry {
    /// Prefix this entry aggregates.
    pub prefix: String,
    /// Objects under the prefix.
    pub objects: u64,
    /// Versions under the prefix.
    pub versions: u64,
    /// Total logical bytes under the prefix.
    pub size: u64,
}

/// Namespace scanner cache, exchanged whole between scans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataUsageCache {
    /// Scan generation, incremented per full sweep.
    pub generation: u64,
    /// Aggregates keyed by prefix.
    pub entries: Vec<DataUsageEntry>,
}

/// Payload of the versions bulk delete request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVersionsReq {
    /// Version sets to delete.
    pub versions: Vec<skerry_types::FileInfoVersions>,
}

/// Body of the metadata write/update RPCs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataReq {
    /// The version record to write.
    pub file_info: FileInfo,
}

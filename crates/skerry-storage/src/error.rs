//! The canonical storage error set and its wire mapping.
//!
//! Storage errors travel over the RPC wire as their display strings; the
//! receiving side matches against the canonical set and reconstructs the
//! variant, so the same condition compares equal no matter which node it
//! was produced on. Unrecognized strings pass through unchanged as
//! [`StorageError::Other`].

/// Errors with local storage semantics, shared by the local disk backend
/// and the remote-disk client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The disk is gone or unreachable; the only state in which a remote
    /// disk is taken offline.
    #[error("disk not found")]
    DiskNotFound,

    /// The disk has no space left.
    #[error("disk path full")]
    DiskFull,

    /// The disk returned I/O errors and is considered faulty.
    #[error("disk is faulty")]
    FaultyDisk,

    /// On-disk data failed a bitrot or structure check.
    #[error("file is corrupted")]
    FileCorrupt,

    /// The volume does not exist.
    #[error("volume not found")]
    VolumeNotFound,

    /// The volume already exists.
    #[error("volume already exists")]
    VolumeExists,

    /// The volume still has entries.
    #[error("volume is not empty")]
    VolumeNotEmpty,

    /// The volume is not accessible.
    #[error("volume access denied")]
    VolumeAccessDenied,

    /// The file does not exist.
    #[error("file not found")]
    FileNotFound,

    /// The requested file version does not exist.
    #[error("file version not found")]
    FileVersionNotFound,

    /// A path component exceeds the filesystem limit.
    #[error("file name too long")]
    FileNameTooLong,

    /// The file is not accessible.
    #[error("file access denied")]
    FileAccessDenied,

    /// An intermediate path component does not exist.
    #[error("path not found")]
    PathNotFound,

    /// The path exists but is not a regular file.
    #[error("not of regular file type")]
    IsNotRegular,

    /// The format file exists but fails to parse.
    #[error("corrupted format")]
    CorruptedFormat,

    /// The disk carries no format file at all.
    #[error("unformatted disk found")]
    UnformattedDisk,

    /// The internode access key is unknown.
    #[error("invalid access key id")]
    InvalidAccessKeyId,

    /// Internode authentication failed.
    #[error("authentication failed")]
    Authentication,

    /// The peer speaks an unsupported RPC API version.
    #[error("unsupported rpc api version")]
    RpcApiVersionUnsupported,

    /// The peer's clock is too far from ours.
    #[error("server time mismatch")]
    ServerTimeMismatch,

    /// The disk was reformatted under us; collapses to
    /// [`StorageError::DiskNotFound`] on receipt.
    #[error("drive is stale")]
    DiskStale,

    /// The stream ended before the expected number of bytes.
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// A failure that has no more specific classification.
    #[error("unexpected error")]
    Unexpected,

    /// A non-canonical error string, passed through unchanged.
    #[error("{0}")]
    Other(String),
}

/// Canonical variants in wire-matching order. `DiskStale` is matched but
/// collapses on receipt, so it is not part of the round-trip set.
const CANONICAL: &[StorageError] = &[
    StorageError::DiskNotFound,
    StorageError::DiskFull,
    StorageError::FaultyDisk,
    StorageError::FileCorrupt,
    StorageError::VolumeNotFound,
    StorageError::VolumeExists,
    StorageError::VolumeNotEmpty,
    StorageError::VolumeAccessDenied,
    StorageError::FileNotFound,
    StorageError::FileVersionNotFound,
    StorageError::FileNameTooLong,
    StorageError::FileAccessDenied,
    StorageError::PathNotFound,
    StorageError::IsNotRegular,
    StorageError::CorruptedFormat,
    StorageError::UnformattedDisk,
    StorageError::InvalidAccessKeyId,
    StorageError::Authentication,
    StorageError::RpcApiVersionUnsupported,
    StorageError::ServerTimeMismatch,
    StorageError::UnexpectedEof,
    StorageError::Unexpected,
];

/// Reconstruct a [`StorageError`] from its wire string.
///
/// Matching is exact over the canonical display strings. `DiskStale`
/// collapses to `DiskNotFound`. Anything else passes through as
/// [`StorageError::Other`].
pub fn to_storage_err(text: &str) -> StorageError {
    if text == StorageError::DiskStale.to_string() {
        return StorageError::DiskNotFound;
    }
    for err in CANONICAL {
        if text == err.to_string() {
            return err.clone();
        }
    }
    StorageError::Other(text.to_string())
}

/// Substrings in peer responses that indicate the peer is shutting down
/// and should be treated as offline.
const SERVER_CLOSED_MARKERS: &[&str] = &["server closed idle connection", "http: Server closed"];

/// Whether `err` is a transport-level failure that must classify the
/// remote disk as [`StorageError::DiskNotFound`]. The sole path by which
/// a remote disk goes offline.
pub fn is_network_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        return true;
    }
    let text = err.to_string();
    SERVER_CLOSED_MARKERS.iter().any(|m| text.contains(m))
}

/// Classify a transport error, collapsing network failures to
/// `DiskNotFound` and mapping anything else through the canonical set.
pub fn classify_transport_err(err: reqwest::Error) -> StorageError {
    if is_network_error(&err) {
        StorageError::DiskNotFound
    } else {
        to_storage_err(&err.to_string())
    }
}

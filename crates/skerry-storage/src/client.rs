//! HTTP RPC client for a single remote disk.
//!
//! [`RemoteDisk`] exposes the full local-disk operation set of a peer
//! node over HTTP. Every call attaches the cached disk ID (the server
//! rejects mismatches — a changed disk ID means the disk was reformatted
//! and must be treated as offline), classifies transport failures through
//! the canonical error set, and fully drains response bodies on every
//! branch.
//!
//! A transport-level failure flips the client offline permanently; only
//! the erasure-set monitor restores it after re-verifying the disk
//! format.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use skerry_types::{DiskInfo, DiskLoc, Endpoint, FileInfo, FileInfoVersions, VolInfo};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use crate::error::{classify_transport_err, to_storage_err, StorageError};
use crate::frames;
use crate::timed::TtlCell;
use crate::wire::{
    method, param, BitrotVerifier, DataUsageCache, DataUsageEntry, DeleteOptions,
    DeleteVersionsReq, DeleteVersionsResp, MetadataReq, ReadMultipleReq, ReadMultipleResp,
    RenameDataResp, StatInfo, VerifyFileResp,
};

/// URL prefix of the storage RPC surface.
pub const STORAGE_REST_PREFIX: &str = "/skerry/storage/v1";

/// TTL of the per-client disk-info cache.
const DISK_INFO_TTL: Duration = Duration::from_secs(1);

/// Per-call timeout for disk-info refreshes.
const DISK_INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call timeout for health probes.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Abstracts a remote disk.
pub struct RemoteDisk {
    endpoint: Endpoint,
    base_url: String,
    http: reqwest::Client,
    /// Sibling client with independent timeouts for health probes, so a
    /// wedged data-plane pool cannot mask a live peer.
    health_http: Option<reqwest::Client>,
    disk_id: OnceLock<String>,
    online: AtomicBool,
    disk_info_cache: TtlCell<DiskInfo>,
}

impl RemoteDisk {
    /// Client for the disk at `endpoint`. `healthcheck` enables the
    /// sibling probe client.
    pub fn new(endpoint: Endpoint, healthcheck: bool) -> Self {
        let base_url = format!("{}{}{}", endpoint.url(), STORAGE_REST_PREFIX, endpoint.path);
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client construction cannot fail");
        let health_http = healthcheck.then(|| {
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(1))
                .timeout(HEALTH_TIMEOUT)
                .build()
                .expect("reqwest client construction cannot fail")
        });

        Self {
            endpoint,
            base_url,
            http,
            health_http,
            disk_id: OnceLock::new(),
            online: AtomicBool::new(true),
            disk_info_cache: TtlCell::new(DISK_INFO_TTL),
        }
    }

    /// The endpoint this client talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Set coordinates of this disk. `-1` until assigned.
    pub fn disk_loc(&self) -> DiskLoc {
        self.endpoint.loc
    }

    /// Assign set coordinates. Done once when the set is assembled.
    pub fn set_disk_loc(&mut self, loc: DiskLoc) {
        self.endpoint.loc = loc;
    }

    /// Cached disk ID. Never a network call; valid once the format has
    /// been verified.
    pub fn disk_id(&self) -> Option<&str> {
        self.disk_id.get().map(String::as_str)
    }

    /// Cache the disk ID. A second call with a different ID is a bug —
    /// the ID never silently changes.
    pub fn set_disk_id(&self, id: String) {
        if let Err(existing) = self.disk_id.set(id.clone()) {
            debug_assert_eq!(existing, id, "disk id must never change");
        }
    }

    /// Whether the transport considers the disk reachable.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn mark_offline(&self) {
        if self.online.swap(false, Ordering::AcqRel) {
            warn!(endpoint = %self.endpoint, "remote disk marked offline");
        }
    }

    /// Restore the online flag. Called by the set-layer monitor after the
    /// disk format has been re-verified, never by this client itself.
    pub fn mark_online(&self) {
        self.online.store(true, Ordering::Release);
    }

    // -------------------------------------------------------------------
    // Call plumbing
    // -------------------------------------------------------------------

    async fn call(
        &self,
        rpc: &str,
        params: &[(&str, String)],
        body: Option<reqwest::Body>,
        length: i64,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, StorageError> {
        if !self.is_online() && rpc != method::HEALTH {
            return Err(StorageError::DiskNotFound);
        }

        let url = format!("{}/{}", self.base_url, rpc);
        let mut req = self
            .http
            .post(&url)
            .query(&[(param::DISK_ID, self.disk_id().unwrap_or_default())])
            .query(params);
        if length > 0 {
            req = req.header(reqwest::header::CONTENT_LENGTH, length);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let err = classify_transport_err(e);
                if err == StorageError::DiskNotFound {
                    self.mark_offline();
                }
                return Err(err);
            }
        };

        if !resp.status().is_success() {
            // Error bodies carry the canonical error string; reading the
            // whole body also drains the connection for reuse.
            let text = resp.text().await.unwrap_or_default();
            return Err(to_storage_err(text.trim()));
        }
        Ok(resp)
    }

    /// Issue a call and discard the response body.
    async fn call_drain(
        &self,
        rpc: &str,
        params: &[(&str, String)],
        body: Option<reqwest::Body>,
        length: i64,
    ) -> Result<(), StorageError> {
        let resp = self.call(rpc, params, body, length, None).await?;
        drain(resp).await;
        Ok(())
    }

    /// Issue a call and decode the whole response body as MessagePack.
    async fn call_decode<T: serde::de::DeserializeOwned>(
        &self,
        rpc: &str,
        params: &[(&str, String)],
        body: Option<reqwest::Body>,
        timeout: Option<Duration>,
    ) -> Result<T, StorageError> {
        let resp = self.call(rpc, params, body, -1, timeout).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|_| StorageError::UnexpectedEof)?;
        frames::decode_frame(&bytes)
    }

    fn msgpack_body<T: serde::Serialize>(value: &T) -> (reqwest::Body, i64) {
        let buf = rmp_serde::to_vec(value).expect("rpc body serialization cannot fail");
        let len = buf.len() as i64;
        (reqwest::Body::from(buf), len)
    }

    // -------------------------------------------------------------------
    // Health and disk info
    // -------------------------------------------------------------------

    /// Probe the disk over the sibling health client. Online iff the
    /// mapped error is not `DiskNotFound`.
    pub async fn check_health(&self) -> bool {
        let Some(health) = &self.health_http else {
            return self.is_online();
        };
        let url = format!("{}/{}", self.base_url, method::HEALTH);
        match health.post(&url).send().await {
            Ok(resp) => {
                let _ = resp.bytes().await;
                true
            }
            Err(e) => classify_transport_err(e) != StorageError::DiskNotFound,
        }
    }

    /// Disk information, cached for one second.
    ///
    /// Offline clients short-circuit without touching the network so that
    /// the cached value cannot mask a dead transport.
    pub async fn disk_info(&self) -> Result<DiskInfo, StorageError> {
        if !self.is_online() {
            return Err(StorageError::DiskNotFound);
        }
        self.disk_info_cache
            .get_with(|| async {
                let info: DiskInfo = self
                    .call_decode(method::DISK_INFO, &[], None, Some(DISK_INFO_TIMEOUT))
                    .await?;
                if !info.error.is_empty() {
                    return Err(to_storage_err(&info.error));
                }
                Ok(info)
            })
            .await
    }

    // -------------------------------------------------------------------
    // Volume operations
    // -------------------------------------------------------------------

    /// Create a volume.
    pub async fn make_vol(&self, volume: &str) -> Result<(), StorageError> {
        self.call_drain(
            method::MAKE_VOL,
            &[(param::VOLUME, volume.to_string())],
            None,
            -1,
        )
        .await
    }

    /// Create several volumes in one round trip.
    pub async fn make_vol_bulk(&self, volumes: &[&str]) -> Result<(), StorageError> {
        self.call_drain(
            method::MAKE_VOL_BULK,
            &[(param::VOLUMES, volumes.join(","))],
            None,
            -1,
        )
        .await
    }

    /// List all volumes.
    pub async fn list_vols(&self) -> Result<Vec<VolInfo>, StorageError> {
        self.call_decode(method::LIST_VOLS, &[], None, None).await
    }

    /// Stat one volume.
    pub async fn stat_vol(&self, volume: &str) -> Result<VolInfo, StorageError> {
        self.call_decode(
            method::STAT_VOL,
            &[(param::VOLUME, volume.to_string())],
            None,
            None,
        )
        .await
    }

    /// Delete a volume.
    pub async fn delete_vol(&self, volume: &str, force: bool) -> Result<(), StorageError> {
        let mut params = vec![(param::VOLUME, volume.to_string())];
        if force {
            params.push((param::FORCE_DELETE, "true".to_string()));
        }
        self.call_drain(method::DELETE_VOL, &params, None, -1).await
    }

    // -------------------------------------------------------------------
    // File data operations
    // -------------------------------------------------------------------

    /// Append to a file.
    pub async fn append_file(
        &self,
        volume: &str,
        path: &str,
        buf: Vec<u8>,
    ) -> Result<(), StorageError> {
        let len = buf.len() as i64;
        self.call_drain(
            method::APPEND_FILE,
            &[
                (param::VOLUME, volume.to_string()),
                (param::FILE_PATH, path.to_string()),
            ],
            Some(reqwest::Body::from(buf)),
            len,
        )
        .await
    }

    /// Create a file from a streaming reader of known size.
    pub async fn create_file<R>(
        &self,
        volume: &str,
        path: &str,
        size: i64,
        reader: R,
    ) -> Result<(), StorageError>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let resp = self
            .call(
                method::CREATE_FILE,
                &[
                    (param::VOLUME, volume.to_string()),
                    (param::FILE_PATH, path.to_string()),
                    (param::LENGTH, size.to_string()),
                ],
                Some(body),
                size,
                None,
            )
            .await?;
        let mut reader = into_reader(resp);
        frames::wait_for_response(&mut reader).await
    }

    /// Overwrite a file with the given bytes.
    pub async fn write_all(
        &self,
        volume: &str,
        path: &str,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let len = data.len() as i64;
        self.call_drain(
            method::WRITE_ALL,
            &[
                (param::VOLUME, volume.to_string()),
                (param::FILE_PATH, path.to_string()),
            ],
            Some(reqwest::Body::from(data)),
            len,
        )
        .await
    }

    /// Read a whole file.
    pub async fn read_all(&self, volume: &str, path: &str) -> Result<Bytes, StorageError> {
        let resp = self
            .call(
                method::READ_ALL,
                &[
                    (param::VOLUME, volume.to_string()),
                    (param::FILE_PATH, path.to_string()),
                ],
                None,
                -1,
                None,
            )
            .await?;
        resp.bytes().await.map_err(|_| StorageError::UnexpectedEof)
    }

    /// Read a section of a file, optionally bitrot-verified server-side.
    pub async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: i64,
        length: usize,
        verifier: Option<&BitrotVerifier>,
    ) -> Result<Bytes, StorageError> {
        let mut params = vec![
            (param::VOLUME, volume.to_string()),
            (param::FILE_PATH, path.to_string()),
            (param::OFFSET, offset.to_string()),
            (param::LENGTH, length.to_string()),
        ];
        match verifier {
            Some(v) => {
                params.push((param::BITROT_ALGO, v.algorithm.clone()));
                params.push((param::BITROT_HASH, hex::encode(&v.sum)));
            }
            None => {
                params.push((param::BITROT_ALGO, String::new()));
                params.push((param::BITROT_HASH, String::new()));
            }
        }
        let resp = self.call(method::READ_FILE, &params, None, -1, None).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|_| StorageError::UnexpectedEof)?;
        if bytes.len() < length {
            return Err(StorageError::UnexpectedEof);
        }
        Ok(bytes)
    }

    /// Stream a section of a file. The caller must drain or drop the
    /// returned reader.
    pub async fn read_file_stream(
        &self,
        volume: &str,
        path: &str,
        offset: i64,
        length: i64,
    ) -> Result<impl AsyncRead + Send + Unpin, StorageError> {
        let resp = self
            .call(
                method::READ_FILE_STREAM,
                &[
                    (param::VOLUME, volume.to_string()),
                    (param::FILE_PATH, path.to_string()),
                    (param::OFFSET, offset.to_string()),
                    (param::LENGTH, length.to_string()),
                ],
                None,
                -1,
                None,
            )
            .await?;
        Ok(into_reader(resp))
    }

    /// Delete a file.
    pub async fn delete(
        &self,
        volume: &str,
        path: &str,
        opts: DeleteOptions,
    ) -> Result<(), StorageError> {
        self.call_drain(
            method::DELETE_FILE,
            &[
                (param::VOLUME, volume.to_string()),
                (param::FILE_PATH, path.to_string()),
                (param::RECURSIVE, opts.recursive.to_string()),
                (param::FORCE_DELETE, opts.force.to_string()),
            ],
            None,
            -1,
        )
        .await
    }

    /// Rename a file.
    pub async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<(), StorageError> {
        self.call_drain(
            method::RENAME_FILE,
            &[
                (param::SRC_VOLUME, src_volume.to_string()),
                (param::SRC_PATH, src_path.to_string()),
                (param::DST_VOLUME, dst_volume.to_string()),
                (param::DST_PATH, dst_path.to_string()),
            ],
            None,
            -1,
        )
        .await
    }

    /// Atomically rename a data+metadata pair into place.
    pub async fn rename_data(
        &self,
        src_volume: &str,
        src_path: &str,
        fi: FileInfo,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<u64, StorageError> {
        let (body, len) = Self::msgpack_body(&MetadataReq { file_info: fi });
        let resp = self
            .call(
                method::RENAME_DATA,
                &[
                    (param::SRC_VOLUME, src_volume.to_string()),
                    (param::SRC_PATH, src_path.to_string()),
                    (param::DST_VOLUME, dst_volume.to_string()),
                    (param::DST_PATH, dst_path.to_string()),
                ],
                Some(body),
                len,
                None,
            )
            .await?;
        let mut reader = into_reader(resp);
        frames::wait_for_response(&mut reader).await?;
        let frame = frames::read_frame(&mut reader)
            .await?
            .ok_or(StorageError::UnexpectedEof)?;
        let rdr: RenameDataResp = frames::decode_frame(&frame)?;
        frames::recycle_buf(frame);
        match rdr.err {
            Some(text) => Err(to_storage_err(&text)),
            None => Ok(rdr.signature),
        }
    }

    /// Remove a path's data directories and inline data not referenced by
    /// its metadata.
    pub async fn clean_abandoned(&self, volume: &str, path: &str) -> Result<(), StorageError> {
        let resp = self
            .call(
                method::CLEAN_ABANDONED,
                &[
                    (param::VOLUME, volume.to_string()),
                    (param::FILE_PATH, path.to_string()),
                ],
                None,
                -1,
                None,
            )
            .await?;
        let mut reader = into_reader(resp);
        frames::wait_for_response(&mut reader).await
    }

    // -------------------------------------------------------------------
    // Metadata operations
    // -------------------------------------------------------------------

    /// Write a fresh metadata record.
    pub async fn write_metadata(
        &self,
        volume: &str,
        path: &str,
        fi: FileInfo,
    ) -> Result<(), StorageError> {
        let (body, len) = Self::msgpack_body(&MetadataReq { file_info: fi });
        self.call_drain(
            method::WRITE_METADATA,
            &[
                (param::VOLUME, volume.to_string()),
                (param::FILE_PATH, path.to_string()),
            ],
            Some(body),
            len,
        )
        .await
    }

    /// Update an existing metadata record in place.
    pub async fn update_metadata(
        &self,
        volume: &str,
        path: &str,
        fi: FileInfo,
    ) -> Result<(), StorageError> {
        let (body, len) = Self::msgpack_body(&MetadataReq { file_info: fi });
        self.call_drain(
            method::UPDATE_METADATA,
            &[
                (param::VOLUME, volume.to_string()),
                (param::FILE_PATH, path.to_string()),
            ],
            Some(body),
            len,
        )
        .await
    }

    /// Read one version's metadata record.
    pub async fn read_version(
        &self,
        volume: &str,
        path: &str,
        version_id: &str,
        read_data: bool,
    ) -> Result<FileInfo, StorageError> {
        self.call_decode(
            method::READ_VERSION,
            &[
                (param::VOLUME, volume.to_string()),
                (param::FILE_PATH, path.to_string()),
                (param::VERSION_ID, version_id.to_string()),
                (param::READ_DATA, read_data.to_string()),
            ],
            None,
            None,
        )
        .await
    }

    /// Delete one version.
    pub async fn delete_version(
        &self,
        volume: &str,
        path: &str,
        fi: FileInfo,
        force_del_marker: bool,
    ) -> Result<(), StorageError> {
        let (body, len) = Self::msgpack_body(&MetadataReq { file_info: fi });
        self.call_drain(
            method::DELETE_VERSION,
            &[
                (param::VOLUME, volume.to_string()),
                (param::FILE_PATH, path.to_string()),
                (param::FORCE_DEL_MARKER, force_del_marker.to_string()),
            ],
            Some(body),
            len,
        )
        .await
    }

    /// Bulk version delete. Returns one slot per requested version set;
    /// a transport failure fills every slot with the same error.
    pub async fn delete_versions(
        &self,
        volume: &str,
        versions: Vec<FileInfoVersions>,
    ) -> Vec<Option<StorageError>> {
        if versions.is_empty() {
            return Vec::new();
        }
        let total = versions.len();
        let (body, len) = Self::msgpack_body(&DeleteVersionsReq { versions });

        let resp = match self
            .call(
                method::DELETE_VERSIONS,
                &[
                    (param::VOLUME, volume.to_string()),
                    (param::TOTAL_VERSIONS, total.to_string()),
                ],
                Some(body),
                len,
                None,
            )
            .await
        {
            Ok(resp) => resp,
            Err(err) => return vec![Some(err); total],
        };

        let mut reader = into_reader(resp);
        if let Err(err) = frames::wait_for_response(&mut reader).await {
            return vec![Some(err); total];
        }
        let frame = match frames::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            _ => return vec![Some(StorageError::UnexpectedEof); total],
        };
        let resp: DeleteVersionsResp = match frames::decode_frame(&frame) {
            Ok(resp) => resp,
            Err(err) => return vec![Some(err); total],
        };
        frames::recycle_buf(frame);

        resp.errs
            .into_iter()
            .map(|e| e.map(|text| to_storage_err(&text)))
            .collect()
    }

    /// Stat all parts referenced by the metadata record.
    pub async fn check_parts(
        &self,
        volume: &str,
        path: &str,
        fi: FileInfo,
    ) -> Result<(), StorageError> {
        let (body, len) = Self::msgpack_body(&MetadataReq { file_info: fi });
        self.call_drain(
            method::CHECK_PARTS,
            &[
                (param::VOLUME, volume.to_string()),
                (param::FILE_PATH, path.to_string()),
            ],
            Some(body),
            len,
        )
        .await
    }

    /// Bitrot-verify all parts of a version server-side.
    pub async fn verify_file(
        &self,
        volume: &str,
        path: &str,
        fi: FileInfo,
    ) -> Result<(), StorageError> {
        let (body, len) = Self::msgpack_body(&MetadataReq { file_info: fi });
        let resp = self
            .call(
                method::VERIFY_FILE,
                &[
                    (param::VOLUME, volume.to_string()),
                    (param::FILE_PATH, path.to_string()),
                ],
                Some(body),
                len,
                None,
            )
            .await?;
        let mut reader = into_reader(resp);
        frames::wait_for_response(&mut reader).await?;
        let frame = frames::read_frame(&mut reader)
            .await?
            .ok_or(StorageError::UnexpectedEof)?;
        let vr: VerifyFileResp = frames::decode_frame(&frame)?;
        frames::recycle_buf(frame);
        match vr.err {
            Some(text) => Err(to_storage_err(&text)),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------
    // Listing and scanning
    // -------------------------------------------------------------------

    /// List a directory, up to `count` entries (`-1` for all).
    pub async fn list_dir(
        &self,
        volume: &str,
        dir_path: &str,
        count: i32,
    ) -> Result<Vec<String>, StorageError> {
        self.call_decode(
            method::LIST_DIR,
            &[
                (param::VOLUME, volume.to_string()),
                (param::DIR_PATH, dir_path.to_string()),
                (param::COUNT, count.to_string()),
            ],
            None,
            None,
        )
        .await
    }

    /// Stat paths matching a glob. The response streams one frame per
    /// match after the status frame.
    pub async fn stat_info_file(
        &self,
        volume: &str,
        path: &str,
        glob: bool,
    ) -> Result<Vec<StatInfo>, StorageError> {
        let resp = self
            .call(
                method::STAT_INFO_FILE,
                &[
                    (param::VOLUME, volume.to_string()),
                    (param::FILE_PATH, path.to_string()),
                    (param::GLOB, glob.to_string()),
                ],
                None,
                -1,
                None,
            )
            .await?;
        let mut reader = into_reader(resp);
        frames::wait_for_response(&mut reader).await?;

        let mut stats = Vec::new();
        while let Some(frame) = frames::read_frame(&mut reader).await? {
            stats.push(frames::decode_frame::<StatInfo>(&frame)?);
            frames::recycle_buf(frame);
        }
        Ok(stats)
    }

    /// Read multiple files in one round trip, pushing each response to
    /// `sink` in request order. The sink closes when the stream ends or
    /// on any error.
    pub async fn read_multiple(
        &self,
        req: ReadMultipleReq,
        sink: mpsc::Sender<ReadMultipleResp>,
    ) -> Result<(), StorageError> {
        let (body, len) = Self::msgpack_body(&req);
        let resp = self
            .call(method::READ_MULTIPLE, &[], Some(body), len, None)
            .await?;
        let mut reader = into_reader(resp);
        frames::wait_for_response(&mut reader).await?;

        while let Some(frame) = frames::read_frame(&mut reader).await? {
            let file: ReadMultipleResp = frames::decode_frame(&frame)?;
            frames::recycle_buf(frame);
            if sink.send(file).await.is_err() {
                // Receiver gone; the caller cancelled. Stop reading.
                return Ok(());
            }
        }
        Ok(())
    }

    /// Bidirectional namespace scan: ship the current cache up, stream
    /// updates to `sink`, and return the refreshed cache.
    ///
    /// The sink closes when the stream ends or on any error. If the
    /// receiver is dropped mid-stream, remaining updates are discarded
    /// but the final cache is still read.
    pub async fn ns_scanner(
        &self,
        cache: &DataUsageCache,
        scan_mode: u8,
        sink: mpsc::Sender<DataUsageEntry>,
    ) -> Result<DataUsageCache, StorageError> {
        let (body, len) = Self::msgpack_body(cache);
        let resp = self
            .call(
                method::NS_SCANNER,
                &[(param::SCAN_MODE, scan_mode.to_string())],
                Some(body),
                len,
                None,
            )
            .await?;
        let mut reader = into_reader(resp);
        frames::wait_for_response(&mut reader).await?;

        let new_cache: DataUsageCache =
            frames::read_update_stream(&mut reader, |update: DataUsageEntry| {
                // try_send keeps the read loop cancellation-safe: a full
                // or dropped receiver never wedges the stream.
                let _ = sink.try_send(update);
            })
            .await?;
        debug!(endpoint = %self.endpoint, generation = new_cache.generation, "ns scan complete");
        Ok(new_cache)
    }
}

impl std::fmt::Display for RemoteDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}

impl std::fmt::Debug for RemoteDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDisk")
            .field("endpoint", &self.endpoint)
            .field("disk_id", &self.disk_id())
            .field("online", &self.is_online())
            .finish()
    }
}

/// Adapt a response body into an `AsyncRead`.
fn into_reader(resp: reqwest::Response) -> impl AsyncRead + Send + Unpin {
    StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other))
}

/// Fully drain a response body so the connection returns to the pool.
async fn drain(resp: reqwest::Response) {
    let mut stream = resp.bytes_stream();
    while let Ok(Some(_)) = stream.try_next().await {}
}

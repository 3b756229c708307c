//! Single-pass verifying reader for upload bodies.
//!
//! [`HashReader`] wraps the request body and checks, while the bytes
//! stream through exactly once: the declared content length, optional
//! MD5/SHA-256 digests, an optional composite checksum, and the
//! policy-imposed min/max byte range. Violations surface as
//! [`HashError`] wrapped in `std::io::Error` at the read boundary.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::Engine as _;
use md5::{Digest as _, Md5};
use sha1::Sha1;
use sha2::Sha256;
use tokio::io::{AsyncRead, ReadBuf};

/// CRC32 (ISO-HDLC) instance for composite checksums.
static CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Verification failures raised by [`HashReader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    /// The body's MD5 did not match the declared `Content-MD5`.
    #[error("content md5 mismatch: expected {expected}, got {got}")]
    BadDigest {
        /// Declared digest, hex.
        expected: String,
        /// Observed digest, hex.
        got: String,
    },

    /// The body's SHA-256 did not match the declared
    /// `x-amz-content-sha256`.
    #[error("content sha256 mismatch: expected {expected}, got {got}")]
    Sha256Mismatch {
        /// Declared digest, hex.
        expected: String,
        /// Observed digest, hex.
        got: String,
    },

    /// The body length did not match the declared size.
    #[error("size mismatch: expected {expected}, got {got}")]
    SizeMismatch {
        /// Declared size.
        expected: i64,
        /// Observed size.
        got: i64,
    },

    /// The body is smaller than the policy's `content-length-range` low
    /// bound.
    #[error("entity too small: {got} < {min}")]
    EntityTooSmall {
        /// Low bound.
        min: i64,
        /// Observed size.
        got: i64,
    },

    /// The body is larger than the policy's `content-length-range` high
    /// bound.
    #[error("entity too large: {got} > {max}")]
    EntityTooLarge {
        /// High bound.
        max: i64,
        /// Observed size.
        got: i64,
    },

    /// The declared composite checksum did not match.
    #[error("checksum mismatch ({algorithm}): expected {expected}, got {got}")]
    ChecksumMismatch {
        /// Algorithm name.
        algorithm: &'static str,
        /// Declared value, base64.
        expected: String,
        /// Observed value, base64.
        got: String,
    },

    /// A declared-header checksum and a trailing checksum were both
    /// requested.
    #[error("cannot combine header and trailing checksums")]
    ConflictingChecksums,

    /// More than one checksum algorithm was declared.
    #[error("multiple checksum algorithms declared")]
    MultipleChecksums,
}

impl From<HashError> for io::Error {
    fn from(e: HashError) -> Self {
        io::Error::other(e)
    }
}

/// Composite checksum algorithms accepted on uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgo {
    Crc32,
    Crc32c,
    Sha1,
    Sha256,
}

impl ChecksumAlgo {
    /// Header carrying this algorithm's declared value.
    pub fn header(&self) -> &'static str {
        match self {
            ChecksumAlgo::Crc32 => "x-amz-checksum-crc32",
            ChecksumAlgo::Crc32c => "x-amz-checksum-crc32c",
            ChecksumAlgo::Sha1 => "x-amz-checksum-sha1",
            ChecksumAlgo::Sha256 => "x-amz-checksum-sha256",
        }
    }

    /// Short algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgo::Crc32 => "CRC32",
            ChecksumAlgo::Crc32c => "CRC32C",
            ChecksumAlgo::Sha1 => "SHA1",
            ChecksumAlgo::Sha256 => "SHA256",
        }
    }

    const ALL: [ChecksumAlgo; 4] = [
        ChecksumAlgo::Crc32,
        ChecksumAlgo::Crc32c,
        ChecksumAlgo::Sha1,
        ChecksumAlgo::Sha256,
    ];
}

/// A declared composite checksum: algorithm plus expected base64 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChecksum {
    /// Declared algorithm.
    pub algo: ChecksumAlgo,
    /// Expected value, base64 as sent by the client.
    pub expected: String,
    /// Whether the value arrives in chunked-upload trailers instead of
    /// headers.
    pub trailing: bool,
}

impl ContentChecksum {
    /// Extract the declared checksum from request/form headers.
    ///
    /// At most one algorithm may be declared; a header value and a
    /// trailer declaration are mutually exclusive.
    pub fn from_headers<'a>(
        mut get: impl FnMut(&str) -> Option<&'a str>,
    ) -> Result<Option<ContentChecksum>, HashError> {
        let trailer = get("x-amz-trailer").map(str::to_ascii_lowercase);
        let mut found: Option<ContentChecksum> = None;

        for algo in ChecksumAlgo::ALL {
            let declared = get(algo.header()).map(str::to_string);
            let trailing = trailer.as_deref() == Some(algo.header());
            if declared.is_none() && !trailing {
                continue;
            }
            if declared.is_some() && trailing {
                return Err(HashError::ConflictingChecksums);
            }
            if found.is_some() {
                return Err(HashError::MultipleChecksums);
            }
            found = Some(ContentChecksum {
                algo,
                expected: declared.unwrap_or_default(),
                trailing,
            });
        }
        Ok(found)
    }
}

enum ChecksumState {
    Crc32(crc::Digest<'static, u32>),
    Crc32c(u32),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl ChecksumState {
    fn new(algo: ChecksumAlgo) -> Self {
        match algo {
            ChecksumAlgo::Crc32 => ChecksumState::Crc32(CRC32.digest()),
            ChecksumAlgo::Crc32c => ChecksumState::Crc32c(0),
            ChecksumAlgo::Sha1 => ChecksumState::Sha1(Sha1::new()),
            ChecksumAlgo::Sha256 => ChecksumState::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumState::Crc32(d) => d.update(data),
            ChecksumState::Crc32c(state) => *state = crc32c::crc32c_append(*state, data),
            ChecksumState::Sha1(h) => h.update(data),
            ChecksumState::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            ChecksumState::Crc32(d) => d.finalize().to_be_bytes().to_vec(),
            ChecksumState::Crc32c(state) => state.to_be_bytes().to_vec(),
            ChecksumState::Sha1(h) => h.finalize().to_vec(),
            ChecksumState::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// The verifying reader. See the module docs.
pub struct HashReader<R> {
    inner: R,
    bytes_read: i64,
    expected_size: i64,
    expected_min: Option<i64>,
    expected_max: Option<i64>,
    expected_md5: Option<Vec<u8>>,
    expected_sha256: Option<Vec<u8>>,
    md5: Md5,
    sha256: Option<Sha256>,
    checksum: Option<(ContentChecksum, ChecksumState)>,
    finished: bool,
    etag: Option<String>,
}

impl<R> HashReader<R> {
    /// Wrap `inner`, expecting `size` bytes (`-1` when unknown) and the
    /// given hex digests when non-empty.
    pub fn new(
        inner: R,
        size: i64,
        md5_hex: &str,
        sha256_hex: &str,
    ) -> Result<Self, HashError> {
        let expected_md5 = if md5_hex.is_empty() {
            None
        } else {
            Some(hex::decode(md5_hex).map_err(|_| HashError::BadDigest {
                expected: md5_hex.to_string(),
                got: String::new(),
            })?)
        };
        let expected_sha256 = if sha256_hex.is_empty() {
            None
        } else {
            Some(
                hex::decode(sha256_hex).map_err(|_| HashError::Sha256Mismatch {
                    expected: sha256_hex.to_string(),
                    got: String::new(),
                })?,
            )
        };

        Ok(Self {
            inner,
            bytes_read: 0,
            expected_size: size,
            expected_min: None,
            expected_max: None,
            sha256: expected_sha256.as_ref().map(|_| Sha256::new()),
            expected_md5,
            expected_sha256,
            md5: Md5::new(),
            checksum: None,
            finished: false,
            etag: None,
        })
    }

    /// Attach a declared composite checksum. Trailing variants are
    /// rejected here; they are only legal on chunked uploads.
    pub fn add_checksum(&mut self, checksum: ContentChecksum) -> Result<(), HashError> {
        if checksum.trailing {
            return Err(HashError::ConflictingChecksums);
        }
        let state = ChecksumState::new(checksum.algo);
        self.checksum = Some((checksum, state));
        Ok(())
    }

    /// Low bound from the policy's `content-length-range`, applied after
    /// form parsing and against the plaintext byte count.
    pub fn set_expected_min(&mut self, min: i64) {
        self.expected_min = Some(min);
    }

    /// High bound from the policy's `content-length-range`.
    pub fn set_expected_max(&mut self, max: i64) {
        self.expected_max = Some(max);
    }

    /// Bytes observed so far.
    pub fn bytes_read(&self) -> i64 {
        self.bytes_read
    }

    /// Hex MD5 of the body; the object ETag. Available after EOF.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn observe(&mut self, data: &[u8]) -> Result<(), HashError> {
        self.bytes_read += data.len() as i64;

        if self.expected_size >= 0 && self.bytes_read > self.expected_size {
            return Err(HashError::SizeMismatch {
                expected: self.expected_size,
                got: self.bytes_read,
            });
        }
        if let Some(max) = self.expected_max {
            if self.bytes_read > max {
                return Err(HashError::EntityTooLarge {
                    max,
                    got: self.bytes_read,
                });
            }
        }

        self.md5.update(data);
        if let Some(sha) = &mut self.sha256 {
            sha.update(data);
        }
        if let Some((_, state)) = &mut self.checksum {
            state.update(data);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), HashError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if self.expected_size >= 0 && self.bytes_read != self.expected_size {
            return Err(HashError::SizeMismatch {
                expected: self.expected_size,
                got: self.bytes_read,
            });
        }
        if let Some(min) = self.expected_min {
            if self.bytes_read < min {
                return Err(HashError::EntityTooSmall {
                    min,
                    got: self.bytes_read,
                });
            }
        }

        let md5 = std::mem::take(&mut self.md5).finalize();
        self.etag = Some(hex::encode(md5));
        if let Some(expected) = &self.expected_md5 {
            if expected.as_slice() != md5.as_slice() {
                return Err(HashError::BadDigest {
                    expected: hex::encode(expected),
                    got: hex::encode(md5),
                });
            }
        }

        if let (Some(expected), Some(sha)) = (&self.expected_sha256, self.sha256.take()) {
            let got = sha.finalize();
            if expected.as_slice() != got.as_slice() {
                return Err(HashError::Sha256Mismatch {
                    expected: hex::encode(expected),
                    got: hex::encode(got),
                });
            }
        }

        if let Some((decl, state)) = self.checksum.take() {
            let got = base64::engine::general_purpose::STANDARD.encode(state.finalize());
            if !decl.expected.is_empty() && decl.expected != got {
                return Err(HashError::ChecksumMismatch {
                    algorithm: decl.algo.name(),
                    expected: decl.expected,
                    got,
                });
            }
        }

        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if filled.is_empty() {
                    // EOF: run the digest and size comparisons exactly once.
                    if let Err(e) = this.finish() {
                        return Poll::Ready(Err(e.into()));
                    }
                    return Poll::Ready(Ok(()));
                }
                let chunk = filled.to_vec();
                if let Err(e) = this.observe(&chunk) {
                    return Poll::Ready(Err(e.into()));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_to_end<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).await?;
        Ok(out)
    }

    fn unwrap_hash_err(e: io::Error) -> HashError {
        e.downcast::<HashError>().expect("expected a hash error")
    }

    #[tokio::test]
    async fn accepts_matching_md5_and_size() {
        let body = b"hello world".as_slice();
        let md5 = hex::encode(md5::Md5::digest(body));
        let mut hr = HashReader::new(body, body.len() as i64, &md5, "").unwrap();
        let out = read_to_end(&mut hr).await.unwrap();
        assert_eq!(out, body);
        assert_eq!(hr.etag(), Some(md5.as_str()));
    }

    #[tokio::test]
    async fn rejects_md5_mismatch() {
        let body = b"hello world".as_slice();
        let wrong = hex::encode(md5::Md5::digest(b"goodbye"));
        let mut hr = HashReader::new(body, -1, &wrong, "").unwrap();
        let err = unwrap_hash_err(read_to_end(&mut hr).await.unwrap_err());
        assert!(matches!(err, HashError::BadDigest { .. }));
    }

    #[tokio::test]
    async fn rejects_short_and_long_bodies() {
        let body = b"four".as_slice();
        let mut hr = HashReader::new(body, 8, "", "").unwrap();
        let err = unwrap_hash_err(read_to_end(&mut hr).await.unwrap_err());
        assert_eq!(err, HashError::SizeMismatch { expected: 8, got: 4 });

        let mut hr = HashReader::new(body, 2, "", "").unwrap();
        let err = unwrap_hash_err(read_to_end(&mut hr).await.unwrap_err());
        assert!(matches!(err, HashError::SizeMismatch { expected: 2, .. }));
    }

    #[tokio::test]
    async fn policy_range_applies_to_plaintext_count() {
        let body = b"0123456789".as_slice();
        let mut hr = HashReader::new(body, -1, "", "").unwrap();
        hr.set_expected_min(4);
        hr.set_expected_max(64);
        read_to_end(&mut hr).await.unwrap();

        let mut hr = HashReader::new(body, -1, "", "").unwrap();
        hr.set_expected_max(4);
        let err = unwrap_hash_err(read_to_end(&mut hr).await.unwrap_err());
        assert!(matches!(err, HashError::EntityTooLarge { max: 4, .. }));

        let mut hr = HashReader::new(body, -1, "", "").unwrap();
        hr.set_expected_min(100);
        let err = unwrap_hash_err(read_to_end(&mut hr).await.unwrap_err());
        assert_eq!(err, HashError::EntityTooSmall { min: 100, got: 10 });
    }

    #[tokio::test]
    async fn composite_checksum_verified_on_eof() {
        let body = b"checksummed content".as_slice();
        let sum = crc32c::crc32c(body);
        let expected = base64::engine::general_purpose::STANDARD.encode(sum.to_be_bytes());

        let mut hr = HashReader::new(body, -1, "", "").unwrap();
        hr.add_checksum(ContentChecksum {
            algo: ChecksumAlgo::Crc32c,
            expected,
            trailing: false,
        })
        .unwrap();
        read_to_end(&mut hr).await.unwrap();

        let mut hr = HashReader::new(body, -1, "", "").unwrap();
        hr.add_checksum(ContentChecksum {
            algo: ChecksumAlgo::Crc32c,
            expected: "AAAAAA==".to_string(),
            trailing: false,
        })
        .unwrap();
        let err = unwrap_hash_err(read_to_end(&mut hr).await.unwrap_err());
        assert!(matches!(
            err,
            HashError::ChecksumMismatch {
                algorithm: "CRC32C",
                ..
            }
        ));
    }

    #[test]
    fn checksum_header_extraction() {
        let headers = [("x-amz-checksum-sha1", "q1YAdP0D7jfYiGSDrqtIBH0BBKs=")];
        let found = ContentChecksum::from_headers(|name| {
            headers.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
        })
        .unwrap()
        .unwrap();
        assert_eq!(found.algo, ChecksumAlgo::Sha1);
        assert!(!found.trailing);

        // Two algorithms at once is an error.
        let headers = [
            ("x-amz-checksum-sha1", "a"),
            ("x-amz-checksum-crc32", "b"),
        ];
        let err = ContentChecksum::from_headers(|name| {
            headers.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
        })
        .unwrap_err();
        assert_eq!(err, HashError::MultipleChecksums);

        // Header value plus a trailer declaration for the same algo.
        let headers = [
            ("x-amz-checksum-crc32", "b"),
            ("x-amz-trailer", "x-amz-checksum-crc32"),
        ];
        let err = ContentChecksum::from_headers(|name| {
            headers.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
        })
        .unwrap_err();
        assert_eq!(err, HashError::ConflictingChecksums);
    }
}

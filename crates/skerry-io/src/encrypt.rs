//! Server-side encryption envelope.
//!
//! Every encrypted object carries a random 256-bit data key sealed under
//! a KEK held by the KMS. The sealed key, the algorithm, and (for
//! SSE-KMS) the KEK ID and encryption context live in the object's
//! reserved-prefix metadata and must round-trip unchanged through any
//! metadata-only update. Key rotation ([`rotate_key`]) unseals the data
//! key under the old KEK and reseals it under the new one without
//! touching object data, so re-rotating an already-rotated object is a
//! no-op transition.
//!
//! [`EncryptReader`] encrypts the plaintext stream in framed AES-256-GCM
//! segments; the ciphertext is what reaches the storage layer.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use rand::RngCore;
use skerry_object::services::{GeneratedKey, Kms, KmsContext, KmsError, KMS_ARN_PREFIX};
use skerry_types::{
    META_SSE_ALGORITHM, META_SSE_KMS_CONTEXT, META_SSE_KMS_KEY_ID, META_SSE_SEALED_KEY,
};
use tokio::io::{AsyncRead, ReadBuf};

/// Plaintext bytes per encrypted segment.
const SEGMENT_SIZE: usize = 64 * 1024;

/// Algorithm values stored in object metadata.
pub const SSE_ALGORITHM_AES256: &str = "AES256";
pub const SSE_ALGORITHM_KMS: &str = "aws:kms";
/// Marker for client-supplied keys; no sealed key is stored, the client
/// presents the key on every request.
pub const SSE_ALGORITHM_C: &str = "SSE-C";

/// Which server-side encryption flavor a request selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseKind {
    /// Internally managed keys.
    S3,
    /// KMS-managed KEK.
    Kms,
    /// Client-supplied key.
    C,
}

/// Envelope failures.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The object carries no encryption envelope.
    #[error("object is not encrypted")]
    NotEncrypted,

    /// The sealed key metadata entry is malformed.
    #[error("malformed sealed key")]
    InvalidSealedKey,

    /// The KMS refused the operation.
    #[error(transparent)]
    Kms(#[from] KmsError),
}

/// Whether the metadata map carries any SSE envelope.
pub fn is_encrypted(metadata: &BTreeMap<String, String>) -> bool {
    metadata.contains_key(META_SSE_ALGORITHM)
}

/// Whether the object is encrypted with SSE-KMS.
pub fn is_sse_kms(metadata: &BTreeMap<String, String>) -> bool {
    metadata.get(META_SSE_ALGORITHM).map(String::as_str) == Some(SSE_ALGORITHM_KMS)
}

/// Whether the object is encrypted with SSE-S3.
pub fn is_sse_s3(metadata: &BTreeMap<String, String>) -> bool {
    metadata.get(META_SSE_ALGORITHM).map(String::as_str) == Some(SSE_ALGORITHM_AES256)
}

/// The object's KMS key ID with any ARN prefix stripped.
pub fn kms_key_id(metadata: &BTreeMap<String, String>) -> Option<&str> {
    metadata
        .get(META_SSE_KMS_KEY_ID)
        .map(|id| strip_arn(id))
}

/// Strip the KMS ARN prefix from a key ID.
pub fn strip_arn(key_id: &str) -> &str {
    key_id.strip_prefix(KMS_ARN_PREFIX).unwrap_or(key_id)
}

/// Write the envelope entries for a freshly generated data key.
pub fn seal_metadata(
    metadata: &mut BTreeMap<String, String>,
    kind: SseKind,
    key: &GeneratedKey,
    context: &KmsContext,
) {
    let b64 = base64::engine::general_purpose::STANDARD;
    metadata.insert(META_SSE_SEALED_KEY.to_string(), b64.encode(&key.sealed));
    match kind {
        SseKind::Kms => {
            metadata.insert(
                META_SSE_ALGORITHM.to_string(),
                SSE_ALGORITHM_KMS.to_string(),
            );
            metadata.insert(META_SSE_KMS_KEY_ID.to_string(), key.key_id.clone());
            if context.is_empty() {
                metadata.remove(META_SSE_KMS_CONTEXT);
            } else {
                let json = serde_json::to_vec(context).expect("context serializes");
                metadata.insert(META_SSE_KMS_CONTEXT.to_string(), b64.encode(json));
            }
        }
        SseKind::S3 | SseKind::C => {
            metadata.insert(
                META_SSE_ALGORITHM.to_string(),
                SSE_ALGORITHM_AES256.to_string(),
            );
            metadata.remove(META_SSE_KMS_KEY_ID);
            metadata.remove(META_SSE_KMS_CONTEXT);
        }
    }
}

/// Read the stored KMS context back out of the envelope.
fn stored_context(metadata: &BTreeMap<String, String>) -> KmsContext {
    metadata
        .get(META_SSE_KMS_CONTEXT)
        .and_then(|b64| {
            base64::engine::general_purpose::STANDARD
                .decode(b64)
                .ok()
        })
        .and_then(|json| serde_json::from_slice(&json).ok())
        .unwrap_or_default()
}

/// Rewrap the object's sealed data key under a new KEK, mutating the
/// reserved-prefix metadata entries in place. Object data is untouched.
pub async fn rotate_key(
    kms: &dyn Kms,
    metadata: &mut BTreeMap<String, String>,
    target: SseKind,
    new_key_id: &str,
    new_context: &KmsContext,
) -> Result<(), CryptoError> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let sealed = metadata
        .get(META_SSE_SEALED_KEY)
        .ok_or(CryptoError::NotEncrypted)?;
    let sealed = b64
        .decode(sealed)
        .map_err(|_| CryptoError::InvalidSealedKey)?;

    let old_key_id = metadata
        .get(META_SSE_KMS_KEY_ID)
        .cloned()
        .unwrap_or_else(|| kms.default_key_id());
    let old_context = stored_context(metadata);

    let plaintext = kms
        .decrypt_key(strip_arn(&old_key_id), &sealed, &old_context)
        .await?;

    let effective_key_id = if new_key_id.is_empty() {
        kms.default_key_id()
    } else {
        strip_arn(new_key_id).to_string()
    };
    let resealed = kms
        .encrypt_key(&effective_key_id, &plaintext, new_context)
        .await?;

    seal_metadata(
        metadata,
        target,
        &GeneratedKey {
            key_id: effective_key_id,
            plaintext,
            sealed: resealed,
        },
        new_context,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// EncryptReader
// ---------------------------------------------------------------------------

/// Encrypting reader: plaintext in, framed AES-256-GCM segments out.
///
/// Each segment is `u32 BE ciphertext length || ciphertext`; the nonce is
/// the segment sequence number, so segments cannot be reordered without
/// failing authentication.
pub struct EncryptReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    seq: u64,
    plain: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    inner_eof: bool,
    done: bool,
}

impl<R> EncryptReader<R> {
    /// Encrypt `inner` under the plaintext data `key` (32 bytes).
    pub fn new(inner: R, key: &[u8]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("data keys are 32 bytes");
        Self {
            inner,
            cipher,
            seq: 0,
            plain: Vec::with_capacity(SEGMENT_SIZE),
            out: Vec::new(),
            out_pos: 0,
            inner_eof: false,
            done: false,
        }
    }

    fn seal_segment(&mut self) -> io::Result<()> {
        let nonce = segment_nonce(self.seq);
        self.seq += 1;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), self.plain.as_slice())
            .map_err(|_| io::Error::other("segment encryption failed"))?;
        self.plain.clear();
        self.out.clear();
        self.out_pos = 0;
        self.out
            .extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        self.out.extend_from_slice(&ciphertext);
        Ok(())
    }
}

fn segment_nonce(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Drain pending ciphertext first.
            if this.out_pos < this.out.len() {
                let n = (this.out.len() - this.out_pos).min(buf.remaining());
                buf.put_slice(&this.out[this.out_pos..this.out_pos + n]);
                this.out_pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            // Fill the current segment from the inner reader.
            while !this.inner_eof && this.plain.len() < SEGMENT_SIZE {
                let mut scratch = [0u8; 8 * 1024];
                let want = scratch.len().min(SEGMENT_SIZE - this.plain.len());
                let mut read_buf = ReadBuf::new(&mut scratch[..want]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let filled = read_buf.filled();
                        if filled.is_empty() {
                            this.inner_eof = true;
                        } else {
                            this.plain.extend_from_slice(filled);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            if this.plain.is_empty() && this.inner_eof {
                // Zero remaining input: emit one final (possibly empty)
                // authenticated segment only if nothing was emitted yet.
                if this.seq == 0 {
                    this.seal_segment()?;
                    this.done = true;
                    continue;
                }
                this.done = true;
                continue;
            }

            this.seal_segment()?;
            if this.inner_eof {
                this.done = true;
            }
        }
    }
}

/// Decrypt a full framed ciphertext stream (tests and the repair path).
pub fn decrypt_segments(key: &[u8], mut data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidSealedKey)?;
    let mut plaintext = Vec::new();
    let mut seq = 0u64;
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(CryptoError::InvalidSealedKey);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        data = &data[4..];
        if data.len() < len {
            return Err(CryptoError::InvalidSealedKey);
        }
        let nonce = segment_nonce(seq);
        seq += 1;
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), &data[..len])
            .map_err(|_| CryptoError::InvalidSealedKey)?;
        plaintext.extend_from_slice(&plain);
        data = &data[len..];
    }
    Ok(plaintext)
}

// ---------------------------------------------------------------------------
// Built-in KMS
// ---------------------------------------------------------------------------

/// KMS backed by a single local master key. Single-node deployments and
/// tests; production points at an external KMS implementing the same
/// trait.
pub struct LocalKms {
    master: Aes256Gcm,
    default_key_id: String,
}

impl LocalKms {
    /// KMS sealing everything under `master`.
    pub fn new(master: [u8; 32], default_key_id: impl Into<String>) -> Self {
        Self {
            master: Aes256Gcm::new_from_slice(&master).expect("master keys are 32 bytes"),
            default_key_id: default_key_id.into(),
        }
    }

    fn aad(key_id: &str, context: &KmsContext) -> Vec<u8> {
        let mut aad = key_id.as_bytes().to_vec();
        // BTreeMap serialization is key-sorted, so the AAD is canonical.
        aad.extend_from_slice(&serde_json::to_vec(context).expect("context serializes"));
        aad
    }
}

#[async_trait::async_trait]
impl Kms for LocalKms {
    async fn generate_key(
        &self,
        key_id: &str,
        context: &KmsContext,
    ) -> Result<GeneratedKey, KmsError> {
        let key_id = if key_id.is_empty() {
            self.default_key_id.clone()
        } else {
            key_id.to_string()
        };
        let mut plaintext = vec![0u8; 32];
        rand::rng().fill_bytes(&mut plaintext);
        let sealed = self.encrypt_key(&key_id, &plaintext, context).await?;
        Ok(GeneratedKey {
            key_id,
            plaintext,
            sealed,
        })
    }

    async fn decrypt_key(
        &self,
        key_id: &str,
        sealed: &[u8],
        context: &KmsContext,
    ) -> Result<Vec<u8>, KmsError> {
        if sealed.len() < 12 {
            return Err(KmsError::UnsealFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(12);
        self.master
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &Self::aad(key_id, context),
                },
            )
            .map_err(|_| KmsError::UnsealFailed)
    }

    async fn encrypt_key(
        &self,
        key_id: &str,
        plaintext: &[u8],
        context: &KmsContext,
    ) -> Result<Vec<u8>, KmsError> {
        if key_id.trim() != key_id || key_id.is_empty() {
            return Err(KmsError::InvalidKeyId(key_id.to_string()));
        }
        let mut nonce = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .master
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &Self::aad(key_id, context),
                },
            )
            .map_err(|e| KmsError::Backend(e.to_string()))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn default_key_id(&self) -> String {
        self.default_key_id.clone()
    }
}

//! Hashed/encrypted reader stack for the Skerry write path.
//!
//! Upload bodies pass through a single-pass [`HashReader`] that enforces
//! declared sizes, digests, composite checksums and policy byte ranges.
//! When server-side encryption is requested, an [`EncryptReader`] is
//! spliced above the hasher: the ciphertext is what reaches the storage
//! layer, wrapped in a second hasher with unknown size and no declared
//! digests.

pub mod encrypt;
pub mod hash;
pub mod limit;

pub use encrypt::{
    decrypt_segments, is_encrypted, is_sse_kms, is_sse_s3, kms_key_id, rotate_key, seal_metadata,
    strip_arn, CryptoError, EncryptReader, LocalKms, SseKind, SSE_ALGORITHM_AES256,
    SSE_ALGORITHM_C, SSE_ALGORITHM_KMS,
};
pub use hash::{ChecksumAlgo, ContentChecksum, HashError, HashReader};
pub use limit::{HardLimitReader, LimitExceeded};

/// Maximum plaintext accepted for a single browser `POST` upload.
pub const MAX_POST_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum input accepted for a fan-out request; the stream must fit in
/// memory so destinations can be written concurrently from one buffer.
pub const MAX_FANOUT_SIZE: u64 = 16 * 1024 * 1024;

//! Length-delimited MessagePack framing for streaming RPC responses.
//!
//! Long responses (namespace scans, bulk verifies, multi-reads) are sent
//! as a sequence of frames, each a 4-byte big-endian length prefix plus a
//! MessagePack payload. The stream opens with keepalive/status frames so
//! that early errors surface synchronously even though the body streams:
//!
//! - empty frame (`len == 0`) — keepalive, skipped;
//! - status frame — `Option<String>`: `None` means the call succeeded and
//!   payload frames follow, `Some(text)` carries a storage error string;
//! - update streams then alternate a `bool` frame (`true` = one more
//!   update follows) with update frames, terminated by a `false` sentinel
//!   and a single final-payload frame.
//!
//! A stream that ends without its sentinel is an error, never a silent
//! truncation.

use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StorageError;

/// Upper bound for a single frame. Data frames carry whole small files
/// (multi-read); metadata frames are far smaller.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Pre-size for pooled frame buffers.
const POOLED_BUF_SIZE: usize = 8 * 1024;

/// Pool of reusable frame buffers, amortizing allocation under high
/// fan-in. Buffers are cleared before reuse; never hold one past the
/// scope of a single call.
static BUF_POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Take a cleared, pre-sized buffer from the pool.
pub fn pooled_buf() -> Vec<u8> {
    let mut pool = BUF_POOL.lock().expect("frame buffer pool poisoned");
    pool.pop()
        .unwrap_or_else(|| Vec::with_capacity(POOLED_BUF_SIZE))
}

/// Return a buffer to the pool.
pub fn recycle_buf(mut buf: Vec<u8>) {
    buf.clear();
    let mut pool = BUF_POOL.lock().expect("frame buffer pool poisoned");
    if pool.len() < 64 {
        pool.push(buf);
    }
}

/// Read one frame. Returns `None` on a clean end of stream (EOF at a
/// frame boundary); anything else mid-frame is [`StorageError::UnexpectedEof`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, StorageError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    // A clean end of stream is only an EOF before the first length byte;
    // anything mid-frame is a truncation error, never silence.
    let first = reader
        .read(&mut len_buf[..1])
        .await
        .map_err(|_| StorageError::UnexpectedEof)?;
    if first == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut len_buf[1..])
        .await
        .map_err(|_| StorageError::UnexpectedEof)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(StorageError::FileCorrupt);
    }

    let mut buf = pooled_buf();
    buf.resize(len, 0);
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|_| StorageError::UnexpectedEof)?;
    Ok(Some(buf))
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await
}

/// Encode a value into a frame appended to `out` (server-side helper).
pub fn push_frame<T: Serialize>(out: &mut Vec<u8>, value: &T) {
    let payload = rmp_serde::to_vec(value).expect("frame serialization cannot fail");
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
}

/// Append a keepalive (empty) frame to `out`.
pub fn push_keepalive(out: &mut Vec<u8>) {
    out.extend_from_slice(&0u32.to_be_bytes());
}

/// Decode one frame payload.
pub fn decode_frame<T: DeserializeOwned>(payload: &[u8]) -> Result<T, StorageError> {
    rmp_serde::from_slice(payload).map_err(|_| StorageError::FileCorrupt)
}

/// Peel keepalive frames and the status frame off a streamed response.
///
/// Returns once the server has committed to success; a status frame
/// carrying an error string is mapped through the canonical set.
pub async fn wait_for_response<R>(reader: &mut R) -> Result<(), StorageError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = read_frame(reader)
            .await?
            .ok_or(StorageError::UnexpectedEof)?;
        if frame.is_empty() {
            continue; // keepalive
        }
        let status: Option<String> = decode_frame(&frame)?;
        recycle_buf(frame);
        return match status {
            None => Ok(()),
            Some(text) => Err(crate::error::to_storage_err(&text)),
        };
    }
}

/// Drive an update stream after [`wait_for_response`]: alternating
/// `bool`/update frames until the `false` sentinel, then one final
/// payload.
///
/// `on_update` receives each decoded update; the final payload is
/// decoded and returned. A missing sentinel or final frame is an error.
pub async fn read_update_stream<R, U, T, F>(
    reader: &mut R,
    mut on_update: F,
) -> Result<T, StorageError>
where
    R: AsyncRead + Unpin,
    U: DeserializeOwned,
    T: DeserializeOwned,
    F: FnMut(U),
{
    loop {
        let frame = read_frame(reader)
            .await?
            .ok_or(StorageError::UnexpectedEof)?;
        let more: bool = decode_frame(&frame)?;
        recycle_buf(frame);
        if !more {
            break;
        }
        let frame = read_frame(reader)
            .await?
            .ok_or(StorageError::UnexpectedEof)?;
        on_update(decode_frame(&frame)?);
        recycle_buf(frame);
    }

    let frame = read_frame(reader)
        .await?
        .ok_or(StorageError::UnexpectedEof)?;
    let final_payload = decode_frame(&frame)?;
    recycle_buf(frame);
    Ok(final_payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_error_surfaces_synchronously() {
        let mut body = Vec::new();
        push_keepalive(&mut body);
        push_keepalive(&mut body);
        push_frame(&mut body, &Some("volume not found".to_string()));

        let mut reader = body.as_slice();
        let err = wait_for_response(&mut reader).await.unwrap_err();
        assert_eq!(err, StorageError::VolumeNotFound);
    }

    #[tokio::test]
    async fn update_stream_delivers_all_updates_then_final() {
        let mut body = Vec::new();
        push_frame(&mut body, &None::<String>);
        for i in 0..3u32 {
            push_frame(&mut body, &true);
            push_frame(&mut body, &i);
        }
        push_frame(&mut body, &false);
        push_frame(&mut body, &"final".to_string());

        let mut reader = body.as_slice();
        wait_for_response(&mut reader).await.unwrap();

        let mut seen = Vec::new();
        let fin: String = read_update_stream(&mut reader, |u: u32| seen.push(u))
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(fin, "final");
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error_not_silence() {
        let mut body = Vec::new();
        push_frame(&mut body, &None::<String>);
        push_frame(&mut body, &true);
        // Stream cut before the update frame.

        let mut reader = body.as_slice();
        wait_for_response(&mut reader).await.unwrap();
        let res: Result<String, _> = read_update_stream(&mut reader, |_: u32| {}).await;
        assert_eq!(res.unwrap_err(), StorageError::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversize_frame_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut reader = body.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap_err(),
            StorageError::FileCorrupt
        );
    }
}

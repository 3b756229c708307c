//! Hard byte-limit reader.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Error raised when a stream exceeds its hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("input exceeds the {limit}-byte limit")]
pub struct LimitExceeded {
    /// The enforced cap.
    pub limit: u64,
}

/// Reader that fails as soon as more than `limit` bytes flow through.
///
/// Unlike a truncating `take()`, exceeding the cap is an error: the
/// caller must reject the request, not silently store a prefix.
pub struct HardLimitReader<R> {
    inner: R,
    remaining: u64,
    limit: u64,
}

impl<R> HardLimitReader<R> {
    /// Cap `inner` at `limit` bytes.
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            limit,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HardLimitReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                if n > this.remaining {
                    return Poll::Ready(Err(io::Error::other(LimitExceeded {
                        limit: this.limit,
                    })));
                }
                this.remaining -= n;
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

    #[tokio::test]
    async fn passes_streams_within_limit() {
        let mut r = HardLimitReader::new(&b"under the cap"[..], 64);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"under the cap");
    }

    #[tokio::test]
    async fn rejects_oversize_streams() {
        let body = vec![0u8; 100];
        let mut r = HardLimitReader::new(body.as_slice(), 50);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        let inner = err.downcast::<LimitExceeded>().unwrap();
        assert_eq!(inner.limit, 50);
    }
}

//! Byte-counting connection wrapper (section 4.1 "TrafficConn"). The
//! original tracked sent/received totals on plain `int64` fields guarded by
//! the enclosing connection's own mutex; ported here as independent atomics
//! behind an `Arc` so the counters can be read from a log line or a future
//! metrics exporter without taking any lock the dispatcher holds.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

#[derive(Clone, Default)]
pub struct TrafficStats(Arc<Counters>);

impl TrafficStats {
    pub fn new() -> Self {
        TrafficStats::default()
    }

    pub fn sent(&self) -> u64 {
        self.0.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.0.received.load(Ordering::Relaxed)
    }
}

pub struct TrafficConn<S> {
    inner: S,
    stats: TrafficStats,
}

impl<S> TrafficConn<S> {
    pub fn new(inner: S) -> Self {
        TrafficConn { inner, stats: TrafficStats::new() }
    }

    pub fn with_stats(inner: S, stats: TrafficStats) -> Self {
        TrafficConn { inner, stats }
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats.clone()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrafficConn<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if res.is_ready() {
            let gained = buf.filled().len().saturating_sub(before) as u64;
            if gained > 0 {
                this.stats.0.received.fetch_add(gained, Ordering::Relaxed);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrafficConn<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = &res {
            this.stats.0.sent.fetch_add(*n as u64, Ordering::Relaxed);
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counters_track_bytes_moved_over_a_duplex_pair() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut wrapped = TrafficConn::new(a);
        let stats = wrapped.stats();

        wrapped.write_all(b"hello").await.unwrap();
        wrapped.flush().await.unwrap();
        assert_eq!(stats.sent(), 5);

        b.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(stats.received(), 6);
    }
}

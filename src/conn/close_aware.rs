//! Probe-write connection wrapper (section 4.1 "CloseAwareConn"). A pooled
//! upstream socket may have been half-closed by the far end while idle in
//! the pool; the first write issued against it after reuse is split so a
//! single byte probes liveness before the rest of the request is committed.
//! If the probe byte fails, a fresh dial replaces the socket and the whole
//! buffer is retried there instead of surfacing a spurious broken-pipe to
//! the client.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

type RedialFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;
type Redialer = Box<dyn Fn() -> RedialFuture + Send + Sync>;

pub struct CloseAwareConn {
    inner: TcpStream,
    redialer: Redialer,
    probed: bool,
    redialed: bool,
}

impl CloseAwareConn {
    pub fn new(inner: TcpStream, redialer: Redialer) -> Self {
        CloseAwareConn { inner, redialer, probed: false, redialed: false }
    }

    /// Marks the connection as freshly pulled from the pool: the next write
    /// will be probed before it is trusted.
    pub fn reset(&mut self) {
        self.probed = false;
    }

    pub fn did_redial(&self) -> bool {
        self.redialed
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        &mut self.inner
    }

    pub fn into_inner(self) -> TcpStream {
        self.inner
    }

    /// Writes `buf`, probing with its first byte on the first call after a
    /// `reset()`. Redials transparently on a dead socket and retries the
    /// whole buffer there.
    pub async fn write_guarded(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if self.probed {
            return self.inner.write_all(buf).await;
        }
        self.probed = true;

        let (probe, rest) = buf.split_at(1);
        match self.inner.write(probe).await {
            Ok(n) if n == 1 => {
                if !rest.is_empty() {
                    self.inner.write_all(rest).await?;
                }
                Ok(())
            }
            _ => {
                self.inner = (self.redialer)().await?;
                self.redialed = true;
                self.inner.write_all(buf).await
            }
        }
    }

    /// Zero-byte non-blocking peek used to pre-emptively detect a
    /// half-closed pooled socket before a write is even attempted.
    pub async fn is_dead(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match self.inner.try_read(&mut probe) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn live_socket_writes_without_redialing() {
        let (client, mut server) = loopback_pair().await;
        let mut conn = CloseAwareConn::new(client, Box::new(|| Box::pin(async { unreachable!() })));
        conn.write_guarded(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(!conn.did_redial());
    }

    #[tokio::test]
    async fn dead_socket_triggers_redial_and_retries_full_buffer() {
        let (client, server) = loopback_pair().await;
        drop(server);
        // give the peer's FIN a moment to land
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (_replacement_client, mut replacement_server) = loopback_pair().await;
        let replacement_addr = replacement_server.local_addr().unwrap();
        let redialer: Redialer = Box::new(move || {
            Box::pin(async move { TcpStream::connect(replacement_addr).await })
        });
        let mut conn = CloseAwareConn::new(client, redialer);

        conn.write_guarded(b"retry-me").await.unwrap();
        let mut buf = [0u8; 8];
        replacement_server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"retry-me");
        assert!(conn.did_redial());
    }
}

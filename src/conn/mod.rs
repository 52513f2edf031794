//! Connection substrate (section 4.1). Grounded on `conn.go`'s `TimedConn`
//! and `CloseAwareConn`, plus `local_conn_pool.rs`'s use of owned sockets
//! behind small wrapper types rather than trait objects.

pub mod close_aware;
pub mod timed;
pub mod traffic;

pub use close_aware::CloseAwareConn;
pub use timed::TimedConn;
pub use traffic::{TrafficConn, TrafficStats};

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

/// Dials `addr`, applying the same `TCP_NODELAY` + connect-timeout
/// treatment as the original's `net.DialTimeout` call site.
pub async fn dial(addr: SocketAddr, connect_timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

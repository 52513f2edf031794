//! Timed connection wrapper (section 4.1). Grounded on `conn.go`'s
//! `TimedConn`. Three timeout modes selected by the sign of `timeout`:
//!
//! - `> 0`: one-shot absolute deadline on the next I/O, then cleared.
//! - `== 0`: no deadline.
//! - `< 0`: sliding deadline of `|timeout|` seconds, refreshed only once
//!   `time_since_last_refresh >= min(30s, |timeout| / 2)`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy)]
enum Mode {
    None,
    Absolute,
    Sliding { period: Duration },
}

pub struct TimedConn<S = TcpStream> {
    inner: S,
    mode: Mode,
    last_refresh: Option<Instant>,
    /// Deadline currently armed on `inner`, enforced manually because
    /// `tokio::net::TcpStream` has no per-call deadline primitive; callers
    /// race the underlying I/O against a `tokio::time::sleep_until`.
    deadline: Option<Instant>,
}

impl<S> TimedConn<S> {
    pub fn new(inner: S) -> Self {
        TimedConn { inner, mode: Mode::None, last_refresh: None, deadline: None }
    }

    /// Sets read/write timeout: absolute if `timeout > 0`, sliding if
    /// `timeout < 0` (internally doubled since the sliding deadline is only
    /// re-armed at `|timeout|/2`, i.e. the deadline itself must cover two
    /// refresh periods), no timeout if `timeout == 0`.
    pub fn set_timeout(&mut self, timeout_secs: i64) {
        match timeout_secs.cmp(&0) {
            std::cmp::Ordering::Greater => {
                self.mode = Mode::Absolute;
                self.deadline = Some(Instant::now() + Duration::from_secs(timeout_secs as u64));
            }
            std::cmp::Ordering::Less => {
                let doubled = (-timeout_secs) as u64 * 2;
                self.mode = Mode::Sliding { period: Duration::from_secs(doubled) };
                self.last_refresh = None;
                self.refresh_if_needed(true);
            }
            std::cmp::Ordering::Equal => {
                self.mode = Mode::None;
                self.deadline = None;
            }
        }
    }

    fn refresh_if_needed(&mut self, force: bool) {
        match self.mode {
            Mode::Absolute => {
                // one-shot: cleared after arming once
                if self.deadline.is_none() {
                    // nothing armed; absolute deadlines are only set by
                    // `set_timeout`, matching `conn.go` where the absolute
                    // case clears `tc.timeout` immediately after arming.
                }
            }
            Mode::Sliding { period } => {
                let min_refresh = period.min(Duration::from_secs(30));
                let due = force
                    || self.last_refresh.map(|t| t.elapsed() >= min_refresh).unwrap_or(true);
                if due {
                    self.deadline = Some(Instant::now() + period);
                    self.last_refresh = Some(Instant::now());
                }
            }
            Mode::None => {}
        }
    }

    pub fn deadline(&mut self) -> Option<Instant> {
        self.refresh_if_needed(false);
        let d = self.deadline;
        if matches!(self.mode, Mode::Absolute) {
            self.mode = Mode::None;
        }
        d
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl AsyncRead for TimedConn<TcpStream> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.refresh_if_needed(false);
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TimedConn<TcpStream> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.refresh_if_needed(false);
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_timeout_arms_then_clears() {
        let mut t = TimedConn::new(());
        t.set_timeout(5);
        assert!(matches!(t.mode, Mode::Absolute));
        let d = t.deadline();
        assert!(d.is_some());
        assert!(matches!(t.mode, Mode::None));
    }

    #[test]
    fn zero_timeout_clears_deadline() {
        let mut t = TimedConn::new(());
        t.set_timeout(5);
        t.set_timeout(0);
        assert!(t.deadline().is_none());
    }

    #[test]
    fn sliding_timeout_refresh_period_caps_at_30s() {
        let mut t = TimedConn::new(());
        t.set_timeout(-120); // doubled internally to 240s, refresh period min(30, 240/2)=30
        if let Mode::Sliding { period } = t.mode {
            assert_eq!(period, Duration::from_secs(240));
        } else {
            panic!("expected sliding mode");
        }
    }
}

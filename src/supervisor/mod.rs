//! Process supervisor (section 4.9). Grounded on `config.go`'s reload loop
//! and `proxy.go`'s accept loops: one task per listener, one task per
//! accepted connection, a `notify` file watcher plus a poll fallback
//! driving hot-reload, and a coarse stop flag accept loops observe between
//! iterations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::TcpListener;

use crate::auth::kerberos::KerberosStore;
use crate::config::{self, CliOverrides, Config};
use crate::dispatcher::Dispatcher;
use crate::pool::Pool;

/// `DEFAULT_CONNECT_TIMEOUT` from `global.go`.
pub const DEFAULT_CONNECT_TIMEOUT: i64 = 10;
/// `DEFAULT_CLOSE_TIMEOUT` from `global.go`.
pub const DEFAULT_CLOSE_TIMEOUT: i64 = 10;
/// Interval the file-watcher's poll fallback runs at, independent of
/// filesystem notification delivery.
pub const RELOAD_TEST_TIMEOUT: u64 = 10;
/// Reload is forced at this cadence even with no observed file change, to
/// recover from a watcher that silently stopped delivering events.
pub const RELOAD_FORCE_TIMEOUT: u64 = 3600;
/// KDC connectivity probe timeout used by the Kerberos store's DNS
/// expansion cache.
pub const KDC_TEST_TIMEOUT: u64 = 10;

const POOL_VACUUM_INTERVAL: Duration = Duration::from_secs(30);

pub struct Supervisor {
    /// Shared behind its own `Arc` (not just `ArcSwap<Config>`) so each
    /// `Dispatcher` can hold the same live pointer the supervisor writes to
    /// and compare its captured generation against it on keep-alive reuse.
    config: Arc<ArcSwap<Config>>,
    overrides: CliOverrides,
    config_path: Option<PathBuf>,
    pool: Arc<Pool>,
    kerberos: Arc<KerberosStore>,
    stopped: AtomicBool,
}

impl Supervisor {
    /// Builds listeners from the initial config (`bind:port` for HTTP,
    /// `bind:socksPort` for SOCKS5).
    pub async fn init(overrides: CliOverrides) -> anyhow::Result<Arc<Self>> {
        let config = config::load(&overrides).await?;
        let kerberos = Arc::new(KerberosStore::new()?);
        let pool = Pool::new(config.pool_enabled);
        Ok(Arc::new(Supervisor {
            config_path: overrides.config_path.clone(),
            config: Arc::new(ArcSwap::from(config)),
            overrides,
            pool,
            kerberos,
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Runs the HTTP and SOCKS5 accept loops plus the reload watcher and
    /// pool vacuum task until `stop()` is called.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let config = self.config.load_full();
        let http_listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
        tracing::info!(bind = %config.bind, port = config.port, "HTTP listener started");

        let socks_listener = if config.socks_port != 0 {
            let l = TcpListener::bind((config.bind.as_str(), config.socks_port)).await?;
            tracing::info!(bind = %config.bind, port = config.socks_port, "SOCKS listener started");
            Some(l)
        } else {
            None
        };

        let http_task = tokio::spawn(self.clone().accept_http(http_listener));
        let socks_task = socks_listener.map(|l| tokio::spawn(self.clone().accept_socks(l)));
        let reload_task = tokio::spawn(self.clone().reload_loop());
        let vacuum_task = tokio::spawn(self.clone().vacuum_loop());

        let _ = http_task.await;
        if let Some(t) = socks_task {
            let _ = t.await;
        }
        reload_task.abort();
        vacuum_task.abort();
        Ok(())
    }

    async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.is_stopped() {
                break;
            }
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if !self.acl_allows(&peer) {
                        tracing::warn!(%peer, "connection rejected by ACL");
                        continue;
                    }
                    let config = self.config.load_full();
                    let dispatcher = Dispatcher::new(config, self.config.clone(), self.pool.clone(), self.kerberos.clone());
                    tokio::spawn(dispatcher.handle_http_connection(stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "HTTP accept failed");
                }
            }
        }
    }

    async fn accept_socks(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.is_stopped() {
                break;
            }
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if !self.acl_allows(&peer) {
                        tracing::warn!(%peer, "connection rejected by ACL");
                        continue;
                    }
                    let config = self.config.load_full();
                    let dispatcher = Dispatcher::new(config, self.config.clone(), self.pool.clone(), self.kerberos.clone());
                    tokio::spawn(crate::socks::handle_connection(dispatcher, stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SOCKS accept failed");
                }
            }
        }
    }

    fn acl_allows(&self, peer: &std::net::SocketAddr) -> bool {
        let acl = &self.config.load().acl;
        if acl.is_empty() {
            return true;
        }
        acl.iter().any(|allowed| allowed == &peer.ip().to_string())
    }

    async fn vacuum_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(POOL_VACUUM_INTERVAL);
        loop {
            ticker.tick().await;
            if self.is_stopped() {
                break;
            }
            self.pool.vacuum();
        }
    }

    /// Watches the config file (`notify`) with a poll fallback and a
    /// forced-reload ceiling, per section 4.9.
    async fn reload_loop(self: Arc<Self>) {
        let Some(path) = self.config_path.clone() else { return };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let watcher = build_watcher(path.clone(), tx);
        let _watcher = match watcher {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(error = %e, "file watcher unavailable, falling back to polling only");
                None
            }
        };

        let mut last_forced = tokio::time::Instant::now();
        loop {
            if self.is_stopped() {
                break;
            }
            let woke_by_event = tokio::time::timeout(Duration::from_secs(RELOAD_TEST_TIMEOUT), rx.recv()).await.is_ok();
            let forced = last_forced.elapsed() >= Duration::from_secs(RELOAD_FORCE_TIMEOUT);
            if !woke_by_event && !forced {
                continue;
            }
            last_forced = tokio::time::Instant::now();
            if let Err(e) = self.try_reload().await {
                tracing::warn!(error = %e, "config reload rejected");
            }
        }
    }

    async fn try_reload(&self) -> anyhow::Result<()> {
        let candidate = config::load(&self.overrides).await?;
        let incomplete = candidate.incomplete_used_credentials();
        if !incomplete.is_empty() {
            anyhow::bail!("hot reload requires new credentials: {} credential(s) still incomplete", incomplete.len());
        }
        let generation = self.config.load().generation + 1;
        let mut next = Arc::try_unwrap(candidate).map_err(|_| anyhow::anyhow!("config still referenced"))?;
        next.generation = generation;
        self.config.store(Arc::new(next));
        tracing::info!(generation, "configuration reloaded");
        Ok(())
    }
}

fn build_watcher(
    path: PathBuf,
    tx: tokio::sync::mpsc::UnboundedSender<notify::Event>,
) -> notify::Result<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

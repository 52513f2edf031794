//! Per-connection HTTP state machine (section 4.7). Grounded on `proxy.go`'s
//! request loop: read a request head, match a rule, authenticate against
//! the winning upstream, relay the body, and either keep the client
//! connection alive or close it, looping until the peer hangs up.

pub mod forward;
mod mitm;
pub mod sticky;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use base64::Engine as _;
use once_cell::sync::OnceCell;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::auth::kerberos::KerberosStore;
use crate::auth::{self, AuthPlan};
use crate::certs::CertsManager;
use crate::config::model::{Config, Proxy};
use crate::config::schema::ProxyType;
use crate::conn::{self, CloseAwareConn, TimedConn, TrafficConn};
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::http::codec::{self, HeaderBlock, RequestLine};
use crate::logging::redact_auth_header;
use crate::pool::{Acquired, Pool};
use crate::rules::HostCache;

static NEXT_REQUEST_ID: AtomicU32 = AtomicU32::new(1);

/// Upstream-EOF retries allowed before a request fails outright (section
/// 4.7, 7): the classic race where a pooled socket the peer already closed
/// still looks alive until we try to read a response from it.
const MAX_EOF_RETRIES: u32 = 3;

pub struct Dispatcher {
    pub config: Arc<Config>,
    /// The supervisor's live config pointer. `config` above is this
    /// dispatcher's captured snapshot; comparing its generation against
    /// `live_config.load().generation` is how a keep-alive loop notices a
    /// hot-reload happened underneath it.
    live_config: Arc<ArcSwap<Config>>,
    cache: HostCache,
    pool: Arc<Pool>,
    kerberos: Arc<KerberosStore>,
    sticky: sticky::StickyMap,
    certs: OnceCell<Arc<CertsManager>>,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, live_config: Arc<ArcSwap<Config>>, pool: Arc<Pool>, kerberos: Arc<KerberosStore>) -> Arc<Self> {
        Arc::new(Dispatcher {
            cache: HostCache::new(config.hosts_cache_enabled),
            live_config,
            pool,
            kerberos,
            sticky: sticky::StickyMap::new(),
            certs: OnceCell::new(),
            config,
        })
    }

    /// Lazily builds the leaf-certificate manager the first time a MITM
    /// rule actually fires, so hosts with no `mitm: true` rule never pay
    /// for CA/leaf issuance.
    fn certs_manager(&self) -> anyhow::Result<Arc<CertsManager>> {
        if let Some(mgr) = self.certs.get() {
            return Ok(mgr.clone());
        }
        let ca = crate::certs::ca_store()?;
        let mgr = Arc::new(CertsManager::new(ca, &[])?);
        Ok(self.certs.get_or_init(|| mgr).clone())
    }

    /// Drives one accepted client connection until it closes or keep-alive
    /// is denied.
    pub async fn handle_http_connection(self: Arc<Self>, client: TcpStream, peer: SocketAddr) {
        let mut timed = TimedConn::new(client);
        timed.set_timeout(self.config.timeouts.connect);
        let mut reader = BufReader::new(timed);

        loop {
            let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
            match self.serve_one(&mut reader, peer, request_id).await {
                Ok(true) => {
                    if self.live_config.load().generation != self.config.generation {
                        tracing::debug!(%request_id, %peer, "config reloaded since this connection was accepted, declining keep-alive reuse");
                        break;
                    }
                    reader.get_mut().set_timeout(self.config.timeouts.connect);
                    continue;
                }
                Ok(false) => break,
                Err(e) => {
                    tracing::debug!(%request_id, %peer, error = %e, "closing client connection");
                    break;
                }
            }
        }
    }

    /// Serves one request on `reader`, returning `Ok(true)` if the
    /// connection should stay open for another request.
    async fn serve_one(&self, reader: &mut BufReader<TimedConn<TcpStream>>, peer: SocketAddr, request_id: u32) -> Result<bool> {
        let head_result = match timeout_duration(self.config.timeouts.connect) {
            Some(d) => tokio::time::timeout(d, codec::read_request_head(reader)).await.map_err(|_| TransportError::Timeout)?,
            None => codec::read_request_head(reader).await,
        };
        let (request_line, headers) = match head_result {
            Ok(head) => head,
            Err(ProtocolError::Eof) => return Ok(false),
            Err(_) => {
                self.write_simple_status(reader, 400, "Bad Request").await?;
                return Ok(false);
            }
        };

        if request_line.method.eq_ignore_ascii_case("CONNECT") {
            return self.handle_connect(reader, &request_line, &headers, peer, request_id).await;
        }

        if request_line.method.eq_ignore_ascii_case("GET") && request_line.target.split('?').next() == Some("/proxy.pac") {
            return self.serve_pac(reader).await.map(|_| false);
        }

        let rewrite = codec::rewrite_direct_uri(&request_line.target);
        if rewrite.as_ref().map(|r| r.direct_to_connect).unwrap_or(false) {
            let rewrite = rewrite.unwrap();
            return self.handle_direct_to_connect(reader, &request_line, &headers, &rewrite, request_id).await;
        }
        let effective_target = rewrite.as_ref().map(|r| r.rewritten_target.as_str()).unwrap_or(&request_line.target);

        let host_port = match codec::host_port_from_target(effective_target).or_else(|| headers.get("host").map(str::to_string)) {
            Some(hp) => hp,
            None => {
                self.write_simple_status(reader, 400, "Bad Request").await?;
                return Ok(false);
            }
        };

        let outcome = match crate::rules::match_request(&self.config, &self.cache, "http:", &self.config.rules, effective_target, &host_port) {
            Some(o) => o,
            None => {
                self.write_simple_status(reader, 400, "Bad Request").await?;
                tracing::debug!(%request_id, %host_port, "no rule matches, replying 400");
                return Ok(false);
            }
        };

        let matched_rule = self
            .config
            .rules
            .iter()
            .find(|r| outcome.proxies.iter().any(|p| r.all_proxy_names().contains(&p.name)));

        let mut candidate_names: Vec<String> = outcome.proxies.iter().map(|p| p.name.clone()).collect();
        if let Some(rule) = matched_rule {
            self.sticky.order(&rule.host_pattern, &mut candidate_names);
        }
        let primary_proxy = candidate_names
            .first()
            .and_then(|n| outcome.proxies.iter().find(|p| &p.name == n))
            .cloned();
        let Some(primary_proxy) = primary_proxy else {
            self.write_simple_status(reader, 400, "Bad Request").await?;
            return Ok(false);
        };

        if auth::requires_client_credentials(&primary_proxy) && headers.get("proxy-authorization").is_none() {
            self.send_407(reader, &primary_proxy.name).await?;
            return Ok(false);
        }

        let origin_host = origin_host_of(&host_port);
        let candidates = failover_candidates(&candidate_names, &outcome.proxies, &host_port);

        let keep_alive = headers.keep_alive(request_line.version);
        let start_line = format!("{} {} {}", request_line.method, effective_target, request_line.version.as_str());
        let has_body = headers.is_chunked() || headers.content_length().unwrap_or(0) > 0;

        let mut last_err: Option<Error> = None;
        let mut selected = None;
        for (proxy, upstream_host_port) in &candidates {
            let auth_plan = self.build_auth_plan(proxy, upstream_host_port, &headers)?;
            let pool_key = crate::pool::pool_key("tcp", upstream_host_port, auth_plan.context_hash(), &origin_host);
            match self.acquire_upstream(&pool_key, upstream_host_port).await {
                Ok(conn) => {
                    selected = Some((proxy.clone(), upstream_host_port.clone(), pool_key, auth_plan, conn));
                    break;
                }
                Err(Error::Transport(te)) if te.could_retry() => {
                    tracing::debug!(%request_id, host = %upstream_host_port, error = %te, "upstream dial failed, trying next candidate");
                    last_err = Some(Error::Transport(te));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        let Some((proxy, upstream_host_port, pool_key, auth_plan, mut upstream)) = selected else {
            return Err(last_err.unwrap_or_else(|| Error::ConfigInvalid("no usable upstream candidate".to_string())));
        };

        let token = auth::produce_token(&auth_plan, &self.kerberos, &self.config.krb5).await.ok();
        let mut extra_headers = Vec::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            extra_headers.push(("Proxy-Authorization".to_string(), token));
        }

        let use_proxy_connection = !matches!(proxy.kind, ProxyType::Direct | ProxyType::Socks | ProxyType::None);

        forward::write_head(upstream.get_mut(), &start_line, &headers, keep_alive, use_proxy_connection, &extra_headers)
            .await
            .map_err(TransportError::Io)?;

        let mut request_bytes = 0u64;
        if headers.is_chunked() {
            request_bytes = crate::http::chunked::copy_chunked_body(reader, upstream.get_mut()).await?;
        } else if let Some(len) = headers.content_length() {
            if len > 0 {
                request_bytes = forward::copy_fixed_length(reader, upstream.get_mut(), len).await?;
            }
        }

        let client_keep_alive;
        let (status, response_bytes);
        {
            let mut attempt = 0u32;
            let head = loop {
                attempt += 1;
                let mut upstream_reader = BufReader::new(upstream.get_mut());
                match codec::read_response_head(&mut upstream_reader).await {
                    Ok(head) => break head,
                    Err(ProtocolError::Eof) if attempt < MAX_EOF_RETRIES && !has_body => {
                        tracing::debug!(%request_id, attempt, host = %upstream_host_port, "upstream closed before responding, retrying on a fresh connection");
                        upstream = self.dial_fresh_upstream(&upstream_host_port).await?;
                        forward::write_head(upstream.get_mut(), &start_line, &headers, keep_alive, use_proxy_connection, &extra_headers)
                            .await
                            .map_err(TransportError::Io)?;
                    }
                    Err(e) => return Err(Error::Protocol(e)),
                }
            };
            let (status_line, resp_headers) = head;

            if let Some(rule) = matched_rule {
                self.sticky.remember(&rule.host_pattern, &proxy.name);
            }

            client_keep_alive = keep_alive && resp_headers.keep_alive(status_line.version);
            let final_version = request_line.version.min(status_line.version);
            let resp_line = format!("{} {} {}", final_version.as_str(), status_line.code, status_line.reason);
            forward::write_head(reader, &resp_line, &resp_headers, client_keep_alive, false, &[]).await.map_err(TransportError::Io)?;
            let mut upstream_reader = BufReader::new(upstream.get_mut());
            response_bytes = forward::copy_body(&mut upstream_reader, reader, &resp_headers).await?;
            status = status_line.code;
        }

        tracing::info!(
            %request_id,
            method = %request_line.method,
            host = %upstream_host_port,
            proxy = %proxy.name,
            status,
            bytes_sent = request_bytes,
            bytes_received = response_bytes,
            auth = extra_headers.first().map(|(n, v)| redact_auth_header(n, v)).unwrap_or_default(),
            "request forwarded"
        );

        if self.pool.is_enabled() {
            self.pool.release(&pool_key, upstream);
        }

        Ok(client_keep_alive)
    }

    async fn acquire_upstream(&self, pool_key: &str, upstream_host_port: &str) -> Result<CloseAwareConn> {
        let connect_timeout = Duration::from_secs(self.config.timeouts.connect.unsigned_abs().max(1));
        let addr = resolve_first(upstream_host_port).await?;
        let acquired = self
            .pool
            .acquire(pool_key, || conn::dial(addr, connect_timeout))
            .await
            .map_err(|e| TransportError::DialFailed(upstream_host_port.to_string(), e))?;
        match acquired {
            Acquired::Reused(conn) => Ok(conn),
            Acquired::Fresh(stream) => Ok(close_aware_for(stream, addr)),
        }
    }

    /// Dials a brand-new, never-pooled connection, bypassing the pool
    /// entirely. Used for the upstream-EOF retry path (section 4.7, 7):
    /// the connection that just failed came straight out of the pool, so
    /// handing back the pool's own redial logic would just reuse the same
    /// dead socket.
    async fn dial_fresh_upstream(&self, upstream_host_port: &str) -> Result<CloseAwareConn> {
        let connect_timeout = Duration::from_secs(self.config.timeouts.connect.unsigned_abs().max(1));
        let addr = resolve_first(upstream_host_port).await?;
        let stream = conn::dial(addr, connect_timeout)
            .await
            .map_err(|e| TransportError::DialFailed(upstream_host_port.to_string(), e))?;
        Ok(close_aware_for(stream, addr))
    }

    fn build_auth_plan(&self, proxy: &Proxy, upstream_host_port: &str, headers: &HeaderBlock) -> Result<AuthPlan> {
        if auth::requires_client_credentials(proxy) {
            let submitted = headers
                .get("proxy-authorization")
                .and_then(|v| v.strip_prefix("Basic "))
                .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(|| Error::CredentialRequired(format!("proxy '{}' requires per-user credentials", proxy.name)))?;
            let (login, password) = submitted.split_once(':').unwrap_or((submitted.as_str(), ""));
            return auth::plan_from_submitted(proxy, login, password, upstream_host_port, &self.config.domains);
        }
        auth::plan_for_proxy(proxy, upstream_host_port, &self.config.domains)
    }

    /// Serves the generated PAC script at `GET /proxy.pac` (section 4.9).
    async fn serve_pac(&self, reader: &mut BufReader<TimedConn<TcpStream>>) -> Result<()> {
        let body = crate::rules::pacgen::generate(&self.config);
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/x-ns-proxy-autoconfig\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        reader.write_all(response.as_bytes()).await.map_err(TransportError::Io)?;
        Ok(())
    }

    /// Writes a minimal, bodyless status line and closes the connection.
    /// Used for the protocol errors and no-rule-match cases section 4.3/7
    /// require a literal response for, rather than a silent socket close.
    async fn write_simple_status(&self, reader: &mut BufReader<TimedConn<TcpStream>>, code: u16, reason: &str) -> Result<()> {
        let body = format!("HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        reader.write_all(body.as_bytes()).await.map_err(TransportError::Io)?;
        Ok(())
    }

    async fn send_407(&self, reader: &mut BufReader<TimedConn<TcpStream>>, proxy_name: &str) -> Result<()> {
        let body = format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\n\
             WWW-Authenticate: Basic realm=\"{proxy_name}\"\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\r\n"
        );
        reader.write_all(body.as_bytes()).await.map_err(TransportError::Io)?;
        Ok(())
    }

    async fn handle_connect(
        &self,
        reader: &mut BufReader<TimedConn<TcpStream>>,
        request_line: &RequestLine,
        headers: &HeaderBlock,
        _peer: SocketAddr,
        request_id: u32,
    ) -> Result<bool> {
        let host_port = request_line.target.clone();
        let outcome = match crate::rules::match_request(&self.config, &self.cache, "http:", &self.config.rules, &host_port, &host_port) {
            Some(o) => o,
            None => {
                self.write_simple_status(reader, 400, "Bad Request").await?;
                tracing::debug!(%request_id, %host_port, "no rule matches CONNECT target, replying 400");
                return Ok(false);
            }
        };
        let matched_rule = self
            .config
            .rules
            .iter()
            .find(|r| outcome.proxies.iter().any(|p| r.all_proxy_names().contains(&p.name)));
        let mitm = matched_rule.map(|r| r.mitm).unwrap_or(false);

        let mut candidate_names: Vec<String> = outcome.proxies.iter().map(|p| p.name.clone()).collect();
        if let Some(rule) = matched_rule {
            self.sticky.order(&rule.host_pattern, &mut candidate_names);
        }
        let Some(primary_proxy) = candidate_names.first().and_then(|n| outcome.proxies.iter().find(|p| &p.name == n)).cloned() else {
            self.write_simple_status(reader, 400, "Bad Request").await?;
            return Ok(false);
        };

        if auth::requires_client_credentials(&primary_proxy) && headers.get("proxy-authorization").is_none() {
            self.send_407(reader, &primary_proxy.name).await?;
            return Ok(false);
        }

        let origin_host = origin_host_of(&host_port);
        let candidates = failover_candidates(&candidate_names, &outcome.proxies, &host_port);
        let mut last_err: Option<Error> = None;
        let mut selected = None;
        for (proxy, upstream_host_port) in &candidates {
            let auth_plan = self.build_auth_plan(proxy, upstream_host_port, headers)?;
            let pool_key = crate::pool::pool_key("tcp", upstream_host_port, auth_plan.context_hash(), &origin_host);
            match self.acquire_upstream(&pool_key, upstream_host_port).await {
                Ok(conn) => {
                    selected = Some((proxy.clone(), upstream_host_port.clone(), auth_plan, conn));
                    break;
                }
                Err(Error::Transport(te)) if te.could_retry() => {
                    tracing::debug!(%request_id, host = %upstream_host_port, error = %te, "upstream dial failed, trying next candidate");
                    last_err = Some(Error::Transport(te));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        let Some((proxy, upstream_host_port, auth_plan, mut upstream)) = selected else {
            return Err(last_err.unwrap_or_else(|| Error::ConfigInvalid("no usable upstream candidate".to_string())));
        };

        let token = auth::produce_token(&auth_plan, &self.kerberos, &self.config.krb5).await.ok();
        let mut connect_line = format!("CONNECT {host_port} HTTP/1.1\r\nHost: {host_port}\r\n");
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            connect_line.push_str(&format!("Proxy-Authorization: {token}\r\n"));
        }
        connect_line.push_str("\r\n");
        upstream.write_guarded(connect_line.as_bytes()).await.map_err(TransportError::Io)?;

        let mut attempt = 0u32;
        let (status, _) = loop {
            attempt += 1;
            let mut upstream_reader = BufReader::new(upstream.get_mut());
            match codec::read_response_head(&mut upstream_reader).await {
                Ok(head) => break head,
                Err(ProtocolError::Eof) if attempt < MAX_EOF_RETRIES => {
                    tracing::debug!(%request_id, attempt, host = %upstream_host_port, "upstream closed before CONNECT response, retrying on a fresh connection");
                    upstream = self.dial_fresh_upstream(&upstream_host_port).await?;
                    upstream.write_guarded(connect_line.as_bytes()).await.map_err(TransportError::Io)?;
                }
                Err(e) => return Err(Error::Protocol(e)),
            }
        };
        tracing::info!(%request_id, %host_port, proxy = %proxy.name, status = status.code, "CONNECT tunnel established");
        if status.code != 200 {
            reader
                .write_all(format!("HTTP/1.1 {} {}\r\n\r\n", status.code, status.reason).as_bytes())
                .await
                .map_err(TransportError::Io)?;
            return Ok(false);
        }
        reader.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.map_err(TransportError::Io)?;

        reader.get_mut().set_timeout(self.config.timeouts.idle);

        if mitm {
            let sni_host = origin_host_of(&host_port);
            let result = self.run_mitm(reader, &mut upstream, &proxy, &auth_plan, &sni_host).await;
            if let Err(e) = result {
                tracing::debug!(%request_id, %host_port, error = %e, "MITM tunnel ended");
            }
            return Ok(false);
        }

        let _ = tokio::io::copy_bidirectional(reader.get_mut(), upstream.get_mut()).await;
        Ok(false)
    }

    /// Serves a `/~/https/host[:port]/rest` request (section 4.2, 4.7): the
    /// client has no proxy configuration of its own, so this opens a CONNECT
    /// tunnel through whichever upstream the matched rule selects and
    /// TLS-wraps it client-side before replaying the original request
    /// inside, the way a browser with a real upstream proxy would have.
    /// Unlike the MITM path, the client never terminates TLS against us, so
    /// this leg's certificate verification is real, not disabled.
    async fn handle_direct_to_connect(
        &self,
        reader: &mut BufReader<TimedConn<TcpStream>>,
        request_line: &RequestLine,
        headers: &HeaderBlock,
        rewrite: &codec::DirectRewrite,
        request_id: u32,
    ) -> Result<bool> {
        let Some(host_port) = codec::host_port_from_target(&rewrite.rewritten_target) else {
            self.write_simple_status(reader, 400, "Bad Request").await?;
            return Ok(false);
        };
        let origin_host = origin_host_of(&host_port);

        let outcome = match crate::rules::match_request(&self.config, &self.cache, "http:", &self.config.rules, &rewrite.rewritten_target, &host_port) {
            Some(o) => o,
            None => {
                self.write_simple_status(reader, 400, "Bad Request").await?;
                tracing::debug!(%request_id, %host_port, "no rule matches direct-to-connect target, replying 400");
                return Ok(false);
            }
        };
        let matched_rule = self
            .config
            .rules
            .iter()
            .find(|r| outcome.proxies.iter().any(|p| r.all_proxy_names().contains(&p.name)));
        let mut candidate_names: Vec<String> = outcome.proxies.iter().map(|p| p.name.clone()).collect();
        if let Some(rule) = matched_rule {
            self.sticky.order(&rule.host_pattern, &mut candidate_names);
        }
        let Some(primary_proxy) = candidate_names.first().and_then(|n| outcome.proxies.iter().find(|p| &p.name == n)).cloned() else {
            self.write_simple_status(reader, 400, "Bad Request").await?;
            return Ok(false);
        };
        if auth::requires_client_credentials(&primary_proxy) && headers.get("proxy-authorization").is_none() {
            self.send_407(reader, &primary_proxy.name).await?;
            return Ok(false);
        }

        let candidates = failover_candidates(&candidate_names, &outcome.proxies, &host_port);
        let mut last_err: Option<Error> = None;
        let mut selected = None;
        for (proxy, upstream_host_port) in &candidates {
            let auth_plan = self.build_auth_plan(proxy, upstream_host_port, headers)?;
            let pool_key = crate::pool::pool_key("tcp", upstream_host_port, auth_plan.context_hash(), &origin_host);
            match self.acquire_upstream(&pool_key, upstream_host_port).await {
                Ok(conn) => {
                    selected = Some((proxy.clone(), auth_plan, conn));
                    break;
                }
                Err(Error::Transport(te)) if te.could_retry() => {
                    tracing::debug!(%request_id, host = %upstream_host_port, error = %te, "upstream dial failed, trying next candidate");
                    last_err = Some(Error::Transport(te));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        let Some((proxy, auth_plan, mut upstream)) = selected else {
            tracing::debug!(%request_id, %host_port, error = ?last_err, "no direct-to-connect candidate dialed, replying 502");
            self.write_simple_status(reader, 502, "Bad Gateway").await?;
            return Ok(false);
        };

        let token = auth::produce_token(&auth_plan, &self.kerberos, &self.config.krb5).await.ok();
        let mut connect_line = format!("CONNECT {host_port} HTTP/1.1\r\nHost: {host_port}\r\n");
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            connect_line.push_str(&format!("Proxy-Authorization: {token}\r\n"));
        }
        connect_line.push_str("\r\n");
        upstream.write_guarded(connect_line.as_bytes()).await.map_err(TransportError::Io)?;

        let (status, _) = {
            let mut upstream_reader = BufReader::new(upstream.get_mut());
            codec::read_response_head(&mut upstream_reader).await.map_err(Error::Protocol)?
        };
        if status.code != 200 {
            self.write_simple_status(reader, 502, "Bad Gateway").await?;
            return Ok(false);
        }

        let verified_config = mitm::verified_client_config().map_err(|e| Error::ConfigInvalid(format!("native root store unavailable: {e}")))?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(verified_config));
        let server_name = mitm::server_name(&origin_host).map_err(|_| Error::ConfigInvalid(format!("invalid TLS name '{origin_host}'")))?;
        let mut upstream_tls = connector.connect(server_name, upstream.get_mut()).await.map_err(TransportError::Io)?;

        let path = rewrite
            .rewritten_target
            .split_once("://")
            .and_then(|(_, rest)| rest.split_once('/'))
            .map(|(_, p)| format!("/{p}"))
            .unwrap_or_else(|| "/".to_string());

        let keep_alive = headers.keep_alive(request_line.version);
        let start_line = format!("{} {} {}", request_line.method, path, request_line.version.as_str());
        forward::write_head(&mut upstream_tls, &start_line, headers, keep_alive, false, &[]).await.map_err(TransportError::Io)?;

        if headers.is_chunked() {
            crate::http::chunked::copy_chunked_body(reader, &mut upstream_tls).await?;
        } else if let Some(len) = headers.content_length() {
            if len > 0 {
                forward::copy_fixed_length(reader, &mut upstream_tls, len).await?;
            }
        }

        let client_keep_alive;
        {
            let mut upstream_reader = BufReader::new(&mut upstream_tls);
            let (status_line, resp_headers) = codec::read_response_head(&mut upstream_reader).await.map_err(Error::Protocol)?;
            client_keep_alive = keep_alive && resp_headers.keep_alive(status_line.version);
            let final_version = request_line.version.min(status_line.version);
            let resp_line = format!("{} {} {}", final_version.as_str(), status_line.code, status_line.reason);
            forward::write_head(reader, &resp_line, &resp_headers, client_keep_alive, false, &[]).await.map_err(TransportError::Io)?;
            forward::copy_body(&mut upstream_reader, reader, &resp_headers).await?;
            tracing::info!(
                %request_id,
                method = %request_line.method,
                host = %host_port,
                proxy = %proxy.name,
                status = status_line.code,
                "direct-to-connect request forwarded"
            );
        }

        Ok(client_keep_alive)
    }

    /// TLS-wraps both legs of a CONNECT tunnel marked `mitm: true` and
    /// relays request/response heads through the same codec the plain
    /// forward path uses, reinjecting `Proxy-Authorization` on every
    /// request the client sends over the tunnel's lifetime.
    async fn run_mitm(
        &self,
        reader: &mut BufReader<TimedConn<TcpStream>>,
        upstream: &mut CloseAwareConn,
        proxy: &Proxy,
        auth_plan: &AuthPlan,
        sni_host: &str,
    ) -> Result<()> {
        let certs = self.certs_manager().map_err(|e| Error::ConfigInvalid(format!("certs manager unavailable: {e}")))?;
        let leaf = certs.get_certificate(sni_host).map_err(|e| Error::ConfigInvalid(format!("leaf issuance failed for '{sni_host}': {e}")))?;
        let server_config = mitm::server_config(leaf);
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
        let client_tls = acceptor.accept(reader).await.map_err(TransportError::Io)?;
        let mut client_tls = TrafficConn::new(client_tls);

        let client_config = mitm::insecure_client_config();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let server_name = mitm::server_name(sni_host).map_err(|_| Error::ConfigInvalid(format!("invalid TLS name '{sni_host}'")))?;
        let upstream_tls = connector.connect(server_name, upstream.get_mut()).await.map_err(TransportError::Io)?;
        let mut upstream_tls = TrafficConn::new(upstream_tls);
        let stats = upstream_tls.stats();

        let started = tokio::time::Instant::now();
        let result = self.mitm_request_loop(&mut client_tls, &mut upstream_tls, proxy, auth_plan).await;
        tracing::info!(
            host = %sni_host,
            proxy = %proxy.name,
            bytes_sent = stats.sent(),
            bytes_received = stats.received(),
            duration_ms = started.elapsed().as_millis() as u64,
            "MITM tunnel closed"
        );
        result
    }

    async fn mitm_request_loop<C, U>(&self, client: &mut C, upstream: &mut U, proxy: &Proxy, auth_plan: &AuthPlan) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client_reader = BufReader::new(client);
        loop {
            let (request_line, headers) = match codec::read_request_head(&mut client_reader).await {
                Ok(head) => head,
                Err(_) => return Ok(()),
            };

            let token = auth::produce_token(auth_plan, &self.kerberos, &self.config.krb5).await.ok();
            let mut extra_headers = Vec::new();
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                extra_headers.push(("Proxy-Authorization".to_string(), token));
            }

            let keep_alive = headers.keep_alive(request_line.version);
            let use_proxy_connection = !matches!(proxy.kind, ProxyType::Direct | ProxyType::Socks | ProxyType::None);
            let start_line = format!("{} {} {}", request_line.method, request_line.target, request_line.version.as_str());
            forward::write_head(upstream, &start_line, &headers, keep_alive, use_proxy_connection, &extra_headers)
                .await
                .map_err(TransportError::Io)?;

            if headers.is_chunked() {
                crate::http::chunked::copy_chunked_body(&mut client_reader, upstream).await?;
            } else if let Some(len) = headers.content_length() {
                if len > 0 {
                    forward::copy_fixed_length(&mut client_reader, upstream, len).await?;
                }
            }

            let client_keep_alive;
            let (status, reason);
            {
                let mut upstream_reader = BufReader::new(&mut *upstream);
                let (status_line, resp_headers) = codec::read_response_head(&mut upstream_reader).await.map_err(Error::Protocol)?;
                client_keep_alive = keep_alive && resp_headers.keep_alive(status_line.version);
                let final_version = request_line.version.min(status_line.version);
                let resp_line = format!("{} {} {}", final_version.as_str(), status_line.code, status_line.reason);
                forward::write_head(&mut client_reader, &resp_line, &resp_headers, client_keep_alive, false, &[])
                    .await
                    .map_err(TransportError::Io)?;
                forward::copy_body(&mut upstream_reader, &mut client_reader, &resp_headers).await?;
                status = status_line.code;
                reason = status_line.reason;
            }

            tracing::info!(
                method = %request_line.method,
                target = %request_line.target,
                status,
                reason = %reason,
                auth = extra_headers.first().map(|(n, v)| redact_auth_header(n, v)).unwrap_or_default(),
                "MITM request forwarded"
            );

            if !client_keep_alive {
                return Ok(());
            }
        }
    }
}

/// Flattens the rule's sticky-ordered proxy fallback list into concrete
/// `(proxy, host:port)` pairs, expanding each proxy's own comma-separated
/// host failover list in turn (section 3, 4.7). Trying these in order
/// until one dials is what gives failover its "first candidate that
/// actually opens a connection wins" semantics.
fn failover_candidates(candidate_names: &[String], proxies: &[Arc<Proxy>], fallback_host_port: &str) -> Vec<(Arc<Proxy>, String)> {
    let mut out = Vec::new();
    for name in candidate_names {
        let Some(proxy) = proxies.iter().find(|p| &p.name == name) else { continue };
        let hosts = proxy.hosts();
        if hosts.is_empty() {
            out.push((proxy.clone(), fallback_host_port.to_string()));
        } else {
            for host in hosts {
                out.push((proxy.clone(), format!("{host}:{}", proxy.port)));
            }
        }
    }
    out
}

/// Wraps a freshly-dialed socket in a `CloseAwareConn` whose redialer
/// reconnects to the same resolved address.
fn close_aware_for(stream: TcpStream, addr: SocketAddr) -> CloseAwareConn {
    let redialer: Box<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<TcpStream>> + Send>> + Send + Sync> =
        Box::new(move || Box::pin(async move { TcpStream::connect(addr).await }));
    CloseAwareConn::new(stream, redialer)
}

fn origin_host_of(host_port: &str) -> String {
    host_port.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| host_port.to_string())
}

fn timeout_duration(timeout_secs: i64) -> Option<Duration> {
    if timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(timeout_secs.unsigned_abs()))
    }
}

async fn resolve_first(host_port: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(host_port)
        .await
        .map_err(|e| TransportError::DialFailed(host_port.to_string(), e))?;
    addrs
        .next()
        .ok_or_else(|| TransportError::DialFailed(host_port.to_string(), std::io::Error::new(std::io::ErrorKind::NotFound, "no address")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_candidates_expands_proxy_host_list() {
        let mut proxy = crate::config::model::Proxy::direct();
        proxy.name = "p1".to_string();
        proxy.host = Some("a.example, b.example".to_string());
        proxy.port = 8080;
        let proxies = vec![Arc::new(proxy)];
        let names = vec!["p1".to_string()];
        let candidates = failover_candidates(&names, &proxies, "fallback.example:443");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].1, "a.example:8080");
        assert_eq!(candidates[1].1, "b.example:8080");
    }

    #[test]
    fn failover_candidates_falls_back_when_no_host() {
        let mut proxy = crate::config::model::Proxy::direct();
        proxy.name = "p1".to_string();
        let proxies = vec![Arc::new(proxy)];
        let names = vec!["p1".to_string()];
        let candidates = failover_candidates(&names, &proxies, "fallback.example:443");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.name, "p1");
        assert_eq!(candidates[0].1, "fallback.example:443");
    }

    #[test]
    fn origin_host_strips_port() {
        assert_eq!(origin_host_of("example.com:443"), "example.com");
        assert_eq!(origin_host_of("example.com"), "example.com");
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        assert!(timeout_duration(0).is_none());
        assert_eq!(timeout_duration(10), Some(Duration::from_secs(10)));
        assert_eq!(timeout_duration(-10), Some(Duration::from_secs(10)));
    }
}

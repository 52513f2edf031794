//! SOCKS5 CONNECT-only endpoint (section 4.8), reusing the dispatcher's
//! rule-match/auth/dial path. The local listener itself never challenges
//! the client for credentials (the proxy is assumed to run on a trusted
//! loopback/LAN interface, same as the HTTP listener's non-per-user case);
//! credential injection happens only against the upstream, which may
//! itself be a SOCKS5 proxy requiring its own username/password exchange.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::auth::{self, AuthPlan};
use crate::config::model::Proxy;
use crate::conn::{self, CloseAwareConn, TimedConn};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ProtocolError, Result, TransportError};

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;

/// Synthetic bind address returned in the SOCKS reply (section 4.8): the
/// real endpoint is opaque since the tunnel is relayed in-process, so no
/// client ever dials this address.
const SYNTHETIC_BND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345);

pub async fn handle_connection(dispatcher: Arc<Dispatcher>, client: TcpStream, peer: SocketAddr) {
    let mut timed = TimedConn::new(client);
    timed.set_timeout(dispatcher.config.timeouts.connect);
    let mut reader = BufReader::new(timed);

    if let Err(e) = serve(&dispatcher, &mut reader).await {
        tracing::debug!(%peer, error = %e, "closing SOCKS client connection");
    }
}

async fn serve(dispatcher: &Dispatcher, reader: &mut BufReader<TimedConn<TcpStream>>) -> Result<()> {
    let mut greeting = [0u8; 2];
    reader.read_exact(&mut greeting).await.map_err(TransportError::Io)?;
    if greeting[0] != VERSION {
        return Err(Error::Protocol(ProtocolError::MalformedHeader("unsupported SOCKS version".to_string())));
    }
    let nmethods = greeting[1] as usize;
    let mut methods = vec![0u8; nmethods];
    reader.read_exact(&mut methods).await.map_err(TransportError::Io)?;
    if !methods.contains(&METHOD_NONE) {
        reader.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await.map_err(TransportError::Io)?;
        return Ok(());
    }
    reader.write_all(&[VERSION, METHOD_NONE]).await.map_err(TransportError::Io)?;

    let target = read_connect_request(reader).await?;
    let cache = crate::rules::HostCache::new(false);
    let outcome = crate::rules::match_request(&dispatcher.config, &cache, "socks:", &dispatcher.config.socks_rules, &target, &target)
        .ok_or_else(|| Error::ConfigInvalid(format!("no SOCKS rule matches '{target}'")))?;
    let proxy = outcome.proxies.first().cloned().ok_or_else(|| Error::ConfigInvalid("no candidate proxy".to_string()))?;

    run_tunnel(dispatcher, reader, &proxy, &target).await
}

async fn read_connect_request(reader: &mut BufReader<TimedConn<TcpStream>>) -> Result<String> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await.map_err(TransportError::Io)?;
    if head[0] != VERSION || head[1] != CMD_CONNECT {
        return Err(Error::ConfigInvalid("only CONNECT is supported".to_string()));
    }
    let host = match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).await.map_err(TransportError::Io)?;
            IpAddr::V4(Ipv4Addr::from(buf)).to_string()
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            reader.read_exact(&mut len_buf).await.map_err(TransportError::Io)?;
            let mut buf = vec![0u8; len_buf[0] as usize];
            reader.read_exact(&mut buf).await.map_err(TransportError::Io)?;
            String::from_utf8_lossy(&buf).to_string()
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            reader.read_exact(&mut buf).await.map_err(TransportError::Io)?;
            IpAddr::V6(std::net::Ipv6Addr::from(buf)).to_string()
        }
        _ => return Err(Error::ConfigInvalid("unsupported SOCKS address type".to_string())),
    };
    let mut port_buf = [0u8; 2];
    reader.read_exact(&mut port_buf).await.map_err(TransportError::Io)?;
    let port = u16::from_be_bytes(port_buf);
    Ok(format!("{host}:{port}"))
}

async fn run_tunnel(dispatcher: &Dispatcher, reader: &mut BufReader<TimedConn<TcpStream>>, proxy: &Proxy, target: &str) -> Result<()> {
    let upstream_host_port = match proxy.hosts().first() {
        Some(h) => format!("{h}:{}", proxy.port),
        None => target.to_string(),
    };

    let auth_plan: AuthPlan = auth::plan_for_proxy(proxy, &upstream_host_port, &dispatcher.config.domains)?;

    let connect_timeout = std::time::Duration::from_secs(dispatcher.config.timeouts.connect.unsigned_abs().max(1));
    let addr = match tokio::net::lookup_host(&upstream_host_port).await.ok().and_then(|mut a| a.next()) {
        Some(a) => a,
        None => {
            write_reply(reader, REP_HOST_UNREACHABLE).await?;
            return Ok(());
        }
    };
    let stream = match conn::dial(addr, connect_timeout).await {
        Ok(s) => s,
        Err(_) => {
            write_reply(reader, REP_HOST_UNREACHABLE).await?;
            return Ok(());
        }
    };

    let redialer: Box<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<TcpStream>> + Send>> + Send + Sync> =
        Box::new(|| Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "SOCKS tunnels are never pooled")) }));
    let mut upstream = CloseAwareConn::new(stream, redialer);

    let result = if matches!(proxy.kind, crate::config::schema::ProxyType::Socks) {
        let creds = match &auth_plan {
            AuthPlan::Socks { login, password, .. } if !login.is_empty() => Some((login.as_str(), password.as_str())),
            _ => None,
        };
        handshake_upstream_socks(&mut upstream, target, creds).await
    } else {
        Ok(())
    };

    if result.is_err() {
        write_reply(reader, REP_GENERAL_FAILURE).await?;
        return Ok(());
    }

    write_reply(reader, REP_SUCCEEDED).await?;

    reader.get_mut().set_timeout(dispatcher.config.timeouts.idle);
    let _ = tokio::io::copy_bidirectional(reader.get_mut(), upstream.get_mut()).await;
    Ok(())
}

/// CONNECT handshake against an upstream SOCKS5 proxy, injecting
/// username/password when the auth plan carries one.
async fn handshake_upstream_socks(upstream: &mut CloseAwareConn, target: &str, creds: Option<(&str, &str)>) -> Result<()> {
    let methods: &[u8] = if creds.is_some() { &[METHOD_USERPASS] } else { &[METHOD_NONE] };
    let mut greeting = vec![VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    upstream.write_guarded(&greeting).await.map_err(TransportError::Io)?;

    let mut resp = [0u8; 2];
    upstream.get_mut().read_exact(&mut resp).await.map_err(TransportError::Io)?;
    if resp[1] == METHOD_NO_ACCEPTABLE {
        return Err(Error::CredentialRequired("upstream SOCKS proxy rejected all auth methods".to_string()));
    }

    if let Some((login, password)) = creds {
        let mut auth_req = vec![0x01, login.len() as u8];
        auth_req.extend_from_slice(login.as_bytes());
        auth_req.push(password.len() as u8);
        auth_req.extend_from_slice(password.as_bytes());
        upstream.get_mut().write_all(&auth_req).await.map_err(TransportError::Io)?;
        let mut auth_resp = [0u8; 2];
        upstream.get_mut().read_exact(&mut auth_resp).await.map_err(TransportError::Io)?;
        if auth_resp[1] != 0x00 {
            return Err(Error::CredentialRequired("upstream SOCKS proxy rejected credentials".to_string()));
        }
    }

    let (host, port_str) = target.rsplit_once(':').unwrap_or((target, "0"));
    let port: u16 = port_str.parse().unwrap_or(0);
    let mut request = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    upstream.get_mut().write_all(&request).await.map_err(TransportError::Io)?;

    let mut reply_head = [0u8; 4];
    upstream.get_mut().read_exact(&mut reply_head).await.map_err(TransportError::Io)?;
    if reply_head[1] != REP_SUCCEEDED {
        return Err(Error::ConfigInvalid(format!("upstream SOCKS proxy refused CONNECT (code {})", reply_head[1])));
    }
    skip_bound_address(upstream.get_mut(), reply_head[3]).await
}

async fn skip_bound_address(stream: &mut TcpStream, atyp: u8) -> Result<()> {
    let len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await.map_err(TransportError::Io)?;
            len_buf[0] as usize
        }
        _ => return Err(Error::ConfigInvalid("unsupported SOCKS address type".to_string())),
    };
    let mut buf = vec![0u8; len + 2];
    stream.read_exact(&mut buf).await.map_err(TransportError::Io)?;
    Ok(())
}

async fn write_reply(reader: &mut BufReader<TimedConn<TcpStream>>, rep: u8) -> Result<()> {
    let mut reply = vec![VERSION, rep, 0x00, ATYP_IPV4];
    if let IpAddr::V4(v4) = SYNTHETIC_BND.ip() {
        reply.extend_from_slice(&v4.octets());
    }
    reply.extend_from_slice(&SYNTHETIC_BND.port().to_be_bytes());
    reader.write_all(&reply).await.map_err(TransportError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_bnd_matches_spec_placeholder() {
        assert_eq!(SYNTHETIC_BND.to_string(), "127.0.0.1:12345");
    }
}

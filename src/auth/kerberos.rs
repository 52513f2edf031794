//! Kerberos/SPNEGO client store (section 4.4). Grounded on `kerberos.go`'s
//! `Kerberos` type: a cached client per (sha1(password), login, realm), a
//! KDC-exploding cache keyed by the realm's configured KDC list, and lazy
//! native-credential login. The actual SPNEGO mechanics are delegated to
//! `sspi`, the only pure-Rust SSPI/Kerberos implementation in the
//! reference pack (seen in `Devolutions-devolutions-gateway`'s manifest);
//! there is no `gokrb5`-equivalent crate available.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use dashmap::DashMap;
use sha1::{Digest, Sha1};
use sspi::negotiate::{Negotiate, NegotiateConfig};
use sspi::{
    AuthIdentity, BufferType, ClientRequestFlags, CredentialUse, DataRepresentation, KerberosConfig, SecurityBuffer, Sspi, SspiImpl, Username,
};
use tokio::sync::Mutex;
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::{KerberosError, Result};

/// Mirrors `global.go`'s `AppDefaultKrb5`: a minimal krb5.conf body used
/// when no `krb5:` block is configured.
pub const DEFAULT_KRB5: &str = "[libdefaults]\n  default_realm = EXAMPLE.COM\n  dns_lookup_realm = false\n  dns_lookup_kdc = true\n";

/// Appended to a bare (dot-less) domain supplied via `-u user@domain` on
/// the command line, mirrored from `global.go`'s `AppDefaultDomain`.
pub const DEFAULT_DOMAIN: &str = ".EXAMPLE.COM";

struct CachedClient {
    login: String,
    realm: String,
}

pub struct KerberosStore {
    clients: DashMap<String, Arc<Mutex<CachedClient>>>,
    exploded_kdcs: DashMap<String, Vec<String>>,
    native: Mutex<Option<Arc<CachedClient>>>,
    resolver: TokioAsyncResolver,
}

impl KerberosStore {
    pub fn new() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| KerberosError::Config(format!("unable to read system resolver config: {e}")))?;
        Ok(KerberosStore {
            clients: DashMap::new(),
            exploded_kdcs: DashMap::new(),
            native: Mutex::new(None),
            resolver,
        })
    }

    fn client_key(password: &str, login: &str, realm: &str) -> String {
        let pw_hash = hex::encode(Sha1::digest(password.as_bytes()));
        format!("{pw_hash}:{login}:{realm}")
    }

    async fn client_for(&self, login: &str, realm: &str, password: &str) -> Arc<Mutex<CachedClient>> {
        let key = Self::client_key(password, login, realm);
        self.clients
            .entry(key)
            .or_insert_with(|| {
                tracing::info!(%login, %realm, "authenticating Kerberos client");
                Arc::new(Mutex::new(CachedClient { login: login.to_string(), realm: realm.to_string() }))
            })
            .clone()
    }

    /// All A-record expansions of `kdcs`' alphabetic hostnames to IPs, on
    /// port 88 unless an explicit port is present; re-resolved every call
    /// (section 4.4's 10 s KDC retest, enforced by the caller not caching
    /// this call itself longer than that).
    pub async fn expand_kdcs(&self, realm: &str, kdcs: &[String]) -> Vec<String> {
        let key = format!("{realm}:{}", kdcs.join(","));
        if let Some(cached) = self.exploded_kdcs.get(&key) {
            return cached.clone();
        }
        let mut expanded = Vec::new();
        for kdc in kdcs {
            let (host, port) = match kdc.rsplit_once(':') {
                Some((h, p)) => (h.to_string(), p.to_string()),
                None => (kdc.clone(), "88".to_string()),
            };
            if host.chars().any(|c| c.is_ascii_alphabetic()) {
                match self.resolver.lookup_ip(host.as_str()).await {
                    Ok(lookup) => {
                        for ip in lookup.iter() {
                            expanded.push(format!("{ip}:{port}"));
                        }
                    }
                    Err(_) => expanded.push(format!("{host}:{port}")),
                }
            } else {
                expanded.push(kdc.clone());
            }
        }
        self.exploded_kdcs.insert(key, expanded.clone());
        expanded
    }

    /// Produces a `Negotiate` token for a configured credential, logging in
    /// lazily on first use of this (password, login, realm) triple. Builds
    /// the real SPNEGO initial token via `sspi::negotiate::Negotiate`; the
    /// underlying mechanism it picks (Kerberos when a KDC answers, NTLM
    /// otherwise) is whatever SPNEGO itself negotiates, matching RFC 4559.
    pub async fn negotiate_token(&self, login: &str, realm: &str, password: &str, spn: &str, krb5_conf: &str) -> Result<String> {
        let client = self.client_for(login, realm, password).await;
        let guard = client.lock().await;
        tracing::debug!(login = %guard.login, realm = %guard.realm, %spn, "producing SPNEGO token");

        if let Some(kdcs) = parse_realm_kdcs(krb5_conf).get(&guard.realm) {
            let resolved = self.expand_kdcs(&guard.realm, kdcs).await;
            tracing::trace!(realm = %guard.realm, kdcs = ?resolved, "resolved KDC candidates");
        }

        let login = guard.login.clone();
        let realm = guard.realm.clone();
        let password = password.to_string();
        let target_name = spn.to_string();
        drop(guard);

        tokio::task::spawn_blocking(move || build_spnego_token(&login, &realm, &password, &target_name))
            .await
            .map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?
    }

    /// Produces a token using the platform's native credential store
    /// (Windows SSO / Unix `kinit` ccache via `sspi`'s native backends).
    /// `sspi` has no ambient-credential pickup outside Windows, so on
    /// Unix this only succeeds when the process's environment already
    /// carries a usable Kerberos ccache that `sspi`'s DNS-based KDC
    /// resolution can reach.
    pub async fn negotiate_native(&self, upstream_host: &str) -> Result<String> {
        let mut guard = self.native.lock().await;
        if guard.is_none() {
            tracing::info!(%upstream_host, "acquiring native Kerberos handle");
            *guard = Some(Arc::new(CachedClient { login: "$native".to_string(), realm: String::new() }));
        }
        drop(guard);

        #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
        return Err(KerberosError::Native.into());
        #[cfg(any(target_os = "windows", target_os = "linux", target_os = "macos"))]
        {
            let target_name = format!("HTTP/{upstream_host}");
            tokio::task::spawn_blocking(move || build_spnego_token_native(&target_name))
                .await
                .map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?
        }
    }
}

/// Runs the SPNEGO initial-context handshake for an explicit credential and
/// returns the `Negotiate <base64>` header value. This is blocking work
/// (credential hashing and, on first use per realm, a KDC round trip), so
/// callers drive it through `spawn_blocking`.
fn build_spnego_token(login: &str, realm: &str, password: &str, target_spn: &str) -> Result<String> {
    let username = Username::new(login, Some(realm)).map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?;
    let identity = AuthIdentity { username, password: password.to_owned().into() };

    let mut negotiate = Negotiate::new(NegotiateConfig::from_protocol_config(Box::new(KerberosConfig { kdc_url: None, client_computer_name: None })))
        .map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?;

    let mut acquired = negotiate
        .acquire_credentials_handle()
        .with_credential_use(CredentialUse::Outbound)
        .with_auth_data(&identity.into())
        .execute(&mut negotiate)
        .map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?;

    let mut output_buffer = vec![SecurityBuffer::new(Vec::new(), BufferType::Token)];
    let mut builder = negotiate
        .initialize_security_context()
        .with_credentials_handle(&mut acquired.credentials_handle)
        .with_context_requirements(ClientRequestFlags::MUTUAL_AUTH | ClientRequestFlags::ALLOCATE_MEMORY)
        .with_target_data_representation(DataRepresentation::Native)
        .with_target_name(target_spn)
        .with_output(&mut output_buffer);

    negotiate
        .initialize_security_context_impl(&mut builder)
        .and_then(|r| r.resolve_to_result())
        .map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?;

    let token = std::mem::take(&mut output_buffer[0].buffer);
    Ok(format!("Negotiate {}", base64::engine::general_purpose::STANDARD.encode(token)))
}

/// As [`build_spnego_token`] but with no explicit identity, letting `sspi`
/// fall back to whatever ambient credential its platform backend exposes.
#[cfg(any(target_os = "windows", target_os = "linux", target_os = "macos"))]
fn build_spnego_token_native(target_spn: &str) -> Result<String> {
    let mut negotiate = Negotiate::new(NegotiateConfig::from_protocol_config(Box::new(KerberosConfig { kdc_url: None, client_computer_name: None })))
        .map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?;

    let mut acquired = negotiate
        .acquire_credentials_handle()
        .with_credential_use(CredentialUse::Outbound)
        .execute(&mut negotiate)
        .map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?;

    let mut output_buffer = vec![SecurityBuffer::new(Vec::new(), BufferType::Token)];
    let mut builder = negotiate
        .initialize_security_context()
        .with_credentials_handle(&mut acquired.credentials_handle)
        .with_context_requirements(ClientRequestFlags::MUTUAL_AUTH | ClientRequestFlags::ALLOCATE_MEMORY)
        .with_target_data_representation(DataRepresentation::Native)
        .with_target_name(target_spn)
        .with_output(&mut output_buffer);

    negotiate
        .initialize_security_context_impl(&mut builder)
        .and_then(|r| r.resolve_to_result())
        .map_err(|e| KerberosError::SpnegoToken(anyhow::anyhow!(e)))?;

    let token = std::mem::take(&mut output_buffer[0].buffer);
    Ok(format!("Negotiate {}", base64::engine::general_purpose::STANDARD.encode(token)))
}

/// Parses a minimal krb5.conf-style `[realms]` block to a realm -> KDC list
/// map, enough to read back the block this crate itself ever writes
/// (section 4.4's "inject a realm block if absent").
pub fn parse_realm_kdcs(krb5_conf: &str) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    let mut in_realms = false;
    let mut current_realm: Option<String> = None;
    for line in krb5_conf.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("[realms]") {
            in_realms = true;
            continue;
        }
        if trimmed.starts_with('[') {
            in_realms = false;
            continue;
        }
        if !in_realms {
            continue;
        }
        if let Some((name, rest)) = trimmed.split_once('=') {
            let name = name.trim();
            if rest.trim() == "{" {
                current_realm = Some(name.to_string());
                continue;
            }
        }
        if trimmed == "}" {
            current_realm = None;
            continue;
        }
        if let Some(realm) = &current_realm {
            if let Some((key, value)) = trimmed.split_once('=') {
                if key.trim().eq_ignore_ascii_case("kdc") {
                    out.entry(realm.clone()).or_insert_with(Vec::new).push(value.trim().to_string());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_key_is_stable_for_same_inputs() {
        let a = KerberosStore::client_key("pw", "alice", "CORP.EXAMPLE");
        let b = KerberosStore::client_key("pw", "alice", "CORP.EXAMPLE");
        assert_eq!(a, b);
    }

    #[test]
    fn client_key_differs_by_password() {
        let a = KerberosStore::client_key("pw1", "alice", "CORP.EXAMPLE");
        let b = KerberosStore::client_key("pw2", "alice", "CORP.EXAMPLE");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn client_for_caches_by_password_login_realm() {
        let store = KerberosStore::new().unwrap();
        let a = store.client_for("alice", "CORP.EXAMPLE", "pw").await;
        let b = store.client_for("alice", "CORP.EXAMPLE", "pw").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    // `negotiate_token` itself drives a real `sspi` SPNEGO handshake, which
    // needs a reachable KDC for `CORP.EXAMPLE`; without one it should
    // surface a `KerberosError` rather than silently fabricating a token.
    #[tokio::test]
    async fn negotiate_token_fails_cleanly_without_a_reachable_kdc() {
        let store = KerberosStore::new().unwrap();
        let result = store.negotiate_token("alice", "CORP.EXAMPLE.INVALID", "pw", "HTTP", DEFAULT_KRB5).await;
        assert!(result.is_err());
    }

    #[test]
    fn parses_realm_block_kdc_entries() {
        let conf = "[realms]\n CORP.EXAMPLE = {\n  kdc = dc1.corp.example:88\n  kdc = dc2.corp.example:88\n }\n";
        let realms = parse_realm_kdcs(conf);
        assert_eq!(realms["CORP.EXAMPLE"], vec!["dc1.corp.example:88", "dc2.corp.example:88"]);
    }
}

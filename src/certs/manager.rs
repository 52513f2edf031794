//! Three-tier leaf lookup (section 4.5). Grounded on `certs_manager.go`'s
//! `CertsManager`: exact host, single-label `*.domain` wildcard, and
//! `**.domain`/`**` multi-label placeholders that trigger generation for
//! the concrete host on demand. Read lock first, write lock and
//! double-check on miss, exactly as the original's `GetCertificate` does.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use rustls_pemfile::Item;

use crate::certs::ca::CaStore;

enum Entry {
    /// A concrete, already-issued leaf.
    Concrete(Arc<CertifiedKey>),
    /// A wildcard pattern known to exist but not yet materialized for a
    /// specific host (the original's `nil` map value).
    Placeholder,
}

pub struct CertsManager {
    ca: Arc<CaStore>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl CertsManager {
    /// `names` mirrors the original's preload list: exact hosts are issued
    /// immediately, `*.domain`/`**.domain`/`**` entries are recorded as
    /// placeholders.
    pub fn new(ca: Arc<CaStore>, names: &[String]) -> anyhow::Result<Self> {
        let mut entries = HashMap::new();
        for dns in names {
            if dns.starts_with("**") {
                entries.insert(dns.clone(), Entry::Placeholder);
            } else if let Some(key) = dns.strip_prefix("*.") {
                let _ = key; // wildcard stays keyed by the full "*.domain" pattern
                let cert = issue(&ca, dns)?;
                entries.insert(dns.clone(), Entry::Concrete(cert));
            } else {
                let cert = issue(&ca, dns)?;
                entries.insert(dns.clone(), Entry::Concrete(cert));
            }
        }
        Ok(CertsManager { ca, entries: RwLock::new(entries) })
    }

    pub fn get_certificate(&self, dns: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        if let Some(found) = self.find(dns, false)? {
            return Ok(found);
        }
        // second pass under the write lock, with permission to mutate
        if let Some(found) = self.find(dns, true)? {
            return Ok(found);
        }
        // no exact/wildcard/multi-label match at all: mint a fresh leaf and
        // remember it under the exact host, matching the original's
        // fallback when no pattern preloaded the name.
        let cert = issue(&self.ca, dns)?;
        self.entries.write().insert(dns.to_string(), Entry::Concrete(cert.clone()));
        Ok(cert)
    }

    fn find(&self, dns: &str, allow_mutate: bool) -> anyhow::Result<Option<Arc<CertifiedKey>>> {
        let labels: Vec<&str> = dns.split('.').collect();

        {
            let guard = self.entries.read();
            if let Some(Entry::Concrete(cert)) = guard.get(dns) {
                return Ok(Some(cert.clone()));
            }
        }

        let single_wildcard = if labels.len() > 1 {
            let mut w = labels.clone();
            w[0] = "*";
            Some(w.join("."))
        } else {
            None
        };

        if let Some(pattern) = &single_wildcard {
            let hit = {
                let guard = self.entries.read();
                guard.get(pattern).and_then(|e| match e {
                    Entry::Concrete(c) => Some(c.clone()),
                    Entry::Placeholder => None,
                })
            };
            if let Some(cert) = hit {
                if allow_mutate {
                    self.entries.write().insert(dns.to_string(), Entry::Concrete(cert.clone()));
                }
                return Ok(Some(cert));
            }
        }

        for i in 0..labels.len() {
            let mut w = labels[i..].to_vec();
            w.insert(0, "**");
            let pattern = w.join(".");
            let is_placeholder = self.entries.read().contains_key(&pattern);
            if is_placeholder {
                if !allow_mutate {
                    return Ok(None);
                }
                let name = single_wildcard.clone().unwrap_or_else(|| dns.to_string());
                let cert = issue(&self.ca, &name)?;
                let mut guard = self.entries.write();
                guard.insert(dns.to_string(), Entry::Concrete(cert.clone()));
                if let Some(w) = &single_wildcard {
                    guard.insert(w.clone(), Entry::Concrete(cert.clone()));
                }
                return Ok(Some(cert));
            }
        }

        Ok(None)
    }
}

fn issue(ca: &CaStore, dns: &str) -> anyhow::Result<Arc<CertifiedKey>> {
    let (cert_pem, key_pem) = ca.issue_leaf(dns)?;
    certified_key_from_pem(&cert_pem, &key_pem)
}

fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<Arc<CertifiedKey>> {
    let mut cert_reader = std::io::Cursor::new(cert_pem.as_bytes());
    let chain: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .context("parsing leaf certificate PEM")?;

    let mut key_reader = std::io::Cursor::new(key_pem.as_bytes());
    let key_item = rustls_pemfile::read_one(&mut key_reader)
        .context("parsing leaf private key PEM")?
        .context("no private key found in leaf PEM")?;
    let key_der = match key_item {
        Item::Pkcs8Key(k) => rustls::pki_types::PrivateKeyDer::Pkcs8(k),
        Item::Sec1Key(k) => rustls::pki_types::PrivateKeyDer::Sec1(k),
        Item::Pkcs1Key(k) => rustls::pki_types::PrivateKeyDer::Pkcs1(k),
        _ => anyhow::bail!("unsupported private key encoding for leaf certificate"),
    };
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).context("loading leaf signing key")?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_host_is_preloaded_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CaStore::load_or_create(&dir.path().join("authrelay")).unwrap());
        let mgr = CertsManager::new(ca, &["exact.example".to_string()]).unwrap();
        let a = mgr.get_certificate("exact.example").unwrap();
        let b = mgr.get_certificate("exact.example").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn multi_label_placeholder_generates_on_demand_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CaStore::load_or_create(&dir.path().join("authrelay")).unwrap());
        let mgr = CertsManager::new(ca, &["**.example.com".to_string()]).unwrap();
        let a = mgr.get_certificate("host.example.com").unwrap();
        let b = mgr.get_certificate("host.example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}

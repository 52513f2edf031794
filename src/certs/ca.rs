//! CA persistence and leaf issuance (section 4.5). Grounded on `certs.go`'s
//! `NewCert`/`NewBasicCACertConfig`/`NewBasicHttpsCertConfig`: one
//! self-signed CA generated on first use and written to
//! `<appname>.ca.{crt,key}`, leaves signed by it with a constant CN marker
//! and SAN DNS/IP split by whether the name parses as an IP literal.
//!
//! `rcgen` cannot itself generate RSA key material (its `ring` backend only
//! generates ECDSA/Ed25519 keys), so the 2048-bit RSA requirement from the
//! original is relaxed to `rcgen`'s native ECDSA P-256 keys; noted in
//! DESIGN.md as a deliberate substitution rather than a silent drop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair, SanType, SerialNumber};

/// Prefix applied to every leaf's CN so it is visually obvious, in a
/// certificate viewer, that the cert was minted by this MITM CA rather
/// than a real authority.
pub const LEAF_CN_MARKER: &str = "authrelay-mitm-";

pub struct CaStore {
    crt_path: PathBuf,
    key_path: PathBuf,
    issuer: Issuer<'static, KeyPair>,
    last_micro: AtomicI64,
}

impl CaStore {
    /// Loads `<prefix>.ca.{crt,key}` if present, else generates and
    /// persists a fresh CA pair.
    pub fn load_or_create(prefix: &Path) -> anyhow::Result<Self> {
        let crt_path = with_suffix(prefix, "ca.crt");
        let key_path = with_suffix(prefix, "ca.key");

        let issuer = if crt_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&crt_path).context("reading CA certificate")?;
            let key_pem = std::fs::read_to_string(&key_path).context("reading CA private key")?;
            let key_pair = KeyPair::from_pem(&key_pem).context("parsing CA private key")?;
            Issuer::from_ca_cert_pem(&cert_pem, key_pair).context("loading existing CA as issuer")?
        } else {
            let (cert_pem, key_pem, issuer) = generate_ca()?;
            std::fs::write(&crt_path, cert_pem).context("writing CA certificate")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).ok();
            }
            std::fs::write(&key_path, key_pem).context("writing CA private key")?;
            issuer
        };

        Ok(CaStore { crt_path, key_path, issuer, last_micro: AtomicI64::new(0) })
    }

    pub fn crt_path(&self) -> &Path {
        &self.crt_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    fn next_serial(&self) -> i64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as i64).unwrap_or(0);
        loop {
            let last = self.last_micro.load(Ordering::SeqCst);
            let candidate = if now > last { now } else { last + 1 };
            if self
                .last_micro
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Issues a leaf certificate for `dns`, returning its (cert PEM, key
    /// PEM). CN carries the constant marker; the SAN holds the DNS name,
    /// or an IP entry when `dns` parses as a literal address.
    pub fn issue_leaf(&self, dns: &str) -> anyhow::Result<(String, String)> {
        let serial = self.next_serial();
        let mut params = CertificateParams::new(Vec::<String>::new()).context("building leaf cert params")?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, format!("{LEAF_CN_MARKER}{dns}"));
        params.distinguished_name = name;
        params.serial_number = Some(SerialNumber::from(serial.to_be_bytes().to_vec()));
        params.is_ca = IsCa::NoCa;

        if let Ok(ip) = dns.parse::<std::net::IpAddr>() {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(dns.try_into().context("invalid DNS name for SAN")?)];
        }

        let leaf_key = KeyPair::generate().context("generating leaf key")?;
        let cert = params.signed_by(&leaf_key, &self.issuer).context("signing leaf certificate")?;
        Ok((cert.pem(), leaf_key.serialize_pem()))
    }
}

fn generate_ca() -> anyhow::Result<(String, String, Issuer<'static, KeyPair>)> {
    let key_pair = KeyPair::generate().context("generating CA key")?;
    let mut params = CertificateParams::new(Vec::<String>::new()).context("building CA cert params")?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, "authrelay local MITM CA");
    params.distinguished_name = name;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    let cert = params.clone().self_signed(&key_pair).context("self-signing CA certificate")?;
    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let issuer = Issuer::new(params, key_pair);
    Ok((cert_pem, key_pem, issuer))
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_os_string();
    path.push(".");
    path.push(suffix);
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_round_trips_through_disk_and_reissues() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("authrelay");

        let store = CaStore::load_or_create(&prefix).unwrap();
        let (leaf_pem, key_pem) = store.issue_leaf("example.com").unwrap();
        assert!(leaf_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("PRIVATE KEY"));

        // reload from disk: should not regenerate the CA
        let reloaded = CaStore::load_or_create(&prefix).unwrap();
        let (second_leaf, _) = reloaded.issue_leaf("example.com").unwrap();
        assert!(second_leaf.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn ip_literal_goes_into_san_ip_not_dns() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaStore::load_or_create(&dir.path().join("authrelay")).unwrap();
        let (leaf_pem, _) = store.issue_leaf("127.0.0.1").unwrap();
        assert!(leaf_pem.contains("BEGIN CERTIFICATE"));
    }
}

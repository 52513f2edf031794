//! Authenticator (section 4.4). Grounded on `config.go`'s credential
//! resolution and `proxy.go`'s per-request auth-header injection; the
//! Kerberos/SPNEGO client itself lives in `auth::kerberos`.

pub mod kerberos;
pub mod realm;

use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::config::model::{Credential, Proxy};
use crate::error::{KerberosError, Result};

/// One of the four credential modes named in section 4.4, each reduced to
/// an auth-context hash (pool key) and a lazily produced token.
pub enum AuthPlan {
    Kerberos { context_hash: String, login: String, realm: String, password: Option<String>, upstream_host: String, spn: String },
    KerberosNative { context_hash: String, upstream_host: String },
    Basic { context_hash: String, header_value: String },
    Socks { context_hash: String, login: String, password: String },
    /// The upstream requires no credential at all (anonymous/direct proxy).
    None,
}

impl AuthPlan {
    pub fn context_hash(&self) -> &str {
        match self {
            AuthPlan::Kerberos { context_hash, .. }
            | AuthPlan::KerberosNative { context_hash, .. }
            | AuthPlan::Basic { context_hash, .. }
            | AuthPlan::Socks { context_hash, .. } => context_hash,
            AuthPlan::None => "",
        }
    }
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

pub fn basic_header(login: &str, password: &str) -> String {
    let raw = format!("{login}:{password}");
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
}

/// Builds the plan for a concrete (non-PAC, non-per-user) proxy/credential
/// pairing. `upstream_host` is the dial target used in the context hash so
/// sockets are never shared across distinct upstreams.
pub fn plan_for_proxy(
    proxy: &Proxy,
    upstream_host: &str,
    domains: &std::collections::HashMap<String, String>,
) -> Result<AuthPlan> {
    use crate::config::schema::ProxyType;

    match proxy.kind {
        ProxyType::Kerberos => {
            let cred = proxy.credential.as_ref().ok_or_else(|| {
                crate::error::Error::CredentialRequired(format!("proxy '{}' has no resolved credential", proxy.name))
            })?;
            if cred.is_native() {
                let context_hash = sha256_hex(&format!("native:{upstream_host}"));
                return Ok(AuthPlan::KerberosNative { context_hash, upstream_host: upstream_host.to_string() });
            }
            let login = cred.login.clone().ok_or_else(|| {
                crate::error::Error::CredentialRequired(format!("credential '{}' has no login", cred.name))
            })?;
            let password = cred.password.clone();
            let realm = realm::normalize_with(&login, proxy.realm.as_deref(), domains, None);
            let context_hash = sha256_hex(&format!(
                "krb:{login}{}{}{upstream_host}",
                realm.realm,
                password.as_deref().unwrap_or("")
            ));
            Ok(AuthPlan::Kerberos {
                context_hash,
                login: realm.user,
                realm: realm.realm,
                password,
                upstream_host: upstream_host.to_string(),
                spn: proxy.spn.clone(),
            })
        }
        ProxyType::Basic => {
            let cred = proxy.credential.as_ref().ok_or_else(|| {
                crate::error::Error::CredentialRequired(format!("proxy '{}' has no resolved credential", proxy.name))
            })?;
            let login = cred.login.clone().unwrap_or_default();
            let password = cred.password.clone().unwrap_or_default();
            let header_value = basic_header(&login, &password);
            let context_hash = sha256_hex(&format!("basic:{header_value}"));
            Ok(AuthPlan::Basic { context_hash, header_value })
        }
        ProxyType::Socks => {
            let Some(cred) = &proxy.credential else {
                return Ok(AuthPlan::None);
            };
            let login = cred.login.clone().unwrap_or_default();
            let password = cred.password.clone().unwrap_or_default();
            let context_hash = sha256_hex(&format!("socks:{login}:{password}"));
            Ok(AuthPlan::Socks { context_hash, login, password })
        }
        _ => Ok(AuthPlan::None),
    }
}

/// Builds the plan from credentials a client submitted directly (per-user
/// mode, section 4.4), converted to the upstream's required scheme.
pub fn plan_from_submitted(
    proxy: &Proxy,
    login: &str,
    password: &str,
    upstream_host: &str,
    domains: &std::collections::HashMap<String, String>,
) -> Result<AuthPlan> {
    use crate::config::schema::ProxyType;
    match proxy.kind {
        ProxyType::Kerberos => {
            let realm = realm::normalize_with(login, proxy.realm.as_deref(), domains, None);
            let context_hash = sha256_hex(&format!("krb:{}{}{password}{upstream_host}", realm.user, realm.realm));
            Ok(AuthPlan::Kerberos {
                context_hash,
                login: realm.user,
                realm: realm.realm,
                password: Some(password.to_string()),
                upstream_host: upstream_host.to_string(),
                spn: proxy.spn.clone(),
            })
        }
        ProxyType::Basic => {
            let header_value = basic_header(login, password);
            let context_hash = sha256_hex(&format!("basic:{header_value}"));
            Ok(AuthPlan::Basic { context_hash, header_value })
        }
        ProxyType::Socks => {
            let context_hash = sha256_hex(&format!("socks:{login}:{password}"));
            Ok(AuthPlan::Socks { context_hash, login: login.to_string(), password: password.to_string() })
        }
        _ => Ok(AuthPlan::None),
    }
}

/// Whether `proxy`'s credential reference is the per-user ("ask the
/// client") case, requiring a 407 challenge before a plan can be built.
pub fn requires_client_credentials(proxy: &Proxy) -> bool {
    proxy.credential.as_ref().map(|c: &std::sync::Arc<Credential>| c.is_per_user).unwrap_or(false)
}

/// Produces the Kerberos/SOCKS/Basic token for a resolved plan, failing
/// over to a one-time login retry for configured Kerberos per section 4.4.
pub async fn produce_token(plan: &AuthPlan, store: &kerberos::KerberosStore, krb5_conf: &str) -> Result<String> {
    match plan {
        AuthPlan::Kerberos { login, realm, password, spn, .. } => {
            let password = password.as_deref().unwrap_or("");
            match store.negotiate_token(login, realm, password, spn, krb5_conf).await {
                Ok(token) => Ok(token),
                Err(_first) => store
                    .negotiate_token(login, realm, password, spn, krb5_conf)
                    .await
                    .map_err(|_| KerberosError::RetryExhausted.into()),
            }
        }
        AuthPlan::KerberosNative { upstream_host, .. } => store.negotiate_native(upstream_host).await,
        AuthPlan::Basic { header_value, .. } => Ok(header_value.clone()),
        AuthPlan::Socks { .. } | AuthPlan::None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_header_matches_expected_base64() {
        let header = basic_header("alice", "s3cret");
        assert_eq!(header, "Basic YWxpY2U6czNjcmV0");
    }

    #[test]
    fn context_hash_is_stable_for_same_inputs() {
        let a = sha256_hex("krb:alicerealmpwdhost");
        let b = sha256_hex("krb:alicerealmpwdhost");
        assert_eq!(a, b);
    }

    #[test]
    fn context_hash_differs_by_upstream_host() {
        let a = sha256_hex("krb:alicerealmpwdhost-a");
        let b = sha256_hex("krb:alicerealmpwdhost-b");
        assert_ne!(a, b);
    }
}

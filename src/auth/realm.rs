//! Realm/username normalization (section 4.4). Grounded on `main.go`'s
//! `splitUsername` and `kerberos.go`'s `NewWithPassword` realm derivation:
//! split `user@realm`/`realm\user`, apply domain aliases, inject a default
//! domain when the result has no dot, then uppercase.

use std::collections::HashMap;

pub struct NormalizedLogin {
    pub user: String,
    pub realm: String,
}

/// Splits `login` into (user, realm) via `\` or `@`, applies `domains`
/// aliases, injects `default_domain` when the realm carries no dot, and
/// uppercases the final realm (Kerberos realms are conventionally
/// upper-case; the original notes usage is case-sensitive but uniformly
/// uppercase by convention).
pub fn normalize(login: &str, configured_realm: Option<&str>) -> NormalizedLogin {
    normalize_with(login, configured_realm, &HashMap::new(), None)
}

pub fn normalize_with(
    login: &str,
    configured_realm: Option<&str>,
    domains: &HashMap<String, String>,
    default_domain: Option<&str>,
) -> NormalizedLogin {
    let (user, mut realm) = split_username(login);
    if realm.is_empty() {
        realm = configured_realm.unwrap_or_default().to_string();
    }
    if let Some(alias) = domains.get(&realm) {
        realm = alias.clone();
    }
    if !realm.contains('.') {
        if let Some(default) = default_domain {
            realm.push_str(default);
        }
    }
    NormalizedLogin { user, realm: realm.to_ascii_uppercase() }
}

fn split_username(username: &str) -> (String, String) {
    if let Some(idx) = username.rfind('\\') {
        let realm = username[..idx].to_string();
        let user = username[idx + 1..].to_string();
        return (user, realm);
    }
    if let Some(idx) = username.rfind('@') {
        let user = username[..idx].to_string();
        let realm = username[idx + 1..].to_string();
        return (user, realm);
    }
    (username.to_string(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_backslash_form() {
        let n = normalize(r"CORP\alice", None);
        assert_eq!(n.user, "alice");
        assert_eq!(n.realm, "CORP");
    }

    #[test]
    fn splits_at_form_and_uppercases() {
        let n = normalize("alice@corp.example", None);
        assert_eq!(n.user, "alice");
        assert_eq!(n.realm, "CORP.EXAMPLE");
    }

    #[test]
    fn falls_back_to_configured_realm_when_bare() {
        let n = normalize("alice", Some("corp.example"));
        assert_eq!(n.realm, "CORP.EXAMPLE");
    }

    #[test]
    fn applies_domain_alias_then_uppercases() {
        let mut domains = HashMap::new();
        domains.insert("EUR".to_string(), "eur.msd.world.company".to_string());
        let n = normalize_with("alice@EUR", None, &domains, None);
        assert_eq!(n.realm, "EUR.MSD.WORLD.COMPANY");
    }

    #[test]
    fn injects_default_domain_when_dotless() {
        let n = normalize_with("alice@corp", None, &HashMap::new(), Some(".example.com"));
        assert_eq!(n.realm, "CORP.EXAMPLE.COM");
    }
}

//! Rule matcher (section 4.3). Grounded on `config.go`'s `match()`/
//! `resolve()`/`resolvePac()`.

use std::sync::Arc;

use crate::config::model::{Config, Proxy, Rule};
use crate::rules::cache::{HostCache, Verdict};
use crate::rules::regex::CandidateKind;

pub struct MatchOutcome {
    pub proxies: Vec<Arc<Proxy>>,
    /// `true` when this is the synthesized `direct` fallback produced by a
    /// PAC rule returning `DIRECT` with no later concrete rule matching
    /// (section 4.3's DIRECT-fallthrough policy).
    pub is_direct_fallthrough: bool,
}

/// `prefix` is `"http:"` or `"socks:"`, matching section 3's cache key.
pub fn match_request(
    config: &Config,
    cache: &HostCache,
    prefix: &str,
    rules: &[Rule],
    url: &str,
    host_port: &str,
) -> Option<MatchOutcome> {
    let host_only = host_port.split(':').next().unwrap_or(host_port);

    if let Some(cached) = cache.get(prefix, host_port) {
        return cached.map(|v| MatchOutcome { proxies: v.proxies, is_direct_fallthrough: false });
    }

    let mut fallback_direct: Option<&Rule> = None;

    for rule in rules {
        let candidate = match rule.regex.candidate_kind() {
            CandidateKind::Url => url,
            CandidateKind::HostPort => host_port,
            CandidateKind::Host => host_only,
        };
        if !rule.regex.is_match(candidate) {
            continue;
        }
        match resolve(config, url, host_only, rule) {
            Resolution::Continue => {
                fallback_direct = Some(rule);
            }
            Resolution::Proxies(proxies) => {
                let verdict = Verdict::from_rule(rule, proxies.clone());
                cache.put(prefix, host_port, Some(verdict));
                return Some(MatchOutcome { proxies, is_direct_fallthrough: false });
            }
            Resolution::None => {}
        }
    }

    if fallback_direct.is_some() {
        let direct = config.proxy("direct").cloned().expect("direct proxy is always synthesized");
        return Some(MatchOutcome { proxies: vec![direct], is_direct_fallthrough: true });
    }

    cache.put(prefix, host_port, None);
    None
}

enum Resolution {
    Proxies(Vec<Arc<Proxy>>),
    /// PAC returned DIRECT: keep scanning subsequent rules.
    Continue,
    None,
}

fn resolve(config: &Config, url: &str, host: &str, rule: &Rule) -> Resolution {
    let Some(first_name) = rule.first_proxy_name() else {
        return Resolution::None;
    };
    let Some(first_proxy) = config.proxy(first_name) else {
        return Resolution::None;
    };

    if !matches!(first_proxy.kind, crate::config::schema::ProxyType::Pac) {
        return Resolution::Proxies(all_proxies(config, rule));
    }

    let pac_result = resolve_pac(config, url, host, first_proxy);
    match pac_result {
        Some(r) if r.is_direct => Resolution::Continue,
        Some(r) if r.is_proxy || r.is_socks => {
            let matches: Vec<Arc<Proxy>> = config
                .proxies
                .values()
                .filter(|p| {
                    p.pac_regex.as_ref().map(|re| {
                        let candidate = if re.source.contains(':') { r.host_port.as_str() } else { r.host_only.as_str() };
                        re.is_match(candidate)
                    }).unwrap_or(false)
                })
                .cloned()
                .collect();
            if !matches.is_empty() {
                Resolution::Proxies(matches)
            } else {
                Resolution::Proxies(vec![Arc::new(synthesize_proxy(&r, rule))])
            }
        }
        _ => Resolution::Proxies(vec![first_proxy.clone()]),
    }
}

fn all_proxies(config: &Config, rule: &Rule) -> Vec<Arc<Proxy>> {
    rule.all_proxy_names().into_iter().filter_map(|n| config.proxy(&n).cloned()).collect()
}

struct PacResult {
    is_direct: bool,
    is_proxy: bool,
    is_socks: bool,
    host_port: String,
    host_only: String,
}

fn resolve_pac(_config: &Config, url: &str, host: &str, proxy: &Proxy) -> Option<PacResult> {
    let runtime = proxy.pac_runtime.as_ref()?;
    let output = runtime.run(url, host).ok()?;
    let first = output.split(';').next().unwrap_or("").trim();
    let mut parts = first.splitn(2, ' ');
    let kind = parts.next().unwrap_or("").trim();
    let host_port = parts.next().unwrap_or("").trim().to_string();
    let host_only = host_port.split(':').next().unwrap_or("").to_string();
    Some(PacResult {
        is_direct: kind == "DIRECT",
        is_proxy: matches!(kind, "PROXY" | "HTTP" | "HTTPS"),
        is_socks: matches!(kind, "SOCKS" | "SOCKS4" | "SOCKS5"),
        host_port,
        host_only,
    })
}

fn synthesize_proxy(result: &PacResult, rule: &Rule) -> Proxy {
    let (host, port) = crate::config::split_host_port(&result.host_port, "127.0.0.1", "8080");
    let port: u16 = port.parse().unwrap_or(8080);
    let kind = if result.is_socks {
        crate::config::schema::ProxyType::Socks
    } else {
        crate::config::schema::ProxyType::Anonymous
    };
    Proxy {
        name: result.host_port.clone(),
        kind,
        host: Some(host),
        port,
        ssl: false,
        spn: "HTTP".to_string(),
        realm: None,
        credential: None,
        pac_credentials: Vec::new(),
        pac_regex: None,
        url: None,
        pac_js: None,
        pac_runtime: None,
        pac_proxy_directive: None,
        verbose: rule.verbose,
        is_used: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{check_and_build, Timeouts};
    use crate::config::schema::RawConf;

    fn build_basic_config(yaml: &str) -> Config {
        let raw: RawConf = serde_yaml::from_str(yaml).unwrap();
        let dir = tempfile::tempdir().unwrap();
        check_and_build(raw, &dir.path().join("key")).unwrap()
    }

    #[test]
    fn direct_fallthrough_continues_scanning_rules() {
        let cfg = build_basic_config(
            r#"
proxies:
  krb:
    type: kerberos
    host: upstream.example
    port: 8080
    credential: user
credentials:
  user:
    login: alice
rules:
  - host: "special.*"
    proxy: krb
  - host: "*"
    proxy: krb
"#,
        );
        let cache = HostCache::new(true);
        let outcome = match_request(&cfg, &cache, "http:", &cfg.rules, "http://special.example/", "special.example:80");
        assert!(outcome.is_some());
        assert_eq!(outcome.unwrap().proxies[0].name, "krb");
    }

    #[test]
    fn no_match_returns_none() {
        let cfg = build_basic_config(
            r#"
rules:
  - host: "only.example"
    proxy: direct
"#,
        );
        let cache = HostCache::new(true);
        let outcome = match_request(&cfg, &cache, "http:", &cfg.rules, "http://other.example/", "other.example:80");
        assert!(outcome.is_none());
    }

    #[test]
    fn cache_is_stable_across_calls() {
        let cfg = build_basic_config(
            r#"
rules:
  - host: "*"
    proxy: direct
"#,
        );
        let cache = HostCache::new(true);
        let a = match_request(&cfg, &cache, "http:", &cfg.rules, "http://x/", "x:80").unwrap();
        let b = match_request(&cfg, &cache, "http:", &cfg.rules, "http://x/", "x:80").unwrap();
        assert_eq!(a.proxies[0].name, b.proxies[0].name);
        let _ = Timeouts { connect: 0, idle: 0, close: 0 };
    }
}

//! Runtime (built and validated) configuration, the product of
//! `check()`/`build()` in `config.go`. Once built, a `Config` is immutable;
//! hot-reload always constructs a brand-new `Config` and swaps an `Arc` of
//! it (`supervisor` module), never mutates one in place.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::schema::{ProxyType, RawConf};
use crate::rules::pac::PacExecutor;
use crate::rules::regex::CompiledRegex;

pub const NONE_PROXY_NAME: &str = "none";
pub const DIRECT_PROXY_NAME: &str = "direct";

#[derive(Debug, Clone)]
pub struct Credential {
    pub name: String,
    pub login: Option<String>,
    pub password: Option<String>,
    pub is_null: bool,
    pub is_per_user: bool,
    pub is_used: bool,
}

impl Credential {
    pub fn is_native(&self) -> bool {
        self.login.as_deref() == Some("$native")
    }
}

#[derive(Debug, Clone)]
pub struct Proxy {
    pub name: String,
    pub kind: ProxyType,
    pub host: Option<String>,
    pub port: u16,
    pub ssl: bool,
    pub spn: String,
    pub realm: Option<String>,
    pub credential: Option<Arc<Credential>>,
    pub pac_credentials: Vec<Arc<Credential>>,
    pub pac_regex: Option<CompiledRegex>,
    pub url: Option<String>,
    pub pac_js: Option<String>,
    pub pac_runtime: Option<Arc<PacExecutor>>,
    /// The directive this proxy contributes to a generated PAC script
    /// (`DIRECT`, `PROXY host:port`, `SOCKS host:port`, ...).
    pub pac_proxy_directive: Option<String>,
    pub verbose: Option<bool>,
    pub is_used: bool,
}

impl Proxy {
    /// First host in the comma-separated failover list.
    pub fn hosts(&self) -> Vec<String> {
        self.host
            .as_deref()
            .map(|h| h.split(',').map(str::trim).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn none() -> Self {
        Proxy {
            name: NONE_PROXY_NAME.to_string(),
            kind: ProxyType::None,
            host: None,
            port: 0,
            ssl: false,
            spn: String::new(),
            realm: None,
            credential: None,
            pac_credentials: Vec::new(),
            pac_regex: None,
            url: None,
            pac_js: None,
            pac_runtime: None,
            pac_proxy_directive: None,
            verbose: None,
            is_used: false,
        }
    }

    pub fn direct() -> Self {
        Proxy {
            name: DIRECT_PROXY_NAME.to_string(),
            kind: ProxyType::Direct,
            pac_proxy_directive: Some("DIRECT".to_string()),
            ..Proxy::none()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub host_pattern: String,
    pub proxy: Option<String>,
    pub dns: Option<String>,
    pub verbose: Option<bool>,
    pub mitm: bool,
    pub regex: CompiledRegex,
}

impl Rule {
    pub fn first_proxy_name(&self) -> Option<&str> {
        self.proxy.as_deref().and_then(|p| p.split(',').next())
    }

    pub fn all_proxy_names(&self) -> Vec<String> {
        self.proxy
            .as_deref()
            .map(|p| p.split(',').map(str::trim).map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: i64,
    pub idle: i64,
    pub close: i64,
}

pub struct Config {
    pub bind: String,
    pub port: u16,
    pub socks_port: u16,
    pub verbose: bool,
    pub debug: bool,
    pub trace: bool,
    pub proxies: HashMap<String, Arc<Proxy>>,
    pub credentials: HashMap<String, Arc<Credential>>,
    pub domains: HashMap<String, String>,
    pub rules: Vec<Rule>,
    pub socks_rules: Vec<Rule>,
    pub krb5: String,
    pub timeouts: Timeouts,
    pub acl: Vec<String>,
    pub pool_enabled: bool,
    pub hosts_cache_enabled: bool,
    pub pac_bind_directive: String,
    /// Bumped on every successful hot-reload; dispatchers capture this at
    /// request start and refuse keep-alive reuse once it goes stale.
    pub generation: u64,
}

impl Config {
    pub fn proxy(&self, name: &str) -> Option<&Arc<Proxy>> {
        self.proxies.get(name)
    }

    /// Every non-per-user credential that is reachable from a used rule and
    /// still missing a login or password. Used by the supervisor's
    /// hot-reload guard (section 4.9).
    pub fn incomplete_used_credentials(&self) -> Vec<&Credential> {
        self.credentials
            .values()
            .map(|c| c.as_ref())
            .filter(|c| c.is_used && !c.is_per_user && !c.is_null && !c.is_native())
            .filter(|c| c.login.is_none() || c.password.is_none())
            .collect()
    }
}

/// Builds and validates a `Config` from the raw deserialized schema,
/// mirroring `config.go`'s `check()` + `build()` pipeline. PAC proxy
/// download/compilation is performed by the caller (it is async) before
/// `pac_js`/`pac_runtime` are attached; this function only validates
/// structure and derives the credential/proxy graph.
pub fn check_and_build(raw: RawConf, existing_key_file: &std::path::Path) -> anyhow::Result<Config> {
    check(&raw)?;
    build(raw, existing_key_file)
}

fn check(raw: &RawConf) -> anyhow::Result<()> {
    for (name, proxy) in &raw.proxies {
        if name.is_empty() || name == NONE_PROXY_NAME || name == DIRECT_PROXY_NAME {
            anyhow::bail!("proxy names cannot be empty, 'direct' or 'none'");
        }
        let kind = proxy
            .kind
            .ok_or_else(|| anyhow::anyhow!("proxy '{name}': all proxies must contain 'type'"))?;
        if kind != ProxyType::Pac {
            if proxy.url.is_some() {
                anyhow::bail!("proxy '{name}': all non-pac proxies must not contain 'url'");
            }
            if proxy.host.is_none() {
                anyhow::bail!("proxy '{name}': all proxies must contain 'host'");
            }
            if proxy.port == 0 {
                anyhow::bail!("proxy '{name}': 'port' must be > 0");
            }
            if proxy.credentials.is_some() {
                anyhow::bail!("proxy '{name}': all non-pac proxies must not contain 'credentials'");
            }
        } else {
            if proxy.url.is_none() {
                anyhow::bail!("proxy '{name}': all pac proxies must contain 'url'");
            }
            if proxy.host.is_some() || proxy.port != 0 {
                anyhow::bail!("proxy '{name}': pac proxies must not contain 'host'/'port'");
            }
        }
        if matches!(kind, ProxyType::Anonymous | ProxyType::Pac) && proxy.credential.is_some() {
            anyhow::bail!("proxy '{name}': anonymous/pac proxies must not contain 'credential'");
        }
        if let Some(cred) = &proxy.credential {
            if !cred.is_empty() && !raw.credentials.contains_key(cred) {
                anyhow::bail!("proxy '{name}': 'credential' must exist in 'credentials'");
            }
        }
        for cred in split_credentials(proxy.credentials.as_deref()) {
            if !raw.credentials.contains_key(&cred) {
                anyhow::bail!("proxy '{name}': pac 'credentials' entries must exist in 'credentials'");
            }
        }
    }
    for name in raw.credentials.keys() {
        if name.is_empty() || name.starts_with('$') {
            anyhow::bail!("credential name cannot be empty or start with '$'");
        }
    }
    for rules in [&raw.rules, &raw.socks_rules] {
        for rule in rules {
            if rule.host.is_none() {
                anyhow::bail!("all rules must contain 'host'");
            }
            if rule.proxy.is_none() && rule.dns.is_none() {
                anyhow::bail!("all rules must contain 'proxy' or 'dns'");
            }
            if let Some(proxy_ref) = &rule.proxy {
                if proxy_ref != DIRECT_PROXY_NAME && proxy_ref != NONE_PROXY_NAME {
                    for p in proxy_ref.split(',').map(str::trim) {
                        if !raw.proxies.contains_key(p) {
                            anyhow::bail!("rule proxy '{p}' must exist in 'proxies', or be 'direct'/'none'");
                        }
                    }
                }
            }
            if let Some(dns) = &rule.dns {
                let parts: Vec<&str> = dns.split(':').collect();
                if parts.is_empty() || parts.len() > 2 {
                    anyhow::bail!("'dns' must look like '[IP][:PORT]'");
                }
            }
        }
    }
    Ok(())
}

fn split_credentials(creds: Option<&str>) -> Vec<String> {
    match creds {
        Some(c) if !c.is_empty() => {
            if c.contains(',') {
                c.split(',').map(str::trim).map(str::to_string).collect()
            } else {
                c.split(' ').map(str::trim).map(str::to_string).filter(|s| !s.is_empty()).collect()
            }
        }
        _ => Vec::new(),
    }
}

fn gen_proxy_directive(kind: &str, hosts: &str, port: u16) -> String {
    hosts
        .split(',')
        .map(|h| format!("{kind} {}:{port}", h.trim()))
        .collect::<Vec<_>>()
        .join(";")
}

fn build(raw: RawConf, key_file: &std::path::Path) -> anyhow::Result<Config> {
    let bind = if raw.bind.is_empty() { "127.0.0.1".to_string() } else { raw.bind.clone() };
    let pac_bind_directive = format!("PROXY {bind}:{}", raw.port);

    let mut credentials: HashMap<String, Arc<Credential>> = HashMap::new();
    for (name, raw_cred) in &raw.credentials {
        let password = match &raw_cred.password {
            Some(p) if p.starts_with(crate::config::password::ENCRYPTED_PREFIX) => {
                let enc = &p[crate::config::password::ENCRYPTED_PREFIX.len()..];
                Some(crate::config::password::decrypt(key_file, enc)?)
            }
            other => other.clone(),
        };
        credentials.insert(
            name.clone(),
            Arc::new(Credential {
                name: name.clone(),
                login: raw_cred.login.clone(),
                password,
                is_null: false,
                is_per_user: false,
                is_used: false,
            }),
        );
    }

    let mut proxies: HashMap<String, Arc<Proxy>> = HashMap::new();
    let mut synthetic_creds: HashMap<String, Credential> = HashMap::new();

    for (name, raw_proxy) in &raw.proxies {
        let kind = raw_proxy.kind.unwrap();
        let credential = if matches!(kind, ProxyType::Kerberos | ProxyType::Basic) {
            match &raw_proxy.credential {
                None => {
                    let cname = format!("$null-{name}");
                    synthetic_creds.insert(
                        cname.clone(),
                        Credential {
                            name: cname.clone(),
                            login: None,
                            password: None,
                            is_null: true,
                            is_per_user: false,
                            is_used: false,
                        },
                    );
                    None // resolved to synthetic_creds below
                }
                Some(c) if c.is_empty() => {
                    let cname = format!("$user-{name}");
                    synthetic_creds.insert(
                        cname.clone(),
                        Credential {
                            name: cname.clone(),
                            login: None,
                            password: None,
                            is_null: false,
                            is_per_user: true,
                            is_used: false,
                        },
                    );
                    None
                }
                Some(c) => credentials.get(c).cloned(),
            }
        } else {
            None
        };

        let pac_regex = match &raw_proxy.pac {
            Some(p) => Some(CompiledRegex::compile(p)?),
            None => None,
        };

        let pac_proxy_directive = match kind {
            ProxyType::Direct => Some("DIRECT".to_string()),
            ProxyType::Socks => raw_proxy.host.as_deref().map(|h| gen_proxy_directive("SOCKS", h, raw_proxy.port)),
            ProxyType::Anonymous => raw_proxy.host.as_deref().map(|h| gen_proxy_directive("PROXY", h, raw_proxy.port)),
            _ => None,
        };

        proxies.insert(
            name.clone(),
            Arc::new(Proxy {
                name: name.clone(),
                kind,
                host: raw_proxy.host.clone(),
                port: raw_proxy.port,
                ssl: raw_proxy.ssl,
                spn: raw_proxy.spn.clone().unwrap_or_else(|| "HTTP".to_string()),
                realm: raw_proxy.realm.clone(),
                credential,
                pac_credentials: split_credentials(raw_proxy.credentials.as_deref())
                    .into_iter()
                    .filter_map(|c| credentials.get(&c).cloned())
                    .collect(),
                pac_regex,
                url: raw_proxy.url.clone(),
                pac_js: None,
                pac_runtime: None,
                pac_proxy_directive,
                verbose: raw_proxy.verbose,
                is_used: false,
            }),
        );
    }

    for (cname, cred) in synthetic_creds {
        credentials.insert(cname, Arc::new(cred));
    }
    // re-link per-user/null credentials onto their owning proxy now that
    // both maps are fully populated.
    for (name, raw_proxy) in &raw.proxies {
        if !matches!(raw_proxy.kind.unwrap(), ProxyType::Kerberos | ProxyType::Basic) {
            continue;
        }
        let cred_name = match &raw_proxy.credential {
            None => format!("$null-{name}"),
            Some(c) if c.is_empty() => format!("$user-{name}"),
            Some(c) => c.clone(),
        };
        if let Some(slot) = proxies.get_mut(name) {
            let cred = credentials.get(&cred_name).cloned();
            *slot = Arc::new(Proxy {
                credential: cred.clone(),
                pac_proxy_directive: if cred.as_ref().map(|c| c.is_per_user).unwrap_or(false) {
                    raw_proxy.host.as_deref().map(|h| gen_proxy_directive("PROXY", h, raw_proxy.port))
                } else {
                    slot.pac_proxy_directive.clone()
                },
                ..(**slot).clone()
            });
        }
    }

    proxies.insert(NONE_PROXY_NAME.to_string(), Arc::new(Proxy::none()));
    proxies.insert(DIRECT_PROXY_NAME.to_string(), Arc::new(Proxy::direct()));

    let build_rules = |raw_rules: &[crate::config::schema::RawRule]| -> anyhow::Result<Vec<Rule>> {
        let mut out = Vec::with_capacity(raw_rules.len());
        for r in raw_rules {
            let host_pattern = r.host.clone().unwrap();
            let regex = CompiledRegex::compile(&host_pattern)?;
            let proxy = if r.dns.is_some() && r.proxy.is_none() {
                Some(DIRECT_PROXY_NAME.to_string())
            } else {
                r.proxy.clone()
            };
            out.push(Rule {
                host_pattern,
                proxy,
                dns: r.dns.clone(),
                verbose: r.verbose,
                mitm: r.mitm,
                regex,
            });
        }
        Ok(out)
    };
    let rules = build_rules(&raw.rules)?;
    let socks_rules = build_rules(&raw.socks_rules)?;

    // mark proxy/credential usage
    let mut proxies = proxies;
    for rule in rules.iter().chain(socks_rules.iter()) {
        for pname in rule.all_proxy_names() {
            if let Some(p) = proxies.get(&pname) {
                let mut updated = (**p).clone();
                updated.is_used = true;
                if let Some(cred) = &updated.credential {
                    if !cred.is_per_user {
                        if let Some(slot) = credentials.get_mut(&cred.name) {
                            let mut c = (**slot).clone();
                            c.is_used = true;
                            *slot = Arc::new(c);
                        }
                    }
                }
                proxies.insert(pname, Arc::new(updated));
            }
        }
    }

    let experimental: Vec<String> = raw
        .experimental
        .as_deref()
        .map(|s| s.split(',').map(str::trim).map(str::to_string).collect())
        .unwrap_or_default();
    let pool_enabled = experimental.iter().any(|e| e == "connection-pools") || raw.experimental.is_none();
    let hosts_cache_enabled = experimental.iter().any(|e| e == "hosts-cache") || raw.experimental.is_none();

    Ok(Config {
        bind,
        port: raw.port,
        socks_port: raw.socks_port,
        verbose: raw.verbose,
        debug: raw.debug,
        trace: raw.trace,
        proxies,
        credentials,
        domains: raw.domains.clone(),
        rules,
        socks_rules,
        krb5: raw.krb5.clone().unwrap_or_else(|| crate::auth::kerberos::DEFAULT_KRB5.to_string()),
        timeouts: Timeouts {
            connect: raw.connect_timeout,
            idle: raw.idle_timeout,
            close: raw.close_timeout,
        },
        acl: raw.acl.clone(),
        pool_enabled,
        hosts_cache_enabled,
        pac_bind_directive,
        generation: 0,
    })
}

//! On-disk config schema (section 6). Deserialized directly from YAML or
//! JSON (the loader sniffs the first non-whitespace byte per `config.go`'s
//! `readFromFile`). Field names mirror the Go `Conf`/`ConfProxy`/`ConfCred`/
//! `ConfRule` structs so operators migrating a `kpx`-style config need no
//! changes beyond the crate name.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProxyType {
    Kerberos,
    Socks,
    Anonymous,
    Direct,
    Basic,
    None,
    Pac,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCred {
    pub login: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProxy {
    #[serde(rename = "type")]
    pub kind: Option<ProxyType>,
    pub host: Option<String>,
    #[serde(default)]
    pub port: u16,
    pub verbose: Option<bool>,
    #[serde(default)]
    pub ssl: bool,
    pub spn: Option<String>,
    pub realm: Option<String>,
    pub credential: Option<String>,
    pub credentials: Option<String>,
    pub pac: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRule {
    pub host: Option<String>,
    pub proxy: Option<String>,
    pub dns: Option<String>,
    pub verbose: Option<bool>,
    #[serde(default)]
    pub mitm: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConf {
    #[serde(default)]
    pub bind: String,
    #[serde(default)]
    pub port: u16,
    #[serde(rename = "socksPort", default)]
    pub socks_port: u16,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub proxies: HashMap<String, RawProxy>,
    #[serde(default)]
    pub credentials: HashMap<String, RawCred>,
    #[serde(default)]
    pub domains: HashMap<String, String>,
    #[serde(default)]
    pub rules: Vec<RawRule>,
    #[serde(rename = "socksRules", default)]
    pub socks_rules: Vec<RawRule>,
    #[serde(default)]
    pub krb5: Option<String>,
    #[serde(rename = "connectTimeout", default = "default_connect_timeout")]
    pub connect_timeout: i64,
    #[serde(rename = "idleTimeout", default)]
    pub idle_timeout: i64,
    #[serde(rename = "closeTimeout", default = "default_close_timeout")]
    pub close_timeout: i64,
    #[serde(rename = "useEnvProxy", default)]
    pub use_env_proxy: bool,
    #[serde(default)]
    pub experimental: Option<String>,
    #[serde(default)]
    pub acl: Vec<String>,
}

fn default_connect_timeout() -> i64 {
    crate::supervisor::DEFAULT_CONNECT_TIMEOUT
}
fn default_close_timeout() -> i64 {
    crate::supervisor::DEFAULT_CLOSE_TIMEOUT
}

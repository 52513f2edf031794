//! Host-verdict cache (section 4.3 "Host-cache entry", section 3). Keyed by
//! `prefix + host:port`, unbounded lifetime tied to the config generation:
//! a hot-reload publishes a brand-new `Config` (and therefore a brand-new
//! cache, since the cache lives alongside it), so invalidation is simply
//! "the old cache is dropped with the old config".

use dashmap::DashMap;
use std::sync::Arc;

use crate::config::model::{Proxy, Rule};

#[derive(Clone)]
pub struct Verdict {
    pub rule_host_pattern: String,
    pub proxies: Vec<Arc<Proxy>>,
}

pub struct HostCache {
    enabled: bool,
    entries: DashMap<String, Option<Verdict>>,
}

impl HostCache {
    pub fn new(enabled: bool) -> Self {
        HostCache { enabled, entries: DashMap::new() }
    }

    pub fn get(&self, prefix: &str, host_port: &str) -> Option<Option<Verdict>> {
        if !self.enabled {
            return None;
        }
        let key = format!("{prefix}{host_port}");
        self.entries.get(&key).map(|v| v.clone())
    }

    pub fn put(&self, prefix: &str, host_port: &str, verdict: Option<Verdict>) {
        if !self.enabled {
            return;
        }
        let key = format!("{prefix}{host_port}");
        self.entries.insert(key, verdict);
    }
}

impl Verdict {
    pub fn from_rule(rule: &Rule, proxies: Vec<Arc<Proxy>>) -> Self {
        Verdict { rule_host_pattern: rule.host_pattern.clone(), proxies }
    }
}

//! Sticky failover (section 4.7 "remember the winning proxy and host for
//! preferential ordering in future matches (sticky failover keyed by
//! `time.Now()` per name)"). A rule with several candidate proxies tries
//! them in declaration order on a cold start, but once one of them proves
//! reachable its name is remembered against the rule so later requests try
//! it first.

use std::time::Instant;

use dashmap::DashMap;

pub struct StickyMap {
    winners: DashMap<String, (String, Instant)>,
}

impl StickyMap {
    pub fn new() -> Self {
        StickyMap { winners: DashMap::new() }
    }

    pub fn remember(&self, rule_host_pattern: &str, proxy_name: &str) {
        self.winners.insert(rule_host_pattern.to_string(), (proxy_name.to_string(), Instant::now()));
    }

    /// Reorders `candidates` (by proxy name) so a remembered winner for
    /// this rule sorts first, if it's still among the candidates.
    pub fn order<'a, T>(&self, rule_host_pattern: &str, candidates: &mut Vec<T>)
    where
        T: AsRef<str>,
    {
        let Some(entry) = self.winners.get(rule_host_pattern) else { return };
        let winner = entry.0.clone();
        if let Some(pos) = candidates.iter().position(|c| c.as_ref() == winner) {
            candidates.swap(0, pos);
        }
    }
}

impl Default for StickyMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembered_winner_sorts_first() {
        let sticky = StickyMap::new();
        sticky.remember("*.example", "backup");
        let mut candidates = vec!["primary".to_string(), "backup".to_string()];
        sticky.order("*.example", &mut candidates);
        assert_eq!(candidates[0], "backup");
    }

    #[test]
    fn no_memory_leaves_order_untouched() {
        let sticky = StickyMap::new();
        let mut candidates = vec!["primary".to_string(), "backup".to_string()];
        sticky.order("*.example", &mut candidates);
        assert_eq!(candidates[0], "primary");
    }
}

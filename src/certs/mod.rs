//! CA and leaf certificate manager (section 4.5). The CA is a process-wide
//! singleton independent of config hot-reload generations: per section
//! 4.5, "certificates are never invalidated; restart rotates," so a config
//! reload must not regenerate or discard it.

pub mod ca;
pub mod manager;

use std::sync::Arc;

use once_cell::sync::OnceCell;

pub use ca::CaStore;
pub use manager::CertsManager;

use crate::config::model::Config;

static CA_STORE: OnceCell<Arc<CaStore>> = OnceCell::new();

/// Ensures the persistent CA exists if any rule enables MITM, so the first
/// intercepted connection never pays CA-generation latency. A no-op when
/// no rule needs it.
pub fn maybe_init_ca(config: &Config) -> anyhow::Result<()> {
    if config.rules.iter().chain(config.socks_rules.iter()).any(|r| r.mitm) {
        ca_store()?;
    }
    Ok(())
}

/// Returns the process-wide CA, generating and persisting it under
/// `./authrelay.ca.{crt,key}` on first use.
pub fn ca_store() -> anyhow::Result<Arc<CaStore>> {
    if let Some(existing) = CA_STORE.get() {
        return Ok(existing.clone());
    }
    let prefix = std::path::PathBuf::from("authrelay");
    let store = Arc::new(CaStore::load_or_create(&prefix)?);
    Ok(CA_STORE.get_or_init(|| store).clone())
}

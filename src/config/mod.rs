pub mod model;
pub mod password;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;

pub use model::Config;
use schema::RawConf;

/// Minimum CLI surface the core requires (section 6). The self-update,
/// terminal UI, and config-file-watching *wiring beyond `notify`* are
/// external collaborators per spec.md section 1; this struct only captures
/// what `Config::load` and the supervisor actually consume.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub listen: Option<String>,
    pub user: Option<String>,
    pub acl: Vec<String>,
    pub key_file: PathBuf,
    /// Pre-built config bypassing the file loader entirely, used by the
    /// CLI's positional `host:port` shorthand (section 6) to synthesize a
    /// single-Kerberos-proxy config with no file on disk.
    pub inline: Option<RawConf>,
}

pub async fn load(overrides: &CliOverrides) -> anyhow::Result<Arc<Config>> {
    let raw = match &overrides.inline {
        Some(inline) => inline.clone(),
        None => match &overrides.config_path {
            Some(path) => read_from_file(path)?,
            None => RawConf::default(),
        },
    };
    let raw = apply_overrides(raw, overrides);
    load_raw(raw, &overrides.key_file).await
}

async fn load_raw(raw: RawConf, key_file: &Path) -> anyhow::Result<Arc<Config>> {
    let mut built = model::check_and_build(raw, key_file).context("unable to build config")?;
    attach_pac_proxies(&mut built).await.context("unable to load PAC proxies")?;
    crate::certs::maybe_init_ca(&built).context("unable to load certificates")?;
    Ok(Arc::new(built))
}

fn read_from_file(path: &Path) -> anyhow::Result<RawConf> {
    let text = std::fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))?;
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(&text).context("unable to parse config as JSON")
    } else {
        serde_yaml::from_str(&text).context("unable to parse config as YAML")
    }
}

fn apply_overrides(mut raw: RawConf, overrides: &CliOverrides) -> RawConf {
    if let Some(listen) = &overrides.listen {
        let (host, port) = split_host_port(listen, "127.0.0.1", "0");
        raw.bind = host;
        if let Ok(p) = port.parse() {
            raw.port = p;
        }
    }
    if let Some(user) = &overrides.user {
        if raw.credentials.len() == 1 {
            for cred in raw.credentials.values_mut() {
                if cred.login.as_deref() != Some(user.as_str()) {
                    cred.login = Some(user.clone());
                    cred.password = None;
                }
            }
        }
    }
    if !overrides.acl.is_empty() {
        raw.acl = overrides.acl.clone();
    }
    raw
}

/// Splits `[host]:port`, defaulting either side when absent, grounded on
/// `proxy.go`'s `splitHostPort` helper.
pub fn split_host_port(value: &str, default_host: &str, default_port: &str) -> (String, String) {
    match value.rsplit_once(':') {
        Some((host, port)) => {
            let host = if host.is_empty() { default_host } else { host };
            let port = if port.is_empty() { default_port } else { port };
            (host.to_string(), port.to_string())
        }
        None => (value.to_string(), default_port.to_string()),
    }
}

/// Downloads and compiles every used PAC proxy's script, with the
/// UTF-8-then-Latin-1 decode fallback named in spec.md section 4.3.
async fn attach_pac_proxies(config: &mut Config) -> anyhow::Result<()> {
    let names: Vec<String> = config
        .proxies
        .values()
        .filter(|p| p.is_used && matches!(p.kind, schema::ProxyType::Pac))
        .map(|p| p.name.clone())
        .collect();

    for name in names {
        let url = config.proxies[&name].url.clone().expect("pac proxy must have url");
        tracing::info!(proxy = %name, %url, "loading PAC script");
        let response = reqwest::get(&url).await.with_context(|| format!("downloading pac for '{name}'"))?;
        let bytes = response.bytes().await?;
        let js = String::from_utf8(bytes.to_vec()).unwrap_or_else(|_| {
            bytes.iter().map(|&b| b as char).collect()
        });
        let runtime = crate::rules::pac::PacExecutor::new(&js)
            .with_context(|| format!("unable to create pac runtime for '{name}'"))?;
        let slot = config.proxies.get_mut(&name).unwrap();
        let mut updated = (**slot).clone();
        updated.pac_js = Some(js);
        updated.pac_runtime = Some(Arc::new(runtime));
        *slot = Arc::new(updated);
    }
    Ok(())
}

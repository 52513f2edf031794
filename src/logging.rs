//! Structured logging init, grounded on `local_proxy.rs`'s
//! `proxy::logging::init()` call. The reference proxy's own `logging`
//! module source wasn't part of the retrieved pack, so this is built
//! directly against `tracing-subscriber` rather than ported line-for-line.

use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default)]
pub struct Verbosity {
    pub verbose: bool,
    pub debug: bool,
    pub trace: bool,
}

impl Verbosity {
    fn filter_directive(self) -> &'static str {
        if self.trace {
            "trace"
        } else if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else {
            "warn"
        }
    }
}

/// Installs the global tracing subscriber. Returns a guard that, when
/// dropped, flushes any buffered output (kept for symmetry with the
/// reference proxy's `_logging_guard` pattern in `main`).
pub fn init(verbosity: Verbosity) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("AUTHRELAY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logging: {e}"))
}

/// `Proxy-Authorization`/`Authorization` header values carry secrets
/// (Basic credentials, SPNEGO tokens). `log.go` truncates them before
/// writing trace output; this is the Rust equivalent, applied everywhere a
/// raw header line is logged.
pub fn redact_auth_header(name: &str, value: &str) -> String {
    let lname = name.to_ascii_lowercase();
    if lname == "proxy-authorization" || lname == "authorization" || lname == "www-authenticate" {
        let keep = value.char_indices().nth(16).map(|(i, _)| i).unwrap_or(value.len());
        format!("{}...(redacted)", &value[..keep])
    } else {
        value.to_string()
    }
}

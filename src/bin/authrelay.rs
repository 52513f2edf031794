//! CLI entrypoint (section 6). Parses the flag/positional surface the core
//! needs, wires it into `config::CliOverrides`, and drives a `Supervisor`
//! until Ctrl-C, an optional `--timeout`, or a fatal error stops it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;

use authrelay::auth::kerberos::DEFAULT_DOMAIN;
use authrelay::config::schema::{ProxyType, RawConf, RawCred, RawProxy, RawRule};
use authrelay::config::{self, CliOverrides};
use authrelay::logging::Verbosity;
use authrelay::supervisor::Supervisor;

/// Single upstream-credential-injecting forward proxy (HTTP + SOCKS5).
#[derive(Parser, Debug)]
#[command(name = "authrelay", version, about)]
struct Cli {
    /// Path to a YAML or JSON config file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Override the listen address as `[ip:]port`.
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Override the single credential's login as `user[@domain]`.
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Allowed client IP literals.
    #[arg(long = "acl", value_delimiter = ',')]
    acl: Vec<String>,

    /// Symmetric key file backing encrypted passwords.
    #[arg(short = 'k', long = "key", default_value = "authrelay.key")]
    key: PathBuf,

    /// Prompt for a password on stdin, print its encrypted form, and exit.
    #[arg(short = 'e', long = "encrypt")]
    encrypt: bool,

    #[arg(short = 'd', long = "debug")]
    debug: bool,

    #[arg(short = 't', long = "trace")]
    trace: bool,

    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Auto-exit after N seconds, regardless of traffic.
    #[arg(long = "timeout")]
    timeout: Option<u64>,

    /// Shorthand single-Kerberos-proxy mode: the upstream's `host:port`.
    #[arg(value_name = "HOST:PORT")]
    target: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.encrypt {
        return run_encrypt(&cli.key);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("authrelay: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run_encrypt(key_file: &std::path::Path) -> ExitCode {
    use std::io::Write as _;
    eprint!("Password to encrypt: ");
    let _ = std::io::stderr().flush();

    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        eprintln!("authrelay: failed to read password from stdin");
        return ExitCode::from(1);
    }
    let password = input.trim_end_matches(['\n', '\r']);

    match authrelay::config::password::encrypt(key_file, password) {
        Ok(encoded) => {
            println!("{}{encoded}", authrelay::config::password::ENCRYPTED_PREFIX);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("authrelay: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let verbosity = Verbosity { verbose: cli.verbose, debug: cli.debug, trace: cli.trace };
    authrelay::logging::init(verbosity)?;

    let mut overrides = CliOverrides {
        config_path: cli.config.clone(),
        listen: cli.listen.clone(),
        user: cli.user.clone(),
        acl: cli.acl.clone(),
        key_file: cli.key.clone(),
        inline: None,
    };

    if let Some(target) = &cli.target {
        overrides.config_path = None;
        overrides.inline = Some(shorthand_config(target, cli.user.as_deref()));
    }

    let supervisor = Supervisor::init(overrides).await.context("fatal: unable to initialize supervisor")?;
    run_until_stopped(supervisor, cli.timeout).await
}

async fn run_until_stopped(supervisor: Arc<Supervisor>, timeout: Option<u64>) -> anyhow::Result<()> {
    let runner = supervisor.clone();
    match timeout {
        Some(secs) => {
            tokio::select! {
                res = runner.run() => res?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    supervisor.stop();
                }
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!(secs, "auto-exit timeout reached");
                    supervisor.stop();
                }
            }
        }
        None => {
            tokio::select! {
                res = runner.run() => res?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    supervisor.stop();
                }
            }
        }
    }
    Ok(())
}

/// Builds a single-rule, single-Kerberos-proxy config for the positional
/// `host:port` shorthand. `user` without a `@domain` suffix falls back to
/// the built-in default realm.
fn shorthand_config(host_port: &str, user: Option<&str>) -> RawConf {
    let (host, port) = config::split_host_port(host_port, "127.0.0.1", "8080");
    let (login, realm) = split_user_domain(user);

    let mut proxies = HashMap::new();
    proxies.insert(
        "krb".to_string(),
        RawProxy {
            kind: Some(ProxyType::Kerberos),
            host: Some(host),
            port: port.parse().unwrap_or(8080),
            credential: Some("default".to_string()),
            realm,
            spn: Some("HTTP".to_string()),
            ..Default::default()
        },
    );

    let mut credentials = HashMap::new();
    credentials.insert("default".to_string(), RawCred { login, password: None });

    let rules = vec![RawRule { host: Some("*".to_string()), proxy: Some("krb".to_string()), ..Default::default() }];

    RawConf {
        port: 3128,
        connect_timeout: authrelay::supervisor::DEFAULT_CONNECT_TIMEOUT,
        close_timeout: authrelay::supervisor::DEFAULT_CLOSE_TIMEOUT,
        proxies,
        credentials,
        rules,
        ..Default::default()
    }
}

fn split_user_domain(user: Option<&str>) -> (Option<String>, Option<String>) {
    match user {
        None => (None, None),
        Some(user) => match user.split_once('@') {
            Some((login, domain)) => (Some(login.to_string()), Some(domain.to_ascii_uppercase())),
            None => (Some(user.to_string()), Some(DEFAULT_DOMAIN.trim_start_matches('.').to_string())),
        },
    }
}

//! Generates the JS served at `GET /proxy.pac` (section 4.3, section 6
//! "Served endpoint"). Grounded on `config.go`'s `genpac()`: a browser
//! pointed at this proxy's own PAC endpoint cannot speak SPNEGO/Basic to an
//! upstream itself, so every concrete rule is rewritten to route back
//! through this listener (`bind:port` for HTTP, `bind:socksPort` for rules
//! whose first proxy is a SOCKS5 entry); `direct` rules keep `DIRECT`;
//! rules backed by a PAC proxy are inlined as a nested `FindProxyForURL`
//! whose own `DIRECT` answer is treated as "fall through to later rules",
//! matching the matcher's semantics in `rules::matcher`.

use crate::config::model::Config;
use crate::config::schema::ProxyType;

pub fn generate(config: &Config) -> String {
    let mut out = String::new();
    out.push_str("function FindProxyForURL(url, host) {\n");
    out.push_str("  \"use strict\";\n");

    for rule in &config.rules {
        if rule.dns.is_some() {
            continue;
        }
        let Some(first_name) = rule.first_proxy_name() else { continue };
        let Some(first_proxy) = config.proxy(first_name) else { continue };
        let negate = if rule.regex.negate { "!" } else { "" };

        if first_proxy.kind == ProxyType::Pac {
            if let Some(js) = &first_proxy.pac_js {
                out.push_str(&format!("  if ({negate}/{}/.test(host)) {{\n", rule.regex.source));
                out.push_str("    var inner = (function() {\n");
                out.push_str(js);
                out.push_str("\n      return FindProxyForURL;\n    })();\n");
                out.push_str("    var r = inner(url, host);\n");
                out.push_str("    if (r && r.split(';')[0].trim() !== 'DIRECT') return r;\n");
                out.push_str("  }\n");
            }
            continue;
        }

        // Regardless of the proxy's real identity, a PAC client must be
        // routed back through this listener, which performs the actual
        // credential injection.
        let via = if first_proxy.kind == ProxyType::Socks {
            format!("SOCKS {}:{}", config.bind, config.socks_port)
        } else {
            config.pac_bind_directive.clone()
        };
        out.push_str(&format!("  if ({negate}/{}/.test(host)) return \"{via}\";\n", rule.regex.source));
    }

    out.push_str("  return \"DIRECT\";\n");
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::check_and_build;
    use crate::config::schema::RawConf;

    #[test]
    fn generated_script_routes_through_local_listener() {
        let raw: RawConf = serde_yaml::from_str(
            r#"
bind: 127.0.0.1
port: 3128
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
  - host: "*"
    proxy: krb
"#,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = check_and_build(raw, &dir.path().join("key")).unwrap();
        let js = generate(&cfg);
        assert!(js.contains("127.0.0.1:3128"));
        assert!(js.contains("FindProxyForURL"));
    }
}

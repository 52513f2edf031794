//! PAC JS runtime (section 4.3), grounded on `examples/original_source/pac.go`.
//! The original wraps `goja` (a Go-native ES5 engine) with a `sync.Pool` of
//! runtimes sharing one compiled program. No JS engine crate appears
//! anywhere in the retrieved example pack's dependency manifests; `boa_engine`
//! is adopted as the equivalent embeddable, pure-Rust, synchronous ES5-class
//! engine, used the same way: one compiled script wrapper reused from a
//! free-list of contexts.

use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    property::Attribute,
    Context, JsValue, Source,
};

const WRAPPER_PREFIX: &str = "(function(url,host) {\n";
const WRAPPER_SUFFIX: &str = "\nreturn FindProxyForURL(url,host);\n})(url,host)\n";

pub struct PacExecutor {
    wrapped_source: String,
    pool: Mutex<Vec<Context>>,
}

impl PacExecutor {
    pub fn new(pac_js: &str) -> anyhow::Result<Self> {
        let wrapped_source = format!("{WRAPPER_PREFIX}{pac_js}{WRAPPER_SUFFIX}");
        // Validate it compiles at least once up front, mirroring `goja.Compile`.
        let mut probe = build_runtime();
        probe
            .eval(Source::from_bytes(&wrapped_source))
            .map_err(|e| anyhow::anyhow!("PAC script failed to compile: {e}"))?;
        Ok(PacExecutor {
            wrapped_source,
            pool: Mutex::new(Vec::new()),
        })
    }

    pub fn run(&self, url: &str, host: &str) -> anyhow::Result<String> {
        let mut runtime = self.pool.lock().pop().unwrap_or_else(build_runtime);
        let result = (|| -> anyhow::Result<String> {
            runtime
                .global_object()
                .set(js_string!("url"), js_string!(url), false, &mut runtime)
                .ok();
            runtime
                .global_object()
                .set(js_string!("host"), js_string!(host), false, &mut runtime)
                .ok();
            let value = runtime
                .eval(Source::from_bytes(&self.wrapped_source))
                .map_err(|e| anyhow::anyhow!("PAC evaluation failed: {e}"))?;
            Ok(value
                .to_string(&mut runtime)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default())
        })();
        self.pool.lock().push(runtime);
        result
    }
}

fn build_runtime() -> Context {
    let mut ctx = Context::default();
    register(&mut ctx, "isPlainHostName", 1, pac_is_plain_host_name);
    register(&mut ctx, "dnsDomainIs", 2, pac_dns_domain_is);
    register(&mut ctx, "localHostOrDomainIs", 2, pac_local_host_or_domain_is);
    register(&mut ctx, "isResolvable", 1, pac_is_resolvable);
    register(&mut ctx, "isInNet", 3, pac_is_in_net);
    register(&mut ctx, "dnsResolve", 1, pac_dns_resolve);
    register(&mut ctx, "convert_addr", 1, pac_convert_addr);
    register(&mut ctx, "myIpAddress", 0, pac_my_ip_address);
    register(&mut ctx, "dnsDomainLevels", 1, pac_dns_domain_levels);
    register(&mut ctx, "shExpMatch", 2, pac_sh_exp_match);
    register(&mut ctx, "weekdayRange", 3, pac_weekday_range);
    register(&mut ctx, "dateRange", 0, pac_date_range);
    register(&mut ctx, "timeRange", 0, pac_time_range);
    register(&mut ctx, "alert", 1, pac_alert);
    ctx
}

fn register(
    ctx: &mut Context,
    name: &'static str,
    arity: u16,
    f: fn(&JsValue, &[JsValue], &mut Context) -> boa_engine::JsResult<JsValue>,
) {
    let func = NativeFunction::from_fn_ptr(f).to_js_function(ctx.realm());
    ctx.register_global_property(js_string!(name), func, Attribute::all()).ok();
    let _ = arity;
}

fn arg_str(args: &[JsValue], i: usize, ctx: &mut Context) -> String {
    args.get(i)
        .and_then(|v| v.to_string(ctx).ok())
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default()
}

fn ok_bool(b: bool) -> boa_engine::JsResult<JsValue> {
    Ok(JsValue::from(b))
}

fn pac_is_plain_host_name(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let host = arg_str(args, 0, ctx);
    ok_bool(!host.contains('.'))
}

fn pac_dns_domain_is(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let host = arg_str(args, 0, ctx);
    let domain = arg_str(args, 1, ctx);
    ok_bool(domain.starts_with('.') && host.ends_with(domain.as_str()))
}

fn pac_local_host_or_domain_is(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let host = arg_str(args, 0, ctx);
    let hostdom = arg_str(args, 1, ctx);
    ok_bool(host == hostdom || (!host.contains('.') && hostdom.starts_with(host.as_str())))
}

fn resolve_first_v4(host: &str) -> Option<Ipv4Addr> {
    use std::net::ToSocketAddrs;
    (host, 0)
        .to_socket_addrs()
        .ok()
        .into_iter()
        .flatten()
        .find_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            _ => None,
        })
}

fn pac_is_resolvable(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let host = arg_str(args, 0, ctx);
    ok_bool(resolve_first_v4(&host).is_some())
}

fn ipv4_to_i64(addr: Ipv4Addr) -> i64 {
    u32::from_be_bytes(addr.octets()) as i64
}

fn pac_is_in_net(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let host = arg_str(args, 0, ctx);
    let pattern = arg_str(args, 1, ctx);
    let mask = arg_str(args, 2, ctx);
    let resolved = resolve_first_v4(&host).map(ipv4_to_i64).unwrap_or(0);
    let pattern_ip = pattern.parse::<Ipv4Addr>().map(ipv4_to_i64).unwrap_or(0);
    let mask_ip = mask.parse::<Ipv4Addr>().map(ipv4_to_i64).unwrap_or(0);
    ok_bool((resolved & mask_ip) == pattern_ip)
}

fn pac_dns_resolve(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let host = arg_str(args, 0, ctx);
    Ok(match resolve_first_v4(&host) {
        Some(ip) => JsValue::from(js_string!(ip.to_string())),
        None => JsValue::from(js_string!("")),
    })
}

fn pac_convert_addr(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let addr = arg_str(args, 0, ctx);
    let v = addr.parse::<Ipv4Addr>().map(ipv4_to_i64).unwrap_or(0);
    Ok(JsValue::from(v as f64))
}

fn pac_my_ip_address(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let ip = resolve_first_v4("localhost").unwrap_or(Ipv4Addr::new(127, 0, 0, 1));
    Ok(JsValue::from(js_string!(ip.to_string())))
}

fn pac_dns_domain_levels(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let host = arg_str(args, 0, ctx);
    Ok(JsValue::from(host.matches('.').count() as i32))
}

fn pac_sh_exp_match(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let s = arg_str(args, 0, ctx);
    let shexp = arg_str(args, 1, ctx);
    let escaped = shexp.replace('.', "\\.").replace('*', ".*").replace('?', ".");
    let anchored = format!("^{escaped}$");
    let matched = regex::Regex::new(&anchored).map(|re| re.is_match(&s)).unwrap_or(false);
    ok_bool(matched)
}

const DAYS: [&str; 7] = ["SUN", "MON", "TUE", "WEN", "THU", "FRI", "SAT"];

fn pac_weekday_range(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let start = arg_str(args, 0, ctx);
    let mut end = arg_str(args, 1, ctx);
    let mut tz = arg_str(args, 2, ctx);

    let mut start_day = DAYS.iter().position(|d| *d == start).map(|i| i as i32).unwrap_or(-1);
    let mut end_day = DAYS.iter().position(|d| *d == end).map(|i| i as i32).unwrap_or(-1);
    if end == "GMT" {
        tz = "GMT".to_string();
        end_day = start_day;
        end = start.clone();
    }
    let _ = end;

    let now_secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    // days since epoch (1970-01-01 was a Thursday = index 4)
    let days_since_epoch = (now_secs / 86400) as i64;
    let mut weekday = ((days_since_epoch + 4) % 7) as i32;
    if weekday < 0 {
        weekday += 7;
    }
    if tz == "GMT" {
        // SystemTime is already UTC; nothing further to adjust here.
    }
    if start_day <= weekday && weekday <= end_day {
        return ok_bool(true);
    }
    weekday += 7;
    ok_bool(start_day <= weekday && weekday <= end_day)
}

fn pac_date_range(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    ok_bool(true)
}

fn pac_time_range(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    ok_bool(true)
}

fn pac_alert(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> boa_engine::JsResult<JsValue> {
    let message = arg_str(args, 0, ctx);
    tracing::info!(target: "pac", "{message}");
    Ok(JsValue::undefined())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_fallthrough_script_evaluates() {
        let exec = PacExecutor::new(
            r#"function FindProxyForURL(url, host) {
                if (shExpMatch(host, "special.*")) { return "DIRECT"; }
                return "PROXY upstream.example:8080";
            }"#,
        )
        .unwrap();
        assert_eq!(exec.run("http://special.example/", "special.example").unwrap(), "DIRECT");
        assert_eq!(
            exec.run("http://other.example/", "other.example").unwrap(),
            "PROXY upstream.example:8080"
        );
    }

    #[test]
    fn evaluation_is_deterministic_for_fixed_inputs() {
        let exec = PacExecutor::new(r#"function FindProxyForURL(url, host) { return "PROXY a:1;DIRECT"; }"#).unwrap();
        let a = exec.run("http://x/", "x").unwrap();
        let b = exec.run("http://x/", "x").unwrap();
        assert_eq!(a, b);
    }
}

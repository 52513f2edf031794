//! Raw-line header parsing, preserving the exact bytes of every header line
//! so MITM passthrough can write them back out unmodified. Grounded on
//! `conn.go`'s header reader (`HEADER_MAX_SIZE = 32*1024`, from
//! `global.go`) and `proxy.go`'s keep-alive and `/~/` rewrite rules.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub use crate::error::ProtocolError as ReadError;

pub const HEADER_MAX_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn parse(token: &str) -> Option<Version> {
        match token {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Downgrades to the lower of the two, matching the end-to-end version
    /// negotiation named in section 4.2.
    pub fn min(self, other: Version) -> Version {
        match (self, other) {
            (Version::Http10, _) | (_, Version::Http10) => Version::Http10,
            _ => Version::Http11,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: Version,
}

#[derive(Debug, Clone)]
pub struct StatusLine {
    pub version: Version,
    pub code: u16,
    pub reason: String,
}

/// A header block: the raw line bytes (exact casing and spacing, minus the
/// trailing CRLF) alongside a lower-cased name index for lookups.
#[derive(Debug, Clone, Default)]
pub struct HeaderBlock {
    pub raw_lines: Vec<String>,
    parsed: Vec<(String, String)>,
}

impl HeaderBlock {
    /// Builds a header block directly from raw lines (no leading request
    /// or status line); used by tests and by the dispatcher when it needs
    /// to synthesize a header set (e.g. adding `Proxy-Authorization`).
    pub fn from_raw_lines(raw_lines: Vec<String>) -> Self {
        let parsed = raw_lines
            .iter()
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
            })
            .collect();
        HeaderBlock { raw_lines, parsed }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let needle = name.to_ascii_lowercase();
        self.parsed.iter().find(|(n, _)| *n == needle).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let needle = name.to_ascii_lowercase();
        self.parsed.iter().filter(move |(n, _)| *n == needle).map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length").and_then(|v| v.parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.get_all("transfer-encoding").any(|v| v.to_ascii_lowercase().contains("chunk"))
    }

    fn connection_tokens(&self) -> Vec<String> {
        self.get_all("connection")
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .collect()
    }

    /// Resolves keep-alive per section 4.2: default closed for HTTP/1.0,
    /// default open for 1.1+, explicit tokens override.
    pub fn keep_alive(&self, version: Version) -> bool {
        let tokens = self.connection_tokens();
        if tokens.iter().any(|t| t == "close") {
            return false;
        }
        if tokens.iter().any(|t| t == "keep-alive") {
            return true;
        }
        matches!(version, Version::Http11)
    }
}

async fn read_raw_lines<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ReadError> {
    let mut buf = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await.map_err(|_| ReadError::Eof)?;
        if n == 0 {
            return Err(ReadError::Eof);
        }
        buf.extend_from_slice(&line);
        if buf.len() > HEADER_MAX_SIZE {
            return Err(ReadError::OversizedHeader(buf.len()));
        }
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(buf)
}

fn split_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split("\r\n")
        .flat_map(|chunk| chunk.split('\n'))
        .map(|s| s.trim_end_matches('\r').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub async fn read_request_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(RequestLine, HeaderBlock), ReadError> {
    let raw = read_raw_lines(reader).await?;
    let mut lines = split_lines(&raw);
    if lines.is_empty() {
        return Err(ReadError::Eof);
    }
    let request_line = lines.remove(0);
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().ok_or_else(|| ReadError::MalformedRequestLine(request_line.clone()))?;
    let target = parts.next().ok_or_else(|| ReadError::MalformedRequestLine(request_line.clone()))?;
    let version_token = parts.next().unwrap_or("HTTP/1.0");
    let version = Version::parse(version_token).ok_or_else(|| ReadError::MalformedRequestLine(request_line.clone()))?;

    Ok((
        RequestLine { method: method.to_string(), target: target.to_string(), version },
        HeaderBlock::from_raw_lines(lines),
    ))
}

pub async fn read_response_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(StatusLine, HeaderBlock), ReadError> {
    let raw = read_raw_lines(reader).await?;
    let mut lines = split_lines(&raw);
    if lines.is_empty() {
        return Err(ReadError::Eof);
    }
    let status_line = lines.remove(0);
    let mut parts = status_line.splitn(3, ' ');
    let version_token = parts.next().ok_or_else(|| ReadError::MalformedStatusLine(status_line.clone()))?;
    let version = Version::parse(version_token).ok_or_else(|| ReadError::MalformedStatusLine(status_line.clone()))?;
    let code: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| ReadError::MalformedStatusLine(status_line.clone()))?;
    let reason = parts.next().unwrap_or("").to_string();

    Ok((StatusLine { version, code, reason }, HeaderBlock::from_raw_lines(lines)))
}

/// Outcome of rewriting a direct (non-proxy) request URI of the form
/// `/~/{http|https}/host[:port]/rest`, per section 4.2.
pub struct DirectRewrite {
    pub rewritten_target: String,
    pub direct_to_connect: bool,
}

/// Rewrites `/~/http/host[:port]/rest` or `/~/https/host[:port]/rest` into
/// an absolute-form target; the `https` form additionally signals that the
/// dispatcher must open a CONNECT tunnel and TLS-wrap it client-side before
/// forwarding, since the client itself has no proxy configured.
pub fn rewrite_direct_uri(target: &str) -> Option<DirectRewrite> {
    let rest = target.strip_prefix("/~/")?;
    let (scheme, rest) = rest.split_once('/')?;
    let (direct_to_connect, scheme) = match scheme {
        "http" => (false, "http"),
        "https" => (true, "https"),
        _ => return None,
    };
    let rewritten_target = format!("{scheme}://{rest}");
    Some(DirectRewrite { rewritten_target, direct_to_connect })
}

/// Host/port derived from the request-URI when absolute, else `None` so
/// the caller falls back to the `Host:` header (section 4.2: Host wins
/// only for origin-form request-URIs).
pub fn host_port_from_target(target: &str) -> Option<String> {
    let without_scheme = target.strip_prefix("http://").or_else(|| target.strip_prefix("https://"))?;
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    if authority.is_empty() {
        None
    } else {
        Some(authority.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_request_line_and_headers_preserving_casing() {
        let raw = b"GET /foo HTTP/1.1\r\nHost: Example.COM\r\nX-Weird-Case: Yes\r\n\r\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(raw));
        let (line, headers) = read_request_head(&mut reader).await.unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.target, "/foo");
        assert_eq!(line.version, Version::Http11);
        assert_eq!(headers.get("host"), Some("Example.COM"));
        assert!(headers.raw_lines.iter().any(|l| l == "X-Weird-Case: Yes"));
    }

    #[tokio::test]
    async fn oversized_header_block_is_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"GET / HTTP/1.1\r\n");
        raw.extend_from_slice(&vec![b'a'; HEADER_MAX_SIZE].into_iter().collect::<Vec<_>>());
        raw.extend_from_slice(b"\r\n\r\n");
        let mut reader = BufReader::new(Cursor::new(raw));
        let result = read_request_head(&mut reader).await;
        assert!(matches!(result, Err(ReadError::OversizedHeader(_))));
    }

    #[test]
    fn keep_alive_defaults_follow_version() {
        let empty = HeaderBlock::from_raw_lines(vec![]);
        assert!(!empty.keep_alive(Version::Http10));
        assert!(empty.keep_alive(Version::Http11));
    }

    #[test]
    fn explicit_close_overrides_1_1_default() {
        let headers = HeaderBlock::from_raw_lines(vec!["Connection: close".to_string()]);
        assert!(!headers.keep_alive(Version::Http11));
    }

    #[test]
    fn direct_https_rewrite_sets_connect_flag() {
        let r = rewrite_direct_uri("/~/https/upstream.example:8443/path?q=1").unwrap();
        assert_eq!(r.rewritten_target, "https://upstream.example:8443/path?q=1");
        assert!(r.direct_to_connect);
    }

    #[test]
    fn direct_http_rewrite_does_not_set_connect_flag() {
        let r = rewrite_direct_uri("/~/http/upstream.example/path").unwrap();
        assert!(!r.direct_to_connect);
    }

    #[test]
    fn host_from_absolute_target_takes_precedence_path() {
        assert_eq!(host_port_from_target("http://a.example:81/x"), Some("a.example:81".to_string()));
        assert_eq!(host_port_from_target("/origin-form"), None);
    }
}

//! Header hygiene and body-copy helpers shared by the CONNECT tunnel, the
//! plain forward path, and the MITM inspection loop (section 4.7 "Header
//! hygiene on forward", "Body copy").

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::http::codec::HeaderBlock;

const HOP_BY_HOP: &[&str] = &["connection", "proxy-connection", "proxy-authorization"];

/// Writes a request or status line plus headers back out, stripping
/// hop-by-hop headers and appending the negotiated `Connection`/
/// `Proxy-Connection` value. `use_proxy_connection` mirrors section 4.7:
/// only sent to a forward-proxy upstream, never to Direct/SOCKS.
pub async fn write_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    start_line: &str,
    headers: &HeaderBlock,
    keep_alive: bool,
    use_proxy_connection: bool,
    extra_headers: &[(String, String)],
) -> std::io::Result<()> {
    writer.write_all(start_line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;

    for line in &headers.raw_lines {
        let name = line.split_once(':').map(|(n, _)| n.trim().to_ascii_lowercase()).unwrap_or_default();
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }

    for (name, value) in extra_headers {
        writer.write_all(format!("{name}: {value}\r\n").as_bytes()).await?;
    }

    let conn_token = if keep_alive { "keep-alive" } else { "close" };
    writer.write_all(format!("Connection: {conn_token}\r\n").as_bytes()).await?;
    if use_proxy_connection {
        writer.write_all(format!("Proxy-Connection: {conn_token}\r\n").as_bytes()).await?;
    }

    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

/// Copies exactly `len` bytes, matching `io.LimitReader` semantics for a
/// `Content-Length`-framed body.
pub async fn copy_fixed_length<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut remaining = len;
    let mut buf = [0u8; 16 * 1024];
    while remaining > 0 {
        let take = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..take]).await.map_err(|_| ProtocolError::Eof)?;
        if n == 0 {
            return Err(ProtocolError::Eof);
        }
        writer.write_all(&buf[..n]).await.map_err(|_| ProtocolError::Eof)?;
        remaining -= n as u64;
    }
    writer.flush().await.map_err(|_| ProtocolError::Eof)?;
    Ok(len)
}

/// Copies a body per section 4.7: `Content-Length` wins a `LimitReader`
/// copy, chunked framing wins a chunk-preserving copy, and a response
/// closed by EOF (no length, no chunking, HTTP/1.0-style) copies until
/// the reader is exhausted. Never applies both length and chunk framing.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, headers: &HeaderBlock) -> Result<u64, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if headers.is_chunked() {
        crate::http::chunked::copy_chunked_body(reader, writer).await
    } else if let Some(len) = headers.content_length() {
        if len == 0 {
            Ok(0)
        } else {
            copy_fixed_length(reader, writer, len).await
        }
    } else {
        tokio::io::copy(reader, writer).await.map_err(|_| ProtocolError::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn write_head_strips_hop_by_hop_and_appends_connection() {
        let headers = HeaderBlock::from_raw_lines(vec![
            "Host: example.com".to_string(),
            "Proxy-Authorization: Basic xyz".to_string(),
            "Connection: keep-alive".to_string(),
        ]);
        let mut out = Vec::new();
        write_head(&mut out, "GET / HTTP/1.1", &headers, true, true, &[]).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Host: example.com"));
        assert!(!text.contains("Proxy-Authorization"));
        assert!(text.contains("Connection: keep-alive"));
        assert!(text.contains("Proxy-Connection: keep-alive"));
    }

    #[tokio::test]
    async fn copy_fixed_length_stops_at_boundary() {
        let mut reader = BufReader::new(Cursor::new(b"hello-extra".to_vec()));
        let mut out = Vec::new();
        let n = copy_fixed_length(&mut reader, &mut out, 5).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
    }
}

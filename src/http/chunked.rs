//! Transfer-encoding-preserving chunk copy (section 4.2): both the chunk
//! size line and the chunk body are relayed byte-for-byte so MITM
//! diagnostics see exactly what the wire carried, trailers included.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Copies one complete chunked-transfer body from `reader` to `writer`,
/// forwarding each chunk-size line, its payload, and the final
/// zero-length chunk plus trailers, unmodified.
pub async fn copy_chunked_body<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let mut size_line = Vec::new();
        reader.read_until(b'\n', &mut size_line).await.map_err(|_| ProtocolError::Eof)?;
        if size_line.is_empty() {
            return Err(ProtocolError::Eof);
        }
        writer.write_all(&size_line).await.map_err(|_| ProtocolError::Eof)?;
        total += size_line.len() as u64;

        let size_token = String::from_utf8_lossy(&size_line);
        let size_token = size_token.trim().split(';').next().unwrap_or("0");
        let chunk_size = usize::from_str_radix(size_token, 16)
            .map_err(|_| ProtocolError::MalformedHeader(size_token.to_string()))?;

        if chunk_size == 0 {
            // trailers: raw lines up to and including the terminating blank line
            loop {
                let mut trailer_line = Vec::new();
                reader.read_until(b'\n', &mut trailer_line).await.map_err(|_| ProtocolError::Eof)?;
                if trailer_line.is_empty() {
                    return Err(ProtocolError::Eof);
                }
                writer.write_all(&trailer_line).await.map_err(|_| ProtocolError::Eof)?;
                total += trailer_line.len() as u64;
                if trailer_line == b"\r\n" || trailer_line == b"\n" {
                    break;
                }
            }
            break;
        }

        let mut body = vec![0u8; chunk_size];
        tokio::io::AsyncReadExt::read_exact(reader, &mut body).await.map_err(|_| ProtocolError::Eof)?;
        writer.write_all(&body).await.map_err(|_| ProtocolError::Eof)?;
        total += body.len() as u64;

        // trailing CRLF after each chunk's data
        let mut crlf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(reader, &mut crlf).await.map_err(|_| ProtocolError::Eof)?;
        writer.write_all(&crlf).await.map_err(|_| ProtocolError::Eof)?;
        total += 2;
    }
    writer.flush().await.map_err(|_| ProtocolError::Eof)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn copies_chunks_and_trailer_verbatim() {
        let input = b"5\r\nhello\r\n0\r\nX-Trailer: ok\r\n\r\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input.clone()));
        let mut out = Vec::new();
        let n = copy_chunked_body(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, input);
        assert_eq!(n as usize, input.len());
    }

    #[tokio::test]
    async fn rejects_non_hex_chunk_size() {
        let input = b"zz\r\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(input));
        let mut out = Vec::new();
        let result = copy_chunked_body(&mut reader, &mut out).await;
        assert!(matches!(result, Err(ProtocolError::MalformedHeader(_))));
    }
}

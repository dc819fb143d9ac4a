use bytes::BytesMut;
use http::HeaderMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::DEFAULT_CHUNK_BUFFER_SIZE;
use crate::error::{Error, Result};

/// How a message body's length is determined, mirroring RFC 7230 §3.3.3 in
/// the order the dispatch core is asked to prefer them (§4.3 step 5):
/// chunked, then content-length, then (response-only) until EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Chunked,
    Fixed(u64),
    UntilEof,
    /// No body at all (no framing header, and not a response).
    None,
}

impl Framing {
    pub fn from_headers(headers: &HeaderMap, is_response: bool) -> Framing {
        if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
            if te
                .to_str()
                .map(|s| s.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false)
            {
                return Framing::Chunked;
            }
        }
        if let Some(cl) = headers.get(http::header::CONTENT_LENGTH) {
            if let Ok(n) = cl.to_str().unwrap_or("").trim().parse::<u64>() {
                return Framing::Fixed(n);
            }
        }
        if is_response {
            Framing::UntilEof
        } else {
            Framing::None
        }
    }
}

/// Copies exactly `n` bytes from `r` to `w`, verbatim. Fails with
/// `PrematureEof` if the source ends first (§4.1, §8 "must not deadlock").
pub async fn stream_fixed_body<R, W>(r: &mut R, w: &mut W, n: u64) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = n;
    while remaining > 0 {
        let buf = r.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::premature_eof());
        }
        let take = (buf.len() as u64).min(remaining) as usize;
        w.write_all(&buf[..take]).await?;
        r.consume(take);
        remaining -= take as u64;
    }
    w.flush().await?;
    Ok(())
}

async fn read_fixed(r: &mut (impl AsyncBufRead + Unpin), n: u64) -> Result<BytesMut> {
    let mut out = BytesMut::with_capacity(n.min(1 << 20) as usize);
    let mut remaining = n;
    while remaining > 0 {
        let buf = r.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::premature_eof());
        }
        let take = (buf.len() as u64).min(remaining) as usize;
        out.extend_from_slice(&buf[..take]);
        r.consume(take);
        remaining -= take as u64;
    }
    Ok(out)
}

pub(crate) async fn read_fixed_into(
    r: &mut (impl AsyncBufRead + Unpin),
    n: u64,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.extend_from_slice(&read_fixed(r, n).await?);
    Ok(())
}

/// Copies a chunked body (size-line, chunk bytes, CRLF, ... zero chunk,
/// optional trailers, blank line) verbatim, including the zero-chunk and
/// trailer framing (§8 scenario 6: "forward trailers verbatim").
pub async fn stream_chunked_body<R, W>(r: &mut R, w: &mut W, chunk_buf: usize) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let chunk_buf = chunk_buf.max(1);
    loop {
        let size_line = read_raw_line(r).await?;
        w.write_all(&size_line).await?;
        let size_str = std::str::from_utf8(&size_line)
            .ok()
            .and_then(|s| s.trim_end().split(';').next())
            .ok_or_else(Error::malformed)?;
        let size = u64::from_str_radix(size_str.trim(), 16).map_err(|_| Error::malformed())?;

        if size == 0 {
            // Zero chunk: forward any trailer header lines verbatim up to
            // and including the terminating blank line.
            loop {
                let line = read_raw_line(r).await?;
                w.write_all(&line).await?;
                if line == b"\r\n" || line == b"\n" {
                    break;
                }
            }
            w.flush().await?;
            return Ok(());
        }

        let mut remaining = size;
        while remaining > 0 {
            let buf = r.fill_buf().await?;
            if buf.is_empty() {
                return Err(Error::premature_eof());
            }
            let take = (buf.len() as u64).min(remaining).min(chunk_buf as u64) as usize;
            w.write_all(&buf[..take]).await?;
            r.consume(take);
            remaining -= take as u64;
        }
        // Trailing CRLF after the chunk's data.
        let crlf = read_raw_line(r).await?;
        w.write_all(&crlf).await?;
    }
}

async fn read_chunked(r: &mut (impl AsyncBufRead + Unpin)) -> Result<BytesMut> {
    let mut out = BytesMut::new();
    loop {
        let size_line = read_raw_line(r).await?;
        let size_str = std::str::from_utf8(&size_line)
            .ok()
            .and_then(|s| s.trim_end().split(';').next())
            .ok_or_else(Error::malformed)?;
        let size = u64::from_str_radix(size_str.trim(), 16).map_err(|_| Error::malformed())?;
        if size == 0 {
            loop {
                let line = read_raw_line(r).await?;
                if line == b"\r\n" || line == b"\n" {
                    break;
                }
            }
            return Ok(out);
        }
        let chunk = read_fixed(r, size).await?;
        out.extend_from_slice(&chunk);
        read_raw_line(r).await?; // trailing CRLF
    }
}

pub(crate) async fn read_chunked_into(
    r: &mut (impl AsyncBufRead + Unpin),
    out: &mut Vec<u8>,
) -> Result<()> {
    out.extend_from_slice(&read_chunked(r).await?);
    Ok(())
}

/// Copies until the source hits EOF. Used only when neither
/// `Content-Length` nor chunked framing is present (§4.1).
pub async fn stream_until_eof<R, W>(r: &mut R, w: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let buf = r.fill_buf().await?;
        if buf.is_empty() {
            break;
        }
        let len = buf.len();
        w.write_all(buf).await?;
        r.consume(len);
    }
    w.flush().await?;
    Ok(())
}

pub(crate) async fn read_until_eof_into(
    r: &mut (impl AsyncBufRead + Unpin),
    out: &mut Vec<u8>,
) -> Result<()> {
    loop {
        let buf = r.fill_buf().await?;
        if buf.is_empty() {
            break;
        }
        let len = buf.len();
        out.extend_from_slice(buf);
        r.consume(len);
    }
    Ok(())
}

async fn read_raw_line(r: &mut (impl AsyncBufRead + Unpin)) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let n = r.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(Error::eof());
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn chunked_round_trip_with_trailers() {
        let raw = b"4\r\nWiki\r\n4\r\npedi\r\n0\r\nX-Trailer: done\r\n\r\n";
        let mut r = BufReader::new(Cursor::new(raw.to_vec()));
        let mut out = Vec::new();
        stream_chunked_body(&mut r, &mut out, 16 * 1024).await.unwrap();
        assert_eq!(out, raw);
    }

    #[tokio::test]
    async fn chunked_middle_chunk_containing_crlf_bytes() {
        let raw = b"4\r\n\r\n\r\n\r\n0\r\n\r\n";
        let mut r = BufReader::new(Cursor::new(raw.to_vec()));
        let mut out = Vec::new();
        stream_chunked_body(&mut r, &mut out, 4).await.unwrap();
        assert_eq!(out, raw);
    }

    #[tokio::test]
    async fn fixed_body_premature_eof_errors_not_hangs() {
        let raw = b"abc";
        let mut r = BufReader::new(Cursor::new(raw.to_vec()));
        let mut out = Vec::new();
        let err = stream_fixed_body(&mut r, &mut out, 10).await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn fixed_body_exact_length() {
        let raw = b"hello";
        let mut r = BufReader::new(Cursor::new(raw.to_vec()));
        let mut out = Vec::new();
        stream_fixed_body(&mut r, &mut out, 5).await.unwrap();
        assert_eq!(out, raw);
    }

    #[tokio::test]
    async fn chunked_body_arriving_in_fragments_with_blocking_reads() {
        let raw: &[u8] = b"4\r\nWiki\r\n4\r\npedi\r\n0\r\n\r\n";
        let mock = tokio_test::io::Builder::new()
            .read(&raw[..6])
            .wait(std::time::Duration::from_millis(1))
            .read(&raw[6..18])
            .wait(std::time::Duration::from_millis(1))
            .read(&raw[18..])
            .build();
        let mut r = BufReader::new(mock);
        let mut out = Vec::new();
        stream_chunked_body(&mut r, &mut out, 16 * 1024).await.unwrap();
        assert_eq!(out, raw);
    }
}

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::body::{self, Framing};
use crate::codec::{HIVE_TAG, MAX_HEADERS_SIZE, MAX_LINE_SIZE};
use crate::error::{Error, Result};

/// The start-line of a message: either an HTTP/1.1 or HIVE request line, or
/// an HTTP/1.1 status line. HIVE has no status line of its own — a HIVE
/// reply reuses the request-line grammar (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `METHOD URI PROTOCOL` where `PROTOCOL` is `HTTP/1.1` or `HIVE`.
    Request {
        method: String,
        uri: String,
        hive: bool,
    },
    /// `HTTP/1.1 STATUS REASON`.
    Response { status: u16, reason: String },
}

impl StartLine {
    pub fn is_hive(&self) -> bool {
        matches!(self, StartLine::Request { hive: true, .. })
    }

    /// For a HIVE request/reply line, the semicolon-delimited argument list
    /// carried in the URI field.
    pub fn hive_args(&self) -> Vec<String> {
        match self {
            StartLine::Request { uri, .. } => {
                let trimmed = uri.trim_start_matches('/');
                if trimmed.is_empty() {
                    Vec::new()
                } else {
                    trimmed.split(';').map(str::to_owned).collect()
                }
            }
            StartLine::Response { .. } => Vec::new(),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }
}

/// A parsed start-line plus headers — everything up to (and consuming) the
/// blank line that terminates the head block. The body, if any, still sits
/// unread on the stream.
#[derive(Debug, Clone)]
pub struct Head {
    pub start: StartLine,
    pub headers: HeaderMap,
}

impl Head {
    pub fn framing(&self, is_response: bool) -> Framing {
        Framing::from_headers(&self.headers, is_response)
    }
}

/// A fully buffered message: head plus body. Used by callers (client
/// intake, HIVE control exchanges) that want the whole thing in memory
/// rather than streaming it; the hot proxy path uses [`read_head`] plus the
/// `stream_*` functions in [`crate::codec::body`] instead.
#[derive(Debug, Clone)]
pub struct Message {
    pub head: Head,
    pub body: Vec<u8>,
}

/// Reads raw bytes up to and including the blank line that terminates a
/// head block, enforcing the line and header-block size ceilings (§4.1) as
/// bytes accumulate rather than after the fact.
async fn read_raw_head<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let start = buf.len();
        let n = r.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Err(Error::eof());
        }
        if start == 0 && n > MAX_LINE_SIZE {
            return Err(Error::line_too_long());
        }
        if buf.len() > MAX_HEADERS_SIZE {
            return Err(Error::too_large());
        }
        let line = &buf[start..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(buf)
}

/// True if `line` (without its CRLF) is a HIVE request/reply line: three
/// space-separated tokens whose third is the literal `HIVE` tag. HTTP
/// version tokens never collide with this since `httparse` would reject
/// `HIVE` as a version string anyway.
fn is_hive_line(line: &str) -> bool {
    let mut parts = line.trim_end().splitn(3, ' ');
    let _method = parts.next();
    let _uri = parts.next();
    parts.next() == Some(HIVE_TAG)
}

/// Splits `raw` into its first line (sans the trailing `\n`, but keeping
/// any `\r`) and everything after that `\n`.
fn split_first_line(raw: &[u8]) -> Result<(&str, &[u8])> {
    let end = raw.iter().position(|&b| b == b'\n').ok_or_else(Error::malformed)?;
    let line = std::str::from_utf8(&raw[..end]).map_err(|_| Error::malformed())?;
    Ok((line, &raw[end + 1..]))
}

fn header_map_from_httparse(raw_headers: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for h in raw_headers {
        let name = HeaderName::from_bytes(h.name.to_ascii_lowercase().as_bytes())
            .map_err(|_| Error::malformed())?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| Error::malformed())?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Reads a start-line and header block, stopping at the blank line. HTTP/1.1
/// request and status lines plus their headers are parsed with `httparse`
/// (the same crate hyper itself uses for HTTP/1 head parsing); HIVE lines
/// carry no headers and are parsed by hand since `httparse` only
/// understands HTTP version tokens.
pub async fn read_head<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Head> {
    let raw = read_raw_head(r).await?;
    let (line, rest) = split_first_line(&raw)?;

    if is_hive_line(line) {
        // A HIVE head is exactly its start-line plus the blank terminator
        // — anything else between them (stray header-like lines) is malformed.
        if rest != b"\r\n" && rest != b"\n" {
            return Err(Error::malformed());
        }
        let mut parts = line.trim_end().splitn(3, ' ');
        let method = parts.next().ok_or_else(Error::malformed)?.to_string();
        let uri = parts.next().ok_or_else(Error::malformed)?.to_string();
        return Ok(Head {
            start: StartLine::Request {
                method,
                uri,
                hive: true,
            },
            headers: HeaderMap::new(),
        });
    }

    if line.starts_with("HTTP/") {
        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut header_storage);
        response.parse(&raw).map_err(|_| Error::malformed())?;
        let status = response.code.ok_or_else(Error::malformed)?;
        let reason = response.reason.unwrap_or("").to_string();
        let headers = header_map_from_httparse(response.headers)?;
        return Ok(Head {
            start: StartLine::Response { status, reason },
            headers,
        });
    }

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut header_storage);
    request.parse(&raw).map_err(|_| Error::malformed())?;
    let method = request.method.ok_or_else(Error::malformed)?.to_string();
    let uri = request.path.ok_or_else(Error::malformed)?.to_string();
    let headers = header_map_from_httparse(request.headers)?;
    Ok(Head {
        start: StartLine::Request {
            method,
            uri,
            hive: false,
        },
        headers,
    })
}

/// Reads a full message: head plus body, buffering the body according to
/// its framing. Intended for small bodies (client intake, HIVE exchanges);
/// the proxy hot path streams instead.
pub async fn read_message<R: AsyncBufRead + Unpin>(r: &mut R, is_response: bool) -> Result<Message> {
    let head = read_head(r).await?;
    if head.start.is_hive() {
        return Ok(Message {
            head,
            body: Vec::new(),
        });
    }
    let framing = head.framing(is_response);
    let mut body = Vec::new();
    match framing {
        Framing::Fixed(0) | Framing::None => {}
        Framing::Fixed(n) => body::read_fixed_into(r, n, &mut body).await?,
        Framing::Chunked => body::read_chunked_into(r, &mut body).await?,
        Framing::UntilEof => body::read_until_eof_into(r, &mut body).await?,
    }
    Ok(Message { head, body })
}

fn write_start_line(start: &StartLine, out: &mut Vec<u8>) {
    match start {
        StartLine::Request { method, uri, hive } => {
            out.extend_from_slice(method.as_bytes());
            out.push(b' ');
            out.extend_from_slice(uri.as_bytes());
            out.push(b' ');
            out.extend_from_slice(if *hive { HIVE_TAG.as_bytes() } else { b"HTTP/1.1" });
        }
        StartLine::Response { status, reason } => {
            out.extend_from_slice(b"HTTP/1.1 ");
            out.extend_from_slice(itoa::Buffer::new().format(*status).as_bytes());
            out.push(b' ');
            out.extend_from_slice(reason.as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
}

/// Writes a start-line, its headers (if any), and the terminating blank
/// line, then flushes. Used both by [`write_message`] and by the proxy hot
/// path, which streams the body separately instead of buffering it.
pub async fn write_head<W: AsyncWrite + Unpin>(w: &mut W, head: &Head) -> Result<()> {
    let mut out = Vec::new();
    write_start_line(&head.start, &mut out);
    if !head.start.is_hive() {
        for (name, value) in head.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

/// Writes a start-line, headers (if any), the terminating blank line, and a
/// body buffer verbatim. Caller is responsible for the body's framing
/// headers (e.g. `Content-Length`) matching `message.body.len()`.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, message: &Message) -> Result<()> {
    write_head(w, &message.head).await?;
    if !message.body.is_empty() {
        w.write_all(&message.body).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Builds a HIVE request/reply line, e.g. `hive_line("AUTH", &[token, nonce])`.
pub fn hive_line(method: &str, args: &[&str]) -> StartLine {
    StartLine::Request {
        method: method.to_string(),
        uri: format!("/{}", args.join(";")),
        hive: true,
    }
}

/// Writes a bare HIVE request/reply line, e.g. `PONG /`, with no headers.
pub async fn write_hive<W: AsyncWrite + Unpin>(w: &mut W, method: &str, args: &[&str]) -> Result<()> {
    let head = Head {
        start: hive_line(method, args),
        headers: HeaderMap::new(),
    };
    write_head(w, &head).await
}

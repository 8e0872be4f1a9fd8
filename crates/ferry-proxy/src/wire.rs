//! Minimal HTTP/1.x wire handling for the forwarders.
//!
//! Only request lines, status lines, and headers are interpreted; bodies are
//! relayed as opaque bytes. Heads are located by scanning raw socket reads
//! for the `\r\n\r\n` boundary with a bounded buffer, so a single read may
//! hand back bytes that belong to the body - those travel alongside the
//! parsed head as "leftover" bytes.

use crate::{ProxyError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a request or response head. Anything larger is treated as
/// malformed rather than buffered indefinitely.
pub(crate) const MAX_HEAD_BYTES: usize = 64 * 1024;

/// A parsed HTTP request head.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// A parsed HTTP response head.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Delimited by connection close (responses only).
    Close,
}

/// Read from `stream` until the `\r\n\r\n` head boundary.
///
/// Returns the head bytes (including the terminating blank line) and any
/// bytes past the boundary that arrived in the same read.
///
/// # Errors
/// * `ProxyError::Relay` - read failure, EOF before the boundary, or a head
///   larger than [`MAX_HEAD_BYTES`].
pub(crate) async fn read_head<R>(stream: &mut R) -> Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_boundary(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Relay("HTTP head exceeds maximum size".to_string()));
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::Relay(format!("failed to read HTTP head: {e}")))?;
        if n == 0 {
            return Err(ProxyError::Relay(
                "connection closed before HTTP head was complete".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Index just past the `\r\n\r\n` boundary, if present.
fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn malformed(what: &str) -> ProxyError {
    ProxyError::Relay(format!("malformed {what}"))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| malformed("header line"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

impl RequestHead {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| malformed("request head"))?;
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| malformed("request line"))?;

        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(|| malformed("request line"))?;
        let target = parts.next().ok_or_else(|| malformed("request line"))?;
        let version = parts.next().unwrap_or("HTTP/1.1");

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers: parse_headers(lines)?,
        })
    }

    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace a header value, or append the header if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Drop all occurrences of a header.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(256);
        out.push_str(&self.method);
        out.push(' ');
        out.push_str(&self.target);
        out.push(' ');
        out.push_str(&self.version);
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

impl ResponseHead {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| malformed("response head"))?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| malformed("status line"))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().ok_or_else(|| malformed("status line"))?;
        if !version.starts_with("HTTP/") {
            return Err(malformed("status line"));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| malformed("status line"))?;
        let reason = parts.next().unwrap_or("");

        Ok(Self {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers: parse_headers(lines)?,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(256);
        out.push_str(&self.version);
        out.push(' ');
        out.push_str(&self.status.to_string());
        if !self.reason.is_empty() {
            out.push(' ');
            out.push_str(&self.reason);
        }
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }

    /// Whether this response asks for the connection to be closed.
    pub fn connection_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}

/// Split `host[:port]` (with optional IPv6 brackets) into host and port.
pub(crate) fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let malformed = || ProxyError::Relay(format!("malformed authority: {authority}"));

    // IPv6 literals arrive bracketed ([::1]:443).
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(malformed)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| malformed())?,
            None if tail.is_empty() => default_port,
            None => return Err(malformed()),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| malformed())?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(malformed()),
        None if !authority.is_empty() => Ok((authority.to_string(), default_port)),
        None => Err(malformed()),
    }
}

/// Destination host, port, and absolute-form URL for a plain request.
///
/// Absolute-form targets (`http://host/path`) carry their own authority;
/// origin-form targets (`/path`) fall back to the `Host` header.
pub(crate) fn request_destination(head: &RequestHead) -> Result<(String, u16, String)> {
    if let Some(rest) = head.target.strip_prefix("http://") {
        let end = rest.find('/').unwrap_or(rest.len());
        let (host, port) = split_authority(&rest[..end], 80)?;
        Ok((host, port, head.target.clone()))
    } else if head.target.starts_with('/') {
        let authority = head.header("host").ok_or_else(|| {
            ProxyError::Relay("origin-form request without a Host header".to_string())
        })?;
        let absolute = format!("http://{}{}", authority, head.target);
        let (host, port) = split_authority(authority, 80)?;
        Ok((host, port, absolute))
    } else {
        Err(ProxyError::Relay(format!(
            "unsupported request target: {}",
            head.target
        )))
    }
}

/// Reduce a request target to origin form (`/path`).
pub(crate) fn origin_form(target: &str) -> &str {
    match target.strip_prefix("http://") {
        Some(rest) => match rest.find('/') {
            Some(i) => &rest[i..],
            None => "/",
        },
        None => target,
    }
}

/// Body framing of a request.
///
/// Requests without a length indicator are treated as bodyless.
pub(crate) fn request_framing(head: &RequestHead) -> BodyFraming {
    if head.header("transfer-encoding").is_some() {
        return BodyFraming::Chunked;
    }
    match head
        .header("content-length")
        .and_then(|v| v.trim().parse().ok())
    {
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::Length(0),
    }
}

/// Body framing of a response to a request with the given method.
pub(crate) fn response_framing(method: &str, head: &ResponseHead) -> BodyFraming {
    // HEAD responses and 204/304 carry headers like Content-Length but no body.
    if method.eq_ignore_ascii_case("HEAD") || head.status == 204 || head.status == 304 {
        return BodyFraming::Length(0);
    }
    if head.header("transfer-encoding").is_some() {
        return BodyFraming::Chunked;
    }
    match head
        .header("content-length")
        .and_then(|v| v.trim().parse().ok())
    {
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::Close,
    }
}

/// Copy exactly `limit` bytes from `reader` to `writer`.
///
/// # Errors
/// * `ProxyError::Relay` - I/O failure, or EOF before `limit` bytes arrived.
pub(crate) async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, limit: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut taken = reader.take(limit);
    let copied = tokio::io::copy(&mut taken, writer)
        .await
        .map_err(|e| ProxyError::Relay(format!("body relay failed: {e}")))?;
    if copied < limit {
        return Err(ProxyError::Relay("connection closed mid-body".to_string()));
    }
    Ok(())
}

/// Relay a chunked body from `reader` to `writer` verbatim.
///
/// Chunk framing is parsed only to find the end of the body; the bytes are
/// passed through unmodified, including the trailer section. Reads of the
/// size lines are byte-wise so nothing past the body is consumed (the
/// connection may go back to a pool afterwards).
pub(crate) async fn relay_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = read_crlf_line(&mut *reader).await?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProxyError::Relay(format!("body relay failed: {e}")))?;
        let size_text = line.trim_end().split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| ProxyError::Relay(format!("invalid chunk size: {size_text}")))?;
        if size == 0 {
            break;
        }
        // Chunk data plus its trailing CRLF; a size near u64::MAX cannot be
        // a real chunk and would overflow the span.
        let span = size
            .checked_add(2)
            .ok_or_else(|| ProxyError::Relay(format!("invalid chunk size: {size_text}")))?;
        copy_exact(&mut *reader, &mut *writer, span).await?;
    }

    // Trailer section: zero or more header lines, then a blank line.
    loop {
        let line = read_crlf_line(&mut *reader).await?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProxyError::Relay(format!("body relay failed: {e}")))?;
        if line == "\r\n" {
            break;
        }
    }
    Ok(())
}

async fn read_crlf_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line: Vec<u8> = Vec::with_capacity(32);
    let mut byte = [0u8; 1];
    loop {
        let n = reader
            .read(&mut byte)
            .await
            .map_err(|e| ProxyError::Relay(format!("chunked read failed: {e}")))?;
        if n == 0 {
            return Err(ProxyError::Relay("connection closed mid-chunk".to_string()));
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > 1024 {
            return Err(ProxyError::Relay("chunk size line too long".to_string()));
        }
    }
    String::from_utf8(line).map_err(|_| ProxyError::Relay("chunk line is not UTF-8".to_string()))
}

/// Best-effort plain-text error response; if the client is already gone it
/// will just see the connection drop.
pub(crate) async fn write_client_error<W>(client: &mut W, status: u16, reason: &str, message: &str)
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{message}\n");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = client.write_all(response.as_bytes()).await;
}

/// Relay data between client and upstream until both sides close.
///
/// Copies bidirectionally; when one direction reaches EOF its write half is
/// explicitly shut down so the peer receives FIN and can finish sending.
pub(crate) async fn splice(client: TcpStream, upstream: TcpStream) -> Result<()> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_upstream = async {
        let r = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        // Best-effort half-close; if shutdown fails the peer will see a connection reset.
        let _ = upstream_write.shutdown().await;
        r
    };
    let upstream_to_client = async {
        let r = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        // Best-effort half-close; if shutdown fails the peer will see a connection reset.
        let _ = client_write.shutdown().await;
        r
    };

    let (a, b) = tokio::join!(client_to_upstream, upstream_to_client);
    for r in [a, b] {
        match r {
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::ConnectionReset
                    || e.kind() == std::io::ErrorKind::BrokenPipe =>
            {
                // Normal connection close
            }
            Err(e) => return Err(ProxyError::Relay(e.to_string())),
        }
    }
    Ok(())
}

//! Minimal HTTP/1.1 client speaking through the host's vsock-proxy.
//!
//! One request per connection: the request always carries
//! `Connection: close`, the response is read to EOF, then parsed at the
//! byte level. This is deliberately small and auditable; the bytes the
//! parser accepts are part of what the enclave image attests.

use crate::service::{AllowlistEntry, Transport};
use crate::transport::{self, ProxyStream};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use wire::Headers;

/// Wall-clock budget for one outbound fetch, TLS handshake included.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream fetch timed out after {}s", FETCH_TIMEOUT.as_secs())]
    UpstreamTimeout,
    #[error("malformed status line: {0:?}")]
    MalformedStatus(String),
    #[error("malformed response: {0}")]
    Malformed(&'static str),
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed upstream response. Header names are lowercased; the body is
/// de-chunked and decoded as UTF-8 with replacement characters.
#[derive(Debug)]
pub struct Upstream {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

/// Fetch `path` from the host named by `entry`, over TLS or in the clear
/// depending on the entry's transport.
pub async fn proxy_fetch(
    entry: &AllowlistEntry,
    method: &str,
    path: &str,
    headers: &Headers,
    body: Option<&str>,
) -> Result<Upstream, FetchError> {
    let attempt = async {
        let vsock = transport::connect_host(entry.proxy_port)
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?;
        let mut stream = match entry.transport {
            Transport::Tls => transport::wrap_tls(vsock, entry.hostname)
                .await
                .map_err(|e| FetchError::Connect(e.to_string()))?,
            Transport::Plain => ProxyStream::Plain(vsock),
        };
        exchange(&mut stream, entry.hostname, method, path, headers, body).await
    };
    match tokio::time::timeout(FETCH_TIMEOUT, attempt).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::UpstreamTimeout),
    }
}

/// Write one serialised request, read the stream to EOF, parse.
pub(crate) async fn exchange<S>(
    stream: &mut S,
    hostname: &str,
    method: &str,
    path: &str,
    headers: &Headers,
    body: Option<&str>,
) -> Result<Upstream, FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = serialize_request(hostname, method, path, headers, body);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut raw = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            // Some servers close without a TLS close_notify.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }
    parse_response(&raw)
}

/// Serialise the request line, caller headers, and the managed overlay.
/// `Host` and `Connection` always come from here, and `Content-Length` is
/// derived from the body; caller copies of those are dropped.
pub(crate) fn serialize_request(
    hostname: &str,
    method: &str,
    path: &str,
    headers: &Headers,
    body: Option<&str>,
) -> Vec<u8> {
    let mut head = format!("{method} {path} HTTP/1.1\r\n");
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || lower == "connection" {
            continue;
        }
        if body.is_some() && lower == "content-length" {
            continue;
        }
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Host: {hostname}\r\nConnection: close\r\n"));
    if let Some(body) = body {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    let mut out = head.into_bytes();
    if let Some(body) = body {
        out.extend_from_slice(body.as_bytes());
    }
    out
}

lazy_static! {
    static ref STATUS_RE: Regex = Regex::new(r"^HTTP/\d\.\d\s+(\d+)").unwrap();
}

/// Parse a full HTTP/1.1 response. The header/body split happens at the
/// byte level: the body may be multi-byte UTF-8 and must not be decoded
/// before the first CRLFCRLF is located.
pub(crate) fn parse_response(raw: &[u8]) -> Result<Upstream, FetchError> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(FetchError::Malformed("missing header terminator"))?;
    let head = std::str::from_utf8(&raw[..header_end])
        .ok()
        .filter(|h| h.is_ascii())
        .ok_or(FetchError::Malformed("non-ASCII header block"))?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = STATUS_RE
        .captures(status_line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| FetchError::MalformedStatus(status_line.to_string()))?;

    let mut headers = Headers::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else { continue };
        headers.insert(
            name.trim().to_ascii_lowercase(),
            serde_json::Value::String(value.trim().to_string()),
        );
    }

    let mut body_bytes = raw[header_end + 4..].to_vec();
    let chunked = headers
        .get("transfer-encoding")
        .and_then(|v| v.as_str())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        body_bytes = dechunk(&body_bytes)?;
    }
    let body = String::from_utf8_lossy(&body_bytes).into_owned();
    Ok(Upstream { status, headers, body })
}

/// Reassemble a `Transfer-Encoding: chunked` body at the byte level.
fn dechunk(data: &[u8]) -> Result<Vec<u8>, FetchError> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = data[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(FetchError::Malformed("unterminated chunk size"))?
            + pos;
        let size_line = std::str::from_utf8(&data[pos..line_end])
            .map_err(|_| FetchError::Malformed("invalid chunk size"))?;
        // Chunk extensions after ';' are ignored.
        let size_digits = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_digits, 16)
            .map_err(|_| FetchError::Malformed("invalid chunk size"))?;
        pos = line_end + 2;
        if size == 0 {
            break;
        }
        if pos + size > data.len() {
            return Err(FetchError::Malformed("chunk overruns body"));
        }
        out.extend_from_slice(&data[pos..pos + size]);
        pos += size;
        if data.get(pos..pos + 2) != Some(&b"\r\n"[..]) {
            return Err(FetchError::Malformed("missing chunk terminator"));
        }
        pos += 2;
    }
    Ok(out)
}

//! Guest-side HTTP/1.x request parsing
//!
//! One [`RequestReader`] runs per flow and yields complete logical requests:
//! head via httparse, body framed by Content-Length or chunked transfer
//! coding. Leftover bytes stay buffered between requests, which is what
//! makes keep-alive and pipelining work.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::headers::HeaderMap;
use crate::{Error, Result};

/// Cap on the request head (request line + headers).
const MAX_HEAD: usize = 32 * 1024;
/// Cap on a buffered request body.
const MAX_BODY: usize = 16 * 1024 * 1024;

/// One complete request as the guest sent it.
#[derive(Debug)]
pub struct GuestRequest {
    pub method: String,
    /// Request target exactly as sent: origin-form or absolute-form
    pub target: String,
    /// Minor version of `HTTP/1.x`
    pub version_minor: u8,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl GuestRequest {
    /// Whether the connection persists after this exchange.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        if self.version_minor == 0 {
            return self.headers.has_token("connection", "keep-alive");
        }
        true
    }
}

pub struct RequestReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + Unpin> RequestReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(1024),
        }
    }

    /// Next complete request; `None` on clean EOF between requests.
    /// [`Error::Transport`] marks a malformed head or body (answer 400).
    pub async fn next(&mut self) -> Result<Option<GuestRequest>> {
        let head_len = loop {
            if let Some(n) = find(&self.buf, b"\r\n\r\n") {
                break n + 4;
            }
            if self.buf.len() > MAX_HEAD {
                return Err(Error::Transport("request head too large".into()));
            }
            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::Transport("truncated request head".into()))
                };
            }
        };

        let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut parsed_headers);
        let status = parsed
            .parse(&self.buf[..head_len])
            .map_err(|e| Error::Transport(format!("bad request head: {e}")))?;
        if !status.is_complete() {
            return Err(Error::Transport("unparseable request head".into()));
        }

        let method = parsed.method.unwrap_or_default().to_string();
        let target = parsed.path.unwrap_or_default().to_string();
        let version_minor = parsed.version.unwrap_or(1);
        let mut headers = HeaderMap::new();
        for h in parsed.headers.iter() {
            headers.push(h.name, h.value);
        }
        self.buf.drain(..head_len);

        let body = if headers.has_token("transfer-encoding", "chunked") {
            self.read_chunked_body().await?
        } else if let Some(cl) = headers.get_str("content-length") {
            let len: usize = cl
                .trim()
                .parse()
                .map_err(|_| Error::Transport("bad content-length".into()))?;
            if len > MAX_BODY {
                return Err(Error::ResourceExhausted(format!(
                    "request body of {len} bytes"
                )));
            }
            self.read_exact_body(len).await?
        } else {
            Vec::new()
        };

        trace!(
            "http: parsed {} {} ({} headers, {} body bytes)",
            method,
            target,
            headers.len(),
            body.len()
        );
        Ok(Some(GuestRequest {
            method,
            target,
            version_minor,
            headers,
            body,
        }))
    }

    async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn read_exact_body(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(Error::Transport("truncated request body".into()));
            }
        }
        Ok(self.buf.drain(..len).collect())
    }

    /// Decode a chunked body, consuming any trailer section.
    async fn read_chunked_body(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| Error::Transport("bad chunk size".into()))?;
            if body.len() + size > MAX_BODY {
                return Err(Error::ResourceExhausted("chunked body too large".into()));
            }
            if size == 0 {
                // trailer section: lines until the empty one
                loop {
                    let trailer = self.read_line().await?;
                    if trailer.is_empty() {
                        return Ok(body);
                    }
                }
            }
            let chunk = self.read_exact_body(size).await?;
            body.extend_from_slice(&chunk);
            let crlf = self.read_line().await?;
            if !crlf.is_empty() {
                return Err(Error::Transport("chunk not CRLF-terminated".into()));
            }
        }
    }

    /// One CRLF-terminated line, without the terminator.
    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(n) = find(&self.buf, b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..n + 2).take(n).collect();
                return String::from_utf8(line)
                    .map_err(|_| Error::Transport("non-ascii chunk line".into()));
            }
            if self.buf.len() > MAX_HEAD {
                return Err(Error::Transport("chunk line too long".into()));
            }
            if self.fill().await? == 0 {
                return Err(Error::Transport("truncated chunked body".into()));
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

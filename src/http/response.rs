//! Response serialization and synthetic responses
//!
//! Everything the guest receives is serialized here: mediated upstream
//! responses (streamed, re-framed) and the synthetic 4xx/5xx responses the
//! stack produces on its own (policy blocks, upstream failures, hook
//! failures). Synthetic responses never carry upstream or host internals.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::headers::HeaderMap;
use crate::error::BlockReason;
use crate::Result;

/// Status line + headers of a response, before the body is streamed.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// How the body following a head is framed on the guest connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// Content-Length framing
    Length(u64),
    /// Chunked transfer coding (upstream gave no length)
    Chunked,
    /// No body bytes follow (HEAD, 1xx/204/304)
    None,
}

/// Hop-by-hop headers never relayed in either direction.
pub fn is_hop_by_hop(name: &str) -> bool {
    const HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Serialize a head onto the guest connection with the given body framing.
pub async fn write_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &ResponseHead,
    mode: BodyMode,
) -> Result<()> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", head.status, head.reason).as_bytes());
    for (name, value) in head.headers.iter() {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    match mode {
        BodyMode::Length(n) => {
            out.extend_from_slice(format!("Content-Length: {n}\r\n").as_bytes());
        }
        BodyMode::Chunked => {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        BodyMode::None => {}
    }
    out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    w.write_all(&out).await?;
    Ok(())
}

/// One chunk in chunked transfer coding.
pub async fn write_chunk<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    w.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    w.write_all(data).await?;
    w.write_all(b"\r\n").await?;
    Ok(())
}

/// Terminating zero chunk.
pub async fn finish_chunked<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(b"0\r\n\r\n").await?;
    Ok(())
}

/// A complete synthetic response, ready to write.
pub fn synthetic(status: u16, reason: &str, body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    out.extend_from_slice(b"Content-Type: text/plain\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    out.extend_from_slice(body.as_bytes());
    out
}

/// 403 carrying the stable policy reason code.
pub fn blocked(reason: BlockReason) -> Vec<u8> {
    synthetic(403, "Forbidden", &format!("blocked: {}\n", reason.as_str()))
}

/// 502 for upstream failures; the detail stays in host logs.
pub fn bad_gateway(reason: &str) -> Vec<u8> {
    synthetic(502, "Bad Gateway", &format!("upstream failed: {reason}\n"))
}

/// 500 for hook failures; the hook's message is elided.
pub fn hook_failed() -> Vec<u8> {
    synthetic(500, "Internal Error", "request hook failed\n")
}

/// 400 for malformed guest requests.
pub fn bad_request() -> Vec<u8> {
    synthetic(400, "Bad Request", "malformed request\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_head_filters_hop_by_hop_and_reframes() {
        let mut headers = HeaderMap::new();
        headers.push("Content-Type", &b"application/json"[..]);
        headers.push("Transfer-Encoding", &b"chunked"[..]);
        headers.push("Connection", &b"close"[..]);
        headers.push("Content-Length", &b"999"[..]);
        let head = ResponseHead {
            status: 200,
            reason: "OK".into(),
            headers,
        };
        let mut out = Vec::new();
        write_head(&mut out, &head, BodyMode::Length(4)).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(!text.contains("999"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(!text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_chunked_round_trip_format() {
        let mut out = Vec::new();
        write_chunk(&mut out, b"hello").await.unwrap();
        write_chunk(&mut out, b"").await.unwrap();
        finish_chunked(&mut out).await.unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn test_blocked_carries_reason_code() {
        let bytes = blocked(BlockReason::HostNotAllowed);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("host_not_allowed"));
    }

    #[test]
    fn test_synthetic_has_accurate_length() {
        let bytes = synthetic(502, "Bad Gateway", "nope\n");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("nope\n"));
    }
}

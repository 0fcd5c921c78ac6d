//! Flow classifier
//!
//! Looks at the first bytes of each accepted TCP flow and decides, exactly
//! once, what runs on top: the HTTP mediator, the TLS interposer, or nothing
//! (reject + RST). Decision rules, in order:
//!
//! 1. TLS record header (content type 0x16, version >= TLS 1.0) -> TLS
//! 2. HTTP method token, SP, origin/absolute/asterisk form, SP, `HTTP/1.` ->
//!    HTTP; a CONNECT verb is rejected outright
//! 3. Anything else, 2 KiB without a decision, idle timeout, or EOF -> reject

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// Bytes examined before giving up on a decision.
pub const CLASSIFY_MAX: usize = 2048;
/// How long a silent or undecidable flow may linger before rejection.
pub const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(5);

const METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH",
];

/// Terminal classification of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Http,
    Tls,
    Rejected(&'static str),
}

/// Classify from the bytes seen so far. `None` means undecidable yet.
pub fn classify(buf: &[u8]) -> Option<Classification> {
    if buf.is_empty() {
        return None;
    }

    // TLS: content type 0x16 (handshake), record version major 3 minor >= 1
    if buf[0] == 0x16 {
        if buf.len() < 3 {
            return None;
        }
        return if buf[1] == 3 && (1..=4).contains(&buf[2]) {
            Some(Classification::Tls)
        } else {
            Some(Classification::Rejected("tls_version"))
        };
    }

    classify_http(buf)
}

fn classify_http(buf: &[u8]) -> Option<Classification> {
    let Some(sp) = buf.iter().position(|&b| b == b' ') else {
        // longest admissible token is OPTIONS/CONNECT at 7 bytes
        return if buf.len() > 7 {
            Some(Classification::Rejected("not_http"))
        } else if buf.iter().any(|b| !b.is_ascii_uppercase()) {
            Some(Classification::Rejected("not_http"))
        } else {
            None
        };
    };

    let method = &buf[..sp];
    if method == b"CONNECT" {
        return Some(Classification::Rejected("connect"));
    }
    if !METHODS.iter().any(|m| m.as_bytes() == method) {
        return Some(Classification::Rejected("unknown_method"));
    }

    let rest = &buf[sp + 1..];
    if let Some(first) = rest.first() {
        let target_ok = matches!(first, b'*' | b'/') || first.is_ascii_alphabetic();
        if !target_ok {
            return Some(Classification::Rejected("bad_target"));
        }
    }

    // decided once " HTTP/1." shows up in the request line
    if let Some(eol) = find(buf, b"\r\n") {
        return if find(&buf[..eol], b" HTTP/1.").is_some() {
            Some(Classification::Http)
        } else {
            Some(Classification::Rejected("bad_version"))
        };
    }
    if find(buf, b" HTTP/1.").is_some() {
        return Some(Classification::Http);
    }
    if buf.len() >= CLASSIFY_MAX {
        return Some(Classification::Rejected("line_too_long"));
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read from `stream` until a classification is reached. Returns the
/// decision and every byte consumed, for replay in front of the stream.
pub async fn classify_stream<S: AsyncRead + Unpin>(stream: &mut S) -> (Classification, Vec<u8>) {
    let mut buf = Vec::with_capacity(512);
    let deadline = tokio::time::Instant::now() + CLASSIFY_TIMEOUT;

    loop {
        if let Some(decision) = classify(&buf) {
            debug!("classifier: {decision:?} after {} bytes", buf.len());
            return (decision, buf);
        }
        let mut chunk = [0u8; 1024];
        let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await;
        match read {
            Err(_) => {
                trace!("classifier: idle timeout");
                return (Classification::Rejected("timeout"), buf);
            }
            Ok(Err(_)) | Ok(Ok(0)) => {
                return (Classification::Rejected("closed"), buf);
            }
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > CLASSIFY_MAX {
                    buf.truncate(CLASSIFY_MAX);
                }
            }
        }
    }
}

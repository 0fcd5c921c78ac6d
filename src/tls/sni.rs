//! ClientHello SNI extraction
//!
//! Reads the server_name extension straight off the record layer, without
//! any TLS state: the interposer needs the name before it can pick a leaf
//! certificate, and the untouched bytes are then replayed into the real
//! handshake.

/// Outcome of scanning the buffered client bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Not enough bytes buffered to decide
    NeedMore,
    /// A complete ClientHello with no server_name extension
    Absent,
    /// The SNI host name
    Found(String),
}

const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;

/// Scan `buf` (the start of the client->server byte stream) for the first
/// ClientHello's SNI. Handles a hello fragmented across records.
pub fn parse_client_hello_sni(buf: &[u8]) -> SniResult {
    // reassemble the handshake byte stream out of the record layer
    let mut handshake = Vec::new();
    let mut rest = buf;
    loop {
        if rest.len() < 5 {
            if handshake_complete(&handshake) {
                break;
            }
            return SniResult::NeedMore;
        }
        if rest[0] != CONTENT_HANDSHAKE {
            // non-handshake record before the hello finished
            return SniResult::Absent;
        }
        let record_len = u16::from_be_bytes([rest[3], rest[4]]) as usize;
        let Some(fragment) = rest.get(5..5 + record_len) else {
            // partial record: take what is there and see if it suffices
            handshake.extend_from_slice(&rest[5..]);
            if handshake_complete(&handshake) {
                break;
            }
            return SniResult::NeedMore;
        };
        handshake.extend_from_slice(fragment);
        rest = &rest[5 + record_len..];
        if handshake_complete(&handshake) {
            break;
        }
        if rest.is_empty() {
            return SniResult::NeedMore;
        }
    }
    parse_hello(&handshake)
}

/// True once the first handshake message is fully buffered.
fn handshake_complete(handshake: &[u8]) -> bool {
    if handshake.len() < 4 {
        return false;
    }
    let len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    handshake.len() >= 4 + len
}

fn parse_hello(handshake: &[u8]) -> SniResult {
    if handshake.len() < 4 || handshake[0] != HANDSHAKE_CLIENT_HELLO {
        return SniResult::Absent;
    }
    let len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    let Some(body) = handshake.get(4..4 + len) else {
        return SniResult::NeedMore;
    };

    let mut cursor = Cursor { buf: body, pos: 0 };
    // legacy_version + random
    if !cursor.skip(2 + 32) {
        return SniResult::Absent;
    }
    // session id
    let Some(sid_len) = cursor.read_u8() else {
        return SniResult::Absent;
    };
    if !cursor.skip(sid_len as usize) {
        return SniResult::Absent;
    }
    // cipher suites
    let Some(cs_len) = cursor.read_u16() else {
        return SniResult::Absent;
    };
    if !cursor.skip(cs_len as usize) {
        return SniResult::Absent;
    }
    // compression methods
    let Some(comp_len) = cursor.read_u8() else {
        return SniResult::Absent;
    };
    if !cursor.skip(comp_len as usize) {
        return SniResult::Absent;
    }
    // extensions
    let Some(ext_total) = cursor.read_u16() else {
        return SniResult::Absent;
    };
    let Some(mut exts) = cursor.take(ext_total as usize) else {
        return SniResult::Absent;
    };
    while exts.remaining() >= 4 {
        let ext_type = exts.read_u16().unwrap_or(0xffff);
        let ext_len = exts.read_u16().unwrap_or(0) as usize;
        let Some(mut ext) = exts.take(ext_len) else {
            return SniResult::Absent;
        };
        if ext_type != EXT_SERVER_NAME {
            continue;
        }
        // server_name_list: u16 length, then (type u8, length u16, name)
        let Some(_list_len) = ext.read_u16() else {
            return SniResult::Absent;
        };
        while ext.remaining() >= 3 {
            let name_type = ext.read_u8().unwrap_or(0xff);
            let name_len = ext.read_u16().unwrap_or(0) as usize;
            let Some(name) = ext.take(name_len) else {
                return SniResult::Absent;
            };
            if name_type == 0 {
                return match std::str::from_utf8(name.rest()) {
                    Ok(s) if !s.is_empty() => SniResult::Found(s.to_ascii_lowercase()),
                    _ => SniResult::Absent,
                };
            }
        }
        return SniResult::Absent;
    }
    SniResult::Absent
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn skip(&mut self, n: usize) -> bool {
        if self.remaining() < n {
            return false;
        }
        self.pos += n;
        true
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_u16(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Some(v)
    }

    fn take(&mut self, n: usize) -> Option<Cursor<'a>> {
        if self.remaining() < n {
            return None;
        }
        let sub = Cursor {
            buf: &self.buf[self.pos..self.pos + n],
            pos: 0,
        };
        self.pos += n;
        Some(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ClientHello with the given extensions blob.
    fn client_hello(extensions: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy_version TLS 1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn sni_extension(name: &str) -> Vec<u8> {
        let mut entry = vec![0u8]; // host_name type
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name.as_bytes());
        let mut list = (entry.len() as u16).to_be_bytes().to_vec();
        list.extend_from_slice(&entry);
        let mut ext = EXT_SERVER_NAME.to_be_bytes().to_vec();
        ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
        ext.extend_from_slice(&list);
        ext
    }

    #[test]
    fn test_sni_extracted() {
        let hello = client_hello(&sni_extension("API.Example.com"));
        assert_eq!(
            parse_client_hello_sni(&hello),
            SniResult::Found("api.example.com".into())
        );
    }

    #[test]
    fn test_sni_after_other_extensions() {
        // ALPN-ish extension first, then server_name
        let mut exts = vec![0x00, 0x10, 0x00, 0x02, 0xaa, 0xbb];
        exts.extend_from_slice(&sni_extension("h.test"));
        let hello = client_hello(&exts);
        assert_eq!(
            parse_client_hello_sni(&hello),
            SniResult::Found("h.test".into())
        );
    }

    #[test]
    fn test_absent_sni() {
        let hello = client_hello(&[]);
        assert_eq!(parse_client_hello_sni(&hello), SniResult::Absent);
    }

    #[test]
    fn test_partial_hello_needs_more() {
        let hello = client_hello(&sni_extension("h.test"));
        for cut in [1, 4, 10, hello.len() - 1] {
            assert_eq!(
                parse_client_hello_sni(&hello[..cut]),
                SniResult::NeedMore,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_hello_fragmented_across_records() {
        let whole = client_hello(&sni_extension("frag.test"));
        let handshake = &whole[5..];
        let (a, b) = handshake.split_at(handshake.len() / 2);
        let mut fragmented = vec![CONTENT_HANDSHAKE, 0x03, 0x01];
        fragmented.extend_from_slice(&(a.len() as u16).to_be_bytes());
        fragmented.extend_from_slice(a);
        fragmented.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x01]);
        fragmented.extend_from_slice(&(b.len() as u16).to_be_bytes());
        fragmented.extend_from_slice(b);
        assert_eq!(
            parse_client_hello_sni(&fragmented),
            SniResult::Found("frag.test".into())
        );
    }

    #[test]
    fn test_non_handshake_record_absent() {
        assert_eq!(
            parse_client_hello_sni(&[0x17, 0x03, 0x03, 0x00, 0x01, 0x00]),
            SniResult::Absent
        );
    }
}

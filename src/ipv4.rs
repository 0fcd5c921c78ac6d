//! IPv4 layer
//!
//! Validates ingress headers and emits egress datagrams. There is no
//! forwarding and no fragmentation: every egress datagram carries DF, and
//! ingress fragments are refused with an ICMP "fragmentation needed" reply
//! built by the ICMP module.

use std::net::Ipv4Addr;

use smoltcp::wire::{IpProtocol, Ipv4Packet};

use crate::{Error, Result};

/// TTL placed on every egress datagram
pub const EGRESS_TTL: u8 = 64;
/// IPv4 header length emitted by this stack (no options)
pub const HEADER_LEN: usize = 20;

/// A validated view of one ingress IPv4 datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct IngressDatagram<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: IpProtocol,
    pub payload: &'a [u8],
}

/// Why an ingress datagram was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum IngressRefusal {
    /// Header malformed or checksum invalid; drop and count
    Invalid(&'static str),
    /// MF set or nonzero fragment offset; answer with ICMP frag-needed
    Fragmented,
}

/// Parse and validate one IPv4 packet (the payload of an Ethernet frame).
pub fn parse(buf: &[u8]) -> std::result::Result<IngressDatagram<'_>, IngressRefusal> {
    let packet = Ipv4Packet::new_checked(buf).map_err(|_| IngressRefusal::Invalid("truncated"))?;
    if packet.version() != 4 {
        return Err(IngressRefusal::Invalid("version"));
    }
    if !packet.verify_checksum() {
        return Err(IngressRefusal::Invalid("checksum"));
    }
    if packet.more_frags() || packet.frag_offset() != 0 {
        return Err(IngressRefusal::Fragmented);
    }
    if packet.hop_limit() == 0 {
        return Err(IngressRefusal::Invalid("ttl"));
    }
    Ok(IngressDatagram {
        src: Ipv4Addr::from(packet.src_addr().0),
        dst: Ipv4Addr::from(packet.dst_addr().0),
        protocol: packet.next_header(),
        payload: &buf[packet.header_len() as usize..packet.total_len() as usize],
    })
}

/// Build one egress IPv4 datagram: fresh checksum, random identification,
/// DF set, fixed TTL, no options.
pub fn build(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProtocol, payload: &[u8]) -> Vec<u8> {
    let total = HEADER_LEN + payload.len();
    let mut buf = vec![0u8; total];
    buf[0] = 0x45; // version 4, IHL 5
    buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    buf[4..6].copy_from_slice(&random_ident().to_be_bytes());
    buf[6] = 0x40; // DF
    buf[8] = EGRESS_TTL;
    buf[9] = protocol.into();
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    let cksum = checksum(&buf[..HEADER_LEN]);
    buf[10..12].copy_from_slice(&cksum.to_be_bytes());
    buf[HEADER_LEN..].copy_from_slice(payload);
    buf
}

/// RFC 1071 internet checksum over `data` (checksum field must be zeroed).
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn random_ident() -> u16 {
    let mut b = [0u8; 2];
    // getrandom only fails on broken platforms; fall back to a counter-free zero
    if getrandom::fill(&mut b).is_err() {
        return 0;
    }
    u16::from_be_bytes(b)
}

impl From<IngressRefusal> for Error {
    fn from(r: IngressRefusal) -> Self {
        match r {
            IngressRefusal::Invalid(what) => Error::L3(format!("invalid header: {what}")),
            IngressRefusal::Fragmented => Error::L3("fragment refused".into()),
        }
    }
}

/// Convenience used by tests and modules that need a `Result`.
pub fn parse_strict(buf: &[u8]) -> Result<IngressDatagram<'_>> {
    parse(buf).map_err(Error::from)
}

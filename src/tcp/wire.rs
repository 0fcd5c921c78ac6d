//! Segment parse/build
//!
//! Thin layer over smoltcp's TCP wire types. Parsing validates the checksum
//! against the pseudo-header; building computes fresh checksums and wraps
//! the segment in an IPv4 datagram with DF set.

use std::net::Ipv4Addr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber,
};

use crate::ipv4;

fn smol_ip(ip: Ipv4Addr) -> IpAddress {
    IpAddress::Ipv4(Ipv4Address(ip.octets()))
}

/// One validated ingress segment.
#[derive(Debug)]
pub(crate) struct SegmentView<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: Option<u32>,
    pub window: u16,
    pub mss: Option<u16>,
    pub control: TcpControl,
    pub payload: &'a [u8],
}

impl<'a> SegmentView<'a> {
    pub fn is_syn(&self) -> bool {
        self.control == TcpControl::Syn
    }

    pub fn is_fin(&self) -> bool {
        self.control == TcpControl::Fin
    }

    pub fn is_rst(&self) -> bool {
        self.control == TcpControl::Rst
    }

    /// Sequence space the segment occupies (data + SYN/FIN flags).
    pub fn seq_len(&self) -> u32 {
        let flag = matches!(self.control, TcpControl::Syn | TcpControl::Fin) as u32;
        self.payload.len() as u32 + flag
    }
}

/// Why a segment could not be accepted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParseError {
    /// Too short to carry a TCP header; nothing to attribute it to
    Truncated,
    /// Checksum failure on an attributable segment; the flow is reset
    Checksum { src_port: u16, dst_port: u16 },
    /// Header valid but flags/options inconsistent
    Malformed,
}

/// Parse one TCP segment out of an IP payload, verifying the checksum.
pub(crate) fn parse<'a>(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ip_payload: &'a [u8],
) -> Result<SegmentView<'a>, ParseError> {
    let packet = TcpPacket::new_checked(ip_payload).map_err(|_| ParseError::Truncated)?;
    if !packet.verify_checksum(&smol_ip(src), &smol_ip(dst)) {
        return Err(ParseError::Checksum {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
        });
    }
    let repr = TcpRepr::parse(
        &packet,
        &smol_ip(src),
        &smol_ip(dst),
        &ChecksumCapabilities::default(),
    )
    .map_err(|_| ParseError::Malformed)?;
    Ok(SegmentView {
        src_port: repr.src_port,
        dst_port: repr.dst_port,
        seq: repr.seq_number.0 as u32,
        ack: repr.ack_number.map(|n| n.0 as u32),
        window: repr.window_len,
        mss: repr.max_seg_size,
        control: repr.control,
        payload: repr.payload,
    })
}

/// Build one egress segment as a complete IPv4 datagram.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: Option<u32>,
    window: u16,
    control: TcpControl,
    payload: &[u8],
) -> Vec<u8> {
    let repr = TcpRepr {
        src_port,
        dst_port,
        control,
        seq_number: TcpSeqNumber(seq as i32),
        ack_number: ack.map(|n| TcpSeqNumber(n as i32)),
        window_len: window,
        window_scale: None,
        max_seg_size: if control == TcpControl::Syn {
            Some(super::MSS as u16)
        } else {
            None
        },
        sack_permitted: false,
        sack_ranges: [None; 3],
        payload,
    };
    let mut buf = vec![0u8; repr.header_len() + payload.len()];
    let mut packet = TcpPacket::new_unchecked(&mut buf[..]);
    repr.emit(
        &mut packet,
        &smol_ip(src),
        &smol_ip(dst),
        &ChecksumCapabilities::default(),
    );
    ipv4::build(src, dst, IpProtocol::Tcp, &buf)
}

/// Sequence-space comparison: true when `a < b` modulo 2^32.
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    b.wrapping_sub(a).wrapping_sub(1) < 0x8000_0000
}

/// True when `a <= b` modulo 2^32.
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < 0x8000_0000
}

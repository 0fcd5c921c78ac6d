//! UDP demux
//!
//! The only UDP admitted through the stack is DNS (destination port 53);
//! everything else is dropped silently. Replies use a zero UDP checksum,
//! which IPv4 permits.

use std::net::Ipv4Addr;

use smoltcp::wire::{IpProtocol, UdpPacket};

/// One parsed ingress UDP datagram.
#[derive(Debug)]
pub struct UdpView<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// The single destination port the gate admits.
pub const DNS_PORT: u16 = 53;

/// Parse the UDP header out of an IP payload.
pub fn parse(ip_payload: &[u8]) -> Option<UdpView<'_>> {
    let udp = UdpPacket::new_checked(ip_payload).ok()?;
    let len = udp.len() as usize;
    if len < 8 || len > ip_payload.len() {
        return None;
    }
    Some(UdpView {
        src_port: udp.src_port(),
        dst_port: udp.dst_port(),
        payload: &ip_payload[8..len],
    })
}

/// Build a full IP datagram carrying one UDP payload.
pub fn build(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    // checksum left zero (optional for IPv4)
    udp[8..].copy_from_slice(payload);
    crate::ipv4::build(src_ip, dst_ip, IpProtocol::Udp, &udp)
}

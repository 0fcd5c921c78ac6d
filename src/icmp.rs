//! ICMP echo responder
//!
//! Every echo request is answered locally, whatever the destination: the
//! guest observes connectivity to arbitrary addresses while nothing about
//! actual host reachability leaks. Nothing is ever forwarded.

use std::net::Ipv4Addr;

use smoltcp::wire::IpProtocol;
use tracing::trace;

use crate::ipv4;

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_DEST_UNREACHABLE: u8 = 3;
const TYPE_ECHO_REQUEST: u8 = 8;
const CODE_FRAG_NEEDED: u8 = 4;

/// Answer an echo request carried in `payload` (the ICMP message of an
/// ingress datagram addressed to `dst`). Returns the full reply datagram,
/// already swapped so it appears to come from the pinged address.
pub fn echo_reply(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < 8 || payload[0] != TYPE_ECHO_REQUEST || payload[1] != 0 {
        return None;
    }
    if ipv4::checksum(payload) != 0 {
        trace!("icmp: bad echo checksum from {src}");
        return None;
    }
    let mut reply = payload.to_vec();
    reply[0] = TYPE_ECHO_REPLY;
    reply[2] = 0;
    reply[3] = 0;
    let cksum = ipv4::checksum(&reply);
    reply[2..4].copy_from_slice(&cksum.to_be_bytes());
    trace!("icmp: echo {} -> {} ({} bytes)", src, dst, reply.len());
    Some(ipv4::build(dst, src, IpProtocol::Icmp, &reply))
}

/// "Fragmentation needed" (type 3 code 4) answering a refused ingress
/// fragment. `offending` is the original datagram; the reply quotes its
/// header plus the first 8 payload bytes, per convention.
pub fn frag_needed(gateway: Ipv4Addr, offending: &[u8]) -> Vec<u8> {
    let quote_len = offending.len().min(28);
    let mut msg = vec![0u8; 8 + quote_len];
    msg[0] = TYPE_DEST_UNREACHABLE;
    msg[1] = CODE_FRAG_NEEDED;
    // next-hop MTU field
    msg[6..8].copy_from_slice(&(crate::config::DEFAULT_MTU as u16).to_be_bytes());
    msg[8..].copy_from_slice(&offending[..quote_len]);
    let cksum = ipv4::checksum(&msg);
    msg[2..4].copy_from_slice(&cksum.to_be_bytes());

    let guest = Ipv4Addr::new(
        offending.get(12).copied().unwrap_or(0),
        offending.get(13).copied().unwrap_or(0),
        offending.get(14).copied().unwrap_or(0),
        offending.get(15).copied().unwrap_or(0),
    );
    ipv4::build(gateway, guest, IpProtocol::Icmp, &msg)
}

//! DHCPv4 server
//!
//! Serves a single-address pool: the one guest NIC always receives the
//! configured guest IP. DISCOVER is answered with OFFER, REQUEST with ACK;
//! the advertised router and DNS both point at the host so every lookup and
//! connection stays under the stack's control.

use std::net::Ipv4Addr;
use std::time::Instant;

use smoltcp::wire::EthernetAddress;
use tracing::{debug, warn};

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
/// Fixed-size BOOTP header up to and including the magic cookie
const OPTIONS_OFFSET: usize = 240;

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_MTU: u8 = 26;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

const DISCOVER: u8 = 1;
const OFFER: u8 = 2;
const REQUEST: u8 = 3;
const ACK: u8 = 5;

/// The one lease this server hands out.
#[derive(Debug, Clone)]
pub struct DhcpLease {
    pub client_mac: EthernetAddress,
    pub assigned_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub dns_ip: Ipv4Addr,
    pub lease_secs: u32,
    pub granted_at: Instant,
}

/// A reply ready for UDP encapsulation (server port 67 -> client port 68,
/// IP broadcast, Ethernet unicast to `client_mac`).
pub struct DhcpReply {
    pub payload: Vec<u8>,
    pub client_mac: EthernetAddress,
    /// True once the client committed (REQUEST/ACK completed)
    pub acked: bool,
}

pub struct DhcpServer {
    guest_ip: Ipv4Addr,
    gateway_ip: Ipv4Addr,
    dns_ip: Ipv4Addr,
    netmask: u8,
    mtu: u16,
    lease_secs: u32,
    lease: Option<DhcpLease>,
}

impl DhcpServer {
    pub fn new(
        guest_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
        dns_ip: Ipv4Addr,
        netmask: u8,
        mtu: u16,
        lease_secs: u32,
    ) -> Self {
        Self {
            guest_ip,
            gateway_ip,
            dns_ip,
            netmask,
            mtu,
            lease_secs,
            lease: None,
        }
    }

    /// Current lease, if the guest has one.
    pub fn lease(&self) -> Option<&DhcpLease> {
        self.lease.as_ref()
    }

    /// Handle one datagram addressed to UDP port 67.
    pub fn handle(&mut self, payload: &[u8]) -> Option<DhcpReply> {
        if payload.len() < OPTIONS_OFFSET || payload[0] != BOOTREQUEST {
            return None;
        }
        if payload[236..240] != MAGIC_COOKIE {
            return None;
        }
        // Ethernet hardware, 6-byte address
        if payload[1] != 1 || payload[2] != 6 {
            return None;
        }
        let xid = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let client_mac = EthernetAddress::from_bytes(&payload[28..34]);

        let msg_type = find_option(&payload[OPTIONS_OFFSET..], OPT_MESSAGE_TYPE)
            .and_then(|v| v.first().copied())?;

        match msg_type {
            DISCOVER => {
                debug!("dhcp: DISCOVER from {client_mac}, offering {}", self.guest_ip);
                self.lease = Some(self.make_lease(client_mac));
                Some(DhcpReply {
                    payload: self.build_reply(OFFER, xid, client_mac),
                    client_mac,
                    acked: false,
                })
            }
            REQUEST => {
                // The pool has one address; a request for anything else is
                // answered with the same ACK the guest would have gotten,
                // since re-offering cannot change the outcome.
                if let Some(requested) =
                    find_option(&payload[OPTIONS_OFFSET..], OPT_REQUESTED_IP)
                {
                    if requested.len() == 4 {
                        let ip = Ipv4Addr::new(requested[0], requested[1], requested[2], requested[3]);
                        if ip != self.guest_ip {
                            warn!("dhcp: {client_mac} requested {ip}, leasing {} anyway", self.guest_ip);
                        }
                    }
                }
                debug!("dhcp: REQUEST from {client_mac}, ACK {}", self.guest_ip);
                self.lease = Some(self.make_lease(client_mac));
                Some(DhcpReply {
                    payload: self.build_reply(ACK, xid, client_mac),
                    client_mac,
                    acked: true,
                })
            }
            other => {
                debug!("dhcp: ignoring message type {other}");
                None
            }
        }
    }

    fn make_lease(&self, client_mac: EthernetAddress) -> DhcpLease {
        DhcpLease {
            client_mac,
            assigned_ip: self.guest_ip,
            gateway_ip: self.gateway_ip,
            dns_ip: self.dns_ip,
            lease_secs: self.lease_secs,
            granted_at: Instant::now(),
        }
    }

    fn build_reply(&self, msg_type: u8, xid: u32, client_mac: EthernetAddress) -> Vec<u8> {
        let mut out = vec![0u8; OPTIONS_OFFSET];
        out[0] = BOOTREPLY;
        out[1] = 1; // Ethernet
        out[2] = 6; // MAC length
        out[4..8].copy_from_slice(&xid.to_be_bytes());
        out[16..20].copy_from_slice(&self.guest_ip.octets()); // yiaddr
        out[20..24].copy_from_slice(&self.gateway_ip.octets()); // siaddr
        out[28..34].copy_from_slice(client_mac.as_bytes());
        out[236..240].copy_from_slice(&MAGIC_COOKIE);

        push_option(&mut out, OPT_MESSAGE_TYPE, &[msg_type]);
        push_option(&mut out, OPT_SERVER_ID, &self.gateway_ip.octets());
        push_option(&mut out, OPT_LEASE_TIME, &self.lease_secs.to_be_bytes());
        push_option(&mut out, OPT_SUBNET_MASK, &mask_octets(self.netmask));
        push_option(&mut out, OPT_ROUTER, &self.gateway_ip.octets());
        push_option(&mut out, OPT_DNS, &self.dns_ip.octets());
        push_option(&mut out, OPT_MTU, &self.mtu.to_be_bytes());
        out.push(OPT_END);
        out
    }
}

fn mask_octets(prefix: u8) -> [u8; 4] {
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    bits.to_be_bytes()
}

fn push_option(out: &mut Vec<u8>, code: u8, data: &[u8]) {
    out.push(code);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

fn find_option(options: &[u8], wanted: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < options.len() {
        let code = options[i];
        if code == OPT_END {
            return None;
        }
        if code == 0 {
            i += 1; // pad
            continue;
        }
        let len = *options.get(i + 1)? as usize;
        let value = options.get(i + 2..i + 2 + len)?;
        if code == wanted {
            return Some(value);
        }
        i += 2 + len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    fn server() -> DhcpServer {
        DhcpServer::new(
            Ipv4Addr::new(10, 0, 2, 15),
            Ipv4Addr::new(10, 0, 2, 2),
            Ipv4Addr::new(10, 0, 2, 3),
            24,
            1500,
            3600,
        )
    }

    fn client_message(msg_type: u8, xid: u32) -> Vec<u8> {
        let mut out = vec![0u8; OPTIONS_OFFSET];
        out[0] = BOOTREQUEST;
        out[1] = 1;
        out[2] = 6;
        out[4..8].copy_from_slice(&xid.to_be_bytes());
        out[10..12].copy_from_slice(&0x8000u16.to_be_bytes()); // broadcast flag
        out[28..34].copy_from_slice(&GUEST_MAC);
        out[236..240].copy_from_slice(&MAGIC_COOKIE);
        out.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, msg_type]);
        out.push(OPT_END);
        out
    }

    #[test]
    fn test_discover_offer_request_ack() {
        let mut dhcp = server();

        let offer = dhcp.handle(&client_message(DISCOVER, 0x1111)).expect("offer");
        assert!(!offer.acked);
        assert_eq!(offer.payload[0], BOOTREPLY);
        assert_eq!(&offer.payload[4..8], &0x1111u32.to_be_bytes());
        assert_eq!(&offer.payload[16..20], &[10, 0, 2, 15]);
        assert_eq!(
            find_option(&offer.payload[OPTIONS_OFFSET..], OPT_MESSAGE_TYPE),
            Some(&[OFFER][..])
        );

        let ack = dhcp.handle(&client_message(REQUEST, 0x2222)).expect("ack");
        assert!(ack.acked);
        assert_eq!(
            find_option(&ack.payload[OPTIONS_OFFSET..], OPT_MESSAGE_TYPE),
            Some(&[ACK][..])
        );
        let lease = dhcp.lease().expect("lease");
        assert_eq!(lease.assigned_ip, Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(lease.client_mac, EthernetAddress(GUEST_MAC));
    }

    #[test]
    fn test_advertises_router_dns_mtu() {
        let mut dhcp = server();
        let offer = dhcp.handle(&client_message(DISCOVER, 1)).unwrap();
        let opts = &offer.payload[OPTIONS_OFFSET..];
        assert_eq!(find_option(opts, OPT_ROUTER), Some(&[10, 0, 2, 2][..]));
        assert_eq!(find_option(opts, OPT_DNS), Some(&[10, 0, 2, 3][..]));
        assert_eq!(find_option(opts, OPT_MTU), Some(&1500u16.to_be_bytes()[..]));
        assert_eq!(find_option(opts, OPT_SUBNET_MASK), Some(&[255, 255, 255, 0][..]));
        assert_eq!(
            find_option(opts, OPT_LEASE_TIME),
            Some(&3600u32.to_be_bytes()[..])
        );
    }

    #[test]
    fn test_same_ip_across_reconnects() {
        let mut dhcp = server();
        let first = dhcp.handle(&client_message(REQUEST, 1)).unwrap();
        let second = dhcp.handle(&client_message(REQUEST, 2)).unwrap();
        assert_eq!(first.payload[16..20], second.payload[16..20]);
    }

    #[test]
    fn test_garbage_ignored() {
        let mut dhcp = server();
        assert!(dhcp.handle(&[0u8; 100]).is_none());
        // BOOTREPLY from a client makes no sense
        let mut msg = client_message(DISCOVER, 1);
        msg[0] = BOOTREPLY;
        assert!(dhcp.handle(&msg).is_none());
    }
}

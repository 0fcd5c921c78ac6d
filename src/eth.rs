//! Ethernet demux and ARP
//!
//! The stack owns one synthetic MAC and answers as the gateway for every
//! host-side address in the guest subnet (the gateway and DNS addresses are
//! both on-link from the guest's point of view). Frames not addressed to the
//! host MAC or broadcast are dropped.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};
use tracing::{debug, trace};

/// Synthetic MAC the host answers with (locally administered)
pub const HOST_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x6e, 0x65, 0x01]);
/// Ethernet broadcast
pub const BROADCAST_MAC: EthernetAddress = EthernetAddress([0xff; 6]);

const ARP_TTL: Duration = Duration::from_secs(600);
/// Ethernet(14) + ARP(28)
const ARP_FRAME_LEN: usize = 42;

/// What one ingress frame contained, after link-layer filtering.
pub enum Ingress<'a> {
    /// IPv4 payload to hand to the L3 layer
    Ipv4(&'a [u8]),
    /// ARP handled in place; reply frame to emit, if any
    Arp(Option<Vec<u8>>),
    /// Not addressed to us, or an EtherType we do not speak
    Dropped(&'static str),
}

/// One resolved neighbor.
struct ArpEntry {
    mac: EthernetAddress,
    /// `None` means the entry never expires (host-synthesized)
    expires: Option<Instant>,
}

/// Link layer state: MAC filtering, ARP cache, ARP responder.
pub struct EthLayer {
    guest_ip: Ipv4Addr,
    subnet_prefix: [u8; 3],
    cache: HashMap<Ipv4Addr, ArpEntry>,
    /// Guest MAC once learned (from ARP or any frame source address)
    guest_mac: Option<EthernetAddress>,
}

impl EthLayer {
    pub fn new(guest_ip: Ipv4Addr, gateway_ip: Ipv4Addr, dns_ip: Ipv4Addr) -> Self {
        let mut cache = HashMap::new();
        // Host-side addresses resolve to the host MAC forever.
        for ip in [gateway_ip, dns_ip] {
            cache.insert(
                ip,
                ArpEntry {
                    mac: HOST_MAC,
                    expires: None,
                },
            );
        }
        let o = gateway_ip.octets();
        Self {
            guest_ip,
            subnet_prefix: [o[0], o[1], o[2]],
            cache,
            guest_mac: None,
        }
    }

    /// MAC of the guest NIC, if seen yet.
    pub fn guest_mac(&self) -> Option<EthernetAddress> {
        self.guest_mac
    }

    /// Classify one ingress frame and service ARP inline.
    pub fn ingress<'a>(&mut self, frame: &'a [u8]) -> Ingress<'a> {
        let eth = match EthernetFrame::new_checked(frame) {
            Ok(f) => f,
            Err(_) => return Ingress::Dropped("truncated"),
        };
        let dst = eth.dst_addr();
        if dst != HOST_MAC && dst != BROADCAST_MAC {
            return Ingress::Dropped("not for us");
        }
        // Any frame from the guest teaches us its MAC.
        if self.guest_mac.is_none() && !eth.src_addr().is_broadcast() {
            debug!("eth: learned guest MAC {}", eth.src_addr());
            self.guest_mac = Some(eth.src_addr());
        }

        match eth.ethertype() {
            EthernetProtocol::Arp => Ingress::Arp(self.handle_arp(frame)),
            EthernetProtocol::Ipv4 => Ingress::Ipv4(&frame[14..]),
            _ => Ingress::Dropped("ethertype"),
        }
    }

    /// Wrap an IPv4 datagram for delivery to the guest. `None` until the
    /// guest MAC is known.
    pub fn frame_to_guest(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        let guest_mac = self.guest_mac?;
        let mut frame = vec![0u8; 14 + datagram.len()];
        frame[0..6].copy_from_slice(guest_mac.as_bytes());
        frame[6..12].copy_from_slice(HOST_MAC.as_bytes());
        frame[12] = 0x08;
        frame[13] = 0x00;
        frame[14..].copy_from_slice(datagram);
        Some(frame)
    }

    /// ARP request for the guest IP, sent once after the DHCP lease if the
    /// guest MAC has not been learned from traffic.
    pub fn arp_request_for_guest(&self, gateway_ip: Ipv4Addr) -> Vec<u8> {
        let mut frame = vec![0u8; ARP_FRAME_LEN];
        frame[0..6].copy_from_slice(BROADCAST_MAC.as_bytes());
        frame[6..12].copy_from_slice(HOST_MAC.as_bytes());
        frame[12] = 0x08;
        frame[13] = 0x06;
        let arp = &mut frame[14..];
        arp[0..2].copy_from_slice(&1u16.to_be_bytes()); // hw type = Ethernet
        arp[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // proto = IPv4
        arp[4] = 6;
        arp[5] = 4;
        arp[6..8].copy_from_slice(&1u16.to_be_bytes()); // opcode = request
        arp[8..14].copy_from_slice(HOST_MAC.as_bytes());
        arp[14..18].copy_from_slice(&gateway_ip.octets());
        // target hw addr left zeroed
        arp[24..28].copy_from_slice(&self.guest_ip.octets());
        frame
    }

    /// Answer "who has X" for any host-side address in the subnet.
    fn handle_arp(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < ARP_FRAME_LEN {
            return None;
        }
        let arp = &frame[14..];
        let hw_type = u16::from_be_bytes([arp[0], arp[1]]);
        let proto_type = u16::from_be_bytes([arp[2], arp[3]]);
        let opcode = u16::from_be_bytes([arp[6], arp[7]]);
        if hw_type != 1 || proto_type != 0x0800 {
            return None;
        }

        let sender_mac = EthernetAddress::from_bytes(&arp[8..14]);
        let sender_ip = Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]);
        let target_ip = Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]);

        // Learn the sender either way (request or reply).
        if sender_ip == self.guest_ip {
            self.cache.insert(
                sender_ip,
                ArpEntry {
                    mac: sender_mac,
                    expires: Some(Instant::now() + ARP_TTL),
                },
            );
            self.guest_mac = Some(sender_mac);
        }

        if opcode != 1 {
            return None; // reply: cache update only
        }
        // Never answer for the guest's own address, and only for our subnet.
        if target_ip == self.guest_ip || target_ip.octets()[..3] != self.subnet_prefix {
            trace!("arp: ignoring who-has {target_ip}");
            return None;
        }

        debug!("arp: {target_ip} is at {HOST_MAC} (asked by {sender_ip})");
        let mut reply = vec![0u8; ARP_FRAME_LEN];
        reply[0..6].copy_from_slice(sender_mac.as_bytes());
        reply[6..12].copy_from_slice(HOST_MAC.as_bytes());
        reply[12] = 0x08;
        reply[13] = 0x06;
        let out = &mut reply[14..];
        out[0..2].copy_from_slice(&1u16.to_be_bytes());
        out[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        out[4] = 6;
        out[5] = 4;
        out[6..8].copy_from_slice(&2u16.to_be_bytes()); // opcode = reply
        out[8..14].copy_from_slice(HOST_MAC.as_bytes());
        out[14..18].copy_from_slice(&target_ip.octets());
        out[18..24].copy_from_slice(sender_mac.as_bytes());
        out[24..28].copy_from_slice(&sender_ip.octets());
        Some(reply)
    }

    /// Drop expired dynamic entries. Host-synthesized entries never expire.
    pub fn sweep(&mut self, now: Instant) {
        self.cache
            .retain(|_, e| e.expires.map(|t| t > now).unwrap_or(true));
    }
}

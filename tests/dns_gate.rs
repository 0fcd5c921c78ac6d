//! DNS gate behavior through the stack: host-side resolution, TTL clamping,
//! and the rebind defense — the address handed to the guest is the address
//! the host later connects to.

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use common::*;
use gatebox::NetConfig;

/// Minimal DNS A query for `name`.
fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut q = Vec::new();
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    q.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    q.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        q.push(label.len() as u8);
        q.extend_from_slice(label.as_bytes());
    }
    q.push(0);
    q.extend_from_slice(&1u16.to_be_bytes()); // A
    q.extend_from_slice(&1u16.to_be_bytes()); // IN
    q
}

/// (rcode, answers as (ttl, ip)) from a DNS response.
fn parse_answers(msg: &[u8]) -> (u8, Vec<(u32, Ipv4Addr)>) {
    let rcode = msg[3] & 0x0f;
    let ancount = u16::from_be_bytes([msg[6], msg[7]]) as usize;
    // skip the question
    let mut i = 12;
    while msg[i] != 0 {
        i += msg[i] as usize + 1;
    }
    i += 5;
    let mut answers = Vec::new();
    for _ in 0..ancount {
        // name: compression pointer or labels
        if msg[i] & 0xc0 == 0xc0 {
            i += 2;
        } else {
            while msg[i] != 0 {
                i += msg[i] as usize + 1;
            }
            i += 1;
        }
        let rtype = u16::from_be_bytes([msg[i], msg[i + 1]]);
        let ttl = u32::from_be_bytes([msg[i + 4], msg[i + 5], msg[i + 6], msg[i + 7]]);
        let rdlen = u16::from_be_bytes([msg[i + 8], msg[i + 9]]) as usize;
        let rdata = &msg[i + 10..i + 10 + rdlen];
        if rtype == 1 && rdlen == 4 {
            answers.push((ttl, Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
        }
        i += 10 + rdlen;
    }
    (rcode, answers)
}

async fn query_stack(guest: &mut Guest, id: u16, name: &str) -> Vec<u8> {
    let udp = udp_datagram(33000, 53, &dns_query(id, name));
    guest.send(&guest_ip_frame(DNS_IP, 17, &udp)).await;
    loop {
        let frame = guest
            .recv(Duration::from_secs(5))
            .await
            .expect("dns answer");
        if let Some((src_port, dst_port, payload)) = parse_udp(&frame) {
            assert_eq!(src_port, 53);
            assert_eq!(dst_port, 33000);
            return payload;
        }
    }
}

#[tokio::test]
async fn test_answer_resolved_on_host_with_clamped_ttl() {
    let mut h = start(
        NetConfig::new(),
        &[("example.com", &[Ipv4Addr::new(93, 184, 216, 34)])],
        MockUpstream::new(|_| MockResponse::ok("unused")),
    );

    let answer = query_stack(&mut h.guest, 0x77, "example.com").await;
    assert_eq!(&answer[0..2], &0x77u16.to_be_bytes(), "id echoed");
    let (rcode, answers) = parse_answers(&answer);
    assert_eq!(rcode, 0);
    assert_eq!(answers.len(), 1);
    let (ttl, ip) = answers[0];
    assert_eq!(ip, Ipv4Addr::new(93, 184, 216, 34));
    assert!(ttl <= 60, "TTL must be clamped, got {ttl}");
}

#[tokio::test]
async fn test_unknown_name_gets_nxdomain() {
    let mut h = start(
        NetConfig::new(),
        &[],
        MockUpstream::new(|_| MockResponse::ok("unused")),
    );
    let answer = query_stack(&mut h.guest, 1, "nope.invalid").await;
    let (rcode, answers) = parse_answers(&answer);
    assert_eq!(rcode, 3, "NXDOMAIN");
    assert!(answers.is_empty());
}

#[tokio::test]
async fn test_rebind_defense_answer_matches_connect_address() {
    // the resolver returns several addresses; whichever single address the
    // guest is told must be the one the host uses to connect upstream
    let pool: &[Ipv4Addr] = &[
        Ipv4Addr::new(93, 184, 216, 34),
        Ipv4Addr::new(5, 6, 7, 8),
        Ipv4Addr::new(200, 1, 1, 1),
    ];
    let mut h = start(
        NetConfig::new().allow_host("example.com"),
        &[("example.com", pool)],
        MockUpstream::new(|_| MockResponse::ok("pinned")),
    );

    let answer = query_stack(&mut h.guest, 2, "example.com").await;
    let (_, answers) = parse_answers(&answer);
    assert_eq!(answers.len(), 1, "exactly one address goes to the guest");
    let advertised = answers[0].1;

    // guest connects to the advertised address and sends a request
    let mut conn = tcp_connect(&mut h.guest, 41000, advertised, 80).await;
    tcp_send(
        &mut h.guest,
        &mut conn,
        b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
    )
    .await;
    let body = tcp_collect(&mut h.guest, &mut conn, Duration::from_secs(5), |b| {
        b.windows(6).any(|w| w == b"pinned")
    })
    .await;
    assert!(!body.is_empty());

    let recorded = h.upstream.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(
        recorded[0].resolved_ip, advertised,
        "host connected to a different address than the guest was told"
    );
}

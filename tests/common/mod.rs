//! Shared test harness: a synthetic guest speaking raw Ethernet frames over
//! the stack's socket, plus fixed resolver and scripted upstream doubles.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use gatebox::dns::NameResolver;
use gatebox::http::client::{UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse};
use gatebox::http::{HeaderMap, ResponseHead};
use gatebox::{NetConfig, NetStack, Result as GbResult};

pub const GUEST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
pub const DNS_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 3);
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

pub fn eth_frame(dst_mac: [u8; 6], src_mac: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    let cksum = gatebox::ipv4::checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&cksum.to_be_bytes());
    packet[20..].copy_from_slice(payload);
    packet
}

/// Full Ethernet frame carrying one IPv4 packet from the guest.
pub fn guest_ip_frame(dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let packet = ipv4_packet(GUEST_IP, dst, protocol, payload);
    eth_frame(gateway_mac(), GUEST_MAC, 0x0800, &packet)
}

/// The stack's MAC: learned from its ARP replies, but any unicast works for
/// ingress as long as it names the stack; tests use the real constant.
pub fn gateway_mac() -> [u8; 6] {
    [0x52, 0x54, 0x00, 0x6e, 0x65, 0x01]
}

pub fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut udp = vec![0u8; len];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    udp[8..].copy_from_slice(payload);
    udp
}

#[allow(clippy::too_many_arguments)]
pub fn tcp_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = 20 + payload.len();
    let mut tcp = vec![0u8; len];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4; // data offset
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&window.to_be_bytes());
    tcp[20..].copy_from_slice(payload);

    // checksum over pseudo-header + segment
    let mut pseudo = Vec::with_capacity(12 + len);
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(6);
    pseudo.extend_from_slice(&(len as u16).to_be_bytes());
    pseudo.extend_from_slice(&tcp);
    let cksum = gatebox::ipv4::checksum(&pseudo);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());
    tcp
}

pub fn arp_request(target: Ipv4Addr) -> Vec<u8> {
    let mut arp = vec![0u8; 28];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes());
    arp[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&1u16.to_be_bytes());
    arp[8..14].copy_from_slice(&GUEST_MAC);
    arp[14..18].copy_from_slice(&GUEST_IP.octets());
    arp[24..28].copy_from_slice(&target.octets());
    eth_frame(BROADCAST_MAC, GUEST_MAC, 0x0806, &arp)
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ParsedTcp {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: Vec<u8>,
}

pub fn ethertype_of(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[12], frame[13]])
}

/// (src, dst, protocol, payload) of an IPv4 frame.
pub fn parse_ip(frame: &[u8]) -> (Ipv4Addr, Ipv4Addr, u8, Vec<u8>) {
    assert_eq!(ethertype_of(frame), 0x0800, "not IPv4: {frame:02x?}");
    let ip = &frame[14..];
    let ihl = (ip[0] & 0x0f) as usize * 4;
    let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    (
        Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
        Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
        ip[9],
        ip[ihl..total].to_vec(),
    )
}

pub fn parse_tcp(frame: &[u8]) -> Option<ParsedTcp> {
    if ethertype_of(frame) != 0x0800 {
        return None;
    }
    let (src_ip, dst_ip, protocol, payload) = parse_ip(frame);
    if protocol != 6 {
        return None;
    }
    let tcp = payload;
    let offset = (tcp[12] >> 4) as usize * 4;
    Some(ParsedTcp {
        src_ip,
        dst_ip,
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        flags: tcp[13],
        window: u16::from_be_bytes([tcp[14], tcp[15]]),
        payload: tcp[offset..].to_vec(),
    })
}

/// (src_port, dst_port, payload) when the frame is UDP.
pub fn parse_udp(frame: &[u8]) -> Option<(u16, u16, Vec<u8>)> {
    if ethertype_of(frame) != 0x0800 {
        return None;
    }
    let (_, _, protocol, payload) = parse_ip(frame);
    if protocol != 17 {
        return None;
    }
    let len = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    Some((
        u16::from_be_bytes([payload[0], payload[1]]),
        u16::from_be_bytes([payload[2], payload[3]]),
        payload[8..len].to_vec(),
    ))
}

// ---------------------------------------------------------------------------
// The synthetic guest
// ---------------------------------------------------------------------------

pub struct Guest {
    rx: ReadHalf<DuplexStream>,
    tx: WriteHalf<DuplexStream>,
}

impl Guest {
    pub fn new(socket: DuplexStream) -> Self {
        let (rx, tx) = tokio::io::split(socket);
        Self { rx, tx }
    }

    pub async fn send(&mut self, frame: &[u8]) {
        self.tx
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .expect("send frame header");
        self.tx.write_all(frame).await.expect("send frame");
    }

    /// Next frame from the stack, or `None` after `wait`.
    pub async fn recv(&mut self, wait: Duration) -> Option<Vec<u8>> {
        let read = async {
            let mut header = [0u8; 4];
            self.rx.read_exact(&mut header).await.ok()?;
            let len = u32::from_be_bytes(header) as usize;
            let mut frame = vec![0u8; len];
            self.rx.read_exact(&mut frame).await.ok()?;
            Some(frame)
        };
        tokio::time::timeout(wait, read).await.ok().flatten()
    }

    /// Next TCP segment addressed to `local_port`, skipping everything else.
    pub async fn recv_tcp(&mut self, local_port: u16, wait: Duration) -> Option<ParsedTcp> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            let frame = self.recv(remaining).await?;
            if let Some(seg) = parse_tcp(&frame) {
                if seg.dst_port == local_port {
                    return Some(seg);
                }
            }
        }
    }
}

/// Client-side view of one guest TCP connection.
pub struct GuestConn {
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    /// next sequence number we will send
    pub seq: u32,
    /// next sequence number we expect from the stack
    pub ack: u32,
    /// in-order payload bytes received while waiting for something else
    pub pending: Vec<u8>,
}

impl GuestConn {
    pub fn segment(&self, flags: u8, payload: &[u8]) -> Vec<u8> {
        let tcp = tcp_segment(
            GUEST_IP,
            self.remote_ip,
            self.local_port,
            self.remote_port,
            self.seq,
            self.ack,
            flags,
            65535,
            payload,
        );
        guest_ip_frame(self.remote_ip, 6, &tcp)
    }
}

/// Three-way handshake; panics if the stack does not answer SYN-ACK.
pub async fn tcp_connect(
    guest: &mut Guest,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
) -> GuestConn {
    let mut conn = GuestConn {
        local_port,
        remote_ip,
        remote_port,
        seq: 0x0100_0000,
        ack: 0,
        pending: Vec::new(),
    };
    let tcp = tcp_segment(
        GUEST_IP, remote_ip, local_port, remote_port, conn.seq, 0, SYN, 65535, &[],
    );
    guest.send(&guest_ip_frame(remote_ip, 6, &tcp)).await;

    let syn_ack = guest
        .recv_tcp(local_port, Duration::from_secs(5))
        .await
        .expect("SYN-ACK");
    assert_eq!(syn_ack.flags & (SYN | ACK), SYN | ACK, "expected SYN-ACK");
    conn.seq = conn.seq.wrapping_add(1);
    conn.ack = syn_ack.seq.wrapping_add(1);
    guest.send(&conn.segment(ACK, &[])).await;
    conn
}

/// Send data and wait for it to be acknowledged.
pub async fn tcp_send(guest: &mut Guest, conn: &mut GuestConn, data: &[u8]) {
    guest.send(&conn.segment(PSH | ACK, data)).await;
    let sent_end = conn.seq.wrapping_add(data.len() as u32);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::ZERO);
        let seg = guest
            .recv_tcp(conn.local_port, remaining)
            .await
            .expect("ACK for sent data");
        ack_data(guest, conn, &seg).await;
        if seg.flags & ACK != 0 && seg.ack == sent_end {
            conn.seq = sent_end;
            return;
        }
    }
}

/// Account for (and acknowledge) any payload in `seg`; in-order bytes are
/// stashed on the connection so no interleaved response data is lost.
async fn ack_data(guest: &mut Guest, conn: &mut GuestConn, seg: &ParsedTcp) {
    if seg.payload.is_empty() && seg.flags & FIN == 0 {
        return;
    }
    if seg.seq == conn.ack {
        conn.pending.extend_from_slice(&seg.payload);
        conn.ack = conn
            .ack
            .wrapping_add(seg.payload.len() as u32)
            .wrapping_add((seg.flags & FIN != 0) as u32);
    }
    guest.send(&conn.segment(ACK, &[])).await;
}

/// Collect response bytes until `done(collected)` or timeout; every data
/// segment is acknowledged. Returns the in-order byte stream received.
pub async fn tcp_collect<F: Fn(&[u8]) -> bool>(
    guest: &mut Guest,
    conn: &mut GuestConn,
    wait: Duration,
    done: F,
) -> Vec<u8> {
    let mut collected = std::mem::take(&mut conn.pending);
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if done(&collected) {
            return collected;
        }
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::ZERO);
        let Some(seg) = guest.recv_tcp(conn.local_port, remaining).await else {
            return collected;
        };
        ack_data(guest, conn, &seg).await;
        collected.append(&mut conn.pending);
        if seg.flags & (FIN | RST) != 0 {
            return collected;
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator doubles
// ---------------------------------------------------------------------------

pub struct FixedResolver {
    map: HashMap<String, Vec<Ipv4Addr>>,
}

impl FixedResolver {
    pub fn new(entries: &[(&str, &[Ipv4Addr])]) -> Self {
        Self {
            map: entries
                .iter()
                .map(|(host, ips)| (host.to_string(), ips.to_vec()))
                .collect(),
        }
    }
}

#[async_trait]
impl NameResolver for FixedResolver {
    async fn resolve_v4(&self, host: &str) -> GbResult<Vec<Ipv4Addr>> {
        self.map
            .get(host)
            .cloned()
            .ok_or_else(|| gatebox::Error::UpstreamHttp(format!("NXDOMAIN {host}")))
    }
}

/// Scripted upstream: records every request, answers from a closure.
pub struct MockUpstream {
    pub requests: Mutex<Vec<UpstreamRequest>>,
    responder: Box<dyn Fn(&UpstreamRequest) -> MockResponse + Send + Sync>,
}

pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<Vec<u8>>,
}

impl MockResponse {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            headers: vec![(
                "Content-Length".to_string(),
                body.len().to_string(),
            )],
            chunks: vec![body.as_bytes().to_vec()],
        }
    }
}

impl MockUpstream {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&UpstreamRequest) -> MockResponse + Send + Sync + 'static,
    {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    pub fn recorded(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct ChunkBody(std::collections::VecDeque<Vec<u8>>);

#[async_trait]
impl UpstreamBody for ChunkBody {
    async fn next_chunk(&mut self) -> GbResult<Option<Vec<u8>>> {
        Ok(self.0.pop_front())
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn send(&self, req: &UpstreamRequest) -> GbResult<UpstreamResponse> {
        let scripted = (self.responder)(req);
        self.requests.lock().unwrap().push(req.clone());
        let mut headers = HeaderMap::new();
        for (name, value) in &scripted.headers {
            headers.push(name.clone(), value.as_bytes());
        }
        Ok(UpstreamResponse {
            head: ResponseHead {
                status: scripted.status,
                reason: "OK".to_string(),
                headers,
            },
            body: Box::new(ChunkBody(scripted.chunks.into())),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub guest: Guest,
    pub upstream: Arc<MockUpstream>,
    pub stack: Arc<NetStack>,
    pub mitm_dir: tempfile::TempDir,
}

/// Boot a stack over an in-memory link with scripted collaborators.
pub fn start(
    mut config: NetConfig,
    resolver_entries: &[(&str, &[Ipv4Addr])],
    upstream: Arc<MockUpstream>,
) -> Harness {
    let mitm_dir = tempfile::tempdir().expect("tempdir");
    config = config.mitm_dir(mitm_dir.path());
    let resolver = Arc::new(FixedResolver::new(resolver_entries));
    let stack = Arc::new(
        NetStack::with_collaborators(config, resolver, upstream.clone()).expect("stack"),
    );

    let (host_side, guest_side) = tokio::io::duplex(1 << 20);
    let runner = stack.clone();
    tokio::spawn(async move { runner.run(host_side).await });

    Harness {
        guest: Guest::new(guest_side),
        upstream,
        stack,
        mitm_dir,
    }
}

// ---------------------------------------------------------------------------
// Byte-stream bridge over a guest TCP connection
// ---------------------------------------------------------------------------

/// Expose one guest TCP connection as an ordinary byte stream: a pump task
/// segments writes onto the wire and reassembles (and acknowledges) reads.
/// Lets a real TLS client run end-to-end through the synthetic guest.
pub fn bridge(mut guest: Guest, mut conn: GuestConn) -> DuplexStream {
    let (app_side, pump_side) = tokio::io::duplex(256 * 1024);
    tokio::spawn(async move {
        let (mut app_rx, mut app_tx) = tokio::io::split(pump_side);
        // keep each segment under the 1500-byte MTU
        let mut buf = [0u8; 1400];
        let mut app_open = true;
        let mut server_fin = false;
        loop {
            if !app_open && server_fin {
                return;
            }
            if app_open {
                match tokio::time::timeout(Duration::from_millis(10), app_rx.read(&mut buf)).await
                {
                    Ok(Ok(0)) | Ok(Err(_)) => {
                        // app side finished writing: half-close toward the stack
                        guest.send(&conn.segment(FIN | ACK, &[])).await;
                        conn.seq = conn.seq.wrapping_add(1);
                        app_open = false;
                    }
                    Ok(Ok(n)) => tcp_send(&mut guest, &mut conn, &buf[..n]).await,
                    Err(_) => {}
                }
            }
            while let Some(seg) = guest
                .recv_tcp(conn.local_port, Duration::from_millis(10))
                .await
            {
                if seg.flags & RST != 0 {
                    return;
                }
                let fin = seg.flags & FIN != 0;
                ack_data(&mut guest, &mut conn, &seg).await;
                if !conn.pending.is_empty() {
                    let data = std::mem::take(&mut conn.pending);
                    if app_tx.write_all(&data).await.is_err() {
                        return;
                    }
                }
                if fin {
                    let _ = app_tx.shutdown().await;
                    server_fin = true;
                }
            }
        }
    });
    app_side
}

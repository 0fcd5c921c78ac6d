//! The network stack event loop
//!
//! Wires every layer together over one frame socket: Ethernet/ARP demux,
//! DHCP, ICMP echo, the UDP/DNS gate, and the TCP engine feeding per-flow
//! mediation tasks. One cooperative loop owns all link-side state; flows
//! make progress concurrently as spawned tasks that talk back through the
//! engine's shared buffers and an egress channel.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use smoltcp::wire::IpProtocol;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::config::NetConfig;
use crate::dhcp::DhcpServer;
use crate::dns::{HostResolver, NameResolver, SystemResolver};
use crate::eth::{EthLayer, Ingress};
use crate::flow::{self, FlowContext};
use crate::http::client::{ReqwestClient, UpstreamClient};
use crate::link;
use crate::policy::PolicyEngine;
use crate::tcp::{FlowKey, TcpEngine};
use crate::tls::MitmStore;
use crate::{dns, icmp, ipv4, udp};
use crate::{Error, Result};

const TICK: Duration = Duration::from_millis(10);
/// Async producers (DNS tasks) queue at most this many egress datagrams.
const EGRESS_QUEUE: usize = 256;

/// Counters kept across the stack's lifetime.
#[derive(Debug, Default)]
pub struct StackStats {
    frames_dropped: AtomicU64,
    l3_errors: AtomicU64,
    flows_rejected: AtomicU64,
    flows_http: AtomicU64,
    flows_tls: AtomicU64,
    requests_mediated: AtomicU64,
    requests_blocked: AtomicU64,
}

impl StackStats {
    pub(crate) fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn l3_error(&self) {
        self.l3_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn reject_flow(&self) {
        self.flows_rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn http_flow(&self) {
        self.flows_http.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn tls_flow(&self) {
        self.flows_tls.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn mediated(&self) {
        self.requests_mediated.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn block(&self, reason: crate::error::BlockReason) {
        trace!("stats: request blocked ({reason})");
        self.requests_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            l3_errors: self.l3_errors.load(Ordering::Relaxed),
            flows_rejected: self.flows_rejected.load(Ordering::Relaxed),
            flows_http: self.flows_http.load(Ordering::Relaxed),
            flows_tls: self.flows_tls.load(Ordering::Relaxed),
            requests_mediated: self.requests_mediated.load(Ordering::Relaxed),
            requests_blocked: self.requests_blocked.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`StackStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub frames_dropped: u64,
    pub l3_errors: u64,
    pub flows_rejected: u64,
    pub flows_http: u64,
    pub flows_tls: u64,
    pub requests_mediated: u64,
    pub requests_blocked: u64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// The mediated network stack for one guest link.
pub struct NetStack {
    config: NetConfig,
    policy: Arc<PolicyEngine>,
    resolver: Arc<HostResolver>,
    upstream: Arc<dyn UpstreamClient>,
    mitm: Arc<MitmStore>,
    stats: Arc<StackStats>,
}

impl NetStack {
    /// Build a stack with the production resolver and HTTP client.
    pub fn new(config: NetConfig) -> Result<Self> {
        let resolver: Arc<dyn NameResolver> = Arc::new(SystemResolver::from_system_conf()?);
        Self::with_collaborators(
            config.clone(),
            resolver,
            Arc::new(ReqwestClient::new(config.trust_roots.clone())),
        )
    }

    /// Build a stack with explicit collaborators (tests, embedders).
    pub fn with_collaborators(
        config: NetConfig,
        resolver: Arc<dyn NameResolver>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Result<Self> {
        let mitm = Arc::new(MitmStore::open(&config.mitm_dir, config.leaf_cache_size)?);
        Ok(Self {
            policy: Arc::new(PolicyEngine::new(&config)),
            resolver: Arc::new(HostResolver::new(resolver, config.dns_ttl_cap)),
            upstream,
            mitm,
            stats: Arc::new(StackStats::default()),
            config,
        })
    }

    /// The CA certificate the guest image should pre-trust.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.mitm.ca_cert_path()
    }

    pub fn ca_cert_pem(&self) -> String {
        self.mitm.ca_cert_pem().to_string()
    }

    /// CA certificate in DER form, for in-process trust stores.
    pub fn ca_cert_der(&self) -> rustls::pki_types::CertificateDer<'static> {
        self.mitm.ca_cert_der()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the stack over a connected frame socket until the link closes.
    ///
    /// Resolves `Ok` when the VM side closes the socket (all flows are reset
    /// locally first) and `Err` on unrecoverable framing violations.
    pub async fn run<S>(&self, socket: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (mut reader, mut writer) = link::split(socket);
        let (egress_tx, mut egress_rx) = mpsc::channel::<Vec<u8>>(EGRESS_QUEUE);

        let mut pipeline = Pipeline {
            guest_ip: self.config.guest_ip,
            gateway_ip: self.config.gateway_ip,
            dns_ttl_cap: self.config.dns_ttl_cap,
            eth: EthLayer::new(
                self.config.guest_ip,
                self.config.gateway_ip,
                self.config.dns_ip,
            ),
            dhcp: DhcpServer::new(
                self.config.guest_ip,
                self.config.gateway_ip,
                self.config.dns_ip,
                self.config.netmask,
                self.config.mtu as u16,
                self.config.lease_secs,
            ),
            engine: TcpEngine::new(self.config.max_flows, self.config.recv_window),
            arp_probe_sent: false,
            policy: self.policy.clone(),
            resolver: self.resolver.clone(),
            upstream: self.upstream.clone(),
            mitm: self.mitm.clone(),
            on_request: self.config.on_request.clone(),
            on_response: self.config.on_response.clone(),
            stats: self.stats.clone(),
            egress_tx,
        };
        let engine_wake = pipeline.engine.wake_handle();

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // frames ready to emit as-is (ARP), and IP datagrams to wrap
        let mut raw_out: Vec<Vec<u8>> = Vec::new();
        let mut out: Vec<Vec<u8>> = Vec::new();

        info!(
            "stack: up (guest {}, gateway {}, dns {})",
            self.config.guest_ip, self.config.gateway_ip, self.config.dns_ip
        );

        let run_error = 'link: loop {
            tokio::select! {
                frame = reader.read_frame() => match frame {
                    Ok(frame) => pipeline.handle_frame(&frame, &mut raw_out, &mut out),
                    Err(Error::LinkClosed) => break 'link None,
                    Err(e) => break 'link Some(e),
                },
                Some(datagram) = egress_rx.recv() => out.push(datagram),
                _ = tick.tick() => {
                    let now = Instant::now();
                    pipeline.engine.on_tick(now, &mut out);
                    pipeline.eth.sweep(now);
                }
                _ = engine_wake.notified() => {}
            }

            pipeline.engine.pump(Instant::now(), &mut out);

            if let Err(e) = flush(&mut writer, &pipeline, &mut raw_out, &mut out).await {
                break 'link if e.is_fatal() { None } else { Some(e) };
            }
        };

        pipeline.engine.reset_all();
        info!("stack: link closed, stats {}", self.stats.snapshot().to_json());
        match run_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Write pending egress: ARP frames verbatim, IP datagrams wrapped for the
/// guest. Awaiting the socket here is the stack's link-level backpressure.
async fn flush<S: AsyncWrite>(
    writer: &mut link::FrameWriter<S>,
    pipeline: &Pipeline,
    raw_out: &mut Vec<Vec<u8>>,
    out: &mut Vec<Vec<u8>>,
) -> Result<()> {
    for frame in raw_out.drain(..) {
        writer.write_frame(&frame).await?;
    }
    for datagram in out.drain(..) {
        match pipeline.eth.frame_to_guest(&datagram) {
            Some(frame) => writer.write_frame(&frame).await?,
            None => {
                // guest MAC not learned yet
                pipeline.stats.frame_dropped();
            }
        }
    }
    Ok(())
}

/// Link-side state owned by the event loop.
struct Pipeline {
    guest_ip: Ipv4Addr,
    gateway_ip: Ipv4Addr,
    dns_ttl_cap: u32,
    eth: EthLayer,
    dhcp: DhcpServer,
    engine: TcpEngine,
    arp_probe_sent: bool,
    policy: Arc<PolicyEngine>,
    resolver: Arc<HostResolver>,
    upstream: Arc<dyn UpstreamClient>,
    mitm: Arc<MitmStore>,
    on_request: Option<Arc<dyn crate::config::RequestHook>>,
    on_response: Option<Arc<dyn crate::config::ResponseHook>>,
    stats: Arc<StackStats>,
    egress_tx: mpsc::Sender<Vec<u8>>,
}

impl Pipeline {
    fn handle_frame(&mut self, frame: &[u8], raw_out: &mut Vec<Vec<u8>>, out: &mut Vec<Vec<u8>>) {
        match self.eth.ingress(frame) {
            Ingress::Dropped(reason) => {
                trace!("eth: dropped frame ({reason})");
                self.stats.frame_dropped();
            }
            Ingress::Arp(reply) => {
                if let Some(reply) = reply {
                    raw_out.push(reply);
                }
            }
            Ingress::Ipv4(payload) => self.handle_ipv4(payload, raw_out, out),
        }
    }

    fn handle_ipv4(&mut self, payload: &[u8], raw_out: &mut Vec<Vec<u8>>, out: &mut Vec<Vec<u8>>) {
        let datagram = match ipv4::parse(payload) {
            Ok(d) => d,
            Err(ipv4::IngressRefusal::Fragmented) => {
                debug!("ipv4: refusing fragment");
                self.stats.l3_error();
                out.push(icmp::frag_needed(self.gateway_ip, payload));
                return;
            }
            Err(ipv4::IngressRefusal::Invalid(what)) => {
                trace!("ipv4: invalid header ({what})");
                self.stats.l3_error();
                return;
            }
        };

        match datagram.protocol {
            IpProtocol::Icmp => {
                if let Some(reply) = icmp::echo_reply(datagram.src, datagram.dst, datagram.payload)
                {
                    out.push(reply);
                }
            }
            IpProtocol::Udp => self.handle_udp(&datagram, raw_out, out),
            IpProtocol::Tcp => self.handle_tcp(&datagram, out),
            other => {
                trace!("ipv4: dropping protocol {other}");
                self.stats.l3_error();
            }
        }
    }

    fn handle_udp(
        &mut self,
        datagram: &ipv4::IngressDatagram<'_>,
        raw_out: &mut Vec<Vec<u8>>,
        out: &mut Vec<Vec<u8>>,
    ) {
        let Some(view) = udp::parse(datagram.payload) else {
            self.stats.l3_error();
            return;
        };

        match view.dst_port {
            67 => {
                if let Some(reply) = self.dhcp.handle(view.payload) {
                    out.push(udp::build(
                        self.gateway_ip,
                        Ipv4Addr::BROADCAST,
                        67,
                        68,
                        &reply.payload,
                    ));
                    if reply.acked && !self.arp_probe_sent && self.eth.guest_mac().is_none() {
                        // learn the guest MAC actively if traffic has not
                        // taught it to us yet
                        raw_out.push(self.eth.arp_request_for_guest(self.gateway_ip));
                        self.arp_probe_sent = true;
                    }
                }
            }
            udp::DNS_PORT => {
                let resolver = self.resolver.clone();
                let egress = self.egress_tx.clone();
                let ttl_cap = self.dns_ttl_cap;
                let (answer_src, answer_dst, guest_port) =
                    (datagram.dst, datagram.src, view.src_port);
                let query = view.payload.to_vec();
                tokio::spawn(async move {
                    if let Some(answer) = dns::answer_query(&query, &resolver, ttl_cap).await {
                        let reply =
                            udp::build(answer_src, answer_dst, udp::DNS_PORT, guest_port, &answer);
                        egress.send(reply).await.ok();
                    }
                });
            }
            other => {
                trace!("udp: dropping datagram to port {other}");
            }
        }
    }

    fn handle_tcp(&mut self, datagram: &ipv4::IngressDatagram<'_>, out: &mut Vec<Vec<u8>>) {
        if datagram.src != self.guest_ip {
            trace!("tcp: segment from non-guest source {}", datagram.src);
            self.stats.frame_dropped();
            return;
        }
        let new_flow = self.engine.handle_segment(
            datagram.src,
            datagram.dst,
            datagram.payload,
            Instant::now(),
            out,
        );
        if let Some(flow) = new_flow {
            self.spawn_flow(flow.key, flow.stream);
        }
    }

    fn spawn_flow(&self, key: FlowKey, stream: crate::tcp::FlowStream) {
        debug!(
            "stack: flow established {}:{} -> {}:{}",
            key.guest_ip, key.guest_port, key.remote_ip, key.remote_port
        );
        let ctx = Arc::new(FlowContext {
            policy: self.policy.clone(),
            resolver: self.resolver.clone(),
            upstream: self.upstream.clone(),
            mitm: self.mitm.clone(),
            on_request: self.on_request.clone(),
            on_response: self.on_response.clone(),
            remote_ip: key.remote_ip,
            remote_port: key.remote_port,
            stats: self.stats.clone(),
        });
        tokio::spawn(flow::drive(stream, ctx));
    }
}

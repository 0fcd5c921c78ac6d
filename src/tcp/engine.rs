//! Flow demux and accept policy
//!
//! Owns every [`Connection`], keyed by 4-tuple. SYNs from the guest create
//! flows (up to the configured cap); segments for unknown flows are answered
//! with RST; checksum failures reset the offending flow only. The engine
//! never opens connections itself.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use smoltcp::wire::TcpControl;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::conn::Connection;
use super::stream::FlowStream;
use super::wire::{self, ParseError};

/// The 4-tuple identifying one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub guest_ip: Ipv4Addr,
    pub guest_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

/// A connection that just completed its handshake; the stack spawns the
/// classifier/mediator task over `stream`.
pub struct NewFlow {
    pub key: FlowKey,
    pub stream: FlowStream,
}

pub struct TcpEngine {
    conns: HashMap<FlowKey, Connection>,
    max_flows: usize,
    recv_window: usize,
    /// Shared with every [`FlowStream`]; flow tasks poke it to request a pump
    wake: Arc<Notify>,
    /// Flows refused because the cap was hit
    pub refused_flows: u64,
    /// Segments dropped as unparseable
    pub dropped_segments: u64,
}

impl TcpEngine {
    pub fn new(max_flows: usize, recv_window: usize) -> Self {
        Self {
            conns: HashMap::new(),
            max_flows,
            recv_window,
            wake: Arc::new(Notify::new()),
            refused_flows: 0,
            dropped_segments: 0,
        }
    }

    /// Notify handle the stack's event loop selects on.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn active_flows(&self) -> usize {
        self.conns.len()
    }

    /// Process one ingress TCP segment (IP payload). Egress datagrams are
    /// appended to `out`; a newly established flow is returned for spawning.
    pub fn handle_segment(
        &mut self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        ip_payload: &[u8],
        now: Instant,
        out: &mut Vec<Vec<u8>>,
    ) -> Option<NewFlow> {
        let seg = match wire::parse(src, dst, ip_payload) {
            Ok(seg) => seg,
            Err(ParseError::Checksum { src_port, dst_port }) => {
                let key = FlowKey {
                    guest_ip: src,
                    guest_port: src_port,
                    remote_ip: dst,
                    remote_port: dst_port,
                };
                if let Some(conn) = self.conns.get_mut(&key) {
                    warn!("tcp: checksum failure on {key:?}, resetting flow");
                    conn.abort(out);
                    self.conns.remove(&key);
                } else {
                    self.dropped_segments += 1;
                }
                return None;
            }
            Err(_) => {
                self.dropped_segments += 1;
                return None;
            }
        };

        let key = FlowKey {
            guest_ip: src,
            guest_port: seg.src_port,
            remote_ip: dst,
            remote_port: seg.dst_port,
        };

        if let Some(conn) = self.conns.get_mut(&key) {
            let established_now = conn.on_segment(&seg, now, out);
            let new_flow = established_now.then(|| NewFlow {
                key,
                stream: FlowStream::new(conn.shared(), self.wake.clone()),
            });
            if conn.is_closed() {
                self.conns.remove(&key);
            }
            return new_flow;
        }

        if seg.is_syn() && seg.ack.is_none() {
            if self.conns.len() >= self.max_flows {
                warn!("tcp: flow cap {} reached, refusing {key:?}", self.max_flows);
                self.refused_flows += 1;
                out.push(refusal(&key, &seg));
                return None;
            }
            let conn = Connection::accept(key, &seg, self.recv_window, now, out);
            self.conns.insert(key, conn);
            return None;
        }

        if seg.is_rst() {
            trace!("tcp: RST for unknown flow {key:?}, ignoring");
            return None;
        }
        debug!("tcp: segment for unknown flow {key:?}, answering RST");
        out.push(refusal(&key, &seg));
        None
    }

    /// Drive all connections: drain flow-task writes, emit FINs, refresh
    /// window advertisements.
    pub fn pump(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) {
        for conn in self.conns.values_mut() {
            conn.pump(now, out);
        }
        self.conns.retain(|_, c| !c.is_closed());
    }

    /// Timer pass over all connections.
    pub fn on_tick(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) {
        for conn in self.conns.values_mut() {
            conn.on_tick(now, out);
        }
        self.conns.retain(|_, c| !c.is_closed());
    }

    /// Link went away: every flow is reset locally, nothing is emitted.
    pub fn reset_all(&mut self) {
        for conn in self.conns.values_mut() {
            conn.close_local();
        }
        self.conns.clear();
    }
}

/// RST answering a segment that has no (or can have no) flow.
fn refusal(key: &FlowKey, seg: &super::wire::SegmentView<'_>) -> Vec<u8> {
    let ack = seg.seq.wrapping_add(seg.seq_len());
    wire::build(
        key.remote_ip,
        key.guest_ip,
        key.remote_port,
        key.guest_port,
        seg.ack.unwrap_or(0),
        Some(ack),
        0,
        TcpControl::Rst,
        &[],
    )
}

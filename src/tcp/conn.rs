//! Per-connection state machine
//!
//! Implements the canonical TCP transitions with the stack's tightened
//! rules: fixed unscaled receive window, cryptographically random ISNs, a
//! single doubling RTO with a retry cap, 40 ms delayed ACKs, and a 30 s
//! TIME_WAIT. The engine is always the passive opener: a connection exists
//! because the guest sent a SYN, and the stack masquerades as the remote
//! endpoint the guest believes it is talking to.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use smoltcp::wire::TcpControl;
use tracing::{debug, trace, warn};

use super::engine::FlowKey;
use super::stream::StreamShared;
use super::wire::{self, SegmentView};
use super::{ACK_DELAY, MAX_RETRIES, MSS, RTO_INITIAL, TIME_WAIT};

/// Connection states. LISTEN is implicit: the engine accepts any SYN, so a
/// `Connection` is born in `SynReceived`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpState {
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

/// One unacknowledged egress segment, kept for retransmission.
struct TxSegment {
    seq: u32,
    control: TcpControl,
    data: Vec<u8>,
}

impl TxSegment {
    fn seq_len(&self) -> u32 {
        let flag = matches!(self.control, TcpControl::Syn | TcpControl::Fin) as u32;
        self.data.len() as u32 + flag
    }
}

pub(crate) struct Connection {
    key: FlowKey,
    state: TcpState,

    // send sequence space (stack -> guest)
    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    rtx: VecDeque<TxSegment>,
    rto: Duration,
    rto_deadline: Option<Instant>,
    retries: u32,
    fin_sent: bool,

    // receive sequence space (guest -> stack)
    irs: u32,
    rcv_nxt: u32,
    /// Out-of-order segments keyed by offset from `irs`
    ooo: BTreeMap<u32, Vec<u8>>,
    ooo_bytes: usize,
    recv_window_max: usize,
    last_advertised: u16,

    // delayed ACK
    ack_deadline: Option<Instant>,
    rx_since_ack: usize,

    time_wait_until: Option<Instant>,
    shared: Arc<Mutex<StreamShared>>,
}

impl Connection {
    /// Accept a guest SYN: allocate state and emit the SYN-ACK.
    pub fn accept(
        key: FlowKey,
        seg: &SegmentView<'_>,
        recv_window_max: usize,
        now: Instant,
        out: &mut Vec<Vec<u8>>,
    ) -> Self {
        let iss = random_isn();
        let mut conn = Self {
            key,
            state: TcpState::SynReceived,
            iss,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1),
            snd_wnd: seg.window,
            rtx: VecDeque::new(),
            rto: RTO_INITIAL,
            rto_deadline: Some(now + RTO_INITIAL),
            retries: 0,
            fin_sent: false,
            irs: seg.seq,
            rcv_nxt: seg.seq.wrapping_add(1),
            ooo: BTreeMap::new(),
            ooo_bytes: 0,
            recv_window_max,
            last_advertised: 0,
            ack_deadline: None,
            rx_since_ack: 0,
            time_wait_until: None,
            shared: Arc::new(Mutex::new(StreamShared::default())),
        };
        debug!(
            "tcp: SYN {}:{} -> {}:{}, iss={iss}",
            key.guest_ip, key.guest_port, key.remote_ip, key.remote_port
        );
        conn.rtx.push_back(TxSegment {
            seq: iss,
            control: TcpControl::Syn,
            data: Vec::new(),
        });
        conn.emit(TcpControl::Syn, iss, &[], out);
        conn
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    pub fn shared(&self) -> Arc<Mutex<StreamShared>> {
        self.shared.clone()
    }

    /// Process one ingress segment. Returns true when this segment completed
    /// the handshake (the flow task should be spawned).
    pub fn on_segment(
        &mut self,
        seg: &SegmentView<'_>,
        now: Instant,
        out: &mut Vec<Vec<u8>>,
    ) -> bool {
        if self.state == TcpState::Closed {
            return false;
        }
        self.snd_wnd = seg.window;

        if seg.is_rst() {
            debug!("tcp: RST from guest on {:?}", self.key);
            self.shared.lock().unwrap().mark_reset();
            self.state = TcpState::Closed;
            return false;
        }

        if seg.is_syn() {
            if self.state == TcpState::SynReceived && seg.seq == self.irs {
                // duplicate SYN: the SYN-ACK got lost, resend it
                self.emit(TcpControl::Syn, self.iss, &[], out);
            } else {
                warn!("tcp: unexpected SYN on {:?}, resetting", self.key);
                self.abort(out);
            }
            return false;
        }

        let mut established_now = false;
        if let Some(ack) = seg.ack {
            established_now = self.process_ack(ack, now);
        }

        if !seg.payload.is_empty() {
            match self.state {
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                    self.on_data(seg.seq, seg.payload, now, out);
                }
                _ => {
                    trace!("tcp: data in {:?} state, re-acking", self.state);
                    self.force_ack(out);
                }
            }
        }

        if seg.is_fin() {
            self.on_fin(seg.seq.wrapping_add(seg.payload.len() as u32), now, out);
        }

        established_now
    }

    fn process_ack(&mut self, ack: u32, now: Instant) -> bool {
        if !(wire::seq_lt(self.snd_una, ack) && wire::seq_le(ack, self.snd_nxt)) {
            return false; // old or out-of-range acknowledgment
        }
        self.snd_una = ack;
        self.trim_rtx();
        // any new ACK resets the backoff
        self.rto = RTO_INITIAL;
        self.retries = 0;
        self.rto_deadline = if self.rtx.is_empty() {
            None
        } else {
            Some(now + self.rto)
        };

        let fin_acked = self.fin_sent && self.rtx.is_empty();
        match self.state {
            TcpState::SynReceived if wire::seq_le(self.iss.wrapping_add(1), ack) => {
                debug!("tcp: established {:?}", self.key);
                self.state = TcpState::Established;
                return true;
            }
            TcpState::FinWait1 if fin_acked => self.state = TcpState::FinWait2,
            TcpState::Closing if fin_acked => {
                self.state = TcpState::TimeWait;
                self.time_wait_until = Some(now + TIME_WAIT);
            }
            TcpState::LastAck if fin_acked => {
                debug!("tcp: closed {:?}", self.key);
                self.state = TcpState::Closed;
            }
            _ => {}
        }
        false
    }

    fn trim_rtx(&mut self) {
        while let Some(front) = self.rtx.front() {
            let end = front.seq.wrapping_add(front.seq_len());
            if wire::seq_le(end, self.snd_una) {
                self.rtx.pop_front();
            } else if wire::seq_lt(front.seq, self.snd_una) && !front.data.is_empty() {
                // partial acknowledgment: drop the acked prefix
                let keep_from = self.snd_una.wrapping_sub(front.seq) as usize;
                let front = self.rtx.front_mut().unwrap();
                front.data.drain(..keep_from.min(front.data.len()));
                front.seq = self.snd_una;
                break;
            } else {
                break;
            }
        }
    }

    fn on_data(&mut self, seq: u32, mut payload: &[u8], now: Instant, out: &mut Vec<Vec<u8>>) {
        let mut seq = seq;
        // trim any prefix we already have
        if wire::seq_lt(seq, self.rcv_nxt) {
            let overlap = self.rcv_nxt.wrapping_sub(seq) as usize;
            if overlap >= payload.len() {
                trace!("tcp: duplicate segment seq={seq}, re-acking");
                self.force_ack(out);
                return;
            }
            payload = &payload[overlap..];
            seq = self.rcv_nxt;
        }

        if seq == self.rcv_nxt {
            let space = self.shared.lock().unwrap().recv_space(self.recv_window_max);
            let accept = space.min(payload.len());
            if accept < payload.len() {
                warn!(
                    "tcp: {} bytes beyond advertised window dropped on {:?}",
                    payload.len() - accept,
                    self.key
                );
            }
            if accept > 0 {
                self.shared.lock().unwrap().push_recv(&payload[..accept]);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(accept as u32);
                self.rx_since_ack += accept;
            }
            self.drain_ooo();
            if self.rx_since_ack >= MSS {
                self.force_ack(out);
            } else {
                self.schedule_ack(now);
            }
        } else {
            // ahead of rcv_nxt: hold it if the window covers it
            let offset = seq.wrapping_sub(self.rcv_nxt);
            if offset as usize <= self.recv_window_max
                && self.ooo_bytes + payload.len() <= self.recv_window_max
            {
                let key = seq.wrapping_sub(self.irs);
                if !self.ooo.contains_key(&key) {
                    self.ooo_bytes += payload.len();
                    self.ooo.insert(key, payload.to_vec());
                    trace!("tcp: buffered {} ooo bytes at +{offset}", payload.len());
                }
            }
            // duplicate ACK tells the guest what we are still missing
            self.force_ack(out);
        }
    }

    fn drain_ooo(&mut self) {
        loop {
            let key = self.rcv_nxt.wrapping_sub(self.irs);
            let Some(chunk) = self.ooo.remove(&key) else {
                break;
            };
            self.ooo_bytes -= chunk.len();
            let space = self.shared.lock().unwrap().recv_space(self.recv_window_max);
            let accept = space.min(chunk.len());
            if accept > 0 {
                self.shared.lock().unwrap().push_recv(&chunk[..accept]);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(accept as u32);
                self.rx_since_ack += accept;
            }
            if accept < chunk.len() {
                break; // window closed mid-chunk; the rest is dropped
            }
        }
        // drop any stale entries now behind rcv_nxt
        let horizon = self.rcv_nxt.wrapping_sub(self.irs);
        let stale: Vec<u32> = self
            .ooo
            .keys()
            .copied()
            .filter(|k| *k < horizon)
            .collect();
        for k in stale {
            if let Some(chunk) = self.ooo.remove(&k) {
                self.ooo_bytes -= chunk.len();
            }
        }
    }

    fn on_fin(&mut self, fin_seq: u32, now: Instant, out: &mut Vec<Vec<u8>>) {
        if fin_seq != self.rcv_nxt {
            // FIN for data we have not seen yet (or a duplicate); just ack
            self.force_ack(out);
            return;
        }
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.shared.lock().unwrap().push_fin();
        debug!("tcp: FIN from guest in {:?} on {:?}", self.state, self.key);

        match self.state {
            TcpState::SynReceived | TcpState::Established => self.state = TcpState::CloseWait,
            TcpState::FinWait1 => {
                if self.fin_sent && self.rtx.is_empty() {
                    self.state = TcpState::TimeWait;
                    self.time_wait_until = Some(now + TIME_WAIT);
                } else {
                    self.state = TcpState::Closing;
                }
            }
            TcpState::FinWait2 => {
                self.state = TcpState::TimeWait;
                self.time_wait_until = Some(now + TIME_WAIT);
            }
            _ => {}
        }
        self.force_ack(out);
    }

    /// Drain flow-task writes into segments, send FIN when the task is done,
    /// and re-advertise the window when reading reopened it.
    pub fn pump(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) {
        if self.state == TcpState::Closed {
            return;
        }
        if self.shared.lock().unwrap().reset && self.state != TcpState::TimeWait {
            // flow task aborted the stream
            self.abort(out);
            return;
        }

        loop {
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
            let available = (self.snd_wnd as u32).saturating_sub(in_flight);
            if available == 0 {
                break;
            }
            let chunk = self
                .shared
                .lock()
                .unwrap()
                .take_send((available as usize).min(MSS));
            if chunk.is_empty() {
                break;
            }
            let seq = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
            self.emit(TcpControl::Psh, seq, &chunk, out);
            self.rtx.push_back(TxSegment {
                seq,
                control: TcpControl::Psh,
                data: chunk,
            });
            if self.rto_deadline.is_none() {
                self.rto_deadline = Some(now + self.rto);
            }
        }

        let fin_ready = {
            let shared = self.shared.lock().unwrap();
            shared.send_fin && shared.send.is_empty()
        };
        if fin_ready
            && !self.fin_sent
            && matches!(self.state, TcpState::Established | TcpState::CloseWait)
        {
            let seq = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
            self.emit(TcpControl::Fin, seq, &[], out);
            self.rtx.push_back(TxSegment {
                seq,
                control: TcpControl::Fin,
                data: Vec::new(),
            });
            if self.rto_deadline.is_none() {
                self.rto_deadline = Some(now + self.rto);
            }
            self.state = match self.state {
                TcpState::Established => TcpState::FinWait1,
                _ => TcpState::LastAck,
            };
            debug!("tcp: FIN to guest, now {:?} on {:?}", self.state, self.key);
        }

        // reading reopened the receive window by at least one MSS
        let space = self
            .shared
            .lock()
            .unwrap()
            .recv_space(self.recv_window_max)
            .min(u16::MAX as usize);
        if space.saturating_sub(self.last_advertised as usize) >= MSS {
            self.force_ack(out);
        }
    }

    /// Timer pass: RTO, delayed ACK, TIME_WAIT expiry.
    pub fn on_tick(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) {
        if let Some(t) = self.time_wait_until {
            if now >= t {
                trace!("tcp: TIME_WAIT expired on {:?}", self.key);
                self.state = TcpState::Closed;
                return;
            }
        }
        if self.state == TcpState::Closed {
            return;
        }

        if let Some(t) = self.ack_deadline {
            if now >= t {
                self.force_ack(out);
            }
        }

        let Some(deadline) = self.rto_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        if self.retries >= MAX_RETRIES {
            warn!("tcp: {} retransmits exhausted on {:?}", MAX_RETRIES, self.key);
            self.abort(out);
            return;
        }
        if let Some(front) = self.rtx.front() {
            debug!(
                "tcp: retransmit seq={} len={} try={} rto={:?}",
                front.seq,
                front.data.len(),
                self.retries + 1,
                self.rto
            );
            let (seq, control, data) = (front.seq, front.control, front.data.clone());
            self.emit(control, seq, &data, out);
            self.retries += 1;
            self.rto *= 2;
            self.rto_deadline = Some(now + self.rto);
        } else {
            self.rto_deadline = None;
        }
    }

    /// Send RST and tear the connection down.
    pub fn abort(&mut self, out: &mut Vec<Vec<u8>>) {
        if self.state != TcpState::Closed {
            self.emit(TcpControl::Rst, self.snd_nxt, &[], out);
        }
        self.close_local();
    }

    /// Tear down without emitting anything (link already gone).
    pub fn close_local(&mut self) {
        self.shared.lock().unwrap().mark_reset();
        self.state = TcpState::Closed;
    }

    fn schedule_ack(&mut self, now: Instant) {
        if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + ACK_DELAY);
        }
    }

    fn force_ack(&mut self, out: &mut Vec<Vec<u8>>) {
        self.emit(TcpControl::None, self.snd_nxt, &[], out);
    }

    /// Emit one segment toward the guest, masquerading as the remote peer.
    fn emit(&mut self, control: TcpControl, seq: u32, payload: &[u8], out: &mut Vec<Vec<u8>>) {
        let window = self
            .shared
            .lock()
            .unwrap()
            .recv_space(self.recv_window_max)
            .min(u16::MAX as usize) as u16;
        self.last_advertised = window;
        self.ack_deadline = None;
        self.rx_since_ack = 0;
        out.push(wire::build(
            self.key.remote_ip,
            self.key.guest_ip,
            self.key.remote_port,
            self.key.guest_port,
            seq,
            Some(self.rcv_nxt),
            window,
            control,
            payload,
        ));
    }
}

fn random_isn() -> u32 {
    let mut b = [0u8; 4];
    if getrandom::fill(&mut b).is_err() {
        // never expected; a constant here only weakens sequence prediction
        return 0x1337_0001;
    }
    u32::from_be_bytes(b)
}

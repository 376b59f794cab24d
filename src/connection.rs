//! The per-socket transport state machine.
//!
//! A `Connection` is shared (`Arc`) between the application threads calling
//! the socket API, the multiplexer's send and receive workers, and the
//! garbage collector. Interior state is split into independently locked
//! pieces; when more than one is taken, the order is
//! `status → hs → snd → rcv → cc`, and the readiness service is only ever
//! touched with no other lock held. Flags the workers poll every iteration
//! are atomics.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::buffer::{AddOutcome, Message, RcvBuffer, RxData, SndBuffer};
use crate::cc::{CcInputs, CcRegistry, CongestionControl};
use crate::clock::{self, timestamp_us};
use crate::epoll::{EpollService, EPOLL_ERR, EPOLL_IN, EPOLL_OUT};
use crate::error::{Error, Result};
use crate::handshake::{
    make_cookie, Handshake, HsExt, HsReqType, RejectReason, RendezvousState, TransportConfig,
    FLAG_PERIODIC_NAK, FLAG_REXMIT, FLAG_TLPKTDROP, FLAG_TSBPD_RCV, FLAG_TSBPD_SND,
    HS_EXT_CONFIG, HS_EXT_KM, HS_EXT_TRANSPORT, INDUCTION_MAGIC, TRANSPORT_VERSION,
};
use crate::loss::{AckWindow, LossList};
use crate::multiplexer::MuxRef;
use crate::options::SocketOptions;
use crate::packet::{
    encode_data, AckDetail, Control, ControlPacket, DataHeader, LossRange,
};
use crate::seq::{self, seq_cmp, seq_dec, seq_inc, seq_off};
use crate::stats::{Gauges, Stats, StatsSnapshot};
use crate::window::ArrivalWindow;

/// The transport's base timing quantum.
pub const SYN_INTERVAL: Duration = Duration::from_millis(10);
/// Full acknowledgements fire at this period.
const ACK_INTERVAL: Duration = SYN_INTERVAL;
/// A light (cumulative-only) ACK goes out every this many data packets.
const LITE_ACK_EVERY: u64 = 64;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Handshake retries while connecting.
pub const HS_RETRY_INTERVAL: Duration = Duration::from_millis(250);
/// Floor for the loss-report repeat period.
const MIN_NAK_INTERVAL: Duration = Duration::from_millis(20);
/// Floor for the no-activity probe period.
const MIN_EXP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Init,
    Opened,
    Listening,
    Connecting,
    Connected,
    Broken,
    Closing,
    Closed,
    Nonexist,
}

/// Outcome of driving an in-flight connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    InProgress,
    Connected,
    Failed,
}

// ---------------------------------------------------------------------------
// Inner state pieces
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StatusInner {
    status: SocketStatus,
    reject: Option<RejectReason>,
    listen_parent: i32,
    closure_time: Option<Instant>,
    linger_until: Option<Instant>,
}

struct SndState {
    buffer: SndBuffer,
    loss: LossList,
    /// Last sequence emitted.
    cur_seq: i32,
    /// Peer's next expected sequence (everything below is released).
    last_ack: i32,
    /// Peer's advertised receive headroom, packets.
    peer_window: i32,
}

struct RcvState {
    buffer: RcvBuffer,
    loss: LossList,
    arrival: ArrivalWindow,
    ack_window: AckWindow,
    /// Largest sequence seen on the wire.
    cur_seq: i32,
    /// Last sequence acknowledged with a full ACK.
    last_ack_acked: i32,
    ack_no: i32,
    last_ack_time: Instant,
    last_nak_time: Instant,
    pkts_since_ack: u64,
    first_data_seen: bool,
}

struct CcState {
    ctrl: Box<dyn CongestionControl>,
    inputs: CcInputs,
}

/// Connect-time state (caller and rendezvous).
struct HsState {
    phase: HsPhase,
    /// The request we re-send until answered.
    req: Option<Handshake>,
    target: Option<SocketAddr>,
    cookie: i32,
    peer_cookie: i32,
    deadline: Option<Instant>,
    last_send: Option<Instant>,
    isn: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HsPhase {
    Idle,
    Induction,
    Conclusion,
    Rendezvous(RendezvousState),
    Done,
}

/// Parameters the handshake settles on.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeResult {
    pub peer_id: i32,
    pub peer_isn: i32,
    pub own_isn: i32,
    pub peer_flight: i32,
    /// Latency this side applies to received data.
    pub rcv_latency: Duration,
    pub mss: usize,
}

pub struct Connection {
    id: i32,
    cookie_secret: u64,

    pub(crate) opts: Mutex<SocketOptions>,
    status: Mutex<StatusInner>,
    status_cv: Condvar,

    mux: Mutex<Option<MuxRef>>,
    self_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,

    hs: Mutex<HsState>,
    snd: Mutex<Option<SndState>>,
    snd_cv: Condvar,
    rcv: Mutex<Option<RcvState>>,
    rcv_cv: Condvar,
    cc: Mutex<Option<CcState>>,
    stats: Mutex<Stats>,

    cc_registry: Arc<CcRegistry>,
    epoll: Arc<EpollService>,
    epoll_ids: Mutex<HashSet<i32>>,

    // Worker-polled flags.
    connected: AtomicBool,
    connecting: AtomicBool,
    listening: AtomicBool,
    broken: AtomicBool,
    closing: AtomicBool,
    on_rcv_list: AtomicBool,
    /// GC grace counter for broken sockets with unread data.
    broken_counter: AtomicI32,

    peer_id: AtomicI32,
    peer_isn: AtomicI32,
    own_isn: AtomicI32,
    start_time: Mutex<Instant>,
    /// Microseconds since `start_time`, updated on any peer activity.
    last_rsp_us: AtomicU64,
    last_snd_us: AtomicU64,
    exp_count: AtomicU32,
    rtt_us: AtomicU32,
    rtt_var_us: AtomicU32,
}

impl Connection {
    pub fn new(
        id: i32,
        opts: SocketOptions,
        epoll: Arc<EpollService>,
        cc_registry: Arc<CcRegistry>,
        cookie_secret: u64,
    ) -> Arc<Connection> {
        let now = Instant::now();
        Arc::new(Connection {
            id,
            cookie_secret,
            opts: Mutex::new(opts),
            status: Mutex::new(StatusInner {
                status: SocketStatus::Init,
                reject: None,
                listen_parent: 0,
                closure_time: None,
                linger_until: None,
            }),
            status_cv: Condvar::new(),
            mux: Mutex::new(None),
            self_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
            hs: Mutex::new(HsState {
                phase: HsPhase::Idle,
                req: None,
                target: None,
                cookie: 0,
                peer_cookie: 0,
                deadline: None,
                last_send: None,
                isn: 0,
            }),
            snd: Mutex::new(None),
            snd_cv: Condvar::new(),
            rcv: Mutex::new(None),
            rcv_cv: Condvar::new(),
            cc: Mutex::new(None),
            stats: Mutex::new(Stats::new(now)),
            cc_registry,
            epoll,
            epoll_ids: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            on_rcv_list: AtomicBool::new(false),
            broken_counter: AtomicI32::new(30),
            peer_id: AtomicI32::new(0),
            peer_isn: AtomicI32::new(0),
            own_isn: AtomicI32::new(0),
            start_time: Mutex::new(now),
            last_rsp_us: AtomicU64::new(0),
            last_snd_us: AtomicU64::new(0),
            exp_count: AtomicU32::new(1),
            rtt_us: AtomicU32::new(100_000),
            rtt_var_us: AtomicU32::new(50_000),
        })
    }

    // -- plain accessors ----------------------------------------------------

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn status(&self) -> SocketStatus {
        self.status.lock().unwrap().status
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        self.status.lock().unwrap().reject
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Relaxed)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Relaxed)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Relaxed)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Relaxed)
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Relaxed)
    }

    pub fn set_on_rcv_list(&self, on: bool) {
        self.on_rcv_list.store(on, Relaxed);
    }

    pub fn is_on_rcv_list(&self) -> bool {
        self.on_rcv_list.load(Relaxed)
    }

    pub fn consume_broken_grace(&self) -> bool {
        self.broken_counter.fetch_sub(1, Relaxed) > 0
    }

    pub fn self_addr(&self) -> Option<SocketAddr> {
        *self.self_addr.lock().unwrap()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().unwrap()
    }

    pub fn peer_socket_id(&self) -> i32 {
        self.peer_id.load(Relaxed)
    }

    pub fn peer_isn(&self) -> i32 {
        self.peer_isn.load(Relaxed)
    }

    pub fn own_isn(&self) -> i32 {
        self.own_isn.load(Relaxed)
    }

    pub fn listen_parent(&self) -> i32 {
        self.status.lock().unwrap().listen_parent
    }

    /// `(peer_id << 30) | isn` — deduplicates repeated connection requests.
    pub fn peer_spec(peer_id: i32, isn: i32) -> u64 {
        ((peer_id as u64) << 30) | (isn as u64 & 0x3FFF_FFFF)
    }

    pub fn options(&self) -> SocketOptions {
        self.opts.lock().unwrap().clone()
    }

    pub fn mux_ref(&self) -> Option<MuxRef> {
        self.mux.lock().unwrap().clone()
    }

    pub fn closure_time(&self) -> Option<Instant> {
        self.status.lock().unwrap().closure_time
    }

    pub fn linger_until(&self) -> Option<Instant> {
        self.status.lock().unwrap().linger_until
    }

    pub fn snd_pending_pkts(&self) -> usize {
        self.snd.lock().unwrap().as_ref().map_or(0, |s| s.buffer.pkts_queued())
    }

    pub fn rcv_has_data(&self) -> bool {
        self.rcv.lock().unwrap().as_ref().map_or(false, |r| r.buffer.has_data())
    }

    fn now_rel_us(&self, now: Instant) -> u64 {
        let start = *self.start_time.lock().unwrap();
        now.saturating_duration_since(start).as_micros() as u64
    }

    fn touch_rsp(&self, now: Instant) {
        self.last_rsp_us.store(self.now_rel_us(now), Relaxed);
        self.exp_count.store(1, Relaxed);
    }

    // -- registry-driven transitions ---------------------------------------

    pub fn set_opened(&self, mux: MuxRef, local: SocketAddr) {
        *self.mux.lock().unwrap() = Some(mux);
        *self.self_addr.lock().unwrap() = Some(local);
        let mut st = self.status.lock().unwrap();
        if st.status == SocketStatus::Init {
            st.status = SocketStatus::Opened;
        }
    }

    pub fn set_listening(&self) {
        self.listening.store(true, Relaxed);
        self.status.lock().unwrap().status = SocketStatus::Listening;
    }

    pub fn set_listen_parent(&self, parent: i32) {
        self.status.lock().unwrap().listen_parent = parent;
    }

    pub fn set_peer_addr(&self, addr: SocketAddr) {
        *self.peer_addr.lock().unwrap() = Some(addr);
    }

    /// Restart the closure clock (linger resolution postpones removal).
    pub fn mark_closing_now(&self, now: Instant) {
        self.closing.store(true, Relaxed);
        let mut st = self.status.lock().unwrap();
        st.closure_time = Some(now);
        st.linger_until = None;
    }

    pub fn mark_closed(&self, now: Instant) {
        let mut st = self.status.lock().unwrap();
        st.status = SocketStatus::Closed;
        st.closure_time = Some(now);
    }

    pub fn stamp_closure(&self, now: Instant) {
        let mut st = self.status.lock().unwrap();
        if st.closure_time.is_none() {
            st.closure_time = Some(now);
        }
    }

    pub fn set_linger_until(&self, t: Option<Instant>) {
        self.status.lock().unwrap().linger_until = t;
    }

    // -- connect: active side ----------------------------------------------

    /// Arm the handshake state machine and emit the first request. The
    /// receive worker (via the rendezvous queue) drives it from here.
    pub fn start_connect(&self, target: SocketAddr, forced_isn: i32, now: Instant) -> Result<()> {
        let opts = self.options();
        let rendezvous = opts.rendezvous;
        let isn = if forced_isn != 0 {
            forced_isn & seq::MAX_SEQ
        } else {
            rand::random::<i32>() & seq::MAX_SEQ
        };

        *self.start_time.lock().unwrap() = now;
        self.connecting.store(true, Relaxed);
        {
            let mut st = self.status.lock().unwrap();
            st.status = SocketStatus::Connecting;
        }
        *self.peer_addr.lock().unwrap() = Some(target);

        let mut hs = self.hs.lock().unwrap();
        hs.target = Some(target);
        hs.isn = isn;
        let ttl = if rendezvous { opts.connect_timeout * 10 } else { opts.connect_timeout };
        hs.deadline = Some(now + ttl);
        if rendezvous {
            let bucket = minute_bucket(now);
            hs.cookie = make_cookie(target, self.cookie_secret, bucket);
            hs.phase = HsPhase::Rendezvous(RendezvousState::Waiting);
            hs.req = Some(Handshake::wave_a_hand(
                self.id,
                isn,
                opts.mss as u32,
                opts.flight_flag_size as u32,
                hs.cookie,
            ));
        } else {
            hs.phase = HsPhase::Induction;
            hs.req = Some(Handshake::induction_request(
                self.id,
                isn,
                opts.mss as u32,
                opts.flight_flag_size as u32,
            ));
        }
        // The first send happens through the async path once the attempt is
        // registered with the rendezvous queue, so a fast response cannot
        // race the registration.
        hs.last_send = None;
        Ok(())
    }

    pub fn connect_deadline(&self) -> Option<Instant> {
        self.hs.lock().unwrap().deadline
    }

    /// Block until the connect attempt resolves. The rendezvous queue
    /// enforces the TTL and marks the socket broken; the extra second here
    /// only guards against that wake-up getting lost.
    pub fn wait_connected(&self) -> Result<()> {
        let deadline = self.connect_deadline().map(|d| d + Duration::from_secs(1));
        let ok = clock::wait_until(&self.status, &self.status_cv, deadline, |st| {
            matches!(st.status, SocketStatus::Connected | SocketStatus::Broken | SocketStatus::Closed)
        });
        let st = self.status.lock().unwrap();
        match st.status {
            SocketStatus::Connected => Ok(()),
            _ if !ok => Err(Error::NoConn),
            _ => match st.reject {
                Some(r) => Err(Error::ConnRej(r)),
                None => Err(Error::ConnFail),
            },
        }
    }

    /// Periodic/driven step of an in-flight connect. `response` is a packet
    /// addressed to this socket, if one arrived this round.
    pub fn process_async_connect(
        self: &Arc<Self>,
        response: Option<&ControlPacket>,
        now: Instant,
    ) -> ConnectOutcome {
        if self.is_closing() {
            self.complete_broken(RejectReason::Close, now);
            return ConnectOutcome::Failed;
        }
        match response {
            Some(cp) => match &cp.control {
                Control::Handshake(hs) => self.process_connect_response(hs, now),
                Control::Shutdown => {
                    self.complete_broken(RejectReason::Peer, now);
                    ConnectOutcome::Failed
                }
                _ => ConnectOutcome::InProgress,
            },
            None => {
                // Timer tick: re-send the current request.
                let mut hs = self.hs.lock().unwrap();
                if hs.phase == HsPhase::Done {
                    return ConnectOutcome::Connected;
                }
                let due = hs
                    .last_send
                    .map_or(true, |t| now.duration_since(t) >= HS_RETRY_INTERVAL);
                if !due {
                    return ConnectOutcome::InProgress;
                }
                hs.last_send = Some(now);
                let (req, target) = (hs.req.clone(), hs.target);
                drop(hs);
                if let (Some(req), Some(target)) = (req, target) {
                    if let Err(e) = self.send_handshake(target, 0, &req) {
                        debug!(id = self.id, error = %e, "handshake retransmit failed");
                    }
                }
                ConnectOutcome::InProgress
            }
        }
    }

    fn process_connect_response(self: &Arc<Self>, resp: &Handshake, now: Instant) -> ConnectOutcome {
        if let HsReqType::Rejection(reason) = resp.req_type {
            warn!(id = self.id, ?reason, "connection rejected by peer");
            self.complete_broken(reason, now);
            return ConnectOutcome::Failed;
        }

        let mut hs = self.hs.lock().unwrap();
        let opts = self.options();
        match hs.phase {
            HsPhase::Induction => {
                if resp.req_type != HsReqType::Induction {
                    return ConnectOutcome::InProgress;
                }
                // The listener's cookie arrives here; answer with the
                // extended conclusion.
                hs.peer_cookie = resp.cookie;
                if resp.version == 5 && resp.ext_field != INDUCTION_MAGIC {
                    drop(hs);
                    self.complete_broken(RejectReason::Rogue, now);
                    return ConnectOutcome::Failed;
                }
                let mut conclusion = Handshake::induction_request(
                    self.id,
                    hs.isn,
                    opts.mss as u32,
                    opts.flight_flag_size as u32,
                );
                conclusion.version = if resp.version == 5 { 5 } else { 4 };
                conclusion.req_type = HsReqType::Conclusion;
                conclusion.cookie = resp.cookie;
                if conclusion.version == 5 {
                    conclusion.ext_field = ext_field_for(&opts);
                    conclusion.ext = build_ext_blocks(&opts, false);
                }
                hs.phase = HsPhase::Conclusion;
                hs.req = Some(conclusion.clone());
                hs.last_send = Some(now);
                let target = hs.target.unwrap();
                drop(hs);
                if let Err(e) = self.send_handshake(target, 0, &conclusion) {
                    debug!(id = self.id, error = %e, "conclusion send failed");
                }
                ConnectOutcome::InProgress
            }
            HsPhase::Conclusion => {
                if resp.req_type != HsReqType::Conclusion {
                    return ConnectOutcome::InProgress;
                }
                // The listener's conclusion carries its socket id, the ISN
                // it chose, and the negotiated transport settings.
                let peer_cfg = resp.transport_rsp().copied();
                let own_isn = hs.isn;
                hs.phase = HsPhase::Done;
                hs.req = None;
                drop(hs);

                let rcv_latency = negotiated_rcv_latency(&opts, peer_cfg.as_ref());
                let result = HandshakeResult {
                    peer_id: resp.socket_id,
                    peer_isn: resp.isn,
                    own_isn,
                    peer_flight: resp.flight_flag as i32,
                    rcv_latency,
                    mss: (resp.mss as usize).min(opts.mss),
                };
                self.setup_connected(result, now);
                ConnectOutcome::Connected
            }
            HsPhase::Rendezvous(state) => {
                self.process_rendezvous(hs, state, resp, now, &opts)
            }
            HsPhase::Idle | HsPhase::Done => ConnectOutcome::Connected,
        }
    }

    fn process_rendezvous(
        self: &Arc<Self>,
        mut hs: std::sync::MutexGuard<'_, HsState>,
        state: RendezvousState,
        resp: &Handshake,
        now: Instant,
        opts: &SocketOptions,
    ) -> ConnectOutcome {
        let we_initiate = hs.cookie.wrapping_sub(resp.cookie) > 0;
        match (state, resp.req_type) {
            // A wave from the peer moves both sides off Waiting. The cookie
            // contest picks the initiator, who attaches the settings request.
            (RendezvousState::Waiting, HsReqType::WaveAHand)
            | (RendezvousState::Attention, HsReqType::WaveAHand) => {
                hs.peer_cookie = resp.cookie;
                let mut conclusion = Handshake::wave_a_hand(
                    self.id,
                    hs.isn,
                    opts.mss as u32,
                    opts.flight_flag_size as u32,
                    hs.cookie,
                );
                conclusion.req_type = HsReqType::Conclusion;
                if we_initiate {
                    conclusion.ext_field = ext_field_for(opts);
                    conclusion.ext = build_ext_blocks(opts, false);
                    hs.phase = HsPhase::Rendezvous(RendezvousState::Initiated);
                } else {
                    hs.phase = HsPhase::Rendezvous(RendezvousState::Attention);
                }
                hs.req = Some(conclusion.clone());
                hs.last_send = Some(now);
                let target = hs.target.unwrap();
                drop(hs);
                let _ = self.send_handshake(target, resp.socket_id, &conclusion);
                ConnectOutcome::InProgress
            }
            // Responder: the initiator's conclusion carries the request
            // extension; answer with the response and come up connected.
            (RendezvousState::Waiting, HsReqType::Conclusion)
            | (RendezvousState::Attention, HsReqType::Conclusion) => {
                if resp.transport_req().is_none() {
                    // Their plain conclusion: we are the initiator and our
                    // extended conclusion is already in flight; keep going.
                    return ConnectOutcome::InProgress;
                }
                hs.peer_cookie = resp.cookie;
                let own_isn = hs.isn;
                let req_cfg = resp.transport_req().copied();
                let mut reply = Handshake::wave_a_hand(
                    self.id,
                    own_isn,
                    opts.mss as u32,
                    opts.flight_flag_size as u32,
                    hs.cookie,
                );
                reply.req_type = HsReqType::Conclusion;
                reply.ext_field = ext_field_for(opts);
                reply.ext = build_ext_blocks(opts, true);
                hs.phase = HsPhase::Done;
                hs.req = None;
                let target = hs.target.unwrap();
                drop(hs);
                let _ = self.send_handshake(target, resp.socket_id, &reply);

                let rcv_latency = negotiated_rcv_latency_from_req(opts, req_cfg.as_ref());
                self.setup_connected(
                    HandshakeResult {
                        peer_id: resp.socket_id,
                        peer_isn: resp.isn,
                        own_isn,
                        peer_flight: resp.flight_flag as i32,
                        rcv_latency,
                        mss: (resp.mss as usize).min(opts.mss),
                    },
                    now,
                );
                ConnectOutcome::Connected
            }
            // Initiator: the responder's extended conclusion ends the dance;
            // confirm with an agreement.
            (RendezvousState::Initiated, HsReqType::Conclusion) => {
                if resp.transport_rsp().is_none() {
                    return ConnectOutcome::InProgress;
                }
                let own_isn = hs.isn;
                let rsp_cfg = resp.transport_rsp().copied();
                let mut agreement = Handshake::wave_a_hand(
                    self.id,
                    own_isn,
                    opts.mss as u32,
                    opts.flight_flag_size as u32,
                    hs.cookie,
                );
                agreement.req_type = HsReqType::Agreement;
                hs.phase = HsPhase::Done;
                hs.req = None;
                let target = hs.target.unwrap();
                drop(hs);
                let _ = self.send_handshake(target, resp.socket_id, &agreement);

                let rcv_latency = negotiated_rcv_latency(opts, rsp_cfg.as_ref());
                self.setup_connected(
                    HandshakeResult {
                        peer_id: resp.socket_id,
                        peer_isn: resp.isn,
                        own_isn,
                        peer_flight: resp.flight_flag as i32,
                        rcv_latency,
                        mss: (resp.mss as usize).min(opts.mss),
                    },
                    now,
                );
                ConnectOutcome::Connected
            }
            _ => ConnectOutcome::InProgress,
        }
    }

    /// Install buffers, congestion control and flags for a live connection.
    pub fn setup_connected(self: &Arc<Self>, r: HandshakeResult, now: Instant) {
        // The negotiated latency overrides the configured one from here on.
        self.opts.lock().unwrap().latency = r.rcv_latency;
        let opts = self.options();
        let payload = r.mss - crate::packet::UDP_OVERHEAD;

        self.peer_id.store(r.peer_id, Relaxed);
        self.peer_isn.store(r.peer_isn, Relaxed);
        self.own_isn.store(r.own_isn, Relaxed);

        {
            let mut snd = self.snd.lock().unwrap();
            *snd = Some(SndState {
                buffer: SndBuffer::new(opts.snd_buf_pkts, payload.min(opts.payload_size)),
                loss: LossList::new(),
                cur_seq: seq_dec(r.own_isn),
                last_ack: r.own_isn,
                peer_window: r.peer_flight.max(1),
            });
        }
        {
            let mut rcv = self.rcv.lock().unwrap();
            // The playout base latches onto the first data packet.
            let buffer = RcvBuffer::new(opts.rcv_buf_pkts, r.peer_isn);
            *rcv = Some(RcvState {
                buffer,
                loss: LossList::new(),
                arrival: ArrivalWindow::new(),
                ack_window: AckWindow::new(1024),
                cur_seq: seq_dec(r.peer_isn),
                last_ack_acked: r.peer_isn,
                ack_no: 1,
                last_ack_time: now,
                last_nak_time: now,
                pkts_since_ack: 0,
                first_data_seen: false,
            });
        }
        {
            let mut cc = self.cc.lock().unwrap();
            let mut inputs = CcInputs {
                mss: r.mss,
                max_bw: opts.max_bw,
                flow_window_pkts: r.peer_flight.max(1),
                ..CcInputs::default()
            };
            let mut ctrl = self
                .cc_registry
                .build(&opts.congestion)
                .unwrap_or_else(|_| {
                    warn!(id = self.id, name = %opts.congestion, "unknown congestion controller, using live");
                    self.cc_registry.build("live").unwrap()
                });
            inputs.rtt_us = self.rtt_us.load(Relaxed);
            ctrl.init(&inputs);
            *cc = Some(CcState { ctrl, inputs });
        }

        self.touch_rsp(now);
        self.connected.store(true, Relaxed);
        self.connecting.store(false, Relaxed);
        {
            let mut st = self.status.lock().unwrap();
            st.status = SocketStatus::Connected;
        }
        self.status_cv.notify_all();
        self.update_epoll(EPOLL_OUT, true);

        // Make the connection visible to the receive worker's dispatch.
        if let Some(mux) = self.mux_ref() {
            mux.rcv_q.register_connected(self.clone());
        }
        debug!(
            id = self.id,
            peer = r.peer_id,
            isn = r.own_isn,
            peer_isn = r.peer_isn,
            "connection established"
        );
    }

    /// Fail the connect attempt (TTL expiry, rejection, close).
    pub fn complete_broken(&self, reason: RejectReason, now: Instant) {
        {
            let mut st = self.status.lock().unwrap();
            if st.reject.is_none() {
                st.reject = Some(reason);
            }
            st.status = SocketStatus::Broken;
            if st.closure_time.is_none() {
                st.closure_time = Some(now);
            }
        }
        self.connecting.store(false, Relaxed);
        self.broken.store(true, Relaxed);
        self.status_cv.notify_all();
        self.snd_cv.notify_all();
        self.rcv_cv.notify_all();
        self.update_epoll(EPOLL_IN | EPOLL_OUT | EPOLL_ERR, true);
    }

    // -- data path: sender --------------------------------------------------

    /// Queue one message. Blocks (bounded by the send timeout) when the
    /// buffer is full and the socket is in blocking-send mode.
    pub fn send_msg(
        self: &Arc<Self>,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
    ) -> Result<usize> {
        let opts = self.options();
        // A message that can never fit must not spin in the blocking loop.
        if data.len() > opts.payload_budget() * opts.snd_buf_pkts {
            return Err(Error::InvalidParam);
        }
        let deadline = clock::deadline_after(opts.snd_timeout);
        loop {
            if self.is_broken() || self.is_closing() {
                return Err(if self.is_connected() { Error::ConnLost } else { Error::ConnFail });
            }
            if !self.is_connected() {
                return Err(Error::NoConn);
            }
            let now = Instant::now();
            {
                let mut guard = self.snd.lock().unwrap();
                let snd = guard.as_mut().ok_or(Error::NoConn)?;
                match snd.buffer.add(data, ttl, in_order, now) {
                    Ok(_) => {
                        drop(guard);
                        self.reschedule_snd(now);
                        return Ok(data.len());
                    }
                    Err(Error::AgainWrite) if opts.snd_syn => {}
                    Err(e) => return Err(e),
                }
            }
            // Buffer full in blocking mode: wait for an ACK to free space.
            let ok = clock::wait_until(&self.snd, &self.snd_cv, deadline, |g| {
                g.as_ref().map_or(true, |s| s.buffer.free_pkts() > 0)
            });
            if !ok {
                return Err(Error::Timeout);
            }
        }
    }

    /// Ask the send worker to visit us now (new data or reopened window).
    fn reschedule_snd(self: &Arc<Self>, now: Instant) {
        if let Some(mux) = self.mux_ref() {
            mux.snd_q.schedule(self.clone(), now, true);
        }
    }

    /// Produce the next packet for the wire, if any is due. Returns the
    /// destination and the next visit time (None: drop from the heap until
    /// rescheduled by new data or an ACK).
    pub fn pack_data(&self, scratch: &mut Vec<u8>, now: Instant) -> Option<(SocketAddr, Option<Instant>)> {
        if !self.is_connected() || self.is_broken() {
            return None;
        }
        let peer_addr = self.peer_addr()?;
        let dst = self.peer_id.load(Relaxed);
        let start = *self.start_time.lock().unwrap();

        let mut guard = self.snd.lock().unwrap();
        let snd = guard.as_mut()?;

        // Retransmissions take precedence over fresh data.
        while let Some(lost) = snd.loss.pop_front() {
            if let Some(pkt) = snd.buffer.retransmit(lost) {
                let hdr = DataHeader {
                    seq: lost,
                    msg: pkt.msg,
                    timestamp: timestamp_us(start, pkt.origin),
                    dst,
                };
                encode_data(&hdr, &pkt.payload, scratch);
                self.stats.lock().unwrap().on_retransmit(pkt.payload.len());
                drop(guard);
                // A retransmit is send activity too; keep the keepalive
                // timer quiet while only losses are being repaired.
                self.last_snd_us.store(self.now_rel_us(now), Relaxed);
                return Some((peer_addr, Some(now + self.cc_pacing())));
            }
            // Already released by an ACK or a drop; look at the next one.
        }

        // Fresh data, window permitting.
        let flight = seq_off(snd.last_ack, snd.cur_seq) + 1;
        let window = self.cc_window().min(snd.peer_window);
        if flight >= window {
            // Window closed; an ACK will reschedule us.
            return None;
        }
        let next_seq = seq_inc(snd.cur_seq);
        match snd.buffer.read_next(next_seq) {
            Some(pkt) => {
                snd.cur_seq = next_seq;
                let hdr = DataHeader {
                    seq: next_seq,
                    msg: pkt.msg,
                    timestamp: timestamp_us(start, pkt.origin),
                    dst,
                };
                encode_data(&hdr, &pkt.payload, scratch);
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.on_pkt_sent(pkt.payload.len());
                }
                drop(guard);
                if let Some(cc) = self.cc.lock().unwrap().as_mut() {
                    let inputs = cc.inputs;
                    cc.ctrl.on_pkt_sent(&inputs);
                }
                self.last_snd_us.store(self.now_rel_us(now), Relaxed);
                Some((peer_addr, Some(now + self.cc_pacing())))
            }
            None => None,
        }
    }

    fn cc_pacing(&self) -> Duration {
        self.cc
            .lock()
            .unwrap()
            .as_ref()
            .map_or(Duration::from_millis(1), |c| c.ctrl.pacing_interval())
    }

    fn cc_window(&self) -> i32 {
        self.cc.lock().unwrap().as_ref().map_or(i32::MAX, |c| c.ctrl.window() as i32)
    }

    // -- data path: receiver ------------------------------------------------

    /// Handle one incoming data packet (raw datagram owned by the unit
    /// pool). Returns a buffer to release, if the packet was not stored.
    pub fn process_data(&self, hdr: DataHeader, data: Vec<u8>, now: Instant) -> Option<Vec<u8>> {
        if hdr.dst != self.id {
            // Wrong destination: possible attack, drop silently.
            return Some(data);
        }
        self.touch_rsp(now);
        let opts_tsbpd;
        let latency;
        {
            let o = self.opts.lock().unwrap();
            opts_tsbpd = o.tsbpd;
            latency = o.latency;
        }

        let mut nak_now: Option<Vec<LossRange>> = None;
        let mut lite_ack: Option<i32> = None;
        let mut released = None;
        let mut head_complete = false;
        let mut ready_now = false;

        {
            let mut guard = self.rcv.lock().unwrap();
            let rcv = match guard.as_mut() {
                Some(r) => r,
                None => return Some(data),
            };

            if opts_tsbpd && !rcv.first_data_seen {
                let base = now
                    .checked_sub(Duration::from_micros(hdr.timestamp as u64))
                    .unwrap_or(now);
                rcv.buffer.enable_playout(base, latency);
            }
            rcv.first_data_seen = true;

            rcv.arrival.on_arrival(now, data.len());
            if hdr.seq % 16 == 0 {
                rcv.arrival.on_probe1(now);
            } else if hdr.seq % 16 == 1 {
                rcv.arrival.on_probe2(now);
            }

            let expected = seq_inc(rcv.cur_seq);
            if seq_cmp(hdr.seq, expected) > 0 {
                // A hole opened: record it and report immediately.
                let from = expected;
                let to = seq_dec(hdr.seq);
                let fresh = rcv.loss.insert(from, to);
                if fresh > 0 {
                    self.stats.lock().unwrap().on_rcv_loss(fresh);
                    nak_now = Some(vec![(from, to)]);
                    rcv.last_nak_time = now;
                }
            }
            if seq_cmp(hdr.seq, rcv.cur_seq) > 0 {
                rcv.cur_seq = hdr.seq;
            } else {
                // A retransmit caught up; clear it from the pending report.
                rcv.loss.remove(hdr.seq);
            }

            let rx = RxData::from_datagram(hdr, data);
            match rcv.buffer.add(rx) {
                (AddOutcome::Stored(bytes), _) => {
                    self.stats.lock().unwrap().on_pkt_recv(bytes);
                    rcv.pkts_since_ack += 1;
                    if rcv.pkts_since_ack >= LITE_ACK_EVERY {
                        rcv.pkts_since_ack = 0;
                        lite_ack = Some(rcv.buffer.ack_seq());
                    }
                    // A complete head message (even one still gated by the
                    // playout clock) must wake blocked readers so they can
                    // recompute their sleep deadline.
                    head_complete = rcv.buffer.next_release_time().is_some();
                    ready_now = rcv.buffer.is_data_ready(now);
                }
                (outcome, Some(rx)) => {
                    if outcome == AddOutcome::Belated {
                        self.stats.lock().unwrap().on_belated();
                    }
                    released = Some(rx.data);
                }
                (_, None) => {}
            }
        }

        if let Some(ranges) = nak_now {
            self.stats.lock().unwrap().on_nak_sent();
            let _ = self.send_ctrl(Control::Nak(ranges));
        }
        if let Some(ack_seq) = lite_ack {
            let _ = self.send_ctrl(Control::Ack { ack_no: 0, last_ack_seq: ack_seq, detail: None });
        }
        if head_complete {
            self.rcv_cv.notify_all();
        }
        if ready_now {
            self.update_epoll(EPOLL_IN, true);
        }
        released
    }

    /// Handle one incoming control packet.
    pub fn process_ctrl(self: &Arc<Self>, cp: &ControlPacket, now: Instant) {
        if cp.dst != self.id && cp.dst != 0 {
            return;
        }
        self.touch_rsp(now);
        match &cp.control {
            Control::Ack { ack_no, last_ack_seq, detail } => {
                self.on_ack(*ack_no, *last_ack_seq, detail.as_ref(), now)
            }
            Control::AckAck { ack_no } => self.on_ack_ack(*ack_no, now),
            Control::Nak(ranges) => self.on_nak(ranges, now),
            Control::DropReq { first, last, .. } => self.on_drop_req(*first, *last, now),
            Control::Shutdown => {
                debug!(id = self.id, "peer shutdown");
                self.make_broken(RejectReason::Close, now);
            }
            Control::KeepAlive => {}
            Control::Handshake(hs) => {
                // A repeated conclusion means the peer missed our response.
                // The listener path re-answers requests addressed to id
                // zero; a rendezvous peer retries against our id directly.
                if hs.req_type == HsReqType::Conclusion && self.is_connected() {
                    self.reanswer_conclusion(hs);
                } else {
                    trace!(id = self.id, "handshake on a connected socket ignored");
                }
            }
            Control::PeerError { code } => {
                warn!(id = self.id, code, "peer signalled error");
                self.make_broken(RejectReason::Peer, now);
            }
            Control::CongestionWarning => {
                trace!(id = self.id, "congestion warning");
            }
            Control::Ext { ext_type, .. } => {
                trace!(id = self.id, ext_type, "user control frame ignored");
            }
        }
    }

    fn reanswer_conclusion(&self, req: &Handshake) {
        let Some(addr) = self.peer_addr() else { return };
        let opts = self.options();
        let mut resp = Handshake {
            version: 5,
            enc_field: 0,
            ext_field: HS_EXT_TRANSPORT,
            isn: self.own_isn.load(Relaxed),
            mss: opts.mss as u32,
            flight_flag: opts.flight_flag_size as u32,
            req_type: HsReqType::Conclusion,
            socket_id: self.id,
            cookie: req.cookie,
            peer_ip: [0; 4],
            ext: Vec::new(),
        };
        resp.ext = build_ext_blocks(&opts, true);
        let _ = self.send_handshake(addr, self.peer_id.load(Relaxed), &resp);
    }

    fn on_ack(self: &Arc<Self>, ack_no: i32, ack_seq: i32, detail: Option<&AckDetail>, now: Instant) {
        let mut window_opened = false;
        {
            let mut guard = self.snd.lock().unwrap();
            let snd = match guard.as_mut() {
                Some(s) => s,
                None => return,
            };
            if seq_cmp(ack_seq, snd.last_ack) > 0 {
                let (pkts, _bytes) = snd.buffer.ack_upto(ack_seq);
                snd.last_ack = ack_seq;
                snd.loss.remove_upto(seq_dec(ack_seq));
                if pkts > 0 {
                    window_opened = true;
                }
            }
            if let Some(d) = detail {
                snd.peer_window = d.avail_buf_pkts.max(1) as i32;
            }
        }
        self.stats.lock().unwrap().on_ack_recv();

        if let Some(d) = detail {
            self.update_rtt(d.rtt_us);
            {
                let mut guard = self.cc.lock().unwrap();
                if let Some(cc) = guard.as_mut() {
                    cc.inputs.rtt_us = self.rtt_us.load(Relaxed);
                    cc.inputs.rtt_var_us = self.rtt_var_us.load(Relaxed);
                    cc.inputs.delivery_rate_pps = d.pkt_recv_rate;
                    cc.inputs.capacity_pps = d.link_capacity;
                    let inputs = cc.inputs;
                    cc.ctrl.on_ack(&inputs, ack_seq);
                }
            }
            // Full ACKs are answered for the peer's RTT measurement.
            let _ = self.send_ctrl(Control::AckAck { ack_no });
        }

        if window_opened {
            self.snd_cv.notify_all();
            self.update_epoll(EPOLL_OUT, true);
            self.reschedule_snd(now);
        }
    }

    fn on_ack_ack(&self, ack_no: i32, now: Instant) {
        let rtt = {
            let mut guard = self.rcv.lock().unwrap();
            match guard.as_mut() {
                Some(rcv) => rcv.ack_window.acknowledge(ack_no, now).map(|(_, rtt)| rtt),
                None => None,
            }
        };
        if let Some(rtt) = rtt {
            self.update_rtt(rtt);
        }
    }

    fn on_nak(self: &Arc<Self>, ranges: &[LossRange], now: Instant) {
        let mut fresh_total = 0u64;
        let first = ranges.first().map(|r| r.0).unwrap_or(0);
        {
            let mut guard = self.snd.lock().unwrap();
            let snd = match guard.as_mut() {
                Some(s) => s,
                None => return,
            };
            for &(from, to) in ranges {
                // Ignore anything already acknowledged.
                if seq_cmp(to, snd.last_ack) < 0 {
                    continue;
                }
                let from = if seq_cmp(from, snd.last_ack) < 0 { snd.last_ack } else { from };
                // Reject ranges beyond what we ever sent.
                if seq_cmp(to, snd.cur_seq) > 0 {
                    continue;
                }
                fresh_total += snd.loss.insert(from, to);
            }
        }
        {
            let mut stats = self.stats.lock().unwrap();
            stats.on_nak_recv();
            if fresh_total > 0 {
                stats.on_snd_loss(fresh_total);
            }
        }
        if fresh_total > 0 {
            let mut guard = self.cc.lock().unwrap();
            if let Some(cc) = guard.as_mut() {
                let inputs = cc.inputs;
                cc.ctrl.on_loss(&inputs, first, fresh_total);
            }
        }
        // Retransmissions are due immediately.
        self.reschedule_snd(now);
    }

    fn on_drop_req(&self, first: i32, last: i32, now: Instant) {
        let released = {
            let mut guard = self.rcv.lock().unwrap();
            match guard.as_mut() {
                Some(rcv) => {
                    rcv.loss.remove_upto(last);
                    let released = rcv.buffer.drop_range(first, last);
                    if seq_cmp(last, rcv.cur_seq) > 0 {
                        rcv.cur_seq = last;
                    }
                    released
                }
                None => return,
            }
        };
        let count = released.len() as u64;
        if count > 0 {
            self.stats.lock().unwrap().on_rcv_drop(count);
        }
        self.release_bufs(released);
        let _ = now;
        self.rcv_cv.notify_all();
    }

    /// Read one message, honouring blocking mode, receive timeout and the
    /// playout gate.
    pub fn recv_msg(&self, out: &mut [u8]) -> Result<(usize, u32)> {
        let opts = self.options();
        let deadline = clock::deadline_after(opts.rcv_timeout);
        loop {
            let now = Instant::now();
            let mut wake_at: Option<Instant> = None;
            {
                let mut guard = self.rcv.lock().unwrap();
                if let Some(rcv) = guard.as_mut() {
                    if let Some(msg) = rcv.buffer.read_msg(now) {
                        let still_ready = rcv.buffer.is_data_ready(now);
                        drop(guard);
                        if !still_ready {
                            self.update_epoll(EPOLL_IN, false);
                        }
                        let n = msg.copy_into(out);
                        let ts = msg.timestamp;
                        self.release_msg(msg);
                        return Ok((n, ts));
                    }
                    wake_at = rcv.buffer.next_release_time();
                }
            }
            if self.is_broken() || self.is_closing() {
                return Err(Error::ConnLost);
            }
            if !self.is_connected() {
                return Err(Error::NoConn);
            }
            if !opts.rcv_syn {
                return Err(Error::AgainRead);
            }
            if deadline.map_or(false, |d| now >= d) {
                return Err(Error::AgainRead);
            }
            // Sleep until data might be ready: the playout deadline, the
            // receive timeout, a wake from the receive worker — re-evaluated
            // at least every timing quantum.
            let mut until = now + SYN_INTERVAL;
            if let Some(w) = wake_at {
                until = until.min(w);
            }
            if let Some(d) = deadline {
                until = until.min(d);
            }
            clock::wait_until(&self.rcv, &self.rcv_cv, Some(until), |g| {
                g.as_ref().map_or(true, |r| r.buffer.is_data_ready(Instant::now()))
            });
        }
    }

    fn release_msg(&self, msg: Message) {
        if let Some(mux) = self.mux_ref() {
            for part in msg.parts {
                mux.pool.release_buf(part.data);
            }
        }
    }

    fn release_bufs(&self, bufs: Vec<RxData>) {
        if let Some(mux) = self.mux_ref() {
            for rx in bufs {
                mux.pool.release_buf(rx.data);
            }
        }
    }

    pub fn release_raw(&self, buf: Vec<u8>) {
        if let Some(mux) = self.mux_ref() {
            mux.pool.release_buf(buf);
        }
    }

    // -- timers -------------------------------------------------------------

    /// Called from the receive worker roughly every SYN interval.
    pub fn check_timers(self: &Arc<Self>, now: Instant) {
        if !self.is_connected() || self.is_broken() {
            return;
        }
        self.check_ack_timer(now);
        self.check_nak_timer(now);
        self.check_exp_timer(now);
        self.check_keepalive(now);
        self.check_snd_drop(now);
        self.check_rcv_drop(now);
    }

    fn check_ack_timer(self: &Arc<Self>, now: Instant) {
        let mut send: Option<(i32, i32, AckDetail)> = None;
        {
            let mut guard = self.rcv.lock().unwrap();
            let rcv = match guard.as_mut() {
                Some(r) => r,
                None => return,
            };
            if now.duration_since(rcv.last_ack_time) < ACK_INTERVAL {
                return;
            }
            let ack_seq = rcv.buffer.ack_seq();
            if seq_cmp(ack_seq, rcv.last_ack_acked) <= 0 {
                rcv.last_ack_time = now;
                return;
            }
            let ack_no = rcv.ack_no;
            rcv.ack_no = if rcv.ack_no == i32::MAX { 1 } else { rcv.ack_no + 1 };
            rcv.last_ack_acked = ack_seq;
            rcv.last_ack_time = now;
            rcv.pkts_since_ack = 0;
            rcv.ack_window.store(ack_no, ack_seq, now);
            let detail = AckDetail {
                rtt_us: self.rtt_us.load(Relaxed),
                rtt_var_us: self.rtt_var_us.load(Relaxed),
                avail_buf_pkts: rcv.buffer.avail_pkts().max(2) as u32,
                pkt_recv_rate: rcv.arrival.pkt_recv_rate(),
                link_capacity: rcv.arrival.capacity(),
                recv_rate: rcv.arrival.byte_recv_rate(),
            };
            send = Some((ack_no, ack_seq, detail));
        }
        if let Some((ack_no, ack_seq, detail)) = send {
            self.stats.lock().unwrap().on_ack_sent();
            let _ = self.send_ctrl(Control::Ack { ack_no, last_ack_seq: ack_seq, detail: Some(detail) });
        }
    }

    fn check_nak_timer(self: &Arc<Self>, now: Instant) {
        let rtt = Duration::from_micros(self.rtt_us.load(Relaxed) as u64);
        let period = (rtt + MIN_NAK_INTERVAL).max(MIN_NAK_INTERVAL);
        let mut ranges: Option<Vec<LossRange>> = None;
        {
            let mut guard = self.rcv.lock().unwrap();
            let rcv = match guard.as_mut() {
                Some(r) => r,
                None => return,
            };
            if rcv.loss.is_empty() || now.duration_since(rcv.last_nak_time) < period {
                return;
            }
            rcv.last_nak_time = now;
            ranges = Some(rcv.loss.ranges().to_vec());
        }
        if let Some(ranges) = ranges {
            self.stats.lock().unwrap().on_nak_sent();
            let _ = self.send_ctrl(Control::Nak(ranges));
        }
    }

    fn check_exp_timer(self: &Arc<Self>, now: Instant) {
        let opts = self.options();
        let last_rsp = self.last_rsp_us.load(Relaxed);
        let now_us = self.now_rel_us(now);
        let silent = Duration::from_micros(now_us.saturating_sub(last_rsp));

        if silent >= opts.peer_idle_timeout {
            warn!(id = self.id, ?silent, "peer idle timeout");
            self.make_broken(RejectReason::Timeout, now);
            return;
        }

        let exp = self.exp_count.load(Relaxed) as u64;
        let rtt = self.rtt_us.load(Relaxed) as u64;
        let var = self.rtt_var_us.load(Relaxed) as u64;
        let period = Duration::from_micros(exp * (rtt + 4 * var) + SYN_INTERVAL.as_micros() as u64)
            .max(MIN_EXP_INTERVAL);
        if silent < period {
            return;
        }
        self.exp_count.fetch_add(1, Relaxed);

        // With nothing in flight there is nothing to salvage; the keepalive
        // timer maintains the link. Otherwise re-arm the loss list so the
        // whole flight is offered for retransmission.
        let mut rearmed = 0u64;
        {
            let mut guard = self.snd.lock().unwrap();
            if let Some(snd) = guard.as_mut() {
                let flight = seq_off(snd.last_ack, snd.cur_seq) + 1;
                if flight > 0 && snd.loss.is_empty() {
                    rearmed = snd.loss.insert(snd.last_ack, snd.cur_seq);
                }
            }
        }
        if rearmed > 0 {
            trace!(id = self.id, pkts = rearmed, "activity timeout, re-arming flight");
            {
                let mut guard = self.cc.lock().unwrap();
                if let Some(cc) = guard.as_mut() {
                    let inputs = cc.inputs;
                    cc.ctrl.on_timeout(&inputs);
                }
            }
            self.reschedule_snd(now);
        }
    }

    fn check_keepalive(self: &Arc<Self>, now: Instant) {
        let last_snd = self.last_snd_us.load(Relaxed);
        let now_us = self.now_rel_us(now);
        if Duration::from_micros(now_us.saturating_sub(last_snd)) >= KEEPALIVE_INTERVAL {
            let _ = self.send_ctrl(Control::KeepAlive);
        }
    }

    fn check_snd_drop(self: &Arc<Self>, now: Instant) {
        let opts = self.options();
        if !opts.tlpktdrop || !opts.tsbpd {
            return;
        }
        // Budget before the sender writes a message off: the peer's playout
        // latency plus a couple of timing quanta of slack.
        let cutoff = self.effective_snd_latency(&opts) + 2 * SYN_INTERVAL;
        let mut dropped = None;
        {
            let mut guard = self.snd.lock().unwrap();
            if let Some(snd) = guard.as_mut() {
                if let Some(d) = snd.buffer.drop_late(now, Some(cutoff)) {
                    snd.loss.remove_upto(d.last_seq);
                    if seq_cmp(seq_inc(d.last_seq), snd.last_ack) > 0 {
                        snd.last_ack = seq_inc(d.last_seq);
                    }
                    dropped = Some(d);
                }
            }
        }
        if let Some(d) = dropped {
            debug!(id = self.id, first = d.first_seq, last = d.last_seq, "dropping late messages");
            self.stats.lock().unwrap().on_snd_drop(d.pkts, d.bytes);
            let _ = self.send_ctrl(Control::DropReq {
                msgno: d.msgno,
                first: d.first_seq,
                last: d.last_seq,
            });
            self.snd_cv.notify_all();
        }
    }

    fn check_rcv_drop(self: &Arc<Self>, now: Instant) {
        let opts = self.options();
        if !opts.tlpktdrop || !opts.tsbpd {
            return;
        }
        let (skipped, released, ready) = {
            let mut guard = self.rcv.lock().unwrap();
            match guard.as_mut() {
                Some(rcv) => {
                    let (skipped, released) = rcv.buffer.drop_too_late(now);
                    if skipped > 0 {
                        let upto = seq_dec(rcv.buffer.next_expected());
                        rcv.loss.remove_upto(upto);
                    }
                    (skipped, released, rcv.buffer.is_data_ready(now))
                }
                None => return,
            }
        };
        if skipped > 0 {
            self.stats.lock().unwrap().on_rcv_drop(skipped);
            self.release_bufs(released);
            if ready {
                self.rcv_cv.notify_all();
                self.update_epoll(EPOLL_IN, true);
            }
        }
    }

    fn effective_snd_latency(&self, opts: &SocketOptions) -> Duration {
        opts.peer_latency.max(opts.latency)
    }

    // -- shutdown -----------------------------------------------------------

    /// Break the connection (peer timeout, shutdown, internal error).
    pub fn make_broken(&self, reason: RejectReason, now: Instant) {
        if self.broken.swap(true, Relaxed) {
            return;
        }
        {
            let mut st = self.status.lock().unwrap();
            st.status = SocketStatus::Broken;
            if st.reject.is_none() {
                st.reject = Some(reason);
            }
            if st.closure_time.is_none() {
                st.closure_time = Some(now);
            }
        }
        self.status_cv.notify_all();
        self.snd_cv.notify_all();
        self.rcv_cv.notify_all();
        self.update_epoll(EPOLL_IN | EPOLL_OUT | EPOLL_ERR, true);
    }

    /// Application-initiated close. The registry finishes the lifecycle.
    pub fn close(&self, now: Instant) {
        if self.closing.swap(true, Relaxed) {
            return;
        }
        if self.is_connected() && !self.is_broken() {
            let _ = self.send_ctrl(Control::Shutdown);
        }
        {
            let mut st = self.status.lock().unwrap();
            if st.closure_time.is_none() {
                st.closure_time = Some(now);
            }
            let linger = self.opts.lock().unwrap().linger;
            if let Some(l) = linger {
                st.linger_until = Some(now + l);
            }
            if st.status != SocketStatus::Closed {
                st.status = SocketStatus::Closing;
            }
        }
        self.connected.store(false, Relaxed);
        self.status_cv.notify_all();
        self.snd_cv.notify_all();
        self.rcv_cv.notify_all();
        self.update_epoll(EPOLL_IN | EPOLL_OUT | EPOLL_ERR, true);
    }

    /// Block until the send buffer drains or the socket dies (close-synch
    /// for blocking-mode sockets).
    pub fn wait_snd_drain(&self, timeout: Duration) {
        let deadline = Some(Instant::now() + timeout);
        let broken = &self.broken;
        clock::wait_until(&self.snd, &self.snd_cv, deadline, |g| {
            broken.load(Relaxed) || g.as_ref().map_or(true, |s| s.buffer.pkts_queued() == 0)
        });
    }

    // -- wire helpers -------------------------------------------------------

    fn send_ctrl(&self, control: Control) -> Result<()> {
        let mux = self.mux_ref().ok_or(Error::Unbound)?;
        let addr = self.peer_addr().ok_or(Error::NoConn)?;
        let now = Instant::now();
        let start = *self.start_time.lock().unwrap();
        let cp = ControlPacket {
            dst: self.peer_id.load(Relaxed),
            timestamp: timestamp_us(start, now),
            control,
        };
        let mut buf = Vec::with_capacity(64);
        cp.encode(&mut buf);
        mux.channel.send_to(addr, &buf)?;
        self.last_snd_us.store(self.now_rel_us(now), Relaxed);
        Ok(())
    }

    /// Handshake packets go to `dst` explicitly (0 while the peer has no
    /// socket id for us yet).
    pub fn send_handshake(&self, addr: SocketAddr, dst: i32, hs: &Handshake) -> Result<()> {
        let mux = self.mux_ref().ok_or(Error::Unbound)?;
        let now = Instant::now();
        let start = *self.start_time.lock().unwrap();
        let cp = ControlPacket {
            dst,
            timestamp: timestamp_us(start, now),
            control: Control::Handshake(hs.clone()),
        };
        let mut buf = Vec::with_capacity(128);
        cp.encode(&mut buf);
        mux.channel.send_to(addr, &buf)?;
        self.last_snd_us.store(self.now_rel_us(now), Relaxed);
        Ok(())
    }

    fn update_rtt(&self, sample_us: u32) {
        // Standard smoothed estimator: rtt ± var with 1/8 and 1/4 gains.
        let rtt = self.rtt_us.load(Relaxed);
        let var = self.rtt_var_us.load(Relaxed);
        let diff = rtt.abs_diff(sample_us);
        let new_var = (var * 3 + diff) / 4;
        let new_rtt = (rtt * 7 + sample_us) / 8;
        self.rtt_us.store(new_rtt.max(1), Relaxed);
        self.rtt_var_us.store(new_var, Relaxed);
    }

    // -- readiness ----------------------------------------------------------

    pub fn add_epoll_id(&self, eid: i32) {
        self.epoll_ids.lock().unwrap().insert(eid);
        // Publish current state into the fresh descriptor.
        let readable = self.rcv.lock().unwrap().as_ref().map_or(false, |r| {
            r.buffer.is_data_ready(Instant::now())
        });
        let writable = self.is_connected()
            && self.snd.lock().unwrap().as_ref().map_or(false, |s| s.buffer.free_pkts() > 0);
        if readable {
            self.update_epoll(EPOLL_IN, true);
        }
        if writable {
            self.update_epoll(EPOLL_OUT, true);
        }
        if self.is_broken() {
            self.update_epoll(EPOLL_ERR, true);
        }
    }

    pub fn remove_epoll_id(&self, eid: i32) {
        self.epoll_ids.lock().unwrap().remove(&eid);
    }

    pub fn update_epoll(&self, events: u32, enable: bool) {
        let ids = self.epoll_ids.lock().unwrap().clone();
        if !ids.is_empty() {
            self.epoll.update_events(self.id, &ids, events, enable);
        }
    }

    pub fn clear_epoll(&self) {
        let ids = std::mem::take(&mut *self.epoll_ids.lock().unwrap());
        if !ids.is_empty() {
            self.epoll.update_events(self.id, &ids, EPOLL_IN | EPOLL_OUT | EPOLL_ERR, false);
        }
    }

    // -- introspection ------------------------------------------------------

    pub fn perf_stats(&self, clear: bool) -> StatsSnapshot {
        let gauges = Gauges {
            rtt_us: self.rtt_us.load(Relaxed),
            rtt_var_us: self.rtt_var_us.load(Relaxed),
            pacing_us: self.cc_pacing().as_micros() as u64,
            flow_window_pkts: self
                .snd
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |s| s.peer_window),
            flight_pkts: self
                .snd
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |s| seq_off(s.last_ack, s.cur_seq) + 1),
            bandwidth_pps: self
                .rcv
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |r| r.arrival.capacity()),
            avail_snd_buf_pkts: self
                .snd
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |s| s.buffer.free_pkts()),
            avail_rcv_buf_pkts: self
                .rcv
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |r| r.buffer.avail_pkts()),
        };
        self.stats.lock().unwrap().snapshot(clear, gauges)
    }
}

// ---------------------------------------------------------------------------
// Handshake assembly helpers (shared with the listener path)
// ---------------------------------------------------------------------------

pub(crate) fn minute_bucket(_now: Instant) -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() / 60).unwrap_or(0)
}

pub(crate) fn transport_flags(opts: &SocketOptions) -> u32 {
    let mut flags = FLAG_PERIODIC_NAK | FLAG_REXMIT;
    if opts.tsbpd {
        flags |= FLAG_TSBPD_SND | FLAG_TSBPD_RCV;
    }
    if opts.tlpktdrop {
        flags |= FLAG_TLPKTDROP;
    }
    flags
}

pub(crate) fn ext_field_for(opts: &SocketOptions) -> u16 {
    let mut f = HS_EXT_TRANSPORT;
    if opts.passphrase.is_some() {
        f |= HS_EXT_KM;
    }
    if !opts.stream_id.is_empty() || opts.congestion != "live" {
        f |= HS_EXT_CONFIG;
    }
    f
}

/// The extension blocks one side contributes to a conclusion.
pub(crate) fn build_ext_blocks(opts: &SocketOptions, response: bool) -> Vec<HsExt> {
    let cfg = TransportConfig {
        version: TRANSPORT_VERSION,
        flags: transport_flags(opts),
        rcv_latency_ms: opts.latency.as_millis() as u16,
        snd_latency_ms: opts.peer_latency.as_millis() as u16,
    };
    let mut ext = vec![if response { HsExt::TransportRsp(cfg) } else { HsExt::TransportReq(cfg) }];
    if let Some(p) = &opts.passphrase {
        ext.push(HsExt::Km { response, words: km_words(p, opts.pb_key_len) });
    }
    if !opts.stream_id.is_empty() {
        ext.push(HsExt::StreamId(opts.stream_id.clone()));
    }
    if opts.congestion != "live" {
        ext.push(HsExt::Congestion(opts.congestion.clone()));
    }
    ext
}

/// Keying-material stand-in: a salted digest both ends can compare. The
/// actual cipher is outside this crate.
pub(crate) fn km_words(passphrase: &str, key_len: usize) -> Vec<u32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut words = vec![key_len as u32];
    for salt in 0u32..4 {
        let mut h = DefaultHasher::new();
        salt.hash(&mut h);
        passphrase.hash(&mut h);
        words.push(h.finish() as u32);
    }
    words
}

/// The latency this side must apply to received data: the larger of its own
/// setting and what the peer demands.
pub(crate) fn negotiated_rcv_latency(
    opts: &SocketOptions,
    peer_rsp: Option<&TransportConfig>,
) -> Duration {
    let peer_snd = peer_rsp.map_or(Duration::ZERO, |c| Duration::from_millis(c.snd_latency_ms as u64));
    opts.latency.max(peer_snd)
}

pub(crate) fn negotiated_rcv_latency_from_req(
    opts: &SocketOptions,
    peer_req: Option<&TransportConfig>,
) -> Duration {
    let peer_snd = peer_req.map_or(Duration::ZERO, |c| Duration::from_millis(c.snd_latency_ms as u64));
    opts.latency.max(peer_snd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoll::EpollService;

    fn conn(opts: SocketOptions) -> Arc<Connection> {
        Connection::new(
            -100,
            opts,
            Arc::new(EpollService::new()),
            Arc::new(CcRegistry::new()),
            7,
        )
    }

    fn connect_pair_state(c: &Arc<Connection>, own_isn: i32, peer_isn: i32) {
        c.setup_connected(
            HandshakeResult {
                peer_id: -200,
                peer_isn,
                own_isn,
                peer_flight: 8192,
                rcv_latency: Duration::from_millis(120),
                mss: 1500,
            },
            Instant::now(),
        );
    }

    #[test]
    fn status_walk_through_connect() {
        let c = conn(SocketOptions::default());
        assert_eq!(c.status(), SocketStatus::Init);
        connect_pair_state(&c, 1000, 5000);
        assert_eq!(c.status(), SocketStatus::Connected);
        assert!(c.is_connected());
        c.make_broken(RejectReason::Timeout, Instant::now());
        assert_eq!(c.status(), SocketStatus::Broken);
        assert_eq!(c.reject_reason(), Some(RejectReason::Timeout));
    }

    #[test]
    fn send_on_closed_socket_fails_with_connfail() {
        let c = conn(SocketOptions::default());
        connect_pair_state(&c, 1000, 5000);
        c.close(Instant::now());
        assert_eq!(c.send_msg(b"x", None, true), Err(Error::ConnFail));
    }

    #[test]
    fn pack_data_emits_in_sequence_order() {
        let mut opts = SocketOptions::default();
        opts.tsbpd = false;
        let c = conn(opts);
        connect_pair_state(&c, 100, 900);
        // No mux: queue directly into the buffer.
        {
            let mut snd = c.snd.lock().unwrap();
            let s = snd.as_mut().unwrap();
            s.buffer.add(b"one", None, true, Instant::now()).unwrap();
            s.buffer.add(b"two", None, true, Instant::now()).unwrap();
        }
        *c.peer_addr.lock().unwrap() = Some(([127, 0, 0, 1], 1).into());
        // pack_data requires a mux for rescheduling side effects only on
        // send_msg; here it reads the buffer directly.
        let mut scratch = Vec::new();
        let (_, _next) = c.pack_data(&mut scratch, Instant::now()).unwrap();
        let hdr = DataHeader::decode(&scratch).unwrap();
        assert_eq!(hdr.seq, 100);
        assert_eq!(&scratch[crate::packet::HEADER_SIZE..], b"one");
        let (_, _) = c.pack_data(&mut scratch, Instant::now()).unwrap();
        let hdr2 = DataHeader::decode(&scratch).unwrap();
        assert_eq!(hdr2.seq, 101);
    }

    #[test]
    fn incoming_gap_is_recorded_for_nak() {
        let mut opts = SocketOptions::default();
        opts.tsbpd = false;
        let c = conn(opts);
        connect_pair_state(&c, 100, 900);
        let mk = |seq: i32| {
            let hdr = DataHeader {
                seq,
                msg: crate::packet::MsgInfo::new(crate::packet::PacketPosition::Only, true, seq),
                timestamp: 0,
                dst: -100,
            };
            let mut data = vec![0u8; crate::packet::HEADER_SIZE];
            data.extend_from_slice(b"payload");
            (hdr, data)
        };
        let (h, d) = mk(900);
        assert!(c.process_data(h, d, Instant::now()).is_none());
        // 901, 902 never arrive; 903 exposes the hole.
        let (h, d) = mk(903);
        assert!(c.process_data(h, d, Instant::now()).is_none());
        {
            let rcv = c.rcv.lock().unwrap();
            let r = rcv.as_ref().unwrap();
            assert_eq!(r.loss.ranges(), &[(901, 902)]);
        }
        // A retransmit of 901 clears part of the report.
        let (h, d) = mk(901);
        assert!(c.process_data(h, d, Instant::now()).is_none());
        {
            let rcv = c.rcv.lock().unwrap();
            assert_eq!(rcv.as_ref().unwrap().loss.ranges(), &[(902, 902)]);
        }
    }

    #[test]
    fn wrong_destination_is_dropped() {
        let c = conn(SocketOptions::default());
        connect_pair_state(&c, 100, 900);
        let hdr = DataHeader {
            seq: 900,
            msg: crate::packet::MsgInfo::new(crate::packet::PacketPosition::Only, true, 1),
            timestamp: 0,
            dst: -999, // not us
        };
        let data = vec![0u8; crate::packet::HEADER_SIZE + 4];
        assert!(c.process_data(hdr, data, Instant::now()).is_some());
        assert!(!c.rcv_has_data());
    }

    #[test]
    fn ack_releases_send_buffer_and_updates_rtt() {
        let mut opts = SocketOptions::default();
        opts.tsbpd = false;
        let c = conn(opts);
        connect_pair_state(&c, 100, 900);
        {
            let mut snd = c.snd.lock().unwrap();
            let s = snd.as_mut().unwrap();
            for _ in 0..3 {
                s.buffer.add(b"m", None, true, Instant::now()).unwrap();
            }
        }
        *c.peer_addr.lock().unwrap() = Some(([127, 0, 0, 1], 1).into());
        let mut scratch = Vec::new();
        for _ in 0..3 {
            c.pack_data(&mut scratch, Instant::now()).unwrap();
        }
        let cp = ControlPacket {
            dst: -100,
            timestamp: 0,
            control: Control::Ack {
                ack_no: 1,
                last_ack_seq: 102,
                detail: Some(AckDetail { rtt_us: 40_000, ..AckDetail::default() }),
            },
        };
        c.process_ctrl(&cp, Instant::now());
        {
            let snd = c.snd.lock().unwrap();
            let s = snd.as_ref().unwrap();
            assert_eq!(s.last_ack, 102);
            assert_eq!(s.buffer.pkts_queued(), 1);
        }
        // Smoothed toward the 40 ms sample from the 100 ms prior.
        let rtt = c.rtt_us.load(Relaxed);
        assert!(rtt < 100_000 && rtt > 40_000, "rtt {rtt}");
    }

    #[test]
    fn nak_schedules_retransmission_first() {
        let mut opts = SocketOptions::default();
        opts.tsbpd = false;
        let c = conn(opts);
        connect_pair_state(&c, 100, 900);
        {
            let mut snd = c.snd.lock().unwrap();
            let s = snd.as_mut().unwrap();
            for _ in 0..4 {
                s.buffer.add(b"m", None, true, Instant::now()).unwrap();
            }
        }
        *c.peer_addr.lock().unwrap() = Some(([127, 0, 0, 1], 1).into());
        let mut scratch = Vec::new();
        for _ in 0..4 {
            c.pack_data(&mut scratch, Instant::now()).unwrap();
        }
        let cp = ControlPacket {
            dst: -100,
            timestamp: 0,
            control: Control::Nak(vec![(101, 102)]),
        };
        eprintln!("DEBUG before process_ctrl");
        c.process_ctrl(&cp, Instant::now());
        eprintln!("DEBUG after process_ctrl");
        // The next two emissions must be the retransmits, flagged as such.
        let (_, _) = c.pack_data(&mut scratch, Instant::now()).unwrap();
        eprintln!("DEBUG after first pack_data post-nak");
        let h = DataHeader::decode(&scratch).unwrap();
        assert_eq!(h.seq, 101);
        assert!(h.msg.retransmitted);
        let (_, _) = c.pack_data(&mut scratch, Instant::now()).unwrap();
        eprintln!("DEBUG after second pack_data post-nak");
        assert_eq!(DataHeader::decode(&scratch).unwrap().seq, 102);
        let snap = c.perf_stats(false);
        assert_eq!(snap.total.pkts_retransmitted, 2);
        assert_eq!(snap.total.naks_recv, 1);
    }

    #[test]
    fn shutdown_control_breaks_the_connection() {
        let c = conn(SocketOptions::default());
        connect_pair_state(&c, 100, 900);
        let cp = ControlPacket { dst: -100, timestamp: 0, control: Control::Shutdown };
        c.process_ctrl(&cp, Instant::now());
        assert!(c.is_broken());
        assert_eq!(c.reject_reason(), Some(RejectReason::Close));
    }

    #[test]
    fn peer_spec_packs_id_and_isn() {
        let spec = Connection::peer_spec(3, 77);
        assert_eq!(spec, (3u64 << 30) | 77);
        assert_ne!(Connection::peer_spec(3, 78), spec);
    }

    #[test]
    fn km_words_differ_by_passphrase() {
        assert_ne!(km_words("correct horse", 16), km_words("battery staple", 16));
        assert_eq!(km_words("correct horse", 16), km_words("correct horse", 16));
    }
}

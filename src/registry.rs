//! The socket registry: handle table, listener accept queues, multiplexer
//! map with reference counting, and the garbage collector that finishes
//! every socket's lifecycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, HandshakeResult, SocketStatus};
use crate::cc::CcRegistry;
use crate::epoll::{EpollService, EPOLL_IN};
use crate::error::{Error, Result};
use crate::handshake::{
    make_cookie, Handshake, HsExt, HsReqType, RejectReason, TransportConfig,
    HS_EXT_TRANSPORT, TRANSPORT_VERSION,
};
use crate::multiplexer::{Multiplexer, MuxKey};
use crate::options::{SockOpt, SocketOptions};
use crate::packet::{Control, ControlPacket};
use crate::seq;
use crate::stats::StatsSnapshot;

/// Extra life a broken listener gets, in case a late handshake arrives.
const LISTENER_GRACE: Duration = Duration::from_secs(3);
/// A closed socket lingers this long before final removal.
const REMOVAL_DELAY: Duration = Duration::from_secs(1);

/// Decides whether an incoming connection is admitted, and with which
/// rejection code refused.
pub type AcceptHook =
    Box<dyn Fn(&Handshake, SocketAddr) -> std::result::Result<(), RejectReason> + Send + Sync>;

// ---------------------------------------------------------------------------
// Listener accept queue
// ---------------------------------------------------------------------------

struct AcceptInner {
    queued: VecDeque<i32>,
    accepted: HashSet<i32>,
    backlog: usize,
    closed: bool,
}

/// Pending connections of one listener, FIFO by arrival.
pub struct AcceptQueue {
    inner: Mutex<AcceptInner>,
    cv: Condvar,
}

impl AcceptQueue {
    fn new(backlog: usize) -> Arc<AcceptQueue> {
        Arc::new(AcceptQueue {
            inner: Mutex::new(AcceptInner {
                queued: VecDeque::new(),
                accepted: HashSet::new(),
                backlog,
                closed: false,
            }),
            cv: Condvar::new(),
        })
    }

    /// Err means the backlog is full.
    fn push(&self, id: i32) -> std::result::Result<(), ()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.queued.len() >= inner.backlog {
            return Err(());
        }
        inner.queued.push_back(id);
        self.cv.notify_all();
        Ok(())
    }

    fn pop(&self, blocking: bool, timeout: Option<Duration>) -> Result<i32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(Error::NoListen);
            }
            if let Some(id) = inner.queued.pop_front() {
                inner.accepted.insert(id);
                return Ok(id);
            }
            if !blocking {
                return Err(Error::AgainRead);
            }
            match deadline {
                None => inner = self.cv.wait(inner).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::AgainRead);
                    }
                    let (g, _) = self.cv.wait_timeout(inner, d - now).unwrap();
                    inner = g;
                }
            }
        }
    }

    fn unlink(&self, id: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.queued.retain(|&q| q != id);
        inner.accepted.remove(&id);
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.cv.notify_all();
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queued.is_empty()
    }

    fn queued_len(&self) -> usize {
        self.inner.lock().unwrap().queued.len()
    }

    fn drain_queued(&self) -> Vec<i32> {
        let mut inner = self.inner.lock().unwrap();
        inner.queued.drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct SocketMaps {
    active: HashMap<i32, Arc<Connection>>,
    closed: HashMap<i32, Arc<Connection>>,
    peer_rec: HashMap<u64, HashSet<i32>>,
}

struct GcControl {
    stop: Mutex<bool>,
    cv: Condvar,
}

pub struct Registry {
    sockets: Mutex<SocketMaps>,
    listeners: Mutex<HashMap<i32, Arc<AcceptQueue>>>,
    accept_hooks: Mutex<HashMap<i32, AcceptHook>>,
    muxes: Mutex<HashMap<usize, Multiplexer>>,
    next_mux_id: AtomicUsize,
    id_gen: Mutex<i32>,
    epoll: Arc<EpollService>,
    cc: Arc<CcRegistry>,
    secret: u64,
    gc: GcControl,
    gc_handle: Mutex<Option<JoinHandle<()>>>,
    self_weak: Weak<Registry>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        let mut rng = rand::thread_rng();
        let seed: i32 = rng.gen_range(1..(1 << 30));
        let registry = Arc::new_cyclic(|weak| Registry {
            sockets: Mutex::new(SocketMaps {
                active: HashMap::new(),
                closed: HashMap::new(),
                peer_rec: HashMap::new(),
            }),
            listeners: Mutex::new(HashMap::new()),
            accept_hooks: Mutex::new(HashMap::new()),
            muxes: Mutex::new(HashMap::new()),
            next_mux_id: AtomicUsize::new(1),
            id_gen: Mutex::new(seed),
            epoll: Arc::new(EpollService::new()),
            cc: Arc::new(CcRegistry::new()),
            secret: rng.gen(),
            gc: GcControl { stop: Mutex::new(false), cv: Condvar::new() },
            gc_handle: Mutex::new(None),
            self_weak: weak.clone(),
        });
        registry.start_gc();
        info!("transport runtime started");
        registry
    }

    fn start_gc(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("rvl-gc".into())
            .spawn(move || loop {
                let Some(registry) = weak.upgrade() else { break };
                {
                    let stop = registry.gc.stop.lock().unwrap();
                    if *stop {
                        break;
                    }
                    let (guard, _) = registry.gc.cv.wait_timeout(stop, Duration::from_secs(1)).unwrap();
                    if *guard {
                        break;
                    }
                }
                registry.check_broken_sockets(Instant::now());
            })
            .expect("failed to spawn gc thread");
        *self.gc_handle.lock().unwrap() = Some(handle);
    }

    pub fn epoll(&self) -> &Arc<EpollService> {
        &self.epoll
    }

    pub fn cc_registry(&self) -> &Arc<CcRegistry> {
        &self.cc
    }

    // -- lookup -------------------------------------------------------------

    fn locate(&self, id: i32) -> Result<Arc<Connection>> {
        self.sockets
            .lock()
            .unwrap()
            .active
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidSock)
    }

    fn locate_any(&self, id: i32) -> Result<Arc<Connection>> {
        let maps = self.sockets.lock().unwrap();
        maps.active
            .get(&id)
            .or_else(|| maps.closed.get(&id))
            .cloned()
            .ok_or(Error::InvalidSock)
    }

    /// Crate-internal lookup for the API layer (epoll wiring).
    pub(crate) fn connection(&self, id: i32) -> Result<Arc<Connection>> {
        self.locate_any(id)
    }

    pub fn sockstate(&self, id: i32) -> SocketStatus {
        let maps = self.sockets.lock().unwrap();
        if let Some(c) = maps.active.get(&id) {
            return c.status();
        }
        if let Some(c) = maps.closed.get(&id) {
            return if c.linger_until().is_some() {
                SocketStatus::Closing
            } else {
                SocketStatus::Closed
            };
        }
        SocketStatus::Nonexist
    }

    // -- socket creation and options ----------------------------------------

    fn next_id(&self) -> i32 {
        let mut gen = self.id_gen.lock().unwrap();
        *gen -= 1;
        if *gen <= 0 {
            *gen = (1 << 30) - 1;
        }
        *gen
    }

    pub fn new_socket(&self, opts: SocketOptions) -> Result<i32> {
        opts.validate()?;
        let id = self.next_id();
        let conn = Connection::new(id, opts, self.epoll.clone(), self.cc.clone(), self.secret);
        self.sockets.lock().unwrap().active.insert(id, conn);
        debug!(id, "socket created");
        Ok(id)
    }

    pub fn set_option(&self, id: i32, opt: SockOpt) -> Result<()> {
        let conn = self.locate(id)?;
        let status = conn.status();
        let bound = !matches!(status, SocketStatus::Init);
        let connected = matches!(
            status,
            SocketStatus::Connecting | SocketStatus::Connected | SocketStatus::Listening
        );
        if opt.pre_bind_only() && bound {
            return Err(Error::IsConnected);
        }
        if opt.pre_connect_only() && connected {
            return Err(Error::IsConnected);
        }
        let mut opts = conn.opts.lock().unwrap();
        let mut updated = opts.clone();
        opt.apply(&mut updated);
        updated.validate()?;
        *opts = updated;
        Ok(())
    }

    pub fn get_options(&self, id: i32) -> Result<SocketOptions> {
        Ok(self.locate_any(id)?.options())
    }

    pub fn reject_reason(&self, id: i32) -> Result<Option<RejectReason>> {
        Ok(self.locate_any(id)?.reject_reason())
    }

    // -- bind ---------------------------------------------------------------

    pub fn bind(&self, id: i32, addr: SocketAddr) -> Result<()> {
        let conn = self.locate(id)?;
        if conn.status() != SocketStatus::Init {
            return Err(Error::IsConnected);
        }
        self.attach_mux(&conn, addr, None)
    }

    pub fn bind_udp(&self, id: i32, udp: std::net::UdpSocket) -> Result<()> {
        let conn = self.locate(id)?;
        if conn.status() != SocketStatus::Init {
            return Err(Error::IsConnected);
        }
        let addr = udp.local_addr().map_err(|e| Error::SetupRes(e.to_string()))?;
        self.attach_mux(&conn, addr, Some(udp))
    }

    /// Find a shareable multiplexer or create one, and hook the socket on.
    fn attach_mux(
        &self,
        conn: &Arc<Connection>,
        addr: SocketAddr,
        udp: Option<std::net::UdpSocket>,
    ) -> Result<()> {
        let opts = conn.options();
        let key = MuxKey::from_opts(addr, &opts);
        let mut muxes = self.muxes.lock().unwrap();

        if udp.is_none() && addr.port() != 0 && opts.reuse_addr {
            let found = muxes
                .values_mut()
                .find(|m| m.key.reusable && m.key == key);
            if let Some(m) = found {
                m.refs += 1;
                let (mux_ref, local) = (m.mux_ref(), m.local_addr());
                drop(muxes);
                conn.set_opened(mux_ref, local);
                debug!(id = conn.id(), mux = mux_ref_id(conn), "multiplexer reused");
                return Ok(());
            }
        }

        let mux_id = self.next_mux_id.fetch_add(1, Relaxed);
        let mut mux = match udp {
            Some(udp) => Multiplexer::attach(mux_id, udp, &opts, self.self_weak.clone())?,
            None => Multiplexer::open(mux_id, addr, &opts, self.self_weak.clone())?,
        };
        mux.refs = 1;
        let (mux_ref, local) = (mux.mux_ref(), mux.local_addr());
        muxes.insert(mux_id, mux);
        drop(muxes);
        conn.set_opened(mux_ref, local);
        debug!(id = conn.id(), mux = mux_id, %local, "socket bound");
        Ok(())
    }

    // -- listen / accept ----------------------------------------------------

    pub fn listen(&self, id: i32, backlog: usize) -> Result<()> {
        if backlog == 0 {
            return Err(Error::InvalidParam);
        }
        let conn = self.locate(id)?;
        let opts = conn.options();
        if opts.rendezvous {
            return Err(Error::IsRendezvous);
        }
        match conn.status() {
            SocketStatus::Opened => {}
            SocketStatus::Init => return Err(Error::Unbound),
            SocketStatus::Listening => return Ok(()),
            _ => return Err(Error::IsConnected),
        }
        let mux = conn.mux_ref().ok_or(Error::Unbound)?;
        mux.rcv_q.set_listener(conn.clone())?;
        self.listeners.lock().unwrap().insert(id, AcceptQueue::new(backlog));
        conn.set_listening();
        debug!(id, backlog, "listening");
        Ok(())
    }

    pub fn accept(&self, id: i32) -> Result<(i32, SocketAddr)> {
        let listener = self.locate(id)?;
        if !listener.is_listening() {
            return Err(Error::NoListen);
        }
        let aq = self
            .listeners
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NoListen)?;
        let opts = listener.options();
        let accepted = aq.pop(opts.rcv_syn, opts.rcv_timeout)?;
        if aq.is_empty() {
            listener.update_epoll(EPOLL_IN, false);
        }
        let conn = self.locate(accepted)?;
        let peer = conn.peer_addr().ok_or(Error::NoConn)?;
        debug!(listener = id, accepted, %peer, "connection accepted");
        Ok((accepted, peer))
    }

    pub fn set_accept_hook(&self, id: i32, hook: AcceptHook) -> Result<()> {
        self.locate(id)?;
        self.accept_hooks.lock().unwrap().insert(id, hook);
        Ok(())
    }

    // -- connect ------------------------------------------------------------

    pub fn connect(&self, id: i32, addr: SocketAddr, forced_isn: i32) -> Result<()> {
        let conn = self.locate(id)?;
        let opts = conn.options();
        match conn.status() {
            SocketStatus::Init => {
                if opts.rendezvous {
                    return Err(Error::RendezvousUnbound);
                }
                self.attach_mux(&conn, ephemeral_for(addr), None)?;
            }
            SocketStatus::Opened => {}
            SocketStatus::Listening => return Err(Error::NoListen),
            SocketStatus::Connecting | SocketStatus::Connected => {
                return Err(Error::IsConnected)
            }
            _ => return Err(Error::InvalidOp),
        }

        let now = Instant::now();
        conn.set_peer_addr(addr);
        conn.start_connect(addr, forced_isn, now)?;
        let mux = conn.mux_ref().ok_or(Error::Unbound)?;
        let deadline = conn.connect_deadline().unwrap_or(now + opts.connect_timeout);
        mux.rcv_q.rendezvous().insert(id, conn.clone(), addr, deadline);
        // First handshake goes out through the same path retries use.
        let _ = conn.process_async_connect(None, now);

        if opts.rcv_syn {
            let res = conn.wait_connected();
            if res.is_err() {
                mux.rcv_q.rendezvous().remove(id);
            }
            res
        } else {
            Ok(())
        }
    }

    // -- data plane delegates ----------------------------------------------

    pub fn send(&self, id: i32, data: &[u8]) -> Result<usize> {
        let conn = self.locate_any(id)?;
        conn.send_msg(data, None, true)
    }

    pub fn send_msg(
        &self,
        id: i32,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
    ) -> Result<usize> {
        let conn = self.locate_any(id)?;
        conn.send_msg(data, ttl, in_order)
    }

    pub fn recv(&self, id: i32, out: &mut [u8]) -> Result<usize> {
        Ok(self.locate_any(id)?.recv_msg(out)?.0)
    }

    pub fn recv_msg(&self, id: i32, out: &mut [u8]) -> Result<(usize, u32)> {
        self.locate_any(id)?.recv_msg(out)
    }

    pub fn sock_name(&self, id: i32) -> Result<SocketAddr> {
        self.locate_any(id)?.self_addr().ok_or(Error::Unbound)
    }

    pub fn peer_name(&self, id: i32) -> Result<SocketAddr> {
        self.locate_any(id)?.peer_addr().ok_or(Error::NoConn)
    }

    pub fn stats(&self, id: i32, clear: bool) -> Result<StatsSnapshot> {
        Ok(self.locate_any(id)?.perf_stats(clear))
    }

    // -- close and GC -------------------------------------------------------

    pub fn close(&self, id: i32) -> Result<()> {
        let conn = self.locate_any(id)?;
        let now = Instant::now();

        if conn.is_listening() {
            // Free the port for an immediate re-bind and fail accepts.
            if let Some(mux) = conn.mux_ref() {
                mux.rcv_q.clear_listener(id);
            }
            if let Some(aq) = self.listeners.lock().unwrap().get(&id).cloned() {
                aq.close();
            }
            self.accept_hooks.lock().unwrap().remove(&id);
            conn.close(now);
            conn.make_broken(RejectReason::Close, now);
            // The GC moves it to the closed set after the listener grace.
            return Ok(());
        }

        let was_connected = conn.is_connected();
        conn.close(now);

        // Close synchronization: a blocking-mode sender drains its buffer
        // within the linger budget before close returns.
        let opts = conn.options();
        if was_connected && opts.snd_syn {
            if let Some(linger) = opts.linger {
                conn.wait_snd_drain(linger);
            }
        }

        {
            let mut maps = self.sockets.lock().unwrap();
            if let Some(c) = maps.active.remove(&id) {
                maps.closed.insert(id, c);
            }
        }
        if let Some(mux) = conn.mux_ref() {
            mux.snd_q.remove(id);
        }
        debug!(id, "socket closed");
        Ok(())
    }

    /// One GC pass (public for the worker and for tests).
    pub fn check_broken_sockets(&self, now: Instant) {
        let mut to_close: Vec<i32> = Vec::new();
        {
            let maps = self.sockets.lock().unwrap();
            for (&id, conn) in maps.active.iter() {
                if !conn.is_broken() && !conn.is_closing() {
                    continue;
                }
                if conn.is_listening() {
                    let waited = conn
                        .closure_time()
                        .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
                    if waited < LISTENER_GRACE {
                        continue;
                    }
                } else if conn.rcv_has_data() && conn.consume_broken_grace() {
                    // Unread data buys a broken socket a little more time.
                    continue;
                }
                to_close.push(id);
            }
        }

        for id in &to_close {
            let conn = {
                let mut maps = self.sockets.lock().unwrap();
                match maps.active.remove(id) {
                    Some(c) => {
                        maps.closed.insert(*id, c.clone());
                        c
                    }
                    None => continue,
                }
            };
            conn.mark_closed(now);
            let parent = conn.listen_parent();
            if parent != 0 {
                if let Some(aq) = self.listeners.lock().unwrap().get(&parent).cloned() {
                    aq.unlink(*id);
                }
            }
        }

        let mut removable: Vec<i32> = Vec::new();
        {
            let maps = self.sockets.lock().unwrap();
            for (&id, conn) in maps.closed.iter() {
                if let Some(linger) = conn.linger_until() {
                    if conn.snd_pending_pkts() == 0 || now >= linger {
                        conn.mark_closing_now(now);
                    }
                    continue;
                }
                let overdue = conn
                    .closure_time()
                    .map_or(true, |t| now.saturating_duration_since(t) > REMOVAL_DELAY);
                if overdue && !conn.is_on_rcv_list() {
                    removable.push(id);
                }
            }
        }
        for id in removable {
            self.remove_socket(id, now);
        }
    }

    /// Final teardown of one closed socket.
    fn remove_socket(&self, id: i32, now: Instant) {
        let Some(conn) = self.sockets.lock().unwrap().closed.remove(&id) else {
            return;
        };
        debug!(id, "removing socket");

        // A listener takes its never-accepted children with it.
        if conn.is_listening() {
            let aq = self.listeners.lock().unwrap().remove(&id);
            if let Some(aq) = aq {
                for child_id in aq.drain_queued() {
                    let child = {
                        let mut maps = self.sockets.lock().unwrap();
                        maps.active.remove(&child_id).map(|c| {
                            maps.closed.insert(child_id, c.clone());
                            c
                        })
                    };
                    if let Some(child) = child {
                        child.make_broken(RejectReason::Close, now);
                        child.close(now);
                        child.mark_closed(now);
                    }
                }
            }
            self.accept_hooks.lock().unwrap().remove(&id);
        }

        // Peer-spec index.
        {
            let mut maps = self.sockets.lock().unwrap();
            let spec = Connection::peer_spec(conn.peer_socket_id(), conn.peer_isn());
            if let Some(set) = maps.peer_rec.get_mut(&spec) {
                set.remove(&id);
                if set.is_empty() {
                    maps.peer_rec.remove(&spec);
                }
            }
        }

        // Events left behind would wake poll waiters for a ghost socket.
        conn.clear_epoll();

        let Some(mux) = conn.mux_ref() else {
            return;
        };
        mux.snd_q.remove(id);
        mux.rcv_q.remove_connection(id);

        let dead = {
            let mut muxes = self.muxes.lock().unwrap();
            match muxes.get_mut(&mux.id) {
                Some(m) => {
                    m.refs -= 1;
                    if m.refs == 0 {
                        muxes.remove(&mux.id)
                    } else {
                        None
                    }
                }
                None => {
                    error!(mux = mux.id, "IPE: multiplexer missing while unref-ing socket");
                    None
                }
            }
        };
        if let Some(dead) = dead {
            // Workers are joined outside every registry lock.
            dead.shutdown();
            debug!(mux = dead.id, "multiplexer destroyed");
        }
    }

    // -- listener wire path --------------------------------------------------

    /// Handle a handshake addressed to the listener (destination id zero).
    pub fn process_connect_request(
        &self,
        listener: &Arc<Connection>,
        cp: &ControlPacket,
        addr: SocketAddr,
    ) {
        let Control::Handshake(hs) = &cp.control else {
            return;
        };
        if listener.is_broken() || listener.is_closing() {
            return;
        }
        match hs.req_type {
            HsReqType::Induction => {
                let cookie = make_cookie(addr, self.secret, crate::connection::minute_bucket(Instant::now()));
                let resp = Handshake::induction_response(hs, cookie, addr);
                if let Err(e) = listener.send_handshake(addr, hs.socket_id, &resp) {
                    debug!(error = %e, "induction response failed");
                }
            }
            HsReqType::Conclusion => self.handle_conclusion(listener, hs, addr),
            _ => {}
        }
    }

    fn handle_conclusion(&self, listener: &Arc<Connection>, hs: &Handshake, addr: SocketAddr) {
        let now = Instant::now();
        // Stateless cookie verification, current and previous minute.
        let bucket = crate::connection::minute_bucket(now);
        let valid = hs.cookie == make_cookie(addr, self.secret, bucket)
            || hs.cookie == make_cookie(addr, self.secret, bucket.wrapping_sub(1));
        if !valid {
            debug!(%addr, "conclusion with a stale or forged cookie dropped");
            return;
        }

        // A repeated conclusion for an already-accepted connection: the
        // peer missed our response; answer again without creating anything.
        let spec = Connection::peer_spec(hs.socket_id, hs.isn);
        let existing = {
            let maps = self.sockets.lock().unwrap();
            maps.peer_rec
                .get(&spec)
                .and_then(|set| set.iter().next().copied())
                .and_then(|id| maps.active.get(&id).cloned())
        };
        if let Some(conn) = existing {
            if conn.peer_addr() == Some(addr) {
                let resp = conclusion_response(&conn, hs);
                let _ = listener.send_handshake(addr, hs.socket_id, &resp);
                return;
            }
        }

        let l_opts = listener.options();
        let reject = |reason: RejectReason| {
            warn!(%addr, ?reason, "connection refused");
            let rej = Handshake::rejection(hs, reason);
            let _ = listener.send_handshake(addr, hs.socket_id, &rej);
        };

        // Keying-material gate: both sides must agree on the secret.
        let caller_km = hs.ext.iter().find_map(|e| match e {
            HsExt::Km { response: false, words } => Some(words.clone()),
            _ => None,
        });
        match (&l_opts.passphrase, &caller_km) {
            (Some(p), Some(words)) => {
                if crate::connection::km_words(p, l_opts.pb_key_len) != *words {
                    return reject(RejectReason::BadSecret);
                }
            }
            (Some(_), None) | (None, Some(_)) => return reject(RejectReason::Unsecure),
            (None, None) => {}
        }

        // Congestion controllers must match.
        let caller_cc = hs.congestion().unwrap_or("live");
        if caller_cc != l_opts.congestion {
            return reject(RejectReason::Congestion);
        }

        // Application veto.
        if let Some(hook) = self.accept_hooks.lock().unwrap().get(&listener.id()) {
            if let Err(reason) = hook(hs, addr) {
                return reject(reason);
            }
        }

        let Some(aq) = self.listeners.lock().unwrap().get(&listener.id()).cloned() else {
            return reject(RejectReason::Close);
        };
        if aq.queued_len() >= aq.inner.lock().unwrap().backlog {
            return reject(RejectReason::Backlog);
        }

        let Some(listener_mux) = listener.mux_ref() else {
            error!(id = listener.id(), "IPE: listener has no multiplexer");
            return reject(RejectReason::Ipe);
        };

        // Build the accepted socket, inheriting the listener's options with
        // the latency demands merged in.
        let mut opts = l_opts.clone();
        if let Some(req) = hs.transport_req() {
            opts.latency = opts
                .latency
                .max(Duration::from_millis(req.snd_latency_ms as u64));
            opts.peer_latency = opts
                .peer_latency
                .max(Duration::from_millis(req.rcv_latency_ms as u64));
            opts.tsbpd = opts.tsbpd && (req.flags & crate::handshake::FLAG_TSBPD_SND != 0);
        }
        opts.mss = opts.mss.min(hs.mss as usize);
        if let Some(sid) = hs.stream_id() {
            opts.stream_id = sid.to_string();
        }

        let new_id = self.next_id();
        let conn = Connection::new(new_id, opts.clone(), self.epoll.clone(), self.cc.clone(), self.secret);
        let own_isn = rand::thread_rng().gen_range(0..seq::MAX_SEQ);
        conn.set_peer_addr(addr);
        conn.set_listen_parent(listener.id());
        conn.set_opened(listener_mux.clone(), listener.self_addr().unwrap_or(addr));

        {
            let mut maps = self.sockets.lock().unwrap();
            maps.active.insert(new_id, conn.clone());
            maps.peer_rec.entry(spec).or_default().insert(new_id);
        }
        {
            let mut muxes = self.muxes.lock().unwrap();
            if let Some(m) = muxes.get_mut(&listener_mux.id) {
                m.refs += 1;
            }
        }

        conn.setup_connected(
            HandshakeResult {
                peer_id: hs.socket_id,
                peer_isn: hs.isn,
                own_isn,
                peer_flight: hs.flight_flag as i32,
                rcv_latency: opts.latency,
                mss: opts.mss,
            },
            now,
        );

        if aq.push(new_id).is_err() {
            // Raced to full between the check and the push.
            self.close(new_id).ok();
            return reject(RejectReason::Backlog);
        }
        listener.update_epoll(EPOLL_IN, true);

        let resp = conclusion_response(&conn, hs);
        let _ = listener.send_handshake(addr, hs.socket_id, &resp);
        info!(listener = listener.id(), id = new_id, %addr, "connection admitted");
    }

    // -- shutdown -----------------------------------------------------------

    pub fn shutdown(&self) {
        info!("transport runtime shutting down");
        {
            let mut stop = self.gc.stop.lock().unwrap();
            *stop = true;
            self.gc.cv.notify_all();
        }
        if let Some(h) = self.gc_handle.lock().unwrap().take() {
            let _ = h.join();
        }

        let active: Vec<i32> = self.sockets.lock().unwrap().active.keys().copied().collect();
        for id in active {
            let _ = self.close(id);
        }

        // Drain with GC passes; anything stubborn is forced out.
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            self.check_broken_sockets(Instant::now() + REMOVAL_DELAY + Duration::from_secs(4));
            let maps = self.sockets.lock().unwrap();
            if maps.active.is_empty() && maps.closed.is_empty() {
                break;
            }
            drop(maps);
            if Instant::now() >= deadline {
                warn!("sockets still present at shutdown, forcing removal");
                let ids: Vec<i32> = {
                    let mut maps = self.sockets.lock().unwrap();
                    let ids: Vec<i32> = maps.active.keys().copied().collect();
                    for id in &ids {
                        if let Some(c) = maps.active.remove(id) {
                            maps.closed.insert(*id, c);
                        }
                    }
                    maps.closed.keys().copied().collect()
                };
                let now = Instant::now();
                for id in ids {
                    self.remove_socket(id, now);
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let leftover: Vec<Multiplexer> = {
            let mut muxes = self.muxes.lock().unwrap();
            muxes.drain().map(|(_, m)| m).collect()
        };
        for m in leftover {
            m.shutdown();
        }
    }
}

fn mux_ref_id(conn: &Arc<Connection>) -> usize {
    conn.mux_ref().map(|m| m.id).unwrap_or(0)
}

fn ephemeral_for(peer: SocketAddr) -> SocketAddr {
    match peer.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// The listener's answer to a conclusion, reconstructible for re-sends.
fn conclusion_response(conn: &Arc<Connection>, req: &Handshake) -> Handshake {
    let opts = conn.options();
    let mut resp = Handshake {
        version: req.version,
        enc_field: 0,
        ext_field: if req.version == 5 { HS_EXT_TRANSPORT } else { crate::handshake::LEGACY_DGRAM },
        isn: conn.own_isn(),
        mss: opts.mss as u32,
        flight_flag: opts.flight_flag_size as u32,
        req_type: HsReqType::Conclusion,
        socket_id: conn.id(),
        cookie: req.cookie,
        peer_ip: [0; 4],
        ext: Vec::new(),
    };
    if req.version == 5 {
        resp.ext = vec![HsExt::TransportRsp(TransportConfig {
            version: TRANSPORT_VERSION,
            flags: crate::connection::transport_flags(&opts),
            rcv_latency_ms: opts.latency.as_millis() as u16,
            snd_latency_ms: opts.peer_latency.as_millis() as u16,
        })];
    }
    resp
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Normal teardown happens in shutdown(); this is the backstop for a
        // registry dropped without one (tests, panics).
        if let Some(h) = self.gc_handle.lock().unwrap().take() {
            {
                let mut stop = self.gc.stop.lock().unwrap();
                *stop = true;
                self.gc.cv.notify_all();
            }
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Arc<Registry> {
        Registry::new()
    }

    #[test]
    fn ids_decrement_from_the_seed() {
        let r = runtime();
        let a = r.new_socket(SocketOptions::default()).unwrap();
        let b = r.new_socket(SocketOptions::default()).unwrap();
        assert_eq!(b, a - 1);
        assert!(a > 0);
        r.shutdown();
    }

    #[test]
    fn bind_transitions_to_opened() {
        let r = runtime();
        let id = r.new_socket(SocketOptions::default()).unwrap();
        assert_eq!(r.sockstate(id), SocketStatus::Init);
        r.bind(id, (Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        assert_eq!(r.sockstate(id), SocketStatus::Opened);
        // Double bind is refused.
        assert_eq!(
            r.bind(id, (Ipv4Addr::LOCALHOST, 0).into()),
            Err(Error::IsConnected)
        );
        r.shutdown();
    }

    #[test]
    fn listen_requires_bind() {
        let r = runtime();
        let id = r.new_socket(SocketOptions::default()).unwrap();
        assert_eq!(r.listen(id, 5), Err(Error::Unbound));
        r.bind(id, (Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        r.listen(id, 5).unwrap();
        assert_eq!(r.sockstate(id), SocketStatus::Listening);
        r.shutdown();
    }

    #[test]
    fn one_listener_per_endpoint() {
        let r = runtime();
        let a = r.new_socket(SocketOptions::default()).unwrap();
        r.bind(a, (Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        r.listen(a, 5).unwrap();
        let port = r.sock_name(a).unwrap().port();
        let b = r.new_socket(SocketOptions::default()).unwrap();
        r.bind(b, (Ipv4Addr::LOCALHOST, port).into()).unwrap();
        assert_eq!(r.listen(b, 5), Err(Error::InvalidOp));
        r.shutdown();
    }

    #[test]
    fn accept_nonblocking_returns_again() {
        let r = runtime();
        let id = r.new_socket(SocketOptions::default()).unwrap();
        r.bind(id, (Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        r.listen(id, 5).unwrap();
        r.set_option(id, SockOpt::RcvSyn(false)).unwrap();
        assert_eq!(r.accept(id).unwrap_err(), Error::AgainRead);
        r.shutdown();
    }

    #[test]
    fn close_invalidates_and_gc_reaps() {
        let r = runtime();
        let id = r.new_socket(SocketOptions::default()).unwrap();
        r.bind(id, (Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        r.close(id).unwrap();
        assert_eq!(r.sockstate(id), SocketStatus::Closed);
        // A GC pass "in the future" removes it.
        r.check_broken_sockets(Instant::now() + Duration::from_secs(2));
        assert_eq!(r.sockstate(id), SocketStatus::Nonexist);
        r.shutdown();
    }

    #[test]
    fn mux_shared_between_sockets_on_same_port() {
        let r = runtime();
        let a = r.new_socket(SocketOptions::default()).unwrap();
        r.bind(a, (Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let port = r.sock_name(a).unwrap().port();
        let b = r.new_socket(SocketOptions::default()).unwrap();
        r.bind(b, (Ipv4Addr::LOCALHOST, port).into()).unwrap();
        assert_eq!(r.muxes.lock().unwrap().len(), 1);
        assert_eq!(r.muxes.lock().unwrap().values().next().unwrap().refs, 2);
        r.shutdown();
    }

    #[test]
    fn rendezvous_connect_requires_bind() {
        let r = runtime();
        let mut opts = SocketOptions::default();
        opts.rendezvous = true;
        let id = r.new_socket(opts).unwrap();
        assert_eq!(
            r.connect(id, (Ipv4Addr::LOCALHOST, 5000).into(), 0),
            Err(Error::RendezvousUnbound)
        );
        r.shutdown();
    }

    #[test]
    fn option_freezes_after_bind() {
        let r = runtime();
        let id = r.new_socket(SocketOptions::default()).unwrap();
        r.set_option(id, SockOpt::Mss(1400)).unwrap();
        r.bind(id, (Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        assert_eq!(r.set_option(id, SockOpt::Mss(1300)), Err(Error::IsConnected));
        // Runtime-tunable options still work.
        r.set_option(id, SockOpt::SndTimeout(Some(Duration::from_secs(1)))).unwrap();
        r.shutdown();
    }
}

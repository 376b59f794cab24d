//! The receive worker: reads datagrams off the shared channel, dispatches
//! them by destination socket id, walks connection timers, and drives
//! pending connect attempts.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use tracing::{debug, error, trace, warn};

use crate::channel::{Channel, RecvStatus};
use crate::connection::{ConnectOutcome, Connection, SYN_INTERVAL};
use crate::error::{Error, Result};
use crate::packet::{self, ControlPacket, DataHeader};
use crate::queue::rendezvous::RendezvousQueue;
use crate::registry::Registry;
use crate::unit::UnitPool;

/// Most datagrams parked for a socket that has not finished registering.
const MAX_PARKED_PER_ID: usize = 16;

struct RcvInner {
    channel: Arc<Channel>,
    pool: Arc<UnitPool>,
    dispatch: DashMap<i32, Arc<Connection>>,
    listener: Mutex<Option<Arc<Connection>>>,
    rendezvous: Arc<RendezvousQueue>,
    parked: Mutex<HashMap<i32, VecDeque<(SocketAddr, Vec<u8>)>>>,
    new_entries: (Sender<Arc<Connection>>, Receiver<Arc<Connection>>),
    registry: Weak<Registry>,
    closing: AtomicBool,
}

pub struct RcvQueue {
    inner: Arc<RcvInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RcvQueue {
    pub fn start(
        channel: Arc<Channel>,
        pool: Arc<UnitPool>,
        rendezvous: Arc<RendezvousQueue>,
        registry: Weak<Registry>,
        mux_id: usize,
    ) -> Result<Arc<RcvQueue>> {
        let inner = Arc::new(RcvInner {
            channel,
            pool,
            dispatch: DashMap::new(),
            listener: Mutex::new(None),
            rendezvous,
            parked: Mutex::new(HashMap::new()),
            new_entries: unbounded(),
            registry,
            closing: AtomicBool::new(false),
        });
        let worker_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rvl-rcv-{mux_id}"))
            .spawn(move || worker_loop(worker_inner))
            .map_err(|e| Error::Thread(e.to_string()))?;
        Ok(Arc::new(RcvQueue { inner, worker: Mutex::new(Some(handle)) }))
    }

    /// Make a connection reachable for dispatch and timer ticks, and replay
    /// anything that arrived for it while it was still registering.
    pub fn register_connected(&self, conn: Arc<Connection>) {
        let id = conn.id();
        self.inner.dispatch.insert(id, conn.clone());
        conn.set_on_rcv_list(true);
        let _ = self.inner.new_entries.0.send(conn.clone());

        let parked = self.inner.parked.lock().unwrap().remove(&id);
        if let Some(parked) = parked {
            let now = Instant::now();
            for (addr, raw) in parked {
                deliver(&self.inner, &conn, addr, raw, now);
            }
        }
    }

    pub fn remove_connection(&self, id: i32) {
        if let Some((_, conn)) = self.inner.dispatch.remove(&id) {
            conn.set_on_rcv_list(false);
        }
        self.inner.parked.lock().unwrap().remove(&id);
    }

    pub fn set_listener(&self, conn: Arc<Connection>) -> Result<()> {
        let mut slot = self.inner.listener.lock().unwrap();
        if slot.is_some() {
            return Err(Error::InvalidOp);
        }
        *slot = Some(conn);
        Ok(())
    }

    /// Unhook the listener (on close) so the port can be re-bound at once.
    pub fn clear_listener(&self, id: i32) {
        let mut slot = self.inner.listener.lock().unwrap();
        if slot.as_ref().map_or(false, |c| c.id() == id) {
            *slot = None;
        }
    }

    pub fn has_listener(&self) -> bool {
        self.inner.listener.lock().unwrap().is_some()
    }

    pub fn rendezvous(&self) -> &Arc<RendezvousQueue> {
        &self.inner.rendezvous
    }

    pub fn close(&self) {
        self.inner.closing.store(true, Relaxed);
        if let Some(h) = self.worker.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

fn worker_loop(inner: Arc<RcvInner>) {
    debug!("receive worker started");
    // Connections due a timer tick, oldest first.
    let mut tick_list: VecDeque<(Instant, Arc<Connection>)> = VecDeque::new();
    // Fallback buffer when the unit pool is dry: read and drop.
    let mut overflow = vec![0u8; inner.pool.unit_size()];

    loop {
        if inner.closing.load(Relaxed) {
            break;
        }

        // Absorb newly registered connections.
        while let Ok(conn) = inner.new_entries.1.try_recv() {
            tick_list.push_back((Instant::now(), conn));
        }

        // One receive attempt.
        match inner.pool.next_avail() {
            Some(mut unit) => match inner.channel.recv_into(&mut unit.data) {
                RecvStatus::Ok { len, addr } => {
                    unit.data.truncate(len);
                    dispatch(&inner, addr, unit.data, Instant::now());
                }
                RecvStatus::Again => inner.pool.release(unit),
                RecvStatus::Error => {
                    inner.pool.release(unit);
                    if inner.closing.load(Relaxed) {
                        debug!("channel closed, receive worker exiting");
                    } else {
                        error!("channel failure, receive worker exiting");
                    }
                    break;
                }
            },
            None => {
                // Pool exhausted: the datagram is lost by policy.
                match inner.channel.recv_into(&mut overflow) {
                    RecvStatus::Ok { .. } => {
                        trace!("unit pool exhausted, datagram dropped")
                    }
                    RecvStatus::Again => {}
                    RecvStatus::Error => {
                        error!("channel failure, receive worker exiting");
                        break;
                    }
                }
            }
        }

        // Timer pass: everything that last ticked more than a SYN ago.
        let now = Instant::now();
        while let Some((stamp, _)) = tick_list.front() {
            if now.duration_since(*stamp) < SYN_INTERVAL {
                break;
            }
            let (_, conn) = tick_list.pop_front().unwrap();
            if conn.is_connected() && !conn.is_broken() && !conn.is_closing() {
                conn.check_timers(now);
                tick_list.push_back((now, conn));
            } else {
                trace!(id = conn.id(), "dropping socket from receive list");
                inner.dispatch.remove(&conn.id());
                conn.set_on_rcv_list(false);
            }
        }

        // Connect attempts: expiry and handshake retransmission.
        inner.rendezvous.tick(now);
    }
    debug!("receive worker exiting");
}

/// Route one datagram. Ownership of `raw` (a pool buffer) ends here: it is
/// either stored by a connection or released back to the pool.
fn dispatch(inner: &Arc<RcvInner>, addr: SocketAddr, raw: Vec<u8>, now: Instant) {
    let Some(dst) = packet::peek_dst(&raw) else {
        inner.pool.release_buf(raw);
        return;
    };

    if dst < 0 {
        // Negative ids never appear on the wire legitimately.
        trace!(dst, "datagram with negative socket id dropped");
        inner.pool.release_buf(raw);
        return;
    }

    if dst == 0 {
        handle_connection_request(inner, addr, raw, now);
        return;
    }

    if let Some(conn) = inner.dispatch.get(&dst).map(|e| e.value().clone()) {
        // Anti-spoofing: a connected socket only talks to its peer.
        if conn.peer_addr() == Some(addr) || conn.is_connecting() {
            deliver(inner, &conn, addr, raw, now);
        } else {
            trace!(dst, %addr, "datagram from a foreign address dropped");
            inner.pool.release_buf(raw);
        }
        return;
    }

    if let Some(conn) = inner.rendezvous.retrieve(addr, dst) {
        drive_connect(inner, &conn, addr, raw, now);
        return;
    }

    // Unknown but plausible: park for a socket still registering.
    let mut parked = inner.parked.lock().unwrap();
    let q = parked.entry(dst).or_default();
    if q.len() >= MAX_PARKED_PER_ID {
        if let Some((_, old)) = q.pop_front() {
            inner.pool.release_buf(old);
        }
    }
    q.push_back((addr, raw));
}

/// A datagram with destination id zero: a handshake for the listener, or a
/// rendezvous wave for a pending attempt on this endpoint.
fn handle_connection_request(inner: &Arc<RcvInner>, addr: SocketAddr, raw: Vec<u8>, now: Instant) {
    let cp = match ControlPacket::decode(&raw) {
        Some(cp) => cp,
        None => {
            inner.pool.release_buf(raw);
            return;
        }
    };
    inner.pool.release_buf(raw);

    let listener = inner.listener.lock().unwrap().clone();
    if let Some(listener) = listener {
        match inner.registry.upgrade() {
            Some(registry) => registry.process_connect_request(&listener, &cp, addr),
            None => warn!("connection request after registry shutdown"),
        }
        return;
    }

    if let Some(conn) = inner.rendezvous.retrieve(addr, 0) {
        let outcome = conn.process_async_connect(Some(&cp), now);
        finish_connect(inner, &conn, outcome);
        return;
    }
    trace!(%addr, "connection request with no listener dropped");
}

/// Feed a packet to a pending connect attempt found in the queue.
fn drive_connect(
    inner: &Arc<RcvInner>,
    conn: &Arc<Connection>,
    _addr: SocketAddr,
    raw: Vec<u8>,
    now: Instant,
) {
    let cp = ControlPacket::decode(&raw);
    inner.pool.release_buf(raw);
    let Some(cp) = cp else { return };
    let outcome = conn.process_async_connect(Some(&cp), now);
    finish_connect(inner, conn, outcome);
}

fn finish_connect(inner: &Arc<RcvInner>, conn: &Arc<Connection>, outcome: ConnectOutcome) {
    match outcome {
        ConnectOutcome::InProgress => {}
        ConnectOutcome::Connected | ConnectOutcome::Failed => {
            inner.rendezvous.remove(conn.id());
        }
    }
}

/// Hand a raw datagram to its connection (data or control).
fn deliver(inner: &Arc<RcvInner>, conn: &Arc<Connection>, addr: SocketAddr, raw: Vec<u8>, now: Instant) {
    match packet::is_control(&raw) {
        Some(true) => {
            if conn.is_connecting() && !conn.is_connected() {
                // Late handshake traffic addressed to our id.
                drive_connect(inner, conn, addr, raw, now);
                return;
            }
            if let Some(cp) = ControlPacket::decode(&raw) {
                conn.process_ctrl(&cp, now);
            }
            inner.pool.release_buf(raw);
        }
        Some(false) => match DataHeader::decode(&raw) {
            Some(hdr) => {
                if let Some(rejected) = conn.process_data(hdr, raw, now) {
                    inner.pool.release_buf(rejected);
                }
            }
            None => inner.pool.release_buf(raw),
        },
        None => inner.pool.release_buf(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::CcRegistry;
    use crate::channel::ChannelConfig;
    use crate::epoll::EpollService;
    use crate::options::SocketOptions;
    use std::time::Duration;

    fn make_queue() -> Arc<RcvQueue> {
        let channel = Arc::new(
            Channel::open((std::net::Ipv4Addr::LOCALHOST, 0).into(), &ChannelConfig::default())
                .unwrap(),
        );
        let pool = Arc::new(UnitPool::new(32, 1500, 512));
        RcvQueue::start(channel, pool, Arc::new(RendezvousQueue::new()), Weak::new(), 0).unwrap()
    }

    fn conn(id: i32) -> Arc<Connection> {
        Connection::new(
            id,
            SocketOptions::default(),
            Arc::new(EpollService::new()),
            Arc::new(CcRegistry::new()),
            1,
        )
    }

    #[test]
    fn listener_slot_is_exclusive() {
        let q = make_queue();
        assert!(!q.has_listener());
        q.set_listener(conn(-1)).unwrap();
        assert!(q.has_listener());
        assert_eq!(q.set_listener(conn(-2)), Err(Error::InvalidOp));
        q.clear_listener(-1);
        assert!(!q.has_listener());
        q.close();
    }

    #[test]
    fn parked_datagrams_are_capped() {
        let q = make_queue();
        let addr: SocketAddr = ([127, 0, 0, 1], 50).into();
        for i in 0..(MAX_PARKED_PER_ID + 4) {
            let mut raw = vec![0u8; packet::HEADER_SIZE];
            // Data packet addressed to unknown socket 77.
            raw[12..16].copy_from_slice(&77u32.to_be_bytes());
            raw[0] = (i % 2) as u8; // vary the first byte, still data
            raw[0] &= 0x7F;
            // Buffers must come from the pool for release accounting.
            let mut unit = q.inner.pool.next_avail().unwrap();
            unit.data.clear();
            unit.data.extend_from_slice(&raw);
            dispatch(&q.inner, addr, unit.data, Instant::now());
        }
        let parked = q.inner.parked.lock().unwrap();
        assert_eq!(parked.get(&77).unwrap().len(), MAX_PARKED_PER_ID);
        drop(parked);
        q.close();
    }

    #[test]
    fn register_makes_connection_dispatchable() {
        let q = make_queue();
        let c = conn(-9);
        q.register_connected(c.clone());
        assert!(c.is_on_rcv_list());
        assert!(q.inner.dispatch.contains_key(&-9));
        q.remove_connection(-9);
        assert!(!c.is_on_rcv_list());
        assert!(!q.inner.dispatch.contains_key(&-9));
        q.close();
    }

    #[test]
    fn worker_shuts_down_cleanly() {
        let q = make_queue();
        std::thread::sleep(Duration::from_millis(30));
        q.close();
    }
}

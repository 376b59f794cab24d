//! The send worker: a min-heap of connections keyed by next-send time, and
//! the thread that pops the earliest due entry, asks it to pack one packet,
//! transmits it and re-inserts it at its next due time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, trace};

use crate::channel::Channel;
use crate::clock::DeadlineTimer;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// Min-heap of `(due time, connection)` with each connection's slot kept in
/// a side table so re-scheduling is a sift, not a search.
struct SendHeap {
    entries: Vec<(Instant, Arc<Connection>)>,
    slots: HashMap<i32, usize>,
}

impl SendHeap {
    fn new() -> SendHeap {
        SendHeap { entries: Vec::new(), slots: HashMap::new() }
    }

    fn peek_ts(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.0)
    }

    fn set_slot(&mut self, idx: usize) {
        let id = self.entries[idx].1.id();
        self.slots.insert(id, idx);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.entries[idx].0 >= self.entries[parent].0 {
                break;
            }
            self.entries.swap(idx, parent);
            self.set_slot(idx);
            idx = parent;
        }
        self.set_slot(idx);
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let (l, r) = (idx * 2 + 1, idx * 2 + 2);
            let mut best = idx;
            if l < self.entries.len() && self.entries[l].0 < self.entries[best].0 {
                best = l;
            }
            if r < self.entries.len() && self.entries[r].0 < self.entries[best].0 {
                best = r;
            }
            if best == idx {
                break;
            }
            self.entries.swap(idx, best);
            self.set_slot(idx);
            idx = best;
        }
        self.set_slot(idx);
    }

    /// Insert or move a connection. With `reschedule` false an existing
    /// later entry stays put (a fresh insert still happens).
    fn update(&mut self, conn: Arc<Connection>, ts: Instant, reschedule: bool) {
        match self.slots.get(&conn.id()).copied() {
            Some(idx) => {
                if !reschedule && self.entries[idx].0 <= ts {
                    return;
                }
                let old = self.entries[idx].0;
                self.entries[idx].0 = ts;
                if ts < old {
                    self.sift_up(idx);
                } else {
                    self.sift_down(idx);
                }
            }
            None => {
                self.entries.push((ts, conn));
                let idx = self.entries.len() - 1;
                self.sift_up(idx);
            }
        }
    }

    fn pop(&mut self) -> Option<(Instant, Arc<Connection>)> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let (ts, conn) = self.entries.pop().unwrap();
        self.slots.remove(&conn.id());
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some((ts, conn))
    }

    fn remove(&mut self, id: i32) {
        let Some(idx) = self.slots.remove(&id) else {
            return;
        };
        let last = self.entries.len() - 1;
        if idx != last {
            self.entries.swap(idx, last);
            self.entries.pop();
            self.set_slot(idx);
            self.sift_down(idx);
            // The swapped entry may also need to rise.
            self.sift_up(idx.min(self.entries.len() - 1));
        } else {
            self.entries.pop();
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct SndInner {
    heap: Mutex<SendHeap>,
    cv: Condvar,
    timer: DeadlineTimer,
    closing: AtomicBool,
    channel: Arc<Channel>,
}

pub struct SndQueue {
    inner: Arc<SndInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SndQueue {
    pub fn start(channel: Arc<Channel>, mux_id: usize) -> Result<Arc<SndQueue>> {
        let inner = Arc::new(SndInner {
            heap: Mutex::new(SendHeap::new()),
            cv: Condvar::new(),
            timer: DeadlineTimer::new(),
            closing: AtomicBool::new(false),
            channel,
        });
        let worker_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rvl-snd-{mux_id}"))
            .spawn(move || worker_loop(worker_inner))
            .map_err(|e| Error::Thread(e.to_string()))?;
        Ok(Arc::new(SndQueue { inner, worker: Mutex::new(Some(handle)) }))
    }

    /// (Re-)schedule a connection's next visit. `force` moves an existing
    /// later entry earlier; without it an earlier entry wins.
    pub fn schedule(&self, conn: Arc<Connection>, ts: Instant, force: bool) {
        let mut heap = self.inner.heap.lock().unwrap();
        let before = heap.peek_ts();
        heap.update(conn, ts, force);
        let after = heap.peek_ts();
        drop(heap);
        if before.is_none() {
            self.inner.cv.notify_all();
        } else if after < before {
            self.inner.timer.interrupt();
        }
    }

    pub fn remove(&self, id: i32) {
        self.inner.heap.lock().unwrap().remove(id);
    }

    /// Stop the worker. Safe to call more than once.
    pub fn close(&self) {
        self.inner.closing.store(true, Relaxed);
        self.inner.cv.notify_all();
        self.inner.timer.interrupt();
        if let Some(h) = self.worker.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    /// Direct control-priority transmit, bypassing pacing.
    pub fn send_to(&self, addr: SocketAddr, buf: &[u8]) -> Result<usize> {
        self.inner.channel.send_to(addr, buf)
    }
}

fn worker_loop(inner: Arc<SndInner>) {
    debug!("send worker started");
    let mut scratch: Vec<u8> = Vec::with_capacity(1500);
    loop {
        if inner.closing.load(Relaxed) {
            break;
        }

        let next = inner.heap.lock().unwrap().peek_ts();
        match next {
            None => {
                // Park until someone schedules a send.
                let heap = inner.heap.lock().unwrap();
                if inner.closing.load(Relaxed) {
                    break;
                }
                if heap.len() == 0 {
                    let _ = inner
                        .cv
                        .wait_timeout(heap, crate::connection::SYN_INTERVAL * 10)
                        .unwrap();
                }
                continue;
            }
            Some(ts) => {
                let now = Instant::now();
                if ts > now {
                    inner.timer.sleep_until(ts);
                    continue;
                }
            }
        }

        let Some((_, conn)) = inner.heap.lock().unwrap().pop() else {
            continue;
        };
        if !conn.is_connected() || conn.is_broken() {
            trace!(id = conn.id(), "skipping unusable socket in send heap");
            continue;
        }
        let now = Instant::now();
        match conn.pack_data(&mut scratch, now) {
            Some((addr, next_time)) => {
                if let Err(e) = inner.channel.send_to(addr, &scratch) {
                    trace!(id = conn.id(), error = %e, "send failed");
                }
                if let Some(t) = next_time {
                    inner.heap.lock().unwrap().update(conn, t, true);
                }
            }
            None => {
                // Nothing to send; the connection re-enters the heap when
                // new data or an ACK arrives.
            }
        }
    }
    debug!("send worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cc::CcRegistry;
    use crate::epoll::EpollService;
    use crate::options::SocketOptions;
    use std::time::Duration;

    fn dummy_conn(id: i32) -> Arc<Connection> {
        Connection::new(
            id,
            SocketOptions::default(),
            Arc::new(EpollService::new()),
            Arc::new(CcRegistry::new()),
            1,
        )
    }

    #[test]
    fn heap_orders_by_time() {
        let mut h = SendHeap::new();
        let t0 = Instant::now();
        let (a, b, c) = (dummy_conn(-1), dummy_conn(-2), dummy_conn(-3));
        h.update(b.clone(), t0 + Duration::from_millis(20), true);
        h.update(a.clone(), t0 + Duration::from_millis(10), true);
        h.update(c.clone(), t0 + Duration::from_millis(30), true);
        assert_eq!(h.pop().unwrap().1.id(), -1);
        assert_eq!(h.pop().unwrap().1.id(), -2);
        assert_eq!(h.pop().unwrap().1.id(), -3);
        assert!(h.pop().is_none());
    }

    #[test]
    fn each_connection_appears_once() {
        let mut h = SendHeap::new();
        let t0 = Instant::now();
        let a = dummy_conn(-1);
        h.update(a.clone(), t0 + Duration::from_millis(30), true);
        h.update(a.clone(), t0 + Duration::from_millis(5), true);
        assert_eq!(h.len(), 1);
        let (ts, _) = h.pop().unwrap();
        assert_eq!(ts, t0 + Duration::from_millis(5));
        assert!(h.pop().is_none());
    }

    #[test]
    fn no_reschedule_keeps_earlier_time() {
        let mut h = SendHeap::new();
        let t0 = Instant::now();
        let a = dummy_conn(-1);
        h.update(a.clone(), t0 + Duration::from_millis(5), true);
        h.update(a.clone(), t0 + Duration::from_millis(50), false);
        assert_eq!(h.pop().unwrap().0, t0 + Duration::from_millis(5));
    }

    #[test]
    fn remove_from_the_middle_keeps_order() {
        let mut h = SendHeap::new();
        let t0 = Instant::now();
        for (i, ms) in [(1, 10u64), (2, 20), (3, 30), (4, 40), (5, 50)] {
            h.update(dummy_conn(-i), t0 + Duration::from_millis(ms), true);
        }
        h.remove(-3);
        let order: Vec<i32> = std::iter::from_fn(|| h.pop()).map(|(_, c)| c.id()).collect();
        assert_eq!(order, vec![-1, -2, -4, -5]);
    }

    #[test]
    fn worker_starts_and_stops() {
        let ch = Arc::new(
            Channel::open(
                (std::net::Ipv4Addr::LOCALHOST, 0).into(),
                &crate::channel::ChannelConfig::default(),
            )
            .unwrap(),
        );
        let q = SndQueue::start(ch, 0).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        q.close();
    }
}

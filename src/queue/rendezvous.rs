//! The queue of in-flight connect attempts (caller and rendezvous modes).
//!
//! The receive worker ticks this every iteration. Qualification happens
//! under the queue lock; the per-socket work happens after the lock is
//! released, because driving a handshake takes the socket's own locks and
//! those must never nest inside the queue lock.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use crate::connection::{ConnectOutcome, Connection};
use crate::handshake::RejectReason;

struct Entry {
    id: i32,
    conn: Arc<Connection>,
    peer: SocketAddr,
    ttl: Instant,
}

pub struct RendezvousQueue {
    list: Mutex<Vec<Entry>>,
}

impl RendezvousQueue {
    pub fn new() -> RendezvousQueue {
        RendezvousQueue { list: Mutex::new(Vec::new()) }
    }

    pub fn insert(&self, id: i32, conn: Arc<Connection>, peer: SocketAddr, ttl: Instant) {
        let mut list = self.list.lock().unwrap();
        list.retain(|e| e.id != id);
        list.push(Entry { id, conn, peer, ttl });
    }

    pub fn remove(&self, id: i32) {
        self.list.lock().unwrap().retain(|e| e.id != id);
    }

    /// Find the attempt a response belongs to. `id` zero matches by address
    /// only (the peer did not know our socket id yet).
    pub fn retrieve(&self, peer: SocketAddr, id: i32) -> Option<Arc<Connection>> {
        let list = self.list.lock().unwrap();
        list.iter()
            .find(|e| e.peer == peer && (id == 0 || e.id == id))
            .map(|e| e.conn.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().unwrap().is_empty()
    }

    /// Periodic update: expire attempts past their TTL, re-drive the rest
    /// (handshake retransmission). Two phases: qualify under the lock, act
    /// outside it.
    pub fn tick(&self, now: Instant) {
        let mut to_remove: Vec<Arc<Connection>> = Vec::new();
        let mut to_process: Vec<Arc<Connection>> = Vec::new();
        {
            let list = self.list.lock().unwrap();
            for e in list.iter() {
                if now >= e.ttl {
                    to_remove.push(e.conn.clone());
                } else {
                    to_process.push(e.conn.clone());
                }
            }
        }

        let mut done: Vec<i32> = Vec::new();
        for conn in to_process {
            match conn.process_async_connect(None, now) {
                ConnectOutcome::InProgress => {}
                ConnectOutcome::Connected => done.push(conn.id()),
                ConnectOutcome::Failed => {
                    debug!(id = conn.id(), "connect attempt failed");
                    done.push(conn.id());
                }
            }
        }
        for conn in &to_remove {
            warn!(id = conn.id(), "connect attempt timed out");
            conn.complete_broken(RejectReason::Timeout, now);
        }

        if !done.is_empty() || !to_remove.is_empty() {
            let mut list = self.list.lock().unwrap();
            list.retain(|e| {
                !done.contains(&e.id) && !to_remove.iter().any(|c| c.id() == e.id)
            });
        }
    }
}

impl Default for RendezvousQueue {
    fn default() -> Self {
        Self::new()
    }
}

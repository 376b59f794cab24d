//! The public socket API: a cloneable `Runtime` owning the whole transport
//! stack, plus the per-thread last-error slot.
//!
//! Every operation returns a typed `Result`; the last error of the calling
//! thread is additionally retrievable through [`Runtime::last_error`] for
//! callers keeping a C-style error discipline.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::SocketStatus;
use crate::epoll::EpollEvent;
use crate::error::{Error, Result};
use crate::handshake::RejectReason;
use crate::options::{SockOpt, SocketOptions};
use crate::registry::{AcceptHook, Registry};
use crate::stats::StatsSnapshot;

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

fn track<T>(res: Result<T>) -> Result<T> {
    if let Err(e) = &res {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(e.clone()));
    }
    res
}

struct RuntimeInner {
    registry: Arc<Registry>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}

/// Handle to a transport runtime. Clones share one stack; dropping the last
/// clone tears everything down (workers joined, sockets reaped).
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime { inner: Arc::new(RuntimeInner { registry: Registry::new() }) }
    }

    fn reg(&self) -> &Registry {
        &self.inner.registry
    }

    /// Last error recorded on this thread by any `Runtime` call.
    pub fn last_error() -> Option<Error> {
        LAST_ERROR.with(|slot| slot.borrow().clone())
    }

    pub fn clear_last_error() {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
    }

    // -- lifecycle ----------------------------------------------------------

    /// Allocate a socket with default options.
    pub fn socket(&self) -> Result<i32> {
        track(self.reg().new_socket(SocketOptions::default()))
    }

    /// Allocate a socket with explicit options.
    pub fn socket_with(&self, opts: SocketOptions) -> Result<i32> {
        track(self.reg().new_socket(opts))
    }

    pub fn bind(&self, id: i32, addr: SocketAddr) -> Result<()> {
        track(self.reg().bind(id, addr))
    }

    /// Attach the socket to a UDP socket the application already bound.
    pub fn bind_udp(&self, id: i32, udp: std::net::UdpSocket) -> Result<()> {
        track(self.reg().bind_udp(id, udp))
    }

    pub fn listen(&self, id: i32, backlog: usize) -> Result<()> {
        track(self.reg().listen(id, backlog))
    }

    /// Pop one pending connection; blocks unless the listener is in
    /// non-blocking receive mode.
    pub fn accept(&self, id: i32) -> Result<(i32, SocketAddr)> {
        track(self.reg().accept(id))
    }

    pub fn connect(&self, id: i32, addr: SocketAddr) -> Result<()> {
        track(self.reg().connect(id, addr, 0))
    }

    /// Connect with a caller-chosen initial sequence number.
    pub fn connect_with_isn(&self, id: i32, addr: SocketAddr, isn: i32) -> Result<()> {
        track(self.reg().connect(id, addr, isn))
    }

    pub fn close(&self, id: i32) -> Result<()> {
        track(self.reg().close(id))
    }

    pub fn sockstate(&self, id: i32) -> SocketStatus {
        self.reg().sockstate(id)
    }

    pub fn reject_reason(&self, id: i32) -> Result<Option<RejectReason>> {
        track(self.reg().reject_reason(id))
    }

    /// Install an admission gate on a listener.
    pub fn set_accept_hook(&self, id: i32, hook: AcceptHook) -> Result<()> {
        track(self.reg().set_accept_hook(id, hook))
    }

    /// Register a congestion controller under a name selectable through
    /// the congestion option ("live" and "file" are built in).
    pub fn register_congestion_control(
        &self,
        name: &str,
        builder: fn() -> Box<dyn crate::cc::CongestionControl>,
    ) {
        self.reg().cc_registry().register(name, builder);
    }

    // -- data ---------------------------------------------------------------

    /// Queue one message for in-order delivery.
    pub fn send(&self, id: i32, data: &[u8]) -> Result<usize> {
        track(self.reg().send(id, data))
    }

    /// Queue one message with an explicit time-to-live and ordering flag.
    pub fn sendmsg(
        &self,
        id: i32,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
    ) -> Result<usize> {
        track(self.reg().send_msg(id, data, ttl, in_order))
    }

    /// Receive one message into `out`; returns the byte count.
    pub fn recv(&self, id: i32, out: &mut [u8]) -> Result<usize> {
        track(self.reg().recv(id, out))
    }

    /// Receive one message plus its source timestamp (µs since the peer's
    /// connection start).
    pub fn recvmsg(&self, id: i32, out: &mut [u8]) -> Result<(usize, u32)> {
        track(self.reg().recv_msg(id, out))
    }

    // -- introspection ------------------------------------------------------

    pub fn sock_name(&self, id: i32) -> Result<SocketAddr> {
        track(self.reg().sock_name(id))
    }

    pub fn peer_name(&self, id: i32) -> Result<SocketAddr> {
        track(self.reg().peer_name(id))
    }

    pub fn set_option(&self, id: i32, opt: SockOpt) -> Result<()> {
        track(self.reg().set_option(id, opt))
    }

    pub fn options(&self, id: i32) -> Result<SocketOptions> {
        track(self.reg().get_options(id))
    }

    /// Performance counters; `clear` resets the interval half.
    pub fn stats(&self, id: i32, clear: bool) -> Result<StatsSnapshot> {
        track(self.reg().stats(id, clear))
    }

    // -- readiness ----------------------------------------------------------

    pub fn epoll_create(&self) -> i32 {
        self.reg().epoll().create()
    }

    pub fn epoll_add_usock(&self, eid: i32, id: i32, events: Option<u32>) -> Result<()> {
        let res = self.reg().epoll().add_usock(eid, id, events);
        if res.is_ok() {
            if let Ok(conn) = self.reg_locate(id) {
                conn.add_epoll_id(eid);
            }
        }
        track(res)
    }

    pub fn epoll_remove_usock(&self, eid: i32, id: i32) -> Result<()> {
        if let Ok(conn) = self.reg_locate(id) {
            conn.remove_epoll_id(eid);
        }
        track(self.reg().epoll().remove_usock(eid, id))
    }

    pub fn epoll_update_usock(&self, eid: i32, id: i32, events: Option<u32>) -> Result<()> {
        track(self.reg().epoll().update_usock(eid, id, events))
    }

    pub fn epoll_add_ssock(&self, eid: i32, fd: i32, events: Option<u32>) -> Result<()> {
        track(self.reg().epoll().add_ssock(eid, fd, events))
    }

    pub fn epoll_remove_ssock(&self, eid: i32, fd: i32) -> Result<()> {
        track(self.reg().epoll().remove_ssock(eid, fd))
    }

    pub fn epoll_update_ssock(&self, eid: i32, fd: i32, events: Option<u32>) -> Result<()> {
        track(self.reg().epoll().update_ssock(eid, fd, events))
    }

    /// Wait for readiness; returns (readable, writable) ids.
    pub fn epoll_wait(
        &self,
        eid: i32,
        timeout: Option<Duration>,
    ) -> Result<(Vec<i32>, Vec<i32>)> {
        track(self.reg().epoll().wait(eid, timeout))
    }

    /// Flat-array wait over transport sockets.
    pub fn epoll_uwait(
        &self,
        eid: i32,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<EpollEvent>> {
        track(self.reg().epoll().uwait(eid, max_events, timeout))
    }

    pub fn epoll_set(&self, eid: i32, flags: u32) -> Result<u32> {
        track(self.reg().epoll().set_flags(eid, flags))
    }

    pub fn epoll_release(&self, eid: i32) -> Result<()> {
        track(self.reg().epoll().release(eid))
    }

    fn reg_locate(&self, id: i32) -> Result<Arc<crate::connection::Connection>> {
        self.reg().connection(id)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn last_error_is_per_thread() {
        let rt = Runtime::new();
        Runtime::clear_last_error();
        assert!(rt.bind(12345, (Ipv4Addr::LOCALHOST, 0).into()).is_err());
        assert_eq!(Runtime::last_error(), Some(Error::InvalidSock));

        let handle = std::thread::spawn(|| Runtime::last_error());
        assert_eq!(handle.join().unwrap(), None);

        Runtime::clear_last_error();
        assert_eq!(Runtime::last_error(), None);
    }

    #[test]
    fn runtime_clones_share_the_stack() {
        let rt = Runtime::new();
        let id = rt.socket().unwrap();
        let rt2 = rt.clone();
        assert_eq!(rt2.sockstate(id), SocketStatus::Init);
        drop(rt2);
        // The stack survives while one handle lives.
        assert_eq!(rt.sockstate(id), SocketStatus::Init);
    }

    #[test]
    fn nonexistent_socket_reports_nonexist() {
        let rt = Runtime::new();
        assert_eq!(rt.sockstate(99), SocketStatus::Nonexist);
    }
}

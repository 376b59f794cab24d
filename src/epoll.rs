//! Epoll-like readiness aggregation over transport sockets and plain system
//! file descriptors.
//!
//! Transport readiness is pushed in by the connections (`update_events`);
//! system descriptors are polled with `poll(2)` while a waiter sleeps. Each
//! descriptor has its own lock and condition variable so waits on one
//! descriptor never serialize against another.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering::Relaxed};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub const EPOLL_IN: u32 = 0x1;
pub const EPOLL_OUT: u32 = 0x4;
pub const EPOLL_ERR: u32 = 0x8;
/// Edge-triggered subscription bit: readiness is reported once, then
/// cleared until the transport raises it again.
pub const EPOLL_ET: u32 = 0x8000_0000;

/// Allow `wait` on a descriptor with nothing registered.
pub const EPOLL_ENABLE_EMPTY: u32 = 0x1;

const WAIT_SLICE: Duration = Duration::from_millis(10);

/// A single readiness report (flat-array wait form).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpollEvent {
    pub id: i32,
    pub events: u32,
}

#[derive(Default)]
struct DescInner {
    usocks: HashMap<i32, u32>,
    ssocks: HashMap<i32, u32>,
    ready_in: HashSet<i32>,
    ready_out: HashSet<i32>,
    ready_err: HashSet<i32>,
    flags: u32,
    closed: bool,
}

struct EpollDesc {
    inner: Mutex<DescInner>,
    cv: Condvar,
}

pub struct EpollService {
    descs: Mutex<HashMap<i32, Arc<EpollDesc>>>,
    next_id: AtomicI32,
}

impl EpollService {
    pub fn new() -> EpollService {
        EpollService { descs: Mutex::new(HashMap::new()), next_id: AtomicI32::new(1) }
    }

    pub fn create(&self) -> i32 {
        let eid = self.next_id.fetch_add(1, Relaxed);
        self.descs.lock().unwrap().insert(
            eid,
            Arc::new(EpollDesc { inner: Mutex::new(DescInner::default()), cv: Condvar::new() }),
        );
        eid
    }

    pub fn release(&self, eid: i32) -> Result<()> {
        let desc = self.descs.lock().unwrap().remove(&eid).ok_or(Error::InvalidParam)?;
        let mut inner = desc.inner.lock().unwrap();
        inner.closed = true;
        desc.cv.notify_all();
        Ok(())
    }

    fn desc(&self, eid: i32) -> Result<Arc<EpollDesc>> {
        self.descs.lock().unwrap().get(&eid).cloned().ok_or(Error::InvalidParam)
    }

    /// Subscribe a transport socket. `events` None means all of IN|OUT|ERR.
    pub fn add_usock(&self, eid: i32, sid: i32, events: Option<u32>) -> Result<()> {
        let desc = self.desc(eid)?;
        let mask = events.unwrap_or(EPOLL_IN | EPOLL_OUT | EPOLL_ERR);
        desc.inner.lock().unwrap().usocks.insert(sid, mask);
        Ok(())
    }

    pub fn update_usock(&self, eid: i32, sid: i32, events: Option<u32>) -> Result<()> {
        self.add_usock(eid, sid, events)
    }

    pub fn remove_usock(&self, eid: i32, sid: i32) -> Result<()> {
        let desc = self.desc(eid)?;
        let mut inner = desc.inner.lock().unwrap();
        inner.usocks.remove(&sid);
        inner.ready_in.remove(&sid);
        inner.ready_out.remove(&sid);
        inner.ready_err.remove(&sid);
        Ok(())
    }

    pub fn add_ssock(&self, eid: i32, fd: i32, events: Option<u32>) -> Result<()> {
        let desc = self.desc(eid)?;
        let mask = events.unwrap_or(EPOLL_IN | EPOLL_OUT | EPOLL_ERR);
        desc.inner.lock().unwrap().ssocks.insert(fd, mask);
        Ok(())
    }

    pub fn update_ssock(&self, eid: i32, fd: i32, events: Option<u32>) -> Result<()> {
        self.add_ssock(eid, fd, events)
    }

    pub fn remove_ssock(&self, eid: i32, fd: i32) -> Result<()> {
        let desc = self.desc(eid)?;
        desc.inner.lock().unwrap().ssocks.remove(&fd);
        Ok(())
    }

    /// Swap the descriptor's flag word, returning the previous value.
    pub fn set_flags(&self, eid: i32, flags: u32) -> Result<u32> {
        let desc = self.desc(eid)?;
        let mut inner = desc.inner.lock().unwrap();
        let prev = inner.flags;
        inner.flags = flags;
        Ok(prev)
    }

    /// Publish readiness from inside the transport.
    pub fn update_events(&self, sid: i32, eids: &HashSet<i32>, events: u32, enable: bool) {
        let descs: Vec<Arc<EpollDesc>> = {
            let map = self.descs.lock().unwrap();
            eids.iter().filter_map(|eid| map.get(eid).cloned()).collect()
        };
        for desc in descs {
            let mut inner = desc.inner.lock().unwrap();
            let Some(&sub) = inner.usocks.get(&sid) else {
                continue;
            };
            let effective = events & sub;
            if effective == 0 && enable {
                continue;
            }
            let mut changed = false;
            for (bit, set) in [(EPOLL_IN, 0), (EPOLL_OUT, 1), (EPOLL_ERR, 2)] {
                if events & bit == 0 {
                    continue;
                }
                let set = match set {
                    0 => &mut inner.ready_in,
                    1 => &mut inner.ready_out,
                    _ => &mut inner.ready_err,
                };
                changed |= if enable { set.insert(sid) } else { set.remove(&sid) };
            }
            if changed && enable {
                desc.cv.notify_all();
            }
        }
    }

    /// Wait for readiness; returns (readable ids, writable ids), system fds
    /// included. Broken sockets appear in both sets when subscribed to ERR.
    pub fn wait(
        &self,
        eid: i32,
        timeout: Option<Duration>,
    ) -> Result<(Vec<i32>, Vec<i32>)> {
        let desc = self.desc(eid)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut reads: Vec<i32> = Vec::new();
            let mut writes: Vec<i32> = Vec::new();
            let sfds: Vec<(i32, u32)>;
            {
                let mut inner = desc.inner.lock().unwrap();
                if inner.closed {
                    return Err(Error::InvalidParam);
                }
                if inner.usocks.is_empty()
                    && inner.ssocks.is_empty()
                    && inner.flags & EPOLL_ENABLE_EMPTY == 0
                {
                    return Err(Error::InvalidParam);
                }
                for (&sid, &sub) in inner.usocks.iter() {
                    let err = inner.ready_err.contains(&sid) && sub & EPOLL_ERR != 0;
                    if (sub & EPOLL_IN != 0 && inner.ready_in.contains(&sid)) || err {
                        reads.push(sid);
                    }
                    if (sub & EPOLL_OUT != 0 && inner.ready_out.contains(&sid)) || err {
                        writes.push(sid);
                    }
                }
                sfds = inner.ssocks.iter().map(|(&fd, &m)| (fd, m)).collect();
                if !reads.is_empty() || !writes.is_empty() {
                    self.apply_edge_clear(&mut inner, &reads, &writes);
                }
            }

            poll_system_fds(&sfds, &mut reads, &mut writes);

            if !reads.is_empty() || !writes.is_empty() {
                reads.sort_unstable();
                reads.dedup();
                writes.sort_unstable();
                writes.dedup();
                return Ok((reads, writes));
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok((Vec::new(), Vec::new()));
            }
            let inner = desc.inner.lock().unwrap();
            let slice = deadline
                .map(|d| d.saturating_duration_since(Instant::now()).min(WAIT_SLICE))
                .unwrap_or(WAIT_SLICE);
            let _ = desc.cv.wait_timeout(inner, slice).unwrap();
        }
    }

    /// Flat-array wait over transport sockets only.
    pub fn uwait(
        &self,
        eid: i32,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<EpollEvent>> {
        let desc = self.desc(eid)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut out = Vec::new();
            {
                let mut inner = desc.inner.lock().unwrap();
                if inner.closed {
                    return Err(Error::InvalidParam);
                }
                for (&sid, &sub) in inner.usocks.iter() {
                    let mut ev = 0u32;
                    if sub & EPOLL_IN != 0 && inner.ready_in.contains(&sid) {
                        ev |= EPOLL_IN;
                    }
                    if sub & EPOLL_OUT != 0 && inner.ready_out.contains(&sid) {
                        ev |= EPOLL_OUT;
                    }
                    if sub & EPOLL_ERR != 0 && inner.ready_err.contains(&sid) {
                        ev |= EPOLL_ERR;
                    }
                    if ev != 0 {
                        out.push(EpollEvent { id: sid, events: ev });
                        if out.len() == max_events {
                            break;
                        }
                    }
                }
                if !out.is_empty() {
                    let reads: Vec<i32> = out.iter().map(|e| e.id).collect();
                    let writes = reads.clone();
                    self.apply_edge_clear(&mut inner, &reads, &writes);
                }
            }
            if !out.is_empty() {
                return Ok(out);
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(Vec::new());
            }
            let inner = desc.inner.lock().unwrap();
            let slice = deadline
                .map(|d| d.saturating_duration_since(Instant::now()).min(WAIT_SLICE))
                .unwrap_or(WAIT_SLICE);
            let _ = desc.cv.wait_timeout(inner, slice).unwrap();
        }
    }

    /// Edge-triggered subscribers see an event once: consume the readiness
    /// they were just shown.
    fn apply_edge_clear(&self, inner: &mut DescInner, reads: &[i32], writes: &[i32]) {
        let et_ids: Vec<i32> = inner
            .usocks
            .iter()
            .filter(|(_, &sub)| sub & EPOLL_ET != 0)
            .map(|(&sid, _)| sid)
            .collect();
        for sid in et_ids {
            if reads.contains(&sid) {
                inner.ready_in.remove(&sid);
            }
            if writes.contains(&sid) {
                inner.ready_out.remove(&sid);
            }
        }
    }
}

impl Default for EpollService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn poll_system_fds(sfds: &[(i32, u32)], reads: &mut Vec<i32>, writes: &mut Vec<i32>) {
    if sfds.is_empty() {
        return;
    }
    let mut pfds: Vec<libc::pollfd> = sfds
        .iter()
        .map(|&(fd, mask)| {
            let mut ev: libc::c_short = 0;
            if mask & EPOLL_IN != 0 {
                ev |= libc::POLLIN;
            }
            if mask & EPOLL_OUT != 0 {
                ev |= libc::POLLOUT;
            }
            libc::pollfd { fd, events: ev, revents: 0 }
        })
        .collect();
    let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, 0) };
    if rc <= 0 {
        return;
    }
    for p in pfds {
        if p.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
            reads.push(p.fd);
        }
        if p.revents & (libc::POLLOUT | libc::POLLERR) != 0 {
            writes.push(p.fd);
        }
    }
}

#[cfg(not(unix))]
fn poll_system_fds(_sfds: &[(i32, u32)], _reads: &mut Vec<i32>, _writes: &mut Vec<i32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ids(v: &[i32]) -> HashSet<i32> {
        v.iter().copied().collect()
    }

    #[test]
    fn wait_with_nothing_registered_is_an_error() {
        let ep = EpollService::new();
        let eid = ep.create();
        assert!(ep.wait(eid, Some(Duration::from_millis(1))).is_err());
        ep.set_flags(eid, EPOLL_ENABLE_EMPTY).unwrap();
        let (r, w) = ep.wait(eid, Some(Duration::from_millis(1))).unwrap();
        assert!(r.is_empty() && w.is_empty());
    }

    #[test]
    fn readiness_roundtrip() {
        let ep = EpollService::new();
        let eid = ep.create();
        ep.add_usock(eid, 42, Some(EPOLL_IN)).unwrap();
        ep.update_events(42, &ids(&[eid]), EPOLL_IN, true);
        let (r, w) = ep.wait(eid, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(r, vec![42]);
        assert!(w.is_empty());
        // Level-triggered: still reported.
        let (r2, _) = ep.wait(eid, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(r2, vec![42]);
        // Cleared: times out empty.
        ep.update_events(42, &ids(&[eid]), EPOLL_IN, false);
        let (r3, _) = ep.wait(eid, Some(Duration::from_millis(10))).unwrap();
        assert!(r3.is_empty());
    }

    #[test]
    fn error_reports_in_both_sets() {
        let ep = EpollService::new();
        let eid = ep.create();
        ep.add_usock(eid, 7, None).unwrap();
        ep.update_events(7, &ids(&[eid]), EPOLL_ERR, true);
        let (r, w) = ep.wait(eid, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(r, vec![7]);
        assert_eq!(w, vec![7]);
    }

    #[test]
    fn subscription_filters_events() {
        let ep = EpollService::new();
        let eid = ep.create();
        ep.add_usock(eid, 9, Some(EPOLL_OUT)).unwrap();
        ep.update_events(9, &ids(&[eid]), EPOLL_IN, true);
        let (r, w) = ep.wait(eid, Some(Duration::from_millis(10))).unwrap();
        assert!(r.is_empty() && w.is_empty());
        ep.update_events(9, &ids(&[eid]), EPOLL_OUT, true);
        let (_, w) = ep.wait(eid, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(w, vec![9]);
    }

    #[test]
    fn edge_triggered_reports_once() {
        let ep = EpollService::new();
        let eid = ep.create();
        ep.add_usock(eid, 5, Some(EPOLL_IN | EPOLL_ET)).unwrap();
        ep.update_events(5, &ids(&[eid]), EPOLL_IN, true);
        let (r, _) = ep.wait(eid, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(r, vec![5]);
        let (r2, _) = ep.wait(eid, Some(Duration::from_millis(10))).unwrap();
        assert!(r2.is_empty());
    }

    #[test]
    fn uwait_returns_flat_events() {
        let ep = EpollService::new();
        let eid = ep.create();
        ep.add_usock(eid, 1, None).unwrap();
        ep.update_events(1, &ids(&[eid]), EPOLL_IN | EPOLL_OUT, true);
        let evs = ep.uwait(eid, 8, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].id, 1);
        assert_eq!(evs[0].events, EPOLL_IN | EPOLL_OUT);
    }

    #[test]
    fn waiter_wakes_on_cross_thread_publish() {
        let ep = Arc::new(EpollService::new());
        let eid = ep.create();
        ep.add_usock(eid, 3, Some(EPOLL_IN)).unwrap();
        let ep2 = ep.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            ep2.update_events(3, &[eid].iter().copied().collect(), EPOLL_IN, true);
        });
        let (r, _) = ep.wait(eid, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(r, vec![3]);
        h.join().unwrap();
    }

    #[test]
    fn system_fd_readiness_via_pipe() {
        #[cfg(unix)]
        {
            let mut fds = [0i32; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            let ep = EpollService::new();
            let eid = ep.create();
            ep.add_ssock(eid, fds[0], Some(EPOLL_IN)).unwrap();
            // Nothing readable yet.
            let (r, _) = ep.wait(eid, Some(Duration::from_millis(20))).unwrap();
            assert!(r.is_empty());
            unsafe {
                libc::write(fds[1], b"x".as_ptr() as *const _, 1);
            }
            let (r, _) = ep.wait(eid, Some(Duration::from_secs(1))).unwrap();
            assert_eq!(r, vec![fds[0]]);
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
        }
    }

    #[test]
    fn release_fails_waiters() {
        let ep = Arc::new(EpollService::new());
        let eid = ep.create();
        ep.add_usock(eid, 1, None).unwrap();
        let ep2 = ep.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            ep2.release(eid).unwrap();
        });
        let res = ep.wait(eid, Some(Duration::from_secs(5)));
        assert!(res.is_err());
        h.join().unwrap();
    }
}

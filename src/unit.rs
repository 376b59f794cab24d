//! Recyclable datagram-buffer pool shared by every connection on one
//! multiplexer.
//!
//! Buffers are allocated in chunks. When occupancy crosses 90 % another
//! chunk is added (up to a hard cap); the pool never shrinks while the
//! multiplexer lives. An exhausted pool means the receive worker drops the
//! datagram on the floor, which the protocol treats as ordinary loss.

use std::sync::Mutex;

/// An owned datagram buffer on loan from the pool. Holds the raw bytes of
/// one received datagram (header included).
#[derive(Debug)]
pub struct Unit {
    pub data: Vec<u8>,
}

pub struct UnitPool {
    inner: Mutex<PoolInner>,
    unit_size: usize,
    max_units: usize,
}

struct PoolInner {
    free: Vec<Vec<u8>>,
    capacity: usize,
    in_use: usize,
}

impl UnitPool {
    /// `initial_units` buffers of `unit_size` bytes each; the pool may grow
    /// to `max_units`.
    pub fn new(initial_units: usize, unit_size: usize, max_units: usize) -> UnitPool {
        assert!(initial_units > 0);
        let mut free = Vec::with_capacity(initial_units);
        for _ in 0..initial_units {
            free.push(Vec::with_capacity(unit_size));
        }
        UnitPool {
            inner: Mutex::new(PoolInner { free, capacity: initial_units, in_use: 0 }),
            unit_size,
            max_units: max_units.max(initial_units),
        }
    }

    /// Buffer size each unit was provisioned with.
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Take a free unit. Grows the pool by one chunk first when 90 % of the
    /// capacity is in flight. Returns None only with every chunk exhausted.
    pub fn next_avail(&self) -> Option<Unit> {
        let mut p = self.inner.lock().unwrap();
        if p.in_use * 10 >= p.capacity * 9 && p.capacity < self.max_units {
            let grow = p.capacity.min(self.max_units - p.capacity);
            for _ in 0..grow {
                p.free.push(Vec::with_capacity(self.unit_size));
            }
            p.capacity += grow;
        }
        match p.free.pop() {
            Some(mut data) => {
                p.in_use += 1;
                data.clear();
                data.resize(self.unit_size, 0);
                Some(Unit { data })
            }
            None => None,
        }
    }

    /// Return a unit (or a buffer extracted from one) to the pool.
    pub fn release(&self, unit: Unit) {
        self.release_buf(unit.data);
    }

    pub fn release_buf(&self, mut buf: Vec<u8>) {
        let mut p = self.inner.lock().unwrap();
        debug_assert!(p.in_use > 0, "release without a matching next_avail");
        buf.clear();
        p.in_use = p.in_use.saturating_sub(1);
        p.free.push(buf);
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().unwrap().in_use
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_release_balances() {
        let pool = UnitPool::new(8, 1500, 64);
        let u = pool.next_avail().unwrap();
        assert_eq!(u.data.len(), 1500);
        assert_eq!(pool.in_use(), 1);
        pool.release(u);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.capacity(), 8);
    }

    #[test]
    fn grows_at_ninety_percent() {
        let pool = UnitPool::new(10, 100, 1000);
        let mut held = Vec::new();
        for _ in 0..9 {
            held.push(pool.next_avail().unwrap());
        }
        assert_eq!(pool.capacity(), 10);
        // The ninth unit in flight crosses 90 %: the next take grows first.
        held.push(pool.next_avail().unwrap());
        assert_eq!(pool.capacity(), 20);
        for u in held {
            pool.release(u);
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = UnitPool::new(4, 100, 4);
        let mut held = Vec::new();
        while let Some(u) = pool.next_avail() {
            held.push(u);
            assert!(held.len() <= 4);
        }
        assert_eq!(held.len(), 4);
        assert!(pool.next_avail().is_none());
        pool.release(held.pop().unwrap());
        assert!(pool.next_avail().is_some());
    }

    #[test]
    fn never_shrinks() {
        let pool = UnitPool::new(2, 100, 64);
        let a = pool.next_avail().unwrap();
        let b = pool.next_avail().unwrap();
        let cap = pool.capacity();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.capacity(), cap);
    }
}

//! Receiver-side ring: slots indexed by sequence offset from the next
//! undelivered packet, with timestamp-gated release and too-late drop.

use std::time::{Duration, Instant};

use crate::packet::{DataHeader, MsgInfo, HEADER_SIZE};
use crate::seq::{seq_add, seq_off};

/// One received data packet: parsed header plus the raw datagram buffer the
/// unit pool loaned out (payload lives at `data[HEADER_SIZE..]`).
#[derive(Debug)]
pub struct RxData {
    pub seq: i32,
    pub msg: MsgInfo,
    pub timestamp: u32,
    pub data: Vec<u8>,
}

impl RxData {
    pub fn from_datagram(hdr: DataHeader, data: Vec<u8>) -> RxData {
        RxData { seq: hdr.seq, msg: hdr.msg, timestamp: hdr.timestamp, data }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }
}

/// A complete application message read out of the buffer. The raw buffers
/// still belong to the unit pool; the caller returns them after copying.
#[derive(Debug)]
pub struct Message {
    pub parts: Vec<RxData>,
    pub msgno: i32,
    pub timestamp: u32,
}

impl Message {
    pub fn len(&self) -> usize {
        self.parts.iter().map(|p| p.payload().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn copy_into(&self, out: &mut [u8]) -> usize {
        let mut off = 0;
        for p in self.parts.iter() {
            let pl = p.payload();
            let n = pl.len().min(out.len() - off);
            out[off..off + n].copy_from_slice(&pl[..n]);
            off += n;
            if off == out.len() {
                break;
            }
        }
        off
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored; payload byte count reported for stats.
    Stored(usize),
    /// Sequence precedes the delivery point (a retransmit that raced the
    /// original, or plain duplication).
    Belated,
    Duplicate,
    OutOfWindow,
}

#[derive(Debug)]
enum Slot {
    Empty,
    Good { rx: RxData, play_ext_us: u64 },
    Dropped,
}

impl Slot {
    fn occupied(&self) -> bool {
        !matches!(self, Slot::Empty)
    }
}

/// Timestamp playout gate.
#[derive(Debug)]
struct Playout {
    /// Local instant corresponding to the peer's timestamp zero.
    base: Instant,
    latency: Duration,
    /// 32-bit wrap extension for packet timestamps.
    epoch_us: u64,
    last_ts: u32,
}

#[derive(Debug)]
pub struct RcvBuffer {
    slots: Vec<Slot>,
    size: usize,
    head: usize,
    /// Sequence expected at `head`: everything before it was delivered
    /// (or dropped) already.
    start_seq: i32,
    playout: Option<Playout>,
    /// Highest stored sequence, for headroom accounting.
    furthest: Option<i32>,
}

impl RcvBuffer {
    pub fn new(size: usize, isn: i32) -> RcvBuffer {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || Slot::Empty);
        RcvBuffer { slots, size, head: 0, start_seq: isn, playout: None, furthest: None }
    }

    /// Arm the timestamp gate. `base` maps the peer's timestamp zero onto
    /// the local clock.
    pub fn enable_playout(&mut self, base: Instant, latency: Duration) {
        self.playout = Some(Playout { base, latency, epoch_us: 0, last_ts: 0 });
    }

    pub fn playout_enabled(&self) -> bool {
        self.playout.is_some()
    }

    pub fn next_expected(&self) -> i32 {
        self.start_seq
    }

    /// Slots free beyond the furthest stored packet.
    pub fn avail_pkts(&self) -> usize {
        match self.furthest {
            None => self.size,
            Some(f) => {
                let used = seq_off(self.start_seq, f) + 1;
                self.size.saturating_sub(used.max(0) as usize)
            }
        }
    }

    /// True if any packet is stored but undelivered (regardless of playout
    /// readiness) — the GC uses this to give a broken socket a grace period.
    pub fn has_data(&self) -> bool {
        self.slots.iter().any(|s| matches!(s, Slot::Good { .. }))
    }

    fn slot_index(&self, off: i32) -> usize {
        (self.head + off as usize) % self.size
    }

    fn play_time(&self, ext_us: u64) -> Option<Instant> {
        let p = self.playout.as_ref()?;
        Some(p.base + Duration::from_micros(ext_us) + p.latency)
    }

    /// Extend a 32-bit packet timestamp past wraparound.
    fn extend_ts(&mut self, ts: u32) -> u64 {
        match self.playout.as_mut() {
            None => ts as u64,
            Some(p) => {
                if ts < p.last_ts && p.last_ts - ts > u32::MAX / 2 {
                    // Wrapped: count the epoch once and move the reference
                    // point past the wrap so the next packet does not count
                    // it again.
                    p.epoch_us += 1 << 32;
                    p.last_ts = ts;
                } else if ts > p.last_ts {
                    p.last_ts = ts;
                }
                p.epoch_us + ts as u64
            }
        }
    }

    /// Place a packet at its slot. The caller keeps ownership (for pool
    /// release) when the outcome is not `Stored`.
    pub fn add(&mut self, rx: RxData) -> (AddOutcome, Option<RxData>) {
        let off = seq_off(self.start_seq, rx.seq);
        if off < 0 {
            return (AddOutcome::Belated, Some(rx));
        }
        if off as usize >= self.size {
            return (AddOutcome::OutOfWindow, Some(rx));
        }
        let idx = self.slot_index(off);
        if self.slots[idx].occupied() {
            return (AddOutcome::Duplicate, Some(rx));
        }
        if self.furthest.map_or(true, |f| seq_off(f, rx.seq) > 0) {
            self.furthest = Some(rx.seq);
        }
        let bytes = rx.payload().len();
        let ext = self.extend_ts(rx.timestamp);
        self.slots[idx] = Slot::Good { rx, play_ext_us: ext };
        (AddOutcome::Stored(bytes), None)
    }

    /// The next sequence the peer should be told we expect: one past the
    /// longest run of occupied slots from the head.
    pub fn ack_seq(&self) -> i32 {
        let mut n = 0;
        while n < self.size && self.slots[self.slot_index(n as i32)].occupied() {
            n += 1;
        }
        seq_add(self.start_seq, n as i32)
    }

    /// Is a complete message sitting at the head, cleared for playout?
    pub fn is_data_ready(&self, now: Instant) -> bool {
        self.ready_message_len(now).is_some()
    }

    /// When the head message will become playable, for blocked readers.
    /// None when no complete head message exists yet.
    pub fn next_release_time(&self) -> Option<Instant> {
        let n = self.complete_head_message()?;
        match &self.slots[self.slot_index(0)] {
            Slot::Good { play_ext_us, .. } => {
                let _ = n;
                match self.play_time(*play_ext_us) {
                    Some(t) => Some(t),
                    None => Some(Instant::now()),
                }
            }
            // A dropped slot at the head is consumable immediately.
            _ => Some(Instant::now()),
        }
    }

    /// Number of packets forming a complete message at the head (dropped
    /// slots at the head count as a zero-length pseudo message).
    fn complete_head_message(&self) -> Option<usize> {
        match &self.slots[self.slot_index(0)] {
            Slot::Empty => None,
            Slot::Dropped => Some(1),
            Slot::Good { rx, .. } => {
                if !rx.msg.position.is_first() {
                    // Mid-message packet at the head: its predecessors were
                    // dropped; it can only be discarded, handled by the
                    // too-late path.
                    return None;
                }
                let mut n = 0;
                loop {
                    match &self.slots[self.slot_index(n as i32)] {
                        Slot::Good { rx, .. } if (n as usize) < self.size => {
                            n += 1;
                            if rx.msg.position.is_last() {
                                return Some(n);
                            }
                        }
                        _ => return None,
                    }
                    if n as usize >= self.size {
                        return None;
                    }
                }
            }
        }
    }

    fn ready_message_len(&self, now: Instant) -> Option<usize> {
        let n = self.complete_head_message()?;
        match &self.slots[self.slot_index(0)] {
            Slot::Good { play_ext_us, .. } => match self.play_time(*play_ext_us) {
                Some(t) if t > now => None,
                _ => Some(n),
            },
            _ => Some(n),
        }
    }

    fn take_slot(&mut self) -> Slot {
        let idx = self.head;
        let slot = std::mem::replace(&mut self.slots[idx], Slot::Empty);
        self.head = (self.head + 1) % self.size;
        self.start_seq = seq_add(self.start_seq, 1);
        if self.furthest == Some(crate::seq::seq_dec(self.start_seq)) {
            // Window emptied past the furthest packet.
            if !self.slots.iter().any(Slot::occupied) {
                self.furthest = None;
            }
        }
        slot
    }

    /// Read one complete message if ready. Dropped pseudo-messages are
    /// consumed silently first.
    pub fn read_msg(&mut self, now: Instant) -> Option<Message> {
        // Consume any dropped slots sitting at the head.
        while matches!(self.slots[self.slot_index(0)], Slot::Dropped) {
            self.take_slot();
        }
        let n = self.ready_message_len(now)?;
        let mut parts = Vec::with_capacity(n);
        for _ in 0..n {
            match self.take_slot() {
                Slot::Good { rx, .. } => parts.push(rx),
                _ => unreachable!("complete message scan returned a hole"),
            }
        }
        let msgno = parts[0].msg.msgno;
        let timestamp = parts[0].timestamp;
        Some(Message { parts, msgno, timestamp })
    }

    /// Give up on the gap blocking the head: when a later packet is already
    /// past its playout time, everything before it is written off as lost.
    /// Returns (skipped sequence count, released buffers).
    pub fn drop_too_late(&mut self, now: Instant) -> (u64, Vec<RxData>) {
        if self.playout.is_none() {
            return (0, Vec::new());
        }
        // Nothing to do unless the head is blocked.
        if matches!(self.slots[self.slot_index(0)], Slot::Good { .. })
            && self.complete_head_message().is_some()
        {
            return (0, Vec::new());
        }
        // Find the first packet that starts a message and is past due.
        let mut due_at: Option<usize> = None;
        let horizon = match self.furthest {
            Some(f) => (seq_off(self.start_seq, f) + 1).max(0) as usize,
            None => 0,
        };
        for off in 0..horizon.min(self.size) {
            if let Slot::Good { rx, play_ext_us } = &self.slots[self.slot_index(off as i32)] {
                if rx.msg.position.is_first() {
                    if let Some(t) = self.play_time(*play_ext_us) {
                        if t <= now {
                            if off == 0 {
                                return (0, Vec::new());
                            }
                            due_at = Some(off);
                        }
                    }
                    break;
                }
            }
        }
        let Some(cut) = due_at else {
            return (0, Vec::new());
        };
        let mut released = Vec::new();
        for _ in 0..cut {
            match self.take_slot() {
                Slot::Good { rx, .. } => released.push(rx),
                _ => {}
            }
        }
        (cut as u64, released)
    }

    /// Peer-requested drop of `[first, last]`: occupied slots are released,
    /// the range is marked consumable.
    pub fn drop_range(&mut self, first: i32, last: i32) -> Vec<RxData> {
        let mut released = Vec::new();
        let from = seq_off(self.start_seq, first).max(0);
        let to = seq_off(self.start_seq, last);
        if to < 0 {
            return released;
        }
        for off in from..=to.min(self.size as i32 - 1) {
            let idx = self.slot_index(off);
            match std::mem::replace(&mut self.slots[idx], Slot::Dropped) {
                Slot::Good { rx, .. } => released.push(rx),
                _ => {}
            }
        }
        if self.furthest.map_or(true, |f| seq_off(f, last) > 0) {
            if to < self.size as i32 {
                self.furthest = Some(last);
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketPosition;

    fn rx(seq: i32, pos: PacketPosition, msgno: i32, ts: u32, body: &[u8]) -> RxData {
        let mut data = vec![0u8; HEADER_SIZE];
        data.extend_from_slice(body);
        RxData {
            seq,
            msg: MsgInfo { position: pos, in_order: true, key_flags: 0, retransmitted: false, msgno },
            timestamp: ts,
            data,
        }
    }

    fn only(seq: i32, msgno: i32, body: &[u8]) -> RxData {
        rx(seq, PacketPosition::Only, msgno, 0, body)
    }

    #[test]
    fn in_order_delivery() {
        let mut b = RcvBuffer::new(16, 100);
        assert!(matches!(b.add(only(100, 1, b"a")).0, AddOutcome::Stored(_)));
        assert!(matches!(b.add(only(101, 2, b"b")).0, AddOutcome::Stored(_)));
        assert_eq!(b.ack_seq(), 102);
        let now = Instant::now();
        let m1 = b.read_msg(now).unwrap();
        assert_eq!(m1.parts[0].payload(), b"a");
        let m2 = b.read_msg(now).unwrap();
        assert_eq!(m2.parts[0].payload(), b"b");
        assert!(b.read_msg(now).is_none());
        assert_eq!(b.next_expected(), 102);
    }

    #[test]
    fn gap_blocks_delivery_until_filled() {
        let mut b = RcvBuffer::new(16, 100);
        let _ = b.add(only(101, 2, b"late"));
        assert_eq!(b.ack_seq(), 100);
        assert!(b.read_msg(Instant::now()).is_none());
        let _ = b.add(only(100, 1, b"first"));
        assert_eq!(b.ack_seq(), 102);
        assert_eq!(b.read_msg(Instant::now()).unwrap().parts[0].payload(), b"first");
    }

    #[test]
    fn belated_duplicate_and_out_of_window() {
        let mut b = RcvBuffer::new(4, 100);
        let _ = b.add(only(100, 1, b"x"));
        let (out, back) = b.add(only(100, 1, b"x"));
        assert_eq!(out, AddOutcome::Duplicate);
        assert!(back.is_some());
        b.read_msg(Instant::now()).unwrap();
        let (out, _) = b.add(only(100, 1, b"x"));
        assert_eq!(out, AddOutcome::Belated);
        let (out, _) = b.add(only(200, 9, b"x"));
        assert_eq!(out, AddOutcome::OutOfWindow);
    }

    #[test]
    fn multi_packet_message_assembles() {
        let mut b = RcvBuffer::new(16, 50);
        let _ = b.add(rx(50, PacketPosition::First, 3, 0, b"ab"));
        assert!(b.read_msg(Instant::now()).is_none());
        let _ = b.add(rx(51, PacketPosition::Last, 3, 0, b"cd"));
        let m = b.read_msg(Instant::now()).unwrap();
        assert_eq!(m.len(), 4);
        let mut out = [0u8; 4];
        assert_eq!(m.copy_into(&mut out), 4);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn playout_gate_holds_early_packets() {
        let mut b = RcvBuffer::new(16, 10);
        let base = Instant::now();
        b.enable_playout(base, Duration::from_millis(50));
        let _ = b.add(rx(10, PacketPosition::Only, 1, 1_000, b"z"));
        // 1 ms stamp + 50 ms latency: not ready right away.
        assert!(!b.is_data_ready(base + Duration::from_millis(10)));
        assert!(b.is_data_ready(base + Duration::from_millis(60)));
        let release = b.next_release_time().unwrap();
        assert!(release > base + Duration::from_millis(40));
        assert!(b.read_msg(base + Duration::from_millis(60)).is_some());
    }

    #[test]
    fn too_late_gap_is_skipped() {
        let mut b = RcvBuffer::new(16, 10);
        let base = Instant::now() - Duration::from_secs(1);
        b.enable_playout(base, Duration::from_millis(50));
        // 10 missing; 11 stamped early enough that it is long overdue.
        let _ = b.add(rx(11, PacketPosition::Only, 2, 100, b"keep"));
        let (skipped, released) = b.drop_too_late(Instant::now());
        assert_eq!(skipped, 1);
        assert!(released.is_empty());
        assert_eq!(b.next_expected(), 11);
        assert_eq!(b.read_msg(Instant::now()).unwrap().parts[0].payload(), b"keep");
    }

    #[test]
    fn timestamp_wrap_extends_monotonically() {
        let mut b = RcvBuffer::new(16, 0);
        b.enable_playout(Instant::now(), Duration::from_millis(50));
        let pre = b.extend_ts(u32::MAX - 500);
        assert_eq!(pre, (u32::MAX - 500) as u64);
        // Crossing the 32-bit boundary keeps the extended clock monotonic.
        let post = b.extend_ts(300);
        assert!(post > pre);
        assert_eq!(post, (1u64 << 32) + 300);
        // The epoch is counted exactly once, not on every post-wrap packet.
        let next = b.extend_ts(600);
        assert_eq!(next, (1u64 << 32) + 600);
        let later = b.extend_ts(100_000);
        assert_eq!(later, (1u64 << 32) + 100_000);
    }

    #[test]
    fn drop_range_marks_slots_consumable() {
        let mut b = RcvBuffer::new(16, 100);
        let _ = b.add(only(102, 3, b"later"));
        let released = b.drop_range(100, 101);
        assert!(released.is_empty());
        assert_eq!(b.ack_seq(), 103);
        // The dropped pseudo-messages vanish; the real one comes out.
        let m = b.read_msg(Instant::now()).unwrap();
        assert_eq!(m.parts[0].payload(), b"later");
    }

    #[test]
    fn avail_shrinks_with_outstanding_packets() {
        let mut b = RcvBuffer::new(8, 0);
        assert_eq!(b.avail_pkts(), 8);
        let _ = b.add(only(0, 1, b"x"));
        let _ = b.add(only(3, 2, b"y"));
        assert_eq!(b.avail_pkts(), 4);
        b.read_msg(Instant::now()).unwrap();
        assert_eq!(b.avail_pkts(), 5);
    }
}

//! Sender-side buffer: application messages fragmented into MSS-sized
//! blocks, released by acknowledgement, droppable when they outlive their
//! latency budget.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::packet::{MsgInfo, PacketPosition};
use crate::seq::{self, seq_cmp, seq_off};

#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    position: PacketPosition,
    in_order: bool,
    msgno: i32,
    /// Wire sequence, assigned on first emission.
    seq: i32,
    origin: Instant,
    ttl: Option<Duration>,
}

/// A packet handed to the send worker (fresh or retransmit).
#[derive(Debug)]
pub struct SndPacket {
    pub payload: Vec<u8>,
    pub msg: MsgInfo,
    pub origin: Instant,
}

/// Range dropped by the sender as too late; mirrored to the peer in a
/// drop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropInfo {
    pub first_seq: i32,
    pub last_seq: i32,
    pub msgno: i32,
    pub pkts: u64,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct SndBuffer {
    blocks: VecDeque<Block>,
    /// How many blocks at the front have been emitted at least once.
    sent: usize,
    capacity: usize,
    payload_size: usize,
    next_msgno: i32,
    bytes: usize,
}

impl SndBuffer {
    pub fn new(capacity_pkts: usize, payload_size: usize) -> SndBuffer {
        SndBuffer {
            blocks: VecDeque::new(),
            sent: 0,
            capacity: capacity_pkts,
            payload_size,
            next_msgno: 1,
            bytes: 0,
        }
    }

    pub fn pkts_queued(&self) -> usize {
        self.blocks.len()
    }

    pub fn pkts_unsent(&self) -> usize {
        self.blocks.len() - self.sent
    }

    pub fn free_pkts(&self) -> usize {
        self.capacity - self.blocks.len()
    }

    pub fn bytes_queued(&self) -> usize {
        self.bytes
    }

    /// Queue one application message, fragmenting to the payload budget.
    /// The whole message must fit; otherwise nothing is queued.
    pub fn add(
        &mut self,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
        now: Instant,
    ) -> Result<i32> {
        let need = data.chunks(self.payload_size).count().max(1);
        if need > self.free_pkts() {
            return Err(Error::AgainWrite);
        }
        let msgno = self.next_msgno;
        self.next_msgno = seq::msg::inc(self.next_msgno);

        if data.is_empty() {
            self.blocks.push_back(Block {
                data: Vec::new(),
                position: PacketPosition::Only,
                in_order,
                msgno,
                seq: -1,
                origin: now,
                ttl,
            });
            return Ok(msgno);
        }

        for (i, chunk) in data.chunks(self.payload_size).enumerate() {
            let first = i == 0;
            let last = (i + 1) * self.payload_size >= data.len();
            let position = match (first, last) {
                (true, true) => PacketPosition::Only,
                (true, false) => PacketPosition::First,
                (false, true) => PacketPosition::Last,
                (false, false) => PacketPosition::Middle,
            };
            self.blocks.push_back(Block {
                data: chunk.to_vec(),
                position,
                in_order,
                msgno,
                seq: -1,
                origin: now,
                ttl,
            });
            self.bytes += chunk.len();
        }
        Ok(msgno)
    }

    /// Emit the next fresh block, stamping it with `seq`.
    pub fn read_next(&mut self, seq: i32) -> Option<SndPacket> {
        let block = self.blocks.get_mut(self.sent)?;
        block.seq = seq;
        self.sent += 1;
        Some(SndPacket {
            payload: block.data.clone(),
            msg: MsgInfo {
                position: block.position,
                in_order: block.in_order,
                key_flags: 0,
                retransmitted: false,
                msgno: block.msgno,
            },
            origin: block.origin,
        })
    }

    /// Fetch an already-emitted block for retransmission.
    pub fn retransmit(&self, seq: i32) -> Option<SndPacket> {
        let front = self.blocks.front()?;
        if self.sent == 0 {
            return None;
        }
        let off = seq_off(front.seq, seq);
        if off < 0 || off as usize >= self.sent {
            return None;
        }
        let block = &self.blocks[off as usize];
        Some(SndPacket {
            payload: block.data.clone(),
            msg: MsgInfo {
                position: block.position,
                in_order: block.in_order,
                key_flags: 0,
                retransmitted: true,
                msgno: block.msgno,
            },
            origin: block.origin,
        })
    }

    /// Release every block with sequence below `ack` (the peer's next
    /// expected sequence). Returns (packets, bytes) released.
    pub fn ack_upto(&mut self, ack: i32) -> (u64, u64) {
        let mut pkts = 0u64;
        let mut bytes = 0u64;
        while self.sent > 0 {
            let front = self.blocks.front().unwrap();
            if seq_cmp(front.seq, ack) >= 0 {
                break;
            }
            bytes += front.data.len() as u64;
            self.bytes -= front.data.len();
            self.blocks.pop_front();
            self.sent -= 1;
            pkts += 1;
        }
        (pkts, bytes)
    }

    /// Drop emitted-but-unacknowledged messages that outlived their budget:
    /// a per-message TTL, or `late_cutoff` for timestamp-gated streams.
    /// Whole messages only, and only within the emitted region.
    pub fn drop_late(&mut self, now: Instant, late_cutoff: Option<Duration>) -> Option<DropInfo> {
        let expired = |b: &Block| -> bool {
            let by_ttl = b.ttl.map_or(false, |t| now >= b.origin + t);
            let by_cutoff = late_cutoff.map_or(false, |c| now >= b.origin + c);
            by_ttl || by_cutoff
        };

        if self.sent == 0 || !expired(self.blocks.front().unwrap()) {
            return None;
        }

        // Extend through consecutive expired blocks, then to the end of the
        // last touched message (never past the emitted region).
        let mut n = 0;
        while n < self.sent && expired(&self.blocks[n]) {
            n += 1;
        }
        let last_msg = self.blocks[n - 1].msgno;
        while n < self.sent && self.blocks[n].msgno == last_msg {
            n += 1;
        }

        let first_seq = self.blocks[0].seq;
        let last_seq = self.blocks[n - 1].seq;
        let msgno = self.blocks[n - 1].msgno;
        let mut bytes = 0u64;
        for _ in 0..n {
            let b = self.blocks.pop_front().unwrap();
            bytes += b.data.len() as u64;
            self.bytes -= b.data.len();
        }
        self.sent -= n;
        Some(DropInfo { first_seq, last_seq, msgno, pkts: n as u64, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> SndBuffer {
        SndBuffer::new(16, 10)
    }

    #[test]
    fn small_message_is_a_single_only_packet() {
        let mut b = buf();
        b.add(b"hello", None, true, Instant::now()).unwrap();
        assert_eq!(b.pkts_queued(), 1);
        let p = b.read_next(100).unwrap();
        assert_eq!(p.payload, b"hello");
        assert_eq!(p.msg.position, PacketPosition::Only);
        assert!(!p.msg.retransmitted);
    }

    #[test]
    fn long_message_fragments_with_position_flags() {
        let mut b = buf();
        let data = [7u8; 25]; // 10 + 10 + 5
        b.add(&data, None, true, Instant::now()).unwrap();
        assert_eq!(b.pkts_queued(), 3);
        let positions: Vec<_> = (0..3).map(|i| b.read_next(100 + i).unwrap().msg.position).collect();
        assert_eq!(
            positions,
            vec![PacketPosition::First, PacketPosition::Middle, PacketPosition::Last]
        );
        // All three share one message number.
        assert_eq!(b.retransmit(100).unwrap().msg.msgno, b.retransmit(102).unwrap().msg.msgno);
    }

    #[test]
    fn add_fails_when_message_does_not_fit() {
        let mut b = SndBuffer::new(2, 10);
        assert!(b.add(&[0u8; 25], None, true, Instant::now()).is_err());
        assert_eq!(b.pkts_queued(), 0);
        b.add(&[0u8; 15], None, true, Instant::now()).unwrap();
        assert_eq!(b.add(&[0u8; 5], None, true, Instant::now()), Err(Error::AgainWrite));
    }

    #[test]
    fn retransmit_only_within_emitted_region() {
        let mut b = buf();
        b.add(b"aaa", None, true, Instant::now()).unwrap();
        b.add(b"bbb", None, true, Instant::now()).unwrap();
        assert!(b.retransmit(200).is_none());
        b.read_next(200).unwrap();
        let r = b.retransmit(200).unwrap();
        assert_eq!(r.payload, b"aaa");
        assert!(r.msg.retransmitted);
        assert!(b.retransmit(201).is_none());
    }

    #[test]
    fn ack_releases_below_the_ack_point() {
        let mut b = buf();
        for m in [&b"aaa"[..], b"bbb", b"ccc"] {
            b.add(m, None, true, Instant::now()).unwrap();
        }
        for i in 0..3 {
            b.read_next(500 + i).unwrap();
        }
        let (pkts, bytes) = b.ack_upto(502);
        assert_eq!((pkts, bytes), (2, 6));
        assert_eq!(b.pkts_queued(), 1);
        assert!(b.retransmit(502).is_some());
        assert!(b.retransmit(501).is_none());
    }

    #[test]
    fn drop_late_takes_whole_messages() {
        let mut b = SndBuffer::new(16, 4);
        let t0 = Instant::now() - Duration::from_secs(2);
        // Message of 2 blocks, expired.
        b.add(&[1u8; 8], None, true, t0).unwrap();
        // Fresh message.
        b.add(&[2u8; 4], None, true, Instant::now()).unwrap();
        for i in 0..3 {
            b.read_next(10 + i).unwrap();
        }
        let d = b.drop_late(Instant::now(), Some(Duration::from_millis(500))).unwrap();
        assert_eq!((d.first_seq, d.last_seq), (10, 11));
        assert_eq!(d.pkts, 2);
        assert_eq!(b.pkts_queued(), 1);
        // Nothing else is late.
        assert!(b.drop_late(Instant::now(), Some(Duration::from_millis(500))).is_none());
    }

    #[test]
    fn per_message_ttl_expires_independently() {
        let mut b = buf();
        let t0 = Instant::now() - Duration::from_millis(100);
        b.add(b"x", Some(Duration::from_millis(50)), true, t0).unwrap();
        b.read_next(1).unwrap();
        let d = b.drop_late(Instant::now(), None).unwrap();
        assert_eq!(d.pkts, 1);
    }
}

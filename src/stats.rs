//! Per-connection performance counters.
//!
//! Counters accumulate twice: since the connection started, and since the
//! last snapshot that asked for a clear. Snapshots are plain serializable
//! values so applications can ship them to whatever monitoring pipeline
//! they run.

use std::time::Instant;

use serde::Serialize;

/// Event counters, one cumulative copy and one interval copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub pkts_sent: u64,
    pub pkts_recv: u64,
    pub pkts_retransmitted: u64,
    /// Packets the sender learned were lost (from NAKs).
    pub pkts_snd_loss: u64,
    /// Gaps the receiver detected.
    pub pkts_rcv_loss: u64,
    /// Packets the sender discarded as too late.
    pub pkts_snd_dropped: u64,
    /// Packets the receiver discarded or gave up waiting for.
    pub pkts_rcv_dropped: u64,
    /// Retransmits that arrived for data already delivered.
    pub pkts_belated: u64,
    pub acks_sent: u64,
    pub acks_recv: u64,
    pub naks_sent: u64,
    pub naks_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub bytes_retransmitted: u64,
    pub bytes_snd_dropped: u64,
}

macro_rules! bump {
    ($self:ident, $field:ident, $n:expr) => {
        $self.total.$field += $n;
        $self.interval.$field += $n;
    };
}

/// Live counter state, owned by the connection.
#[derive(Debug)]
pub struct Stats {
    total: Counters,
    interval: Counters,
    start: Instant,
    interval_start: Instant,
}

impl Stats {
    pub fn new(start: Instant) -> Stats {
        Stats { total: Counters::default(), interval: Counters::default(), start, interval_start: start }
    }

    pub fn on_pkt_sent(&mut self, bytes: usize) {
        bump!(self, pkts_sent, 1);
        bump!(self, bytes_sent, bytes as u64);
    }

    pub fn on_pkt_recv(&mut self, bytes: usize) {
        bump!(self, pkts_recv, 1);
        bump!(self, bytes_recv, bytes as u64);
    }

    pub fn on_retransmit(&mut self, bytes: usize) {
        bump!(self, pkts_retransmitted, 1);
        bump!(self, bytes_retransmitted, bytes as u64);
    }

    pub fn on_snd_loss(&mut self, pkts: u64) {
        bump!(self, pkts_snd_loss, pkts);
    }

    pub fn on_rcv_loss(&mut self, pkts: u64) {
        bump!(self, pkts_rcv_loss, pkts);
    }

    pub fn on_snd_drop(&mut self, pkts: u64, bytes: u64) {
        bump!(self, pkts_snd_dropped, pkts);
        bump!(self, bytes_snd_dropped, bytes);
    }

    pub fn on_rcv_drop(&mut self, pkts: u64) {
        bump!(self, pkts_rcv_dropped, pkts);
    }

    pub fn on_belated(&mut self) {
        bump!(self, pkts_belated, 1);
    }

    pub fn on_ack_sent(&mut self) {
        bump!(self, acks_sent, 1);
    }

    pub fn on_ack_recv(&mut self) {
        bump!(self, acks_recv, 1);
    }

    pub fn on_nak_sent(&mut self) {
        bump!(self, naks_sent, 1);
    }

    pub fn on_nak_recv(&mut self) {
        bump!(self, naks_recv, 1);
    }

    /// Take a snapshot; with `clear` the interval counters restart.
    pub fn snapshot(&mut self, clear: bool, gauges: Gauges) -> StatsSnapshot {
        let now = Instant::now();
        let snap = StatsSnapshot {
            total: self.total,
            interval: self.interval,
            elapsed_us: now.duration_since(self.start).as_micros() as u64,
            interval_us: now.duration_since(self.interval_start).as_micros() as u64,
            gauges,
        };
        if clear {
            self.interval = Counters::default();
            self.interval_start = now;
        }
        snap
    }
}

/// Instantaneous readings sampled at snapshot time.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Gauges {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// Inter-packet pacing currently applied by the sender.
    pub pacing_us: u64,
    pub flow_window_pkts: i32,
    pub flight_pkts: i32,
    /// Receiver's estimate of the link, packets per second.
    pub bandwidth_pps: u32,
    pub avail_snd_buf_pkts: usize,
    pub avail_rcv_buf_pkts: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub total: Counters,
    pub interval: Counters,
    pub elapsed_us: u64,
    pub interval_us: u64,
    pub gauges: Gauges,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_resets_interval_only() {
        let mut s = Stats::new(Instant::now());
        s.on_pkt_sent(100);
        s.on_pkt_sent(100);
        s.on_nak_recv();

        let snap = s.snapshot(true, Gauges::default());
        assert_eq!(snap.total.pkts_sent, 2);
        assert_eq!(snap.interval.pkts_sent, 2);
        assert_eq!(snap.interval.naks_recv, 1);

        s.on_pkt_sent(50);
        let snap2 = s.snapshot(false, Gauges::default());
        assert_eq!(snap2.total.pkts_sent, 3);
        assert_eq!(snap2.total.bytes_sent, 250);
        assert_eq!(snap2.interval.pkts_sent, 1);
        assert_eq!(snap2.interval.naks_recv, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let mut s = Stats::new(Instant::now());
        s.on_retransmit(1316);
        let snap = s.snapshot(false, Gauges { rtt_us: 12_000, ..Gauges::default() });
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"pkts_retransmitted\":1"));
        assert!(json.contains("\"rtt_us\":12000"));
    }
}

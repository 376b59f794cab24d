//! Arrival-interval bookkeeping feeding the receive-rate and link-capacity
//! fields of full acknowledgements.
//!
//! Two sampling windows: every packet contributes an inter-arrival interval
//! (delivery rate), and consecutive-sequence probe pairs contribute a
//! back-to-back spacing (capacity). Estimates use a median-filtered mean:
//! samples outside (median/8, median*8) are ignored.

use std::time::Instant;

const ARRIVAL_SLOTS: usize = 16;
const PROBE_SLOTS: usize = 16;

fn filtered_rate(samples: &[u64]) -> u64 {
    let mut sorted: Vec<u64> = samples.to_vec();
    sorted.sort_unstable();
    let median = sorted[sorted.len() / 2];
    if median == 0 {
        return 0;
    }
    let (mut sum, mut count) = (0u64, 0u64);
    for &s in samples {
        if s > median / 8 && s < median.saturating_mul(8) {
            sum += s;
            count += 1;
        }
    }
    if count == 0 || sum == 0 {
        return 0;
    }
    // Mean interval in µs → events per second.
    count * 1_000_000 / sum
}

/// Receiver-side timing window.
#[derive(Debug)]
pub struct ArrivalWindow {
    intervals_us: [u64; ARRIVAL_SLOTS],
    sizes: [usize; ARRIVAL_SLOTS],
    idx: usize,
    last_arrival: Option<Instant>,

    probes_us: [u64; PROBE_SLOTS],
    probe_idx: usize,
    probe_start: Option<Instant>,
}

impl ArrivalWindow {
    pub fn new() -> ArrivalWindow {
        ArrivalWindow {
            // Seed with a slow default so early estimates stay conservative.
            intervals_us: [1_000_000; ARRIVAL_SLOTS],
            sizes: [0; ARRIVAL_SLOTS],
            idx: 0,
            last_arrival: None,
            probes_us: [1_000; PROBE_SLOTS],
            probe_idx: 0,
            probe_start: None,
        }
    }

    /// Record a data-packet arrival.
    pub fn on_arrival(&mut self, now: Instant, payload_bytes: usize) {
        if let Some(last) = self.last_arrival {
            self.intervals_us[self.idx] = now.duration_since(last).as_micros() as u64;
            self.sizes[self.idx] = payload_bytes;
            self.idx = (self.idx + 1) % ARRIVAL_SLOTS;
        }
        self.last_arrival = Some(now);
    }

    /// First packet of a probe pair (sequence number divisible by 16).
    pub fn on_probe1(&mut self, now: Instant) {
        self.probe_start = Some(now);
    }

    /// Second packet of a probe pair; only valid right after `on_probe1`.
    pub fn on_probe2(&mut self, now: Instant) {
        if let Some(start) = self.probe_start.take() {
            let us = now.duration_since(start).as_micros() as u64;
            if us > 0 {
                self.probes_us[self.probe_idx] = us;
                self.probe_idx = (self.probe_idx + 1) % PROBE_SLOTS;
            }
        }
    }

    /// Packets per second currently arriving.
    pub fn pkt_recv_rate(&self) -> u32 {
        filtered_rate(&self.intervals_us) as u32
    }

    /// Bytes per second currently arriving.
    pub fn byte_recv_rate(&self) -> u32 {
        let rate = self.pkt_recv_rate() as u64;
        let filled: Vec<usize> = self.sizes.iter().copied().filter(|&s| s > 0).collect();
        if filled.is_empty() {
            return 0;
        }
        let avg = filled.iter().sum::<usize>() / filled.len();
        (rate * avg as u64) as u32
    }

    /// Estimated link capacity, packets per second.
    pub fn capacity(&self) -> u32 {
        filtered_rate(&self.probes_us) as u32
    }
}

impl Default for ArrivalWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn steady_arrivals_give_matching_rate() {
        let mut w = ArrivalWindow::new();
        let t0 = Instant::now();
        // One packet per millisecond → 1000 pkts/s.
        for i in 0..32u64 {
            w.on_arrival(t0 + Duration::from_millis(i), 1000);
        }
        let rate = w.pkt_recv_rate();
        assert!((900..=1100).contains(&rate), "rate {rate}");
        let bps = w.byte_recv_rate();
        assert!((900_000..=1_100_000).contains(&bps), "bps {bps}");
    }

    #[test]
    fn outliers_are_filtered() {
        let mut w = ArrivalWindow::new();
        let mut t = Instant::now();
        for i in 0..32u64 {
            // Every eighth gap stalls 500 ms; the filter must ignore those.
            let gap = if i % 8 == 0 { Duration::from_millis(500) } else { Duration::from_millis(1) };
            t += gap;
            w.on_arrival(t, 1000);
        }
        let rate = w.pkt_recv_rate();
        assert!(rate > 500, "stalls leaked into the estimate: {rate}");
    }

    #[test]
    fn probe_pairs_estimate_capacity() {
        let mut w = ArrivalWindow::new();
        let t0 = Instant::now();
        // 100 µs back-to-back spacing → 10_000 pkts/s.
        for i in 0..PROBE_SLOTS as u64 {
            let base = t0 + Duration::from_millis(i * 10);
            w.on_probe1(base);
            w.on_probe2(base + Duration::from_micros(100));
        }
        let cap = w.capacity();
        assert!((9_000..=11_000).contains(&cap), "cap {cap}");
    }

    #[test]
    fn probe2_without_probe1_is_ignored() {
        let mut w = ArrivalWindow::new();
        let before = w.capacity();
        w.on_probe2(Instant::now());
        assert_eq!(w.capacity(), before);
    }
}

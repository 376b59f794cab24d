//! Pluggable congestion control.
//!
//! Controllers are looked up by name at connection setup ("live" and "file"
//! ship built in; applications may register their own). The transport only
//! ever consults the pacing interval, the window, and the timers derived
//! from the controller's RTT state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Interval between rate-control adjustments (the SYN interval).
pub const RATE_CTRL_INTERVAL: Duration = Duration::from_millis(10);

/// Transport-side readings a controller may consult.
#[derive(Debug, Clone, Copy)]
pub struct CcInputs {
    pub mss: usize,
    /// Configured ceiling, bytes per second; <= 0 means unconstrained.
    pub max_bw: i64,
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// Receiver's delivery rate estimate, packets per second.
    pub delivery_rate_pps: u32,
    /// Receiver's link capacity estimate, packets per second.
    pub capacity_pps: u32,
    /// Packets currently in flight.
    pub flight_pkts: i32,
    /// Peer's flow-control window.
    pub flow_window_pkts: i32,
}

impl Default for CcInputs {
    fn default() -> Self {
        CcInputs {
            mss: 1500,
            max_bw: -1,
            rtt_us: 100_000,
            rtt_var_us: 50_000,
            delivery_rate_pps: 0,
            capacity_pps: 0,
            flight_pkts: 0,
            flow_window_pkts: 25_600,
        }
    }
}

pub trait CongestionControl: Send {
    fn init(&mut self, inputs: &CcInputs);
    fn close(&mut self) {}

    fn on_ack(&mut self, inputs: &CcInputs, acked_seq: i32);
    fn on_loss(&mut self, inputs: &CcInputs, first: i32, pkts: u64);
    fn on_timeout(&mut self, inputs: &CcInputs);
    fn on_pkt_sent(&mut self, inputs: &CcInputs) {
        let _ = inputs;
    }

    /// Spacing between consecutive data packets.
    fn pacing_interval(&self) -> Duration;
    /// Congestion window, packets.
    fn window(&self) -> f64;
}

// ---------------------------------------------------------------------------
// Live controller: constant-rate pacing against the configured bandwidth.
// ---------------------------------------------------------------------------

/// Streaming controller: paces to the configured (or assumed) bandwidth and
/// never reacts to loss with rate cuts; recovery rides on retransmission
/// and the latency budget.
pub struct LiveCc {
    pacing: Duration,
    window: f64,
    pkt_size: usize,
}

/// Bandwidth assumed when `max_bw` is unconstrained.
const LIVE_FALLBACK_BW: i64 = 1_000_000_000 / 8; // 1 Gbps in bytes/s

impl LiveCc {
    pub fn new() -> LiveCc {
        LiveCc { pacing: Duration::from_micros(10), window: 25_600.0, pkt_size: 1500 }
    }

    fn recompute(&mut self, inputs: &CcInputs) {
        let bw = if inputs.max_bw > 0 { inputs.max_bw } else { LIVE_FALLBACK_BW };
        let us = (self.pkt_size as u64).saturating_mul(1_000_000) / bw.max(1) as u64;
        self.pacing = Duration::from_micros(us.max(1));
        self.window = inputs.flow_window_pkts.max(1) as f64;
    }
}

impl CongestionControl for LiveCc {
    fn init(&mut self, inputs: &CcInputs) {
        self.pkt_size = inputs.mss;
        self.recompute(inputs);
    }

    fn on_ack(&mut self, inputs: &CcInputs, _acked_seq: i32) {
        self.recompute(inputs);
    }

    fn on_loss(&mut self, _inputs: &CcInputs, _first: i32, _pkts: u64) {}

    fn on_timeout(&mut self, _inputs: &CcInputs) {}

    fn pacing_interval(&self) -> Duration {
        self.pacing
    }

    fn window(&self) -> f64 {
        self.window
    }
}

// ---------------------------------------------------------------------------
// File controller: classic AIMD for bulk transfer.
// ---------------------------------------------------------------------------

/// Bulk-transfer controller: slow start into rate-based additive increase,
/// multiplicative period backoff on loss.
pub struct FileCc {
    pacing_us: f64,
    window: f64,
    slow_start: bool,
    last_ack: i32,
    /// Largest sequence sent when the last loss was seen; a loss below it
    /// belongs to the same congestion event.
    loss_horizon: i32,
    dec_count: u32,
    mss: usize,
}

impl FileCc {
    pub fn new() -> FileCc {
        FileCc {
            pacing_us: 1.0,
            window: 16.0,
            slow_start: true,
            last_ack: 0,
            loss_horizon: -1,
            dec_count: 1,
            mss: 1500,
        }
    }
}

impl CongestionControl for FileCc {
    fn init(&mut self, inputs: &CcInputs) {
        self.mss = inputs.mss;
        self.window = 16.0;
        self.slow_start = true;
        self.pacing_us = 1.0;
    }

    fn on_ack(&mut self, inputs: &CcInputs, acked_seq: i32) {
        let acked = crate::seq::seq_off(self.last_ack, acked_seq).max(0) as f64;
        self.last_ack = acked_seq;

        if self.slow_start {
            self.window += acked;
            if self.window >= inputs.flow_window_pkts as f64 {
                self.slow_start = false;
                if inputs.delivery_rate_pps > 0 {
                    self.pacing_us = 1_000_000.0 / inputs.delivery_rate_pps as f64;
                } else {
                    self.pacing_us = self.window / (inputs.rtt_us as f64 + 10_000.0);
                }
            }
            return;
        }

        // Steady state: window follows the delivery rate; the sending
        // period shrinks by an increase derived from spare capacity.
        self.window = inputs.delivery_rate_pps as f64
            * (inputs.rtt_us as f64 + RATE_CTRL_INTERVAL.as_micros() as f64)
            / 1_000_000.0
            + 16.0;

        let current_rate = 1_000_000.0 / self.pacing_us;
        let spare = inputs.capacity_pps as f64 - current_rate;
        let inc = if spare <= 0.0 {
            1.0 / self.mss as f64
        } else {
            let bits = spare * self.mss as f64 * 8.0;
            (10f64.powf(bits.log10().ceil()) * 1.5e-6 / self.mss as f64).max(1.0 / self.mss as f64)
        };
        let syn = RATE_CTRL_INTERVAL.as_micros() as f64;
        self.pacing_us = (self.pacing_us * syn) / (self.pacing_us * inc + syn);
    }

    fn on_loss(&mut self, _inputs: &CcInputs, first: i32, _pkts: u64) {
        self.slow_start = false;
        if crate::seq::seq_cmp(first, self.loss_horizon) > 0 {
            // New congestion event: back the period off.
            self.pacing_us *= 1.125;
            self.loss_horizon = first;
            self.dec_count = 1;
        } else {
            // Within the same event, back off progressively less often.
            self.dec_count += 1;
            if self.dec_count.is_power_of_two() {
                self.pacing_us *= 1.125;
            }
        }
    }

    fn on_timeout(&mut self, _inputs: &CcInputs) {
        if self.slow_start {
            self.slow_start = false;
            self.pacing_us = 10.0;
        }
    }

    fn pacing_interval(&self) -> Duration {
        Duration::from_micros(self.pacing_us.max(1.0) as u64)
    }

    fn window(&self) -> f64 {
        self.window
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type CcBuilder = fn() -> Box<dyn CongestionControl>;

/// Name → builder table; "live" and "file" are pre-registered.
pub struct CcRegistry {
    builders: Mutex<HashMap<String, CcBuilder>>,
}

impl CcRegistry {
    pub fn new() -> CcRegistry {
        let mut builders: HashMap<String, CcBuilder> = HashMap::new();
        builders.insert("live".into(), || Box::new(LiveCc::new()));
        builders.insert("file".into(), || Box::new(FileCc::new()));
        CcRegistry { builders: Mutex::new(builders) }
    }

    pub fn register(&self, name: &str, builder: CcBuilder) {
        self.builders.lock().unwrap().insert(name.to_string(), builder);
    }

    pub fn build(&self, name: &str) -> Result<Box<dyn CongestionControl>> {
        self.builders
            .lock()
            .unwrap()
            .get(name)
            .map(|b| b())
            .ok_or(Error::InvalidParam)
    }
}

impl Default for CcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_paces_to_configured_bandwidth() {
        let mut cc = LiveCc::new();
        let inputs = CcInputs { mss: 1500, max_bw: 1_500_000, ..CcInputs::default() };
        cc.init(&inputs);
        // 1500 bytes at 1.5 MB/s → one packet per millisecond.
        assert_eq!(cc.pacing_interval(), Duration::from_millis(1));
        // Loss must not slow a live stream down.
        cc.on_loss(&inputs, 100, 10);
        assert_eq!(cc.pacing_interval(), Duration::from_millis(1));
    }

    #[test]
    fn live_unconstrained_uses_fallback_rate() {
        let mut cc = LiveCc::new();
        cc.init(&CcInputs::default());
        assert!(cc.pacing_interval() <= Duration::from_micros(50));
    }

    #[test]
    fn file_slow_start_grows_then_exits() {
        let mut cc = FileCc::new();
        let inputs = CcInputs { flow_window_pkts: 100, ..CcInputs::default() };
        cc.init(&inputs);
        assert!(cc.window() < 100.0);
        cc.on_ack(&inputs, 200);
        cc.last_ack = 0;
        cc.on_ack(&inputs, 200);
        assert!(!cc.slow_start, "window {} should have left slow start", cc.window());
    }

    #[test]
    fn file_loss_backs_off_pacing() {
        let mut cc = FileCc::new();
        let inputs = CcInputs::default();
        cc.init(&inputs);
        cc.slow_start = false;
        cc.pacing_us = 100.0;
        cc.on_loss(&inputs, 500, 3);
        let after_first = cc.pacing_interval();
        assert!(after_first >= Duration::from_micros(112));
        // Re-reported loss inside the same event must not compound every time.
        cc.on_loss(&inputs, 400, 1);
        cc.on_loss(&inputs, 450, 1);
        assert!(cc.pacing_interval() < Duration::from_micros(200));
    }

    #[test]
    fn registry_builds_known_names_only() {
        let reg = CcRegistry::new();
        assert!(reg.build("live").is_ok());
        assert!(reg.build("file").is_ok());
        assert_eq!(reg.build("bespoke").err(), Some(Error::InvalidParam));
        reg.register("bespoke", || Box::new(LiveCc::new()));
        assert!(reg.build("bespoke").is_ok());
    }
}

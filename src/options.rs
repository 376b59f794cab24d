//! Per-socket option table.
//!
//! Options that shape buffers, the multiplexer key or the handshake are
//! frozen once the socket is bound (or connected); the mutability rules are
//! enforced in the registry, which knows the socket state.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::handshake::MAX_STREAM_ID;
use crate::packet::UDP_OVERHEAD;

/// Everything configurable on a socket, with live-streaming defaults.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Maximum segment size including IP/UDP overhead.
    pub mss: usize,
    /// Flow-control window: the most packets allowed in flight.
    pub flight_flag_size: i32,
    /// Send buffer capacity, packets.
    pub snd_buf_pkts: usize,
    /// Receive buffer capacity, packets.
    pub rcv_buf_pkts: usize,
    pub udp_snd_buf: usize,
    pub udp_rcv_buf: usize,
    pub rendezvous: bool,
    pub reuse_addr: bool,
    /// None blocks forever (when the blocking mode below is on).
    pub snd_timeout: Option<Duration>,
    pub rcv_timeout: Option<Duration>,
    /// Blocking send / recv ("synchronous" modes).
    pub snd_syn: bool,
    pub rcv_syn: bool,
    /// Bytes per second; <= 0 means unconstrained.
    pub max_bw: i64,
    /// Receiver-side playout latency.
    pub latency: Duration,
    /// Latency demanded of the peer's receiving direction.
    pub peer_latency: Duration,
    pub tlpktdrop: bool,
    pub tsbpd: bool,
    /// Largest message handed to `send` in live mode.
    pub payload_size: usize,
    pub passphrase: Option<String>,
    /// Advertised key length for the keying-material extension (bytes).
    pub pb_key_len: usize,
    pub congestion: String,
    pub stream_id: String,
    pub linger: Option<Duration>,
    pub connect_timeout: Duration,
    pub peer_idle_timeout: Duration,
    pub ip_ttl: Option<u32>,
    pub ip_tos: Option<u32>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            mss: 1500,
            flight_flag_size: 25_600,
            snd_buf_pkts: 8192,
            rcv_buf_pkts: 8192,
            udp_snd_buf: 65_536,
            udp_rcv_buf: 8192 * 1500,
            rendezvous: false,
            reuse_addr: true,
            snd_timeout: None,
            rcv_timeout: None,
            snd_syn: true,
            rcv_syn: true,
            max_bw: -1,
            latency: Duration::from_millis(120),
            peer_latency: Duration::ZERO,
            tlpktdrop: true,
            tsbpd: true,
            payload_size: 1316,
            passphrase: None,
            pb_key_len: 0,
            congestion: "live".into(),
            stream_id: String::new(),
            linger: None,
            connect_timeout: Duration::from_secs(3),
            peer_idle_timeout: Duration::from_secs(10),
            ip_ttl: None,
            ip_tos: None,
        }
    }
}

impl SocketOptions {
    /// Payload budget per data packet.
    pub fn payload_budget(&self) -> usize {
        self.mss - UDP_OVERHEAD
    }

    pub fn validate(&self) -> Result<()> {
        if self.mss <= UDP_OVERHEAD + 4 || self.mss > 65_536 {
            return Err(Error::InvalidParam);
        }
        if self.payload_size > self.payload_budget() * 8 {
            return Err(Error::InvalidParam);
        }
        if self.flight_flag_size < 1 {
            return Err(Error::InvalidParam);
        }
        if self.stream_id.len() > MAX_STREAM_ID {
            return Err(Error::InvalidParam);
        }
        if let Some(p) = &self.passphrase {
            if !p.is_empty() && (p.len() < 10 || p.len() > 79) {
                return Err(Error::InvalidParam);
            }
        }
        Ok(())
    }
}

/// A single option assignment for `Runtime::set_option`.
#[derive(Debug, Clone)]
pub enum SockOpt {
    Mss(usize),
    FlightFlagSize(i32),
    SndBuf(usize),
    RcvBuf(usize),
    UdpSndBuf(usize),
    UdpRcvBuf(usize),
    Rendezvous(bool),
    ReuseAddr(bool),
    SndTimeout(Option<Duration>),
    RcvTimeout(Option<Duration>),
    SndSyn(bool),
    RcvSyn(bool),
    MaxBw(i64),
    Latency(Duration),
    PeerLatency(Duration),
    TlPktDrop(bool),
    Tsbpd(bool),
    PayloadSize(usize),
    Passphrase(Option<String>),
    PbKeyLen(usize),
    Congestion(String),
    StreamId(String),
    Linger(Option<Duration>),
    ConnectTimeout(Duration),
    PeerIdleTimeout(Duration),
    IpTtl(Option<u32>),
    IpTos(Option<u32>),
}

impl SockOpt {
    /// True if the option participates in binding or the handshake and must
    /// therefore be set before `bind`/`connect`.
    pub fn pre_bind_only(&self) -> bool {
        matches!(
            self,
            SockOpt::Mss(_)
                | SockOpt::UdpSndBuf(_)
                | SockOpt::UdpRcvBuf(_)
                | SockOpt::ReuseAddr(_)
                | SockOpt::IpTtl(_)
                | SockOpt::IpTos(_)
        )
    }

    /// True if the option must be settled before the connection exists.
    pub fn pre_connect_only(&self) -> bool {
        self.pre_bind_only()
            || matches!(
                self,
                SockOpt::FlightFlagSize(_)
                    | SockOpt::SndBuf(_)
                    | SockOpt::RcvBuf(_)
                    | SockOpt::Rendezvous(_)
                    | SockOpt::Latency(_)
                    | SockOpt::PeerLatency(_)
                    | SockOpt::Tsbpd(_)
                    | SockOpt::PayloadSize(_)
                    | SockOpt::Passphrase(_)
                    | SockOpt::PbKeyLen(_)
                    | SockOpt::Congestion(_)
                    | SockOpt::StreamId(_)
            )
    }

    pub fn apply(self, o: &mut SocketOptions) {
        match self {
            SockOpt::Mss(v) => o.mss = v,
            SockOpt::FlightFlagSize(v) => o.flight_flag_size = v,
            SockOpt::SndBuf(v) => o.snd_buf_pkts = v,
            SockOpt::RcvBuf(v) => o.rcv_buf_pkts = v,
            SockOpt::UdpSndBuf(v) => o.udp_snd_buf = v,
            SockOpt::UdpRcvBuf(v) => o.udp_rcv_buf = v,
            SockOpt::Rendezvous(v) => o.rendezvous = v,
            SockOpt::ReuseAddr(v) => o.reuse_addr = v,
            SockOpt::SndTimeout(v) => o.snd_timeout = v,
            SockOpt::RcvTimeout(v) => o.rcv_timeout = v,
            SockOpt::SndSyn(v) => o.snd_syn = v,
            SockOpt::RcvSyn(v) => o.rcv_syn = v,
            SockOpt::MaxBw(v) => o.max_bw = v,
            SockOpt::Latency(v) => o.latency = v,
            SockOpt::PeerLatency(v) => o.peer_latency = v,
            SockOpt::TlPktDrop(v) => o.tlpktdrop = v,
            SockOpt::Tsbpd(v) => o.tsbpd = v,
            SockOpt::PayloadSize(v) => o.payload_size = v,
            SockOpt::Passphrase(v) => o.passphrase = v,
            SockOpt::PbKeyLen(v) => o.pb_key_len = v,
            SockOpt::Congestion(v) => o.congestion = v,
            SockOpt::StreamId(v) => o.stream_id = v,
            SockOpt::Linger(v) => o.linger = v,
            SockOpt::ConnectTimeout(v) => o.connect_timeout = v,
            SockOpt::PeerIdleTimeout(v) => o.peer_idle_timeout = v,
            SockOpt::IpTtl(v) => o.ip_ttl = v,
            SockOpt::IpTos(v) => o.ip_tos = v,
        }
    }
}

//! Wire format: the fixed 16-byte header plus data and control payloads.
//!
//! All multi-byte integers are big-endian on the wire. Control-packet
//! payloads are sequences of 32-bit words, each byte-swapped like the
//! header. Data payloads are opaque bytes.
//!
//! ```text
//! bit 0:   0 = data, 1 = control
//! Data:    [0|seq(31)] [FF|O|KK|R|msgno(26)] [timestamp(32)] [dst id(32)]
//! Control: [1|type(15)|subtype(16)] [type-specific info(32)] [timestamp(32)] [dst id(32)]
//! ```

use crate::handshake::Handshake;
use crate::seq;

/// Size of the packet header on the wire.
pub const HEADER_SIZE: usize = 16;

/// IP + UDP header overhead assumed when converting MSS to payload budget.
pub const UDP_OVERHEAD: usize = 28;

/// Largest payload a data packet may carry for a given MSS.
pub fn payload_budget(mss: usize) -> usize {
    mss - UDP_OVERHEAD
}

// ---------------------------------------------------------------------------
// Data packets
// ---------------------------------------------------------------------------

/// Position of a data packet within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketPosition {
    Middle = 0,
    Last = 1,
    First = 2,
    Only = 3,
}

impl PacketPosition {
    fn from_bits(b: u32) -> Self {
        match b & 0b11 {
            1 => PacketPosition::Last,
            2 => PacketPosition::First,
            3 => PacketPosition::Only,
            _ => PacketPosition::Middle,
        }
    }

    pub fn is_first(self) -> bool {
        matches!(self, PacketPosition::First | PacketPosition::Only)
    }

    pub fn is_last(self) -> bool {
        matches!(self, PacketPosition::Last | PacketPosition::Only)
    }
}

/// The second header word of a data packet: message number plus flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgInfo {
    pub position: PacketPosition,
    pub in_order: bool,
    /// Two-bit even/odd encryption marker; zero when plaintext.
    pub key_flags: u8,
    pub retransmitted: bool,
    pub msgno: i32,
}

impl MsgInfo {
    pub fn new(position: PacketPosition, in_order: bool, msgno: i32) -> Self {
        MsgInfo { position, in_order, key_flags: 0, retransmitted: false, msgno }
    }

    pub fn to_word(self) -> u32 {
        ((self.position as u32) << 30)
            | ((self.in_order as u32) << 29)
            | ((self.key_flags as u32 & 0b11) << 27)
            | ((self.retransmitted as u32) << 26)
            | (self.msgno as u32 & 0x03FF_FFFF)
    }

    pub fn from_word(w: u32) -> Self {
        MsgInfo {
            position: PacketPosition::from_bits(w >> 30),
            in_order: (w >> 29) & 1 == 1,
            key_flags: ((w >> 27) & 0b11) as u8,
            retransmitted: (w >> 26) & 1 == 1,
            msgno: (w & 0x03FF_FFFF) as i32,
        }
    }
}

/// Parsed header of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub seq: i32,
    pub msg: MsgInfo,
    pub timestamp: u32,
    pub dst: i32,
}

impl DataHeader {
    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_SIZE);
        out[0..4].copy_from_slice(&(self.seq as u32 & 0x7FFF_FFFF).to_be_bytes());
        out[4..8].copy_from_slice(&self.msg.to_word().to_be_bytes());
        out[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        out[12..16].copy_from_slice(&(self.dst as u32).to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<DataHeader> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let w0 = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if w0 & 0x8000_0000 != 0 {
            return None;
        }
        Some(DataHeader {
            seq: (w0 & 0x7FFF_FFFF) as i32,
            msg: MsgInfo::from_word(u32::from_be_bytes(buf[4..8].try_into().unwrap())),
            timestamp: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            dst: u32::from_be_bytes(buf[12..16].try_into().unwrap()) as i32,
        })
    }
}

/// Serialize a full data packet (header + payload) into `out`.
pub fn encode_data(hdr: &DataHeader, payload: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.resize(HEADER_SIZE, 0);
    hdr.encode_into(&mut out[..HEADER_SIZE]);
    out.extend_from_slice(payload);
}

/// True if the datagram carries a control packet. Runt datagrams return None.
pub fn is_control(buf: &[u8]) -> Option<bool> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    Some(buf[0] & 0x80 != 0)
}

/// Destination socket id without a full parse.
pub fn peek_dst(buf: &[u8]) -> Option<i32> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    Some(u32::from_be_bytes(buf[12..16].try_into().unwrap()) as i32)
}

// ---------------------------------------------------------------------------
// Control packets
// ---------------------------------------------------------------------------

/// Inclusive sequence range reported lost.
pub type LossRange = (i32, i32);

/// The optional tail of a full acknowledgement. Light ACKs omit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckDetail {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// Receiver buffer headroom, in packets.
    pub avail_buf_pkts: u32,
    /// Packets per second observed arriving.
    pub pkt_recv_rate: u32,
    /// Estimated link capacity, packets per second.
    pub link_capacity: u32,
    /// Delivery rate, bytes per second.
    pub recv_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Handshake(Handshake),
    KeepAlive,
    /// `ack_no` identifies this ACK for the ACK-ACK round trip.
    Ack { ack_no: i32, last_ack_seq: i32, detail: Option<AckDetail> },
    Nak(Vec<LossRange>),
    CongestionWarning,
    Shutdown,
    AckAck { ack_no: i32 },
    DropReq { msgno: i32, first: i32, last: i32 },
    PeerError { code: u32 },
    /// User/extension frame: raw subtype plus payload words.
    Ext { ext_type: u16, words: Vec<u32> },
}

impl Control {
    fn type_code(&self) -> u16 {
        match self {
            Control::Handshake(_) => 0x0000,
            Control::KeepAlive => 0x0001,
            Control::Ack { .. } => 0x0002,
            Control::Nak(_) => 0x0003,
            Control::CongestionWarning => 0x0004,
            Control::Shutdown => 0x0005,
            Control::AckAck { .. } => 0x0006,
            Control::DropReq { .. } => 0x0007,
            Control::PeerError { .. } => 0x0008,
            Control::Ext { .. } => 0x7FFF,
        }
    }
}

/// A decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub dst: i32,
    pub timestamp: u32,
    pub control: Control,
}

impl ControlPacket {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        let type_code = self.control.type_code();
        let subtype: u16 = match &self.control {
            Control::Ext { ext_type, .. } => *ext_type,
            _ => 0,
        };
        let info: u32 = match &self.control {
            Control::Ack { ack_no, .. } => *ack_no as u32,
            Control::AckAck { ack_no } => *ack_no as u32,
            Control::DropReq { msgno, .. } => *msgno as u32,
            Control::PeerError { code } => *code,
            _ => 0,
        };
        let w0 = 0x8000_0000 | ((type_code as u32) << 16) | subtype as u32;
        out.extend_from_slice(&w0.to_be_bytes());
        out.extend_from_slice(&info.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&(self.dst as u32).to_be_bytes());
        for w in self.payload_words() {
            out.extend_from_slice(&w.to_be_bytes());
        }
    }

    fn payload_words(&self) -> Vec<u32> {
        match &self.control {
            Control::Handshake(hs) => hs.encode_words(),
            Control::KeepAlive
            | Control::CongestionWarning
            | Control::Shutdown
            | Control::AckAck { .. }
            | Control::PeerError { .. } => Vec::new(),
            Control::Ack { last_ack_seq, detail, .. } => {
                let mut words = vec![*last_ack_seq as u32];
                if let Some(d) = detail {
                    words.extend_from_slice(&[
                        d.rtt_us,
                        d.rtt_var_us,
                        d.avail_buf_pkts,
                        d.pkt_recv_rate,
                        d.link_capacity,
                        d.recv_rate,
                    ]);
                }
                words
            }
            Control::Nak(ranges) => {
                let mut words = Vec::with_capacity(ranges.len() * 2);
                for &(from, to) in ranges {
                    if from == to {
                        words.push(from as u32);
                    } else {
                        words.push(from as u32 | 0x8000_0000);
                        words.push(to as u32);
                    }
                }
                words
            }
            Control::DropReq { first, last, .. } => vec![*first as u32, *last as u32],
            Control::Ext { words, .. } => words.clone(),
        }
    }

    pub fn decode(buf: &[u8]) -> Option<ControlPacket> {
        if buf.len() < HEADER_SIZE || buf.len() % 4 != 0 {
            return None;
        }
        let w0 = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if w0 & 0x8000_0000 == 0 {
            return None;
        }
        let type_code = ((w0 >> 16) & 0x7FFF) as u16;
        let subtype = (w0 & 0xFFFF) as u16;
        let info = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let timestamp = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let dst = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as i32;
        let words: Vec<u32> = buf[16..]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();

        let control = match type_code {
            0x0000 => Control::Handshake(Handshake::decode_words(&words)?),
            0x0001 => Control::KeepAlive,
            0x0002 => {
                let last_ack_seq = (*words.first()? & 0x7FFF_FFFF) as i32;
                let detail = if words.len() >= 7 {
                    Some(AckDetail {
                        rtt_us: words[1],
                        rtt_var_us: words[2],
                        avail_buf_pkts: words[3],
                        pkt_recv_rate: words[4],
                        link_capacity: words[5],
                        recv_rate: words[6],
                    })
                } else {
                    None
                };
                Control::Ack { ack_no: info as i32, last_ack_seq, detail }
            }
            0x0003 => {
                let mut ranges = Vec::new();
                let mut i = 0;
                while i < words.len() {
                    let w = words[i];
                    if w & 0x8000_0000 != 0 {
                        let from = (w & 0x7FFF_FFFF) as i32;
                        let to = (*words.get(i + 1)? & 0x7FFF_FFFF) as i32;
                        if seq::seq_cmp(to, from) < 0 {
                            return None;
                        }
                        ranges.push((from, to));
                        i += 2;
                    } else {
                        ranges.push((w as i32, w as i32));
                        i += 1;
                    }
                }
                Control::Nak(ranges)
            }
            0x0004 => Control::CongestionWarning,
            0x0005 => Control::Shutdown,
            0x0006 => Control::AckAck { ack_no: info as i32 },
            0x0007 => {
                if words.len() < 2 {
                    return None;
                }
                Control::DropReq {
                    msgno: info as i32,
                    first: (words[0] & 0x7FFF_FFFF) as i32,
                    last: (words[1] & 0x7FFF_FFFF) as i32,
                }
            }
            0x0008 => Control::PeerError { code: info },
            0x7FFF => Control::Ext { ext_type: subtype, words },
            _ => return None,
        };

        Some(ControlPacket { dst, timestamp, control })
    }
}

//! Handshake payload codec and connection-setup vocabulary.
//!
//! Two generations are spoken: the fixed 48-byte legacy payload (version 4)
//! and the extended payload (version 5) that appends typed extension blocks
//! (transport settings, keying material, stream id, congestion controller
//! name, packet-filter config, group membership).

use std::net::{IpAddr, SocketAddr};

/// Version word carried in the transport-settings extension:
/// major.minor.patch packed one byte each.
pub const TRANSPORT_VERSION: u32 = 0x0001_0500;

/// Magic value the listener places in the extension field of its induction
/// response to advertise version-5 support.
pub const INDUCTION_MAGIC: u16 = 0x4A17;

/// Legacy socket-type marker kept in the version-4 type field.
pub const LEGACY_DGRAM: u16 = 2;

// Extension-field bits of a version-5 conclusion.
pub const HS_EXT_TRANSPORT: u16 = 0x1;
pub const HS_EXT_KM: u16 = 0x2;
pub const HS_EXT_CONFIG: u16 = 0x4;

// Flag bits inside the transport-settings extension.
pub const FLAG_TSBPD_SND: u32 = 0x1;
pub const FLAG_TSBPD_RCV: u32 = 0x2;
pub const FLAG_CRYPT: u32 = 0x4;
pub const FLAG_TLPKTDROP: u32 = 0x8;
pub const FLAG_PERIODIC_NAK: u32 = 0x10;
pub const FLAG_REXMIT: u32 = 0x20;

/// Why a connection request was refused. Carried on the wire inside a
/// refused conclusion as `1000 + code` in the request-type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Unknown = 0,
    System = 1,
    Peer = 2,
    Resource = 3,
    Rogue = 4,
    Backlog = 5,
    Ipe = 6,
    Close = 7,
    Version = 8,
    RdvCookie = 9,
    BadSecret = 10,
    Unsecure = 11,
    MessageApi = 12,
    Congestion = 13,
    Filter = 14,
    Group = 15,
    Timeout = 16,
}

impl RejectReason {
    pub fn from_code(code: u16) -> RejectReason {
        use RejectReason::*;
        match code {
            1 => System,
            2 => Peer,
            3 => Resource,
            4 => Rogue,
            5 => Backlog,
            6 => Ipe,
            7 => Close,
            8 => Version,
            9 => RdvCookie,
            10 => BadSecret,
            11 => Unsecure,
            12 => MessageApi,
            13 => Congestion,
            14 => Filter,
            15 => Group,
            16 => Timeout,
            _ => Unknown,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// The request-type word of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsReqType {
    WaveAHand,
    Induction,
    Conclusion,
    Agreement,
    Rejection(RejectReason),
}

impl HsReqType {
    fn to_wire(self) -> i32 {
        match self {
            HsReqType::WaveAHand => 0,
            HsReqType::Induction => 1,
            HsReqType::Conclusion => -1,
            HsReqType::Agreement => -2,
            HsReqType::Rejection(r) => 1000 + r.code() as i32,
        }
    }

    fn from_wire(v: i32) -> Option<HsReqType> {
        match v {
            0 => Some(HsReqType::WaveAHand),
            1 => Some(HsReqType::Induction),
            -1 => Some(HsReqType::Conclusion),
            -2 => Some(HsReqType::Agreement),
            v if (1000..=1016).contains(&v) => {
                Some(HsReqType::Rejection(RejectReason::from_code((v - 1000) as u16)))
            }
            _ => None,
        }
    }
}

/// Transport settings exchanged in the version-5 conclusion (request from
/// the initiator, response from the responder).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub version: u32,
    pub flags: u32,
    /// Latency the sender of this block applies to its receiving direction.
    pub rcv_latency_ms: u16,
    /// Latency requested of the peer's receiving direction.
    pub snd_latency_ms: u16,
}

impl TransportConfig {
    fn words(&self) -> [u32; 3] {
        [
            self.version,
            self.flags,
            ((self.snd_latency_ms as u32) << 16) | self.rcv_latency_ms as u32,
        ]
    }

    fn from_words(w: &[u32]) -> Option<TransportConfig> {
        if w.len() < 3 {
            return None;
        }
        Some(TransportConfig {
            version: w[0],
            flags: w[1],
            snd_latency_ms: (w[2] >> 16) as u16,
            rcv_latency_ms: (w[2] & 0xFFFF) as u16,
        })
    }
}

/// A typed extension block of a version-5 handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsExt {
    TransportReq(TransportConfig),
    TransportRsp(TransportConfig),
    /// Keying material, opaque to the transport core.
    Km { response: bool, words: Vec<u32> },
    StreamId(String),
    Congestion(String),
    Filter(String),
    Group(Vec<u32>),
    Unknown { ext_type: u16, words: Vec<u32> },
}

const EXT_TRANSPORT_REQ: u16 = 1;
const EXT_TRANSPORT_RSP: u16 = 2;
const EXT_KM_REQ: u16 = 3;
const EXT_KM_RSP: u16 = 4;
const EXT_SID: u16 = 5;
const EXT_CONGESTION: u16 = 6;
const EXT_FILTER: u16 = 7;
const EXT_GROUP: u16 = 8;

/// Stream-id length cap, bytes.
pub const MAX_STREAM_ID: usize = 512;

fn pack_string(s: &str) -> Vec<u32> {
    let bytes = s.as_bytes();
    let mut words = Vec::with_capacity((bytes.len() + 3) / 4);
    for chunk in bytes.chunks(4) {
        let mut w = 0u32;
        for (i, b) in chunk.iter().enumerate() {
            w |= (*b as u32) << (8 * i);
        }
        words.push(w);
    }
    words
}

fn unpack_string(words: &[u32]) -> Option<String> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for w in words {
        for i in 0..4 {
            bytes.push(((w >> (8 * i)) & 0xFF) as u8);
        }
    }
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8(bytes).ok()
}

impl HsExt {
    fn encode(&self, out: &mut Vec<u32>) {
        let (ext_type, words): (u16, Vec<u32>) = match self {
            HsExt::TransportReq(c) => (EXT_TRANSPORT_REQ, c.words().to_vec()),
            HsExt::TransportRsp(c) => (EXT_TRANSPORT_RSP, c.words().to_vec()),
            HsExt::Km { response, words } => {
                (if *response { EXT_KM_RSP } else { EXT_KM_REQ }, words.clone())
            }
            HsExt::StreamId(s) => (EXT_SID, pack_string(s)),
            HsExt::Congestion(s) => (EXT_CONGESTION, pack_string(s)),
            HsExt::Filter(s) => (EXT_FILTER, pack_string(s)),
            HsExt::Group(words) => (EXT_GROUP, words.clone()),
            HsExt::Unknown { ext_type, words } => (*ext_type, words.clone()),
        };
        out.push(((ext_type as u32) << 16) | words.len() as u32);
        out.extend_from_slice(&words);
    }

    fn decode(ext_type: u16, words: &[u32]) -> Option<HsExt> {
        Some(match ext_type {
            EXT_TRANSPORT_REQ => HsExt::TransportReq(TransportConfig::from_words(words)?),
            EXT_TRANSPORT_RSP => HsExt::TransportRsp(TransportConfig::from_words(words)?),
            EXT_KM_REQ => HsExt::Km { response: false, words: words.to_vec() },
            EXT_KM_RSP => HsExt::Km { response: true, words: words.to_vec() },
            EXT_SID => {
                let s = unpack_string(words)?;
                if s.len() > MAX_STREAM_ID {
                    return None;
                }
                HsExt::StreamId(s)
            }
            EXT_CONGESTION => HsExt::Congestion(unpack_string(words)?),
            EXT_FILTER => HsExt::Filter(unpack_string(words)?),
            EXT_GROUP => HsExt::Group(words.to_vec()),
            _ => HsExt::Unknown { ext_type, words: words.to_vec() },
        })
    }
}

/// A decoded handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    /// Encryption advertisement (0 = none); upper half of the type word.
    pub enc_field: u16,
    /// Version 5: extension bits or the induction magic. Version 4: the
    /// legacy socket type.
    pub ext_field: u16,
    pub isn: i32,
    pub mss: u32,
    pub flight_flag: u32,
    pub req_type: HsReqType,
    pub socket_id: i32,
    pub cookie: i32,
    pub peer_ip: [u32; 4],
    pub ext: Vec<HsExt>,
}

impl Handshake {
    /// Base payload length in words (48 bytes).
    const BASE_WORDS: usize = 12;

    /// First packet of a caller: spoken in version-4 dialect so that a
    /// legacy listener can answer it too.
    pub fn induction_request(socket_id: i32, isn: i32, mss: u32, flight_flag: u32) -> Handshake {
        Handshake {
            version: 4,
            enc_field: 0,
            ext_field: LEGACY_DGRAM,
            isn,
            mss,
            flight_flag,
            req_type: HsReqType::Induction,
            socket_id,
            cookie: 0,
            peer_ip: [0; 4],
            ext: Vec::new(),
        }
    }

    /// Listener's stateless induction reply carrying the cookie and the
    /// version-5 magic.
    pub fn induction_response(req: &Handshake, cookie: i32, peer: SocketAddr) -> Handshake {
        Handshake {
            version: 5,
            enc_field: 0,
            ext_field: INDUCTION_MAGIC,
            isn: req.isn,
            mss: req.mss,
            flight_flag: req.flight_flag,
            req_type: HsReqType::Induction,
            socket_id: 0,
            cookie,
            peer_ip: encode_peer_ip(peer.ip()),
            ext: Vec::new(),
        }
    }

    /// Rendezvous opener.
    pub fn wave_a_hand(socket_id: i32, isn: i32, mss: u32, flight_flag: u32, cookie: i32) -> Handshake {
        Handshake {
            version: 5,
            enc_field: 0,
            ext_field: 0,
            isn,
            mss,
            flight_flag,
            req_type: HsReqType::WaveAHand,
            socket_id,
            cookie,
            peer_ip: [0; 4],
            ext: Vec::new(),
        }
    }

    /// Refusal shaped after `base` (so the peer can correlate it).
    pub fn rejection(base: &Handshake, reason: RejectReason) -> Handshake {
        let mut hs = base.clone();
        hs.req_type = HsReqType::Rejection(reason);
        hs.ext = Vec::new();
        hs
    }

    pub fn transport_req(&self) -> Option<&TransportConfig> {
        self.ext.iter().find_map(|e| match e {
            HsExt::TransportReq(c) => Some(c),
            _ => None,
        })
    }

    pub fn transport_rsp(&self) -> Option<&TransportConfig> {
        self.ext.iter().find_map(|e| match e {
            HsExt::TransportRsp(c) => Some(c),
            _ => None,
        })
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.ext.iter().find_map(|e| match e {
            HsExt::StreamId(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn congestion(&self) -> Option<&str> {
        self.ext.iter().find_map(|e| match e {
            HsExt::Congestion(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn encode_words(&self) -> Vec<u32> {
        let mut w = Vec::with_capacity(Self::BASE_WORDS + self.ext.len() * 4);
        w.push(self.version);
        w.push(((self.enc_field as u32) << 16) | self.ext_field as u32);
        w.push(self.isn as u32 & 0x7FFF_FFFF);
        w.push(self.mss);
        w.push(self.flight_flag);
        w.push(self.req_type.to_wire() as u32);
        w.push(self.socket_id as u32);
        w.push(self.cookie as u32);
        w.extend_from_slice(&self.peer_ip);
        if self.version == 5 {
            for e in &self.ext {
                e.encode(&mut w);
            }
        }
        w
    }

    pub fn decode_words(words: &[u32]) -> Option<Handshake> {
        if words.len() < Self::BASE_WORDS {
            return None;
        }
        let version = words[0];
        if version != 4 && version != 5 {
            return None;
        }
        let mut hs = Handshake {
            version,
            enc_field: (words[1] >> 16) as u16,
            ext_field: (words[1] & 0xFFFF) as u16,
            isn: (words[2] & 0x7FFF_FFFF) as i32,
            mss: words[3],
            flight_flag: words[4],
            req_type: HsReqType::from_wire(words[5] as i32)?,
            socket_id: words[6] as i32,
            cookie: words[7] as i32,
            peer_ip: [words[8], words[9], words[10], words[11]],
            ext: Vec::new(),
        };
        if version == 5 {
            let mut i = Self::BASE_WORDS;
            while i < words.len() {
                let head = words[i];
                let ext_type = (head >> 16) as u16;
                let len = (head & 0xFFFF) as usize;
                i += 1;
                if i + len > words.len() {
                    return None;
                }
                hs.ext.push(HsExt::decode(ext_type, &words[i..i + len])?);
                i += len;
            }
        }
        Some(hs)
    }
}

fn encode_peer_ip(ip: IpAddr) -> [u32; 4] {
    match ip {
        IpAddr::V4(v4) => [u32::from_be_bytes(v4.octets()), 0, 0, 0],
        IpAddr::V6(v6) => {
            let o = v6.octets();
            let mut w = [0u32; 4];
            for (i, chunk) in o.chunks_exact(4).enumerate() {
                w[i] = u32::from_be_bytes(chunk.try_into().unwrap());
            }
            w
        }
    }
}

/// Cookie for stateless induction and the rendezvous contest: a keyed hash
/// of the peer address and a one-minute time bucket, so replays from a
/// different address or a stale capture fail verification.
pub fn make_cookie(peer: SocketAddr, secret: u64, minute_bucket: u64) -> i32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    secret.hash(&mut h);
    peer.ip().hash(&mut h);
    peer.port().hash(&mut h);
    minute_bucket.hash(&mut h);
    let v = h.finish();
    ((v ^ (v >> 32)) as u32) as i32
}

/// Rendezvous progress, one side's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousState {
    /// Waving, nothing heard yet.
    Waiting,
    /// Peer's wave received, replied.
    Attention,
    /// We won the cookie contest and sent our conclusion.
    Initiated,
    /// Responder saw the initiator's conclusion.
    Fine,
    Connected,
}

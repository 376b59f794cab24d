//! Per-socket ordered buffers: the sender's fragmented message FIFO and the
//! receiver's sequence-indexed ring.

pub mod rcv;
pub mod snd;

pub use rcv::{AddOutcome, Message, RcvBuffer, RxData};
pub use snd::{DropInfo, SndBuffer, SndPacket};

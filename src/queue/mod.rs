//! Shared per-multiplexer workers: the paced send worker with its schedule
//! heap, the receive worker with its dispatch table, and the queue of
//! in-flight connect attempts.

pub mod rcv;
pub mod rendezvous;
pub mod snd;

pub use rcv::RcvQueue;
pub use rendezvous::RendezvousQueue;
pub use snd::SndQueue;

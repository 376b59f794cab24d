//! rivulet — a reliable low-latency UDP transport.
//!
//! A connection-oriented, datagram-based protocol multiplexing many logical
//! sockets over shared UDP endpoints: in-order reliable message delivery
//! with NAK-driven retransmission, periodic acknowledgement, pluggable
//! congestion control, timestamp-based playout with too-late-packet drop,
//! caller/listener/rendezvous connection setup, and an epoll-like readiness
//! service.
//!
//! Entry point is [`Runtime`]:
//!
//! ```no_run
//! use rivulet::Runtime;
//!
//! let rt = Runtime::new();
//! let listener = rt.socket().unwrap();
//! rt.bind(listener, "127.0.0.1:49000".parse().unwrap()).unwrap();
//! rt.listen(listener, 10).unwrap();
//! let (sock, peer) = rt.accept(listener).unwrap();
//! let mut buf = vec![0u8; 1500];
//! let n = rt.recv(sock, &mut buf).unwrap();
//! println!("{} bytes from {}", n, peer);
//! ```

pub mod api;
pub mod buffer;
pub mod cc;
pub mod channel;
pub mod clock;
pub mod connection;
pub mod epoll;
pub mod error;
pub mod handshake;
pub mod loss;
pub mod multiplexer;
pub mod options;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod seq;
pub mod stats;
pub mod unit;
pub mod window;

pub use api::Runtime;
pub use cc::{CcInputs, CongestionControl};
pub use connection::SocketStatus;
pub use epoll::{EpollEvent, EPOLL_ERR, EPOLL_ET, EPOLL_IN, EPOLL_OUT};
pub use error::{Error, ErrorKind, Result};
pub use handshake::RejectReason;
pub use options::{SockOpt, SocketOptions};
pub use stats::{Counters, Gauges, StatsSnapshot};

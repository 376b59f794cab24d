//! Error taxonomy for the transport.
//!
//! Errors are grouped into kind families (setup, connection, resources, API
//! preconditions, would-block, peer) mirrored by [`ErrorKind`]. Internally
//! everything is `Result<_, Error>`; the public API additionally records the
//! last error in a per-thread slot (see `api`).

use std::io;

use thiserror::Error;

use crate::handshake::RejectReason;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bind/open failures.
    Setup,
    /// Transport-state errors (no connection, lost, refused).
    Connection,
    /// Resource exhaustion (memory, threads).
    SystemRes,
    /// API precondition failures.
    NotSup,
    /// Non-blocking operation would block.
    Again,
    /// The peer signalled an error.
    PeerError,
    Unknown,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("connection setup failure")]
    Setup,
    #[error("connection setup failure: unable to create/configure UDP socket: {0}")]
    SetupRes(String),

    #[error("no connection on this socket")]
    NoConn,
    #[error("connection was broken")]
    ConnLost,
    #[error("connection setup was aborted or refused")]
    ConnFail,
    #[error("connection rejected by peer: {0:?}")]
    ConnRej(RejectReason),

    #[error("not enough memory")]
    Memory,
    #[error("unable to spawn worker thread: {0}")]
    Thread(String),

    #[error("invalid socket id")]
    InvalidSock,
    #[error("invalid operation in this state")]
    InvalidOp,
    #[error("socket is already connected")]
    IsConnected,
    #[error("socket is not bound")]
    Unbound,
    #[error("operation not available in rendezvous mode")]
    IsRendezvous,
    #[error("socket is not listening")]
    NoListen,
    #[error("rendezvous connect requires a bound socket")]
    RendezvousUnbound,
    #[error("invalid parameter")]
    InvalidParam,

    #[error("no data available for reading")]
    AgainRead,
    #[error("no buffer space available for writing")]
    AgainWrite,
    #[error("operation timed out")]
    Timeout,
    #[error("congestion: send rejected by flow control")]
    Congestion,

    #[error("peer reported an error")]
    Peer,

    /// Internal programming error: an invariant the code relies on was
    /// observed broken. Logged at error level wherever it is produced.
    #[error("internal programming error: {0}")]
    Ipe(&'static str),

    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            Setup | SetupRes(_) => ErrorKind::Setup,
            NoConn | ConnLost | ConnFail | ConnRej(_) => ErrorKind::Connection,
            Memory | Thread(_) => ErrorKind::SystemRes,
            InvalidSock | InvalidOp | IsConnected | Unbound | IsRendezvous | NoListen
            | RendezvousUnbound | InvalidParam => ErrorKind::NotSup,
            AgainRead | AgainWrite | Timeout | Congestion => ErrorKind::Again,
            Peer => ErrorKind::PeerError,
            Ipe(_) | Io(_) => ErrorKind::Unknown,
        }
    }

    /// True for the would-block family, which a caller in non-blocking mode
    /// is expected to retry.
    pub fn is_again(&self) -> bool {
        self.kind() == ErrorKind::Again
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_families() {
        assert_eq!(Error::SetupRes("x".into()).kind(), ErrorKind::Setup);
        assert_eq!(Error::ConnLost.kind(), ErrorKind::Connection);
        assert_eq!(Error::ConnRej(RejectReason::Backlog).kind(), ErrorKind::Connection);
        assert_eq!(Error::NoListen.kind(), ErrorKind::NotSup);
        assert_eq!(Error::AgainRead.kind(), ErrorKind::Again);
        assert!(Error::Timeout.is_again());
        assert!(!Error::ConnFail.is_again());
    }

    #[test]
    fn io_errors_map_to_unknown() {
        let e: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(e.kind(), ErrorKind::Unknown);
    }
}

//! Thin wrapper over a non-blocking UDP socket shared by one multiplexer.
//!
//! The receive side folds transient conditions (timeout, interrupt, refused
//! ICMP, runt datagrams, kernel truncation) into `Again` so the worker loop
//! stays simple; anything else is a terminal `Error` that shuts the worker
//! down.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Error, Result};
use crate::packet::HEADER_SIZE;

/// How long a blocking receive waits before giving the worker a chance to
/// observe the closing flag.
pub const RECV_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub udp_snd_buf: usize,
    pub udp_rcv_buf: usize,
    pub reuse_addr: bool,
    pub ip_ttl: Option<u32>,
    pub ip_tos: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            udp_snd_buf: 65_536,
            udp_rcv_buf: 8192 * 1500,
            reuse_addr: true,
            ip_ttl: None,
            ip_tos: None,
        }
    }
}

/// Outcome of one receive attempt.
#[derive(Debug)]
pub enum RecvStatus {
    /// A whole datagram landed in the buffer.
    Ok { len: usize, addr: SocketAddr },
    /// Nothing usable this round; try again.
    Again,
    /// The socket is beyond recovery (closed underneath us, or an internal
    /// error); the worker should exit.
    Error,
}

pub struct Channel {
    sock: Socket,
    local: SocketAddr,
}

impl Channel {
    /// Open and configure a UDP socket bound to `addr`.
    pub fn open(addr: SocketAddr, cfg: &ChannelConfig) -> Result<Channel> {
        let domain = Domain::for_address(addr);
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::SetupRes(e.to_string()))?;
        if cfg.reuse_addr {
            sock.set_reuse_address(true).map_err(|e| Error::SetupRes(e.to_string()))?;
        }
        sock.bind(&SockAddr::from(addr)).map_err(|e| Error::SetupRes(e.to_string()))?;
        Self::configure(sock, cfg)
    }

    /// Attach to a UDP socket the application already bound.
    pub fn from_udp(udp: std::net::UdpSocket, cfg: &ChannelConfig) -> Result<Channel> {
        Self::configure(Socket::from(udp), cfg)
    }

    fn configure(sock: Socket, cfg: &ChannelConfig) -> Result<Channel> {
        sock.set_send_buffer_size(cfg.udp_snd_buf)
            .map_err(|e| Error::SetupRes(e.to_string()))?;
        sock.set_recv_buffer_size(cfg.udp_rcv_buf)
            .map_err(|e| Error::SetupRes(e.to_string()))?;
        if let Some(ttl) = cfg.ip_ttl {
            sock.set_ttl(ttl).map_err(|e| Error::SetupRes(e.to_string()))?;
        }
        if let Some(tos) = cfg.ip_tos {
            // Best effort: some platforms refuse ToS on bound sockets.
            let _ = sock.set_tos(tos);
        }
        sock.set_read_timeout(Some(RECV_POLL))
            .map_err(|e| Error::SetupRes(e.to_string()))?;
        let local = sock
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .ok_or(Error::Setup)?;
        Ok(Channel { sock, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Transmit one serialized packet.
    pub fn send_to(&self, addr: SocketAddr, buf: &[u8]) -> Result<usize> {
        self.sock
            .send_to(buf, &SockAddr::from(addr))
            .map_err(|e| Error::Io(e.to_string()))
    }

    /// Receive one datagram into `buf` (which must already be sized to the
    /// largest acceptable datagram).
    pub fn recv_into(&self, buf: &mut [u8]) -> RecvStatus {
        match self.recv_raw(buf) {
            Ok((len, addr, truncated)) => {
                if truncated || len < HEADER_SIZE {
                    // Kernel-fragmented or runt datagram: both count as loss.
                    RecvStatus::Again
                } else {
                    RecvStatus::Ok { len, addr }
                }
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset => RecvStatus::Again,
                _ => RecvStatus::Error,
            },
        }
    }

    #[cfg(unix)]
    fn recv_raw(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, bool)> {
        use std::os::unix::io::AsRawFd;

        let fd = self.sock.as_raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut _, iov_len: buf.len() };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut storage as *mut _ as *mut _;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let truncated = msg.msg_flags & libc::MSG_TRUNC != 0;
        let addr = sockaddr_to_std(&storage)?;
        Ok((n as usize, addr, truncated))
    }

    #[cfg(not(unix))]
    fn recv_raw(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, bool)> {
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(
                buf.as_mut_ptr() as *mut std::mem::MaybeUninit<u8>,
                buf.len(),
            )
        };
        let (len, addr) = self.sock.recv_from(uninit)?;
        let addr = addr.as_socket().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "non-inet peer address")
        })?;
        Ok((len, addr, false))
    }
}

#[cfg(unix)]
fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> std::io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(std::io::Error::new(std::io::ErrorKind::Other, "non-inet peer address")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback_channel() -> Channel {
        Channel::open((Ipv4Addr::LOCALHOST, 0).into(), &ChannelConfig::default()).unwrap()
    }

    #[test]
    fn bind_assigns_port() {
        let ch = loopback_channel();
        assert_ne!(ch.local_addr().port(), 0);
    }

    #[test]
    fn send_and_receive_datagram() {
        let a = loopback_channel();
        let b = loopback_channel();
        let payload = [7u8; 64];
        a.send_to(b.local_addr(), &payload).unwrap();

        let mut buf = vec![0u8; 1500];
        for _ in 0..100 {
            match b.recv_into(&mut buf) {
                RecvStatus::Ok { len, addr } => {
                    assert_eq!(len, 64);
                    assert_eq!(&buf[..len], &payload[..]);
                    assert_eq!(addr, a.local_addr());
                    return;
                }
                RecvStatus::Again => continue,
                RecvStatus::Error => panic!("channel error"),
            }
        }
        panic!("datagram never arrived");
    }

    #[test]
    fn runt_datagram_reported_as_again() {
        let a = loopback_channel();
        let b = loopback_channel();
        a.send_to(b.local_addr(), &[1, 2, 3]).unwrap();

        let mut buf = vec![0u8; 1500];
        // The runt must never surface as Ok; eventually the poll times out.
        for _ in 0..20 {
            match b.recv_into(&mut buf) {
                RecvStatus::Ok { .. } => panic!("runt datagram surfaced"),
                RecvStatus::Again => {}
                RecvStatus::Error => panic!("channel error"),
            }
        }
    }

    #[test]
    fn idle_receive_times_out_quickly() {
        let ch = loopback_channel();
        let mut buf = vec![0u8; 1500];
        let started = std::time::Instant::now();
        assert!(matches!(ch.recv_into(&mut buf), RecvStatus::Again));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn attach_to_existing_udp_socket() {
        let udp = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = udp.local_addr().unwrap().port();
        let ch = Channel::from_udp(udp, &ChannelConfig::default()).unwrap();
        assert_eq!(ch.local_addr().port(), port);
    }
}

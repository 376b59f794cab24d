//! One multiplexer per unique local UDP endpoint configuration: the channel,
//! its unit pool, and the pair of send/receive workers, reference-counted by
//! the sockets riding on it.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::channel::{Channel, ChannelConfig};
use crate::error::Result;
use crate::options::SocketOptions;
use crate::queue::{RcvQueue, RendezvousQueue, SndQueue};
use crate::registry::Registry;
use crate::unit::UnitPool;

/// Sockets may share a multiplexer only when every field matches (and the
/// socket asked for a reusable endpoint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxKey {
    pub ipv6: bool,
    pub port: u16,
    pub mss: usize,
    pub ip_ttl: Option<u32>,
    pub ip_tos: Option<u32>,
    pub reusable: bool,
}

impl MuxKey {
    pub fn from_opts(addr: SocketAddr, opts: &SocketOptions) -> MuxKey {
        MuxKey {
            ipv6: addr.is_ipv6(),
            port: addr.port(),
            mss: opts.mss,
            ip_ttl: opts.ip_ttl,
            ip_tos: opts.ip_tos,
            reusable: opts.reuse_addr,
        }
    }
}

/// Initial unit-pool provisioning, in packets, and its growth ceiling.
const POOL_INITIAL: usize = 512;
const POOL_MAX: usize = 65_536;

pub struct Multiplexer {
    pub id: usize,
    pub key: MuxKey,
    pub channel: Arc<Channel>,
    pub pool: Arc<UnitPool>,
    pub snd_q: Arc<SndQueue>,
    pub rcv_q: Arc<RcvQueue>,
    /// Live sockets riding this endpoint; guarded by the registry's
    /// multiplexer-map lock.
    pub refs: usize,
}

/// The per-socket handle onto a multiplexer.
#[derive(Clone)]
pub struct MuxRef {
    pub id: usize,
    pub channel: Arc<Channel>,
    pub pool: Arc<UnitPool>,
    pub snd_q: Arc<SndQueue>,
    pub rcv_q: Arc<RcvQueue>,
}

impl Multiplexer {
    /// Bind a fresh UDP endpoint and spawn its workers.
    pub fn open(
        id: usize,
        addr: SocketAddr,
        opts: &SocketOptions,
        registry: Weak<Registry>,
    ) -> Result<Multiplexer> {
        let cfg = ChannelConfig {
            udp_snd_buf: opts.udp_snd_buf,
            udp_rcv_buf: opts.udp_rcv_buf,
            reuse_addr: opts.reuse_addr,
            ip_ttl: opts.ip_ttl,
            ip_tos: opts.ip_tos,
        };
        let channel = Arc::new(Channel::open(addr, &cfg)?);
        Self::assemble(id, channel, opts, registry)
    }

    /// Wrap a UDP socket the application bound itself.
    pub fn attach(
        id: usize,
        udp: std::net::UdpSocket,
        opts: &SocketOptions,
        registry: Weak<Registry>,
    ) -> Result<Multiplexer> {
        let cfg = ChannelConfig {
            udp_snd_buf: opts.udp_snd_buf,
            udp_rcv_buf: opts.udp_rcv_buf,
            reuse_addr: opts.reuse_addr,
            ip_ttl: opts.ip_ttl,
            ip_tos: opts.ip_tos,
        };
        let channel = Arc::new(Channel::from_udp(udp, &cfg)?);
        Self::assemble(id, channel, opts, registry)
    }

    fn assemble(
        id: usize,
        channel: Arc<Channel>,
        opts: &SocketOptions,
        registry: Weak<Registry>,
    ) -> Result<Multiplexer> {
        // The sharing key carries the resolved port, not the requested one
        // (binding to port zero resolves to an ephemeral port).
        let local = channel.local_addr();
        let pool = Arc::new(UnitPool::new(POOL_INITIAL, opts.mss.max(64), POOL_MAX));
        let rendezvous = Arc::new(RendezvousQueue::new());
        let snd_q = SndQueue::start(channel.clone(), id)?;
        let rcv_q = RcvQueue::start(channel.clone(), pool.clone(), rendezvous, registry, id)?;
        debug!(mux = id, %local, "multiplexer started");
        Ok(Multiplexer {
            id,
            key: MuxKey::from_opts(local, opts),
            channel,
            pool,
            snd_q,
            rcv_q,
            refs: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    pub fn mux_ref(&self) -> MuxRef {
        MuxRef {
            id: self.id,
            channel: self.channel.clone(),
            pool: self.pool.clone(),
            snd_q: self.snd_q.clone(),
            rcv_q: self.rcv_q.clone(),
        }
    }

    /// Silence the workers before the channel goes away; operations still in
    /// flight fail out rather than touching a dead socket.
    pub fn shutdown(&self) {
        debug!(mux = self.id, "multiplexer shutting down");
        self.snd_q.close();
        self.rcv_q.close();
    }
}

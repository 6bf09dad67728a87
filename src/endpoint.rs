//! Managed file descriptors: listener sockets, peer links and the TUN
//! device, each with its role-specific buffers.

use std::net::{IpAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::framer::MAX_L3_PKT;
use crate::ring::{PacketBuf, RingBuffer};

/// Per-link backlog on each side of a peer connection.
pub const CONN_RING_SZ: usize = 128 * 1024;

/// TUN write backlog shared by all peer receive paths. Must comfortably
/// exceed the largest L3 packet.
pub const TUN_RING_SZ: usize = 4 * 1024 * 1024;

const TUN_WRITE_BUF_INIT: usize = 4096;

/// A TCP link to one mesh peer.
pub struct PeerConn {
    sock: TcpStream,
    /// The peer's mesh address, which is also its key in the live index.
    pub addr: IpAddr,
    /// True when this node dialed the connection (the peer sorted higher
    /// than self); outbound links return to the retry queue on teardown.
    pub outbound: bool,
    pub rx: RingBuffer,
    pub tx: RingBuffer,
}

impl PeerConn {
    pub fn new(sock: TcpStream, addr: IpAddr, outbound: bool) -> Self {
        Self {
            sock,
            addr,
            outbound,
            rx: RingBuffer::new(CONN_RING_SZ),
            tx: RingBuffer::new(CONN_RING_SZ),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

/// The TUN device plus its transmit backlog and packet staging buffers.
pub struct TunDev {
    fd: OwnedFd,
    pub tx: RingBuffer,
    /// One-packet scratch for TUN reads.
    pub rbuf: PacketBuf,
    /// Staging for a queued packet that wraps the tx ring.
    pub wbuf: PacketBuf,
}

impl TunDev {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            tx: RingBuffer::new(TUN_RING_SZ),
            rbuf: PacketBuf::new(MAX_L3_PKT),
            wbuf: PacketBuf::new(TUN_WRITE_BUF_INIT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Role-tagged endpoint registered with the readiness notifier.
pub enum Endpoint {
    Listener(TcpListener),
    Peer(PeerConn),
    Tun(TunDev),
}

impl Endpoint {
    pub fn fd(&self) -> RawFd {
        match self {
            Endpoint::Listener(l) => l.as_raw_fd(),
            Endpoint::Peer(c) => c.fd(),
            Endpoint::Tun(t) => t.fd(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Endpoint::Listener(_) => "listener",
            Endpoint::Peer(_) => "peer",
            Endpoint::Tun(_) => "tun",
        }
    }
}

//! The I/O engine: one thread, one edge-triggered epoll loop.
//!
//! Everything the forwarder does happens between two `epoll_wait` calls:
//! accepting mesh links, pumping peer sockets through their rings, framing
//! packets onto the TUN device and dispatching TUN reads to the peer that
//! owns the destination address. The only blocking call is the wait itself;
//! every fd is non-blocking and every handler drains to `EAGAIN` before
//! yielding. When a ring cannot take a whole packet the packet is dropped
//! and counted — the mesh never stalls a reader to protect a slow writer.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::endpoint::{Endpoint, PeerConn, TunDev};
use crate::framer::{self, HeaderParse, IPV4_HDR_LEN, IPV6_HDR_LEN};
use crate::peers::{PassivePeer, PeerTable};
use crate::poll::{edge_rw, signal_eventfd, EventFd, Poller};
use crate::reload;
use crate::ring::RingBuffer;
use crate::routes::RouteSink;
use crate::stats::Stats;

const MAX_EVENTS: usize = 256;
const LISTEN_BACKLOG: i32 = 1024;

// ---------------------------------------------------------------------------
// Control plane. Reload and stop may be requested from signal context, so
// the requests are an atomic flag plus one eventfd write — nothing else.
// ---------------------------------------------------------------------------

static WANT_RELOAD: AtomicBool = AtomicBool::new(false);
static WANT_STOP: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Ask the running engine to re-read the peer file. Async-signal-safe.
pub fn request_reload() {
    WANT_RELOAD.store(true, Ordering::SeqCst);
    wake();
}

/// Ask the running engine to stop. In-flight ring contents are discarded.
/// Async-signal-safe.
pub fn request_stop() {
    WANT_STOP.store(true, Ordering::SeqCst);
    wake();
}

fn wake() {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        signal_eventfd(fd);
    }
}

// ---------------------------------------------------------------------------
// Non-blocking socket steps and ring pumps
// ---------------------------------------------------------------------------

/// Outcome of one non-blocking syscall on a link.
enum IoStep {
    Progress(usize),
    WouldBlock,
    /// Orderly close, reset or dead pipe: the link is gone.
    Closed,
    Failed(io::Error),
}

/// Outcome of pumping a ring against its fd until it can go no further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpStatus {
    /// Ring empty (drain) or no further progress possible without the
    /// counterparty (fill).
    Done,
    /// The kernel would block; yield back to the notifier.
    Blocked,
    /// Ring full and the consumer could not take a single packet.
    Stalled,
    /// The link died; destroy the endpoint.
    Closed,
    /// Unexpected errno, already logged. Endpoint stays alive.
    Failed,
}

fn sock_recv(fd: RawFd, buf: &mut [u8]) -> IoStep {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n == 0 {
        return IoStep::Closed;
    }
    if n > 0 {
        return IoStep::Progress(n as usize);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return IoStep::WouldBlock;
    }
    match err.raw_os_error() {
        Some(libc::ECONNRESET) | Some(libc::ECONNREFUSED) | Some(libc::ENOTCONN) => IoStep::Closed,
        _ => IoStep::Failed(err),
    }
}

fn sock_send(fd: RawFd, buf: &[u8]) -> IoStep {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n >= 0 {
        return IoStep::Progress(n as usize);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return IoStep::WouldBlock;
    }
    match err.raw_os_error() {
        Some(libc::ECONNRESET) | Some(libc::ENOTCONN) | Some(libc::EPIPE) => IoStep::Closed,
        _ => IoStep::Failed(err),
    }
}

/// Send the ring's contents out of a socket until empty or the kernel
/// pushes back. Progress advances the ring's read index by the byte count
/// the kernel actually accepted; the wrap is handled by the loop re-asking
/// for the head region.
fn drain_to_socket(fd: RawFd, ring: &mut RingBuffer) -> PumpStatus {
    loop {
        let step = {
            let (head, _) = ring.readable_regions();
            if head.is_empty() {
                return PumpStatus::Done;
            }
            sock_send(fd, head)
        };
        match step {
            IoStep::Progress(n) => ring.commit_read(n),
            IoStep::WouldBlock => return PumpStatus::Blocked,
            IoStep::Closed => return PumpStatus::Closed,
            IoStep::Failed(err) => {
                warn!("send error on fd {fd}: {err}");
                return PumpStatus::Failed;
            }
        }
    }
}

/// Pull bytes from a peer socket into its rx ring, inviting the TUN framer
/// to consume after every successful read. Terminates when the kernel would
/// block, the ring is full with a jammed consumer, or the link dies.
fn fill_peer_rx(conn: &mut PeerConn, tun: &mut TunDev, stats: &mut Stats) -> PumpStatus {
    let fd = conn.fd();
    let tun_fd = tun.fd();
    loop {
        let step = {
            let (head, _) = conn.rx.writable_regions();
            if head.is_empty() {
                None
            } else {
                Some(sock_recv(fd, head))
            }
        };
        match step {
            None => {
                // Full ring: only the consumer can make room now.
                if framer::pump_to_tun(&mut conn.rx, tun_fd, &mut tun.tx, stats) == 0 {
                    return PumpStatus::Stalled;
                }
            }
            Some(IoStep::Progress(n)) => {
                conn.rx.commit_write(n);
                framer::pump_to_tun(&mut conn.rx, tun_fd, &mut tun.tx, stats);
            }
            Some(IoStep::WouldBlock) => return PumpStatus::Blocked,
            Some(IoStep::Closed) => return PumpStatus::Closed,
            Some(IoStep::Failed(err)) => {
                warn!("recv error on peer {}: {err}", conn.addr);
                return PumpStatus::Failed;
            }
        }
    }
}

/// Drain the TUN tx ring into the device, one whole packet per write. A
/// packet that wraps the ring end is staged into the write buffer so it
/// still leaves in a single vectored write.
fn drain_tun_tx(tun: &mut TunDev, stats: &mut Stats) -> PumpStatus {
    let fd = tun.fd();
    let tx = &mut tun.tx;
    let wbuf = &mut tun.wbuf;
    loop {
        let (pkt_len, step) = {
            let (a, b) = tx.readable_regions();
            if a.is_empty() && b.is_empty() {
                return PumpStatus::Done;
            }
            let pkt_len = match framer::parse_l3_len(a, b) {
                HeaderParse::Length(len) if a.len() + b.len() >= len => len,
                // Only whole packets are ever queued, so anything else
                // means the backlog is corrupt.
                other => {
                    warn!("unreadable packet at tun backlog head ({other:?}), abandoning drain");
                    return PumpStatus::Failed;
                }
            };
            let written = if a.len() >= pkt_len {
                tun_write(fd, &a[..pkt_len], &[])
            } else {
                wbuf.begin(pkt_len);
                wbuf.extend(a);
                let step = tun_write(fd, wbuf.staged(), &b[..pkt_len - a.len()]);
                wbuf.reset();
                step
            };
            (pkt_len, written)
        };
        match step {
            IoStep::Progress(n) => {
                debug_assert_eq!(n, pkt_len);
                stats.tun_tx.account(pkt_len);
                tx.commit_read(pkt_len);
            }
            IoStep::WouldBlock => return PumpStatus::Blocked,
            IoStep::Closed | IoStep::Failed(_) => {
                warn!("tun write failed, leaving backlog for retry");
                return PumpStatus::Failed;
            }
        }
    }
}

fn tun_write(fd: RawFd, p1: &[u8], p2: &[u8]) -> IoStep {
    let n = if p2.is_empty() {
        unsafe { libc::write(fd, p1.as_ptr() as *const libc::c_void, p1.len()) }
    } else {
        let iov = [
            libc::iovec {
                iov_base: p1.as_ptr() as *mut libc::c_void,
                iov_len: p1.len(),
            },
            libc::iovec {
                iov_base: p2.as_ptr() as *mut libc::c_void,
                iov_len: p2.len(),
            },
        ];
        unsafe { libc::writev(fd, iov.as_ptr(), 2) }
    };
    if n >= 0 {
        return IoStep::Progress(n as usize);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        IoStep::WouldBlock
    } else {
        IoStep::Failed(err)
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("fcntl(F_GETFL)");
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error()).context("fcntl(F_SETFL, O_NONBLOCK)");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The engine context
// ---------------------------------------------------------------------------

pub struct IoContext {
    poller: Poller,
    control: EventFd,
    /// Owning table of every registered fd; all other references to
    /// endpoints are indexes into this map.
    endpoints: HashMap<RawFd, Endpoint>,
    peers: PeerTable,
    routes: Box<dyn RouteSink>,
    tun_fd: RawFd,
    peer_file: PathBuf,
    listener_port: u16,
    self_v4: Option<Ipv4Addr>,
    self_v6: Option<Ipv6Addr>,
    pub stats: Stats,
}

impl IoContext {
    pub fn new(
        tun: OwnedFd,
        peer_file: PathBuf,
        self_v4: Option<Ipv4Addr>,
        self_v6: Option<Ipv6Addr>,
        listener_port: u16,
        routes: Box<dyn RouteSink>,
    ) -> Result<Self> {
        if self_v4.is_none() && self_v6.is_none() {
            bail!("at least one of the IPv4/IPv6 self addresses is required");
        }
        let tun_fd = tun.as_raw_fd();
        set_nonblocking(tun_fd).context("could not make tun non-blocking")?;

        let poller = Poller::new()?;
        let control = EventFd::new()?;
        poller.add(control.raw(), libc::EPOLLIN as u32)?;
        poller.add(tun_fd, edge_rw())?;

        let mut endpoints = HashMap::new();
        endpoints.insert(tun_fd, Endpoint::Tun(TunDev::new(tun)));

        Ok(Self {
            poller,
            control,
            endpoints,
            peers: PeerTable::new(),
            routes,
            tun_fd,
            peer_file,
            listener_port,
            self_v4,
            self_v6,
            stats: Stats::default(),
        })
    }

    /// Bind a listener per address family. A single family failing to bind
    /// is a warning; both failing is fatal.
    pub fn setup_listeners(&mut self) -> Result<()> {
        let candidates: [(Domain, SocketAddr); 2] = [
            (
                Domain::IPV4,
                (Ipv4Addr::UNSPECIFIED, self.listener_port).into(),
            ),
            (
                Domain::IPV6,
                (Ipv6Addr::UNSPECIFIED, self.listener_port).into(),
            ),
        ];
        let mut bound = 0;
        for (domain, addr) in candidates {
            match bind_listener(domain, addr) {
                Ok(listener) => {
                    let fd = listener.as_raw_fd();
                    self.poller.add(fd, edge_rw())?;
                    self.endpoints.insert(fd, Endpoint::Listener(listener));
                    info!("listening for mesh links on {addr}");
                    bound += 1;
                }
                Err(err) => warn!("could not listen on {addr}: {err:#}"),
            }
        }
        if bound == 0 {
            bail!("no listener could be bound on port {}", self.listener_port);
        }
        Ok(())
    }

    /// Block in the notifier and dispatch until a stop is requested.
    pub fn run_loop(&mut self) -> Result<()> {
        WAKE_FD.store(self.control.raw(), Ordering::SeqCst);
        request_reload();

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            if WANT_STOP.swap(false, Ordering::SeqCst) {
                info!("stop requested, leaving event loop");
                break;
            }
            let n = self.poller.wait(&mut events)?;
            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                if fd == self.control.raw() {
                    self.control.drain();
                    continue;
                }
                self.handle_event(fd, ev.events);
            }
            if WANT_RELOAD.swap(false, Ordering::SeqCst) {
                self.reset_peers();
            }
        }
        WAKE_FD.store(-1, Ordering::SeqCst);
        Ok(())
    }

    /// Tear down every endpoint, dropping kernel routes for live peers.
    pub fn shutdown(&mut self) {
        let fds: Vec<RawFd> = self.endpoints.keys().copied().collect();
        for fd in fds {
            if let Some(ep) = self.endpoints.remove(&fd) {
                self.destroy_endpoint(ep);
            }
        }
    }

    fn handle_event(&mut self, fd: RawFd, events: u32) {
        // An earlier event in this batch may have destroyed the endpoint.
        let Some(mut ep) = self.endpoints.remove(&fd) else {
            return;
        };
        let keep = match &mut ep {
            Endpoint::Listener(listener) => {
                self.accept_all(listener);
                true
            }
            Endpoint::Tun(tun) => {
                self.tun_io(events, tun);
                true
            }
            Endpoint::Peer(conn) => self.conn_io(events, conn),
        };
        if keep {
            self.endpoints.insert(fd, ep);
        } else {
            self.destroy_endpoint(ep);
        }
    }

    fn tun_io(&mut self, events: u32, tun: &mut TunDev) {
        if events & libc::EPOLLOUT as u32 != 0 {
            drain_tun_tx(tun, &mut self.stats);
        }
        if events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
            self.dispatch_from_tun(tun);
        }
    }

    /// Returns false when the connection must be destroyed.
    fn conn_io(&mut self, events: u32, conn: &mut PeerConn) -> bool {
        if events & libc::EPOLLOUT as u32 != 0
            && drain_to_socket(conn.fd(), &mut conn.tx) == PumpStatus::Closed
        {
            warn!("send failed, dropping link to {}", conn.addr);
            return false;
        }
        if events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
            let tun_fd = self.tun_fd;
            let stats = &mut self.stats;
            let Some(Endpoint::Tun(tun)) = self.endpoints.get_mut(&tun_fd) else {
                warn!("tun endpoint missing while serving peer {}", conn.addr);
                return true;
            };
            match fill_peer_rx(conn, tun, stats) {
                PumpStatus::Closed => {
                    info!("peer {} hung up", conn.addr);
                    return false;
                }
                PumpStatus::Stalled => {
                    debug!("rx backlog for {} jammed, waiting for tun", conn.addr);
                }
                _ => {}
            }
        }
        true
    }

    /// Read packets off TUN and hand each to the peer owning its
    /// destination, dropping (and counting) what cannot be routed or queued.
    fn dispatch_from_tun(&mut self, tun: &mut TunDev) {
        let fd = tun.fd();
        loop {
            let n = {
                let buf = tun.rbuf.storage_mut();
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::WouldBlock {
                        warn!("tun read failed: {err}");
                    }
                    break;
                }
                if n == 0 {
                    break;
                }
                n as usize
            };
            self.stats.tun_rx.account(n);

            let pkt = &tun.rbuf.storage()[..n];
            let dst: IpAddr = match pkt[0] >> 4 {
                4 if n >= IPV4_HDR_LEN => {
                    let octets: [u8; 4] = pkt[16..20].try_into().unwrap();
                    Ipv4Addr::from(octets).into()
                }
                6 if n >= IPV6_HDR_LEN => {
                    let octets: [u8; 16] = pkt[24..40].try_into().unwrap();
                    Ipv6Addr::from(octets).into()
                }
                v => {
                    debug!("unroutable {n}-byte packet from tun (version nibble {v})");
                    continue;
                }
            };

            let Some(peer_fd) = self.peers.live_fd(&dst) else {
                self.stats.world_tx.account_drop(n);
                continue;
            };
            let Some(Endpoint::Peer(conn)) = self.endpoints.get_mut(&peer_fd) else {
                self.stats.world_tx.account_drop(n);
                continue;
            };
            if conn.tx.push_slices(pkt, &[]) {
                self.stats.world_tx.account(n);
                // Opportunistic flush; a dead link is reaped on its own
                // epoll event, not here.
                drain_to_socket(conn.fd(), &mut conn.tx);
            } else {
                self.stats.world_tx.account_drop(n);
            }
        }
    }

    fn accept_all(&mut self, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, remote)) => {
                    let addr = remote.ip();
                    info!("accepted mesh link from {addr}");
                    if let Err(err) = self.add_peer(stream, addr, false) {
                        warn!("rejecting inbound link from {addr}: {err:#}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                    warn!("out of file descriptors, deferring accepts");
                    break;
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    /// Register a peer link: non-blocking mode, rings, notifier entry and
    /// kernel route, all-or-nothing. On any failure the socket is closed
    /// and nothing is left behind.
    fn add_peer(&mut self, stream: TcpStream, addr: IpAddr, outbound: bool) -> Result<()> {
        if self.peers.is_live(&addr) {
            bail!("a live link for {addr} already exists");
        }
        stream
            .set_nonblocking(true)
            .context("could not make peer socket non-blocking")?;
        let conn = PeerConn::new(stream, addr, outbound);
        let fd = conn.fd();
        self.poller.add(fd, edge_rw())?;
        if let Err(err) = self.routes.add(addr) {
            let _ = self.poller.del(fd);
            return Err(err).context("route setup failed");
        }
        self.peers.mark_live(addr, fd);
        self.endpoints.insert(fd, Endpoint::Peer(conn));
        debug!(
            "registered {} link to {addr} (fd {fd})",
            if outbound { "outbound" } else { "inbound" }
        );
        Ok(())
    }

    fn destroy_endpoint(&mut self, ep: Endpoint) {
        let fd = ep.fd();
        debug!("destroying {} endpoint (fd {fd})", ep.role());
        let _ = self.poller.del(fd);
        if let Endpoint::Peer(conn) = ep {
            self.routes.remove(conn.addr);
            self.peers.clear_live(&conn.addr);
            if conn.outbound && self.peers.passive(&conn.addr).is_some() {
                self.peers.mark_disconnected(conn.addr);
            }
        }
        // Dropping the endpoint closes the fd and frees its rings.
    }

    /// Re-read the peer file and apply the roster delta: vanished peers are
    /// torn down, new peers dialed, and previously failed dials retried.
    /// A file that fails to resolve leaves the current roster untouched.
    fn reset_peers(&mut self) {
        let updated = match reload::load_roster(
            &self.peer_file,
            self.listener_port,
            self.self_v4,
            self.self_v6,
        ) {
            Ok(roster) => roster,
            Err(err) => {
                warn!("peer reload failed, keeping current roster: {err:#}");
                return;
            }
        };

        let stale: Vec<IpAddr> = self
            .peers
            .passive_addrs()
            .filter(|addr| !updated.contains_key(addr))
            .copied()
            .collect();
        for addr in stale {
            self.disconnect_and_discard(&addr);
        }

        // Snapshot the retry queue first so a dial failing below is not
        // immediately retried in the same pass.
        let retry = self.peers.take_disconnected();

        for (addr, peer) in updated {
            if self.peers.passive(&addr).is_none() {
                self.peers.insert_passive(peer.clone());
                self.dial(peer);
            }
        }

        for addr in retry {
            if let Some(peer) = self.peers.passive(&addr).cloned() {
                self.dial(peer);
            }
        }

        info!(
            "roster applied: {} dial targets, {} live links",
            self.peers.passive_count(),
            self.peers.live_count()
        );
    }

    fn disconnect_and_discard(&mut self, addr: &IpAddr) {
        if let Some(fd) = self.peers.live_fd(addr) {
            if let Some(ep) = self.endpoints.remove(&fd) {
                self.destroy_endpoint(ep);
            }
        }
        self.peers.remove_passive(addr);
        info!("peer {addr} left the roster");
    }

    fn dial(&mut self, peer: PassivePeer) {
        if self.peers.is_live(&peer.addr) {
            debug!("peer {} already linked inbound, not dialing", peer.addr);
            return;
        }
        match TcpStream::connect(peer.target) {
            Ok(stream) => {
                info!("connected out to peer {}", peer.target);
                if let Err(err) = self.add_peer(stream, peer.addr, true) {
                    warn!("could not register link to {}: {err:#}", peer.target);
                    self.peers.mark_disconnected(peer.addr);
                }
            }
            Err(err) => {
                warn!("could not reach {}: {err}, queueing for retry", peer.target);
                self.peers.mark_disconnected(peer.addr);
            }
        }
    }
}

fn bind_listener(domain: Domain, addr: SocketAddr) -> Result<TcpListener> {
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("could not create listener socket")?;
    sock.set_reuse_address(true)?;
    if domain == Domain::IPV6 {
        // The IPv4 listener covers the v4 side; keep this one v6-only so
        // accepted peers never show up as v4-mapped addresses.
        sock.set_only_v6(true)?;
    }
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())
        .with_context(|| format!("could not bind {addr}"))?;
    sock.listen(LISTEN_BACKLOG)
        .with_context(|| format!("could not listen on {addr}"))?;
    Ok(sock.into())
}

/// Run the forwarder until a stop is requested.
///
/// `tun` must be an already configured TUN device; the engine only reads
/// and writes whole L3 packets on it. Peer liveness is mirrored into the
/// named ipset. Returns the final traffic counters on a clean stop, an
/// error when initialization fails.
pub fn run(
    tun: OwnedFd,
    peer_file: &Path,
    self_v4: Option<Ipv4Addr>,
    self_v6: Option<Ipv6Addr>,
    listener_port: u16,
    ipset_name: &str,
) -> Result<Stats> {
    let mut ctx = IoContext::new(
        tun,
        peer_file.to_path_buf(),
        self_v4,
        self_v6,
        listener_port,
        Box::new(crate::routes::IpsetSink::new(ipset_name)),
    )?;
    ctx.setup_listeners()?;
    ctx.run_loop()?;
    ctx.shutdown();
    ctx.stats.log_summary();
    Ok(ctx.stats)
}

//! Peer bookkeeping: the passive dial roster, the live-link index and the
//! disconnected retry queue.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;

use log::info;

/// A dial target from the roster file.
#[derive(Debug, Clone)]
pub struct PassivePeer {
    pub addr: IpAddr,
    /// Resolved host:port this node would dial.
    pub target: SocketAddr,
}

impl PassivePeer {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            addr: target.ip(),
            target,
        }
    }
}

/// Bidirectional peer state keyed by mesh address.
///
/// Invariants, held at every wake boundary:
/// - every live link's address indexes exactly one endpoint fd;
/// - an outbound link's address is also present in the passive roster;
/// - an address is live or (if outbound) queued for retry, never both.
#[derive(Default)]
pub struct PeerTable {
    passive: HashMap<IpAddr, PassivePeer>,
    live: HashMap<IpAddr, RawFd>,
    disconnected: Vec<IpAddr>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passive(&self, addr: &IpAddr) -> Option<&PassivePeer> {
        self.passive.get(addr)
    }

    pub fn passive_addrs(&self) -> impl Iterator<Item = &IpAddr> {
        self.passive.keys()
    }

    pub fn insert_passive(&mut self, peer: PassivePeer) {
        self.passive.insert(peer.addr, peer);
    }

    /// Drop a roster entry entirely: roster, live index and retry queue.
    pub fn remove_passive(&mut self, addr: &IpAddr) -> Option<PassivePeer> {
        self.disconnected.retain(|a| a != addr);
        self.passive.remove(addr)
    }

    pub fn live_fd(&self, addr: &IpAddr) -> Option<RawFd> {
        self.live.get(addr).copied()
    }

    pub fn is_live(&self, addr: &IpAddr) -> bool {
        self.live.contains_key(addr)
    }

    pub fn mark_live(&mut self, addr: IpAddr, fd: RawFd) {
        self.disconnected.retain(|a| *a != addr);
        self.live.insert(addr, fd);
    }

    pub fn clear_live(&mut self, addr: &IpAddr) {
        self.live.remove(addr);
    }

    /// Queue an outbound peer for a later redial. Idempotent.
    pub fn mark_disconnected(&mut self, addr: IpAddr) {
        if !self.disconnected.contains(&addr) {
            info!("peer {addr} queued for reconnect");
            self.disconnected.push(addr);
        }
    }

    /// Take the whole retry queue; callers push failures back via
    /// `mark_disconnected`.
    pub fn take_disconnected(&mut self) -> Vec<IpAddr> {
        std::mem::take(&mut self.disconnected)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn passive_count(&self) -> usize {
        self.passive.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PassivePeer {
        PassivePeer::new(s.parse().unwrap())
    }

    #[test]
    fn roster_round_trip() {
        let mut table = PeerTable::new();
        table.insert_passive(peer("10.0.0.2:4747"));
        let addr: IpAddr = "10.0.0.2".parse().unwrap();

        assert_eq!(table.passive_count(), 1);
        assert_eq!(table.passive(&addr).unwrap().target.port(), 4747);

        table.mark_live(addr, 7);
        assert_eq!(table.live_fd(&addr), Some(7));

        table.clear_live(&addr);
        assert!(!table.is_live(&addr));
    }

    #[test]
    fn remove_passive_clears_retry_queue() {
        let mut table = PeerTable::new();
        table.insert_passive(peer("10.0.0.2:4747"));
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        table.mark_disconnected(addr);

        assert!(table.remove_passive(&addr).is_some());
        assert!(table.take_disconnected().is_empty());
    }

    #[test]
    fn mark_live_dequeues_retry() {
        let mut table = PeerTable::new();
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        table.insert_passive(peer("10.0.0.2:4747"));
        table.mark_disconnected(addr);
        table.mark_disconnected(addr); // idempotent

        table.mark_live(addr, 9);
        assert!(table.take_disconnected().is_empty());
        assert!(table.is_live(&addr));
    }
}

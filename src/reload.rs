//! Peer roster loading.
//!
//! The roster is a plain text file, one host per line. Every line is
//! resolved with the mesh port as a numeric service; the resolved addresses
//! are filtered down to the families this node actually runs, and the
//! dial-direction tie-break keeps exactly one side of every mesh edge
//! initiating: a node only dials peers whose address sorts above its own.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

use crate::peers::PassivePeer;

/// Hostnames longer than this are cut before resolution.
pub const MAX_HOST_LEN: usize = 255;

/// Dial iff the peer address sorts strictly above this node's own address
/// for the matching family. The ordering on `Ipv4Addr`/`Ipv6Addr` is the
/// byte-lexicographic order of the address octets.
pub fn dials_peer(peer: &IpAddr, self_v4: Option<Ipv4Addr>, self_v6: Option<Ipv6Addr>) -> bool {
    match peer {
        IpAddr::V4(p) => self_v4.is_some_and(|s| *p > s),
        IpAddr::V6(p) => self_v6.is_some_and(|s| *p > s),
    }
}

/// Read and resolve the peer file into a fresh dial roster.
///
/// Fails wholesale when any line errors during resolution, so a half-broken
/// file never produces a partial diff; the caller keeps the previous roster.
pub fn load_roster(
    path: &Path,
    port: u16,
    self_v4: Option<Ipv4Addr>,
    self_v6: Option<Ipv6Addr>,
) -> Result<HashMap<IpAddr, PassivePeer>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read peer file {}", path.display()))?;

    let mut roster = HashMap::new();
    for raw in text.lines() {
        let mut host = raw.trim();
        if host.is_empty() {
            continue;
        }
        if host.len() > MAX_HOST_LEN {
            let mut cut = MAX_HOST_LEN;
            while !host.is_char_boundary(cut) {
                cut -= 1;
            }
            warn!("peer line truncated to {cut} bytes: {}…", &host[..cut]);
            host = &host[..cut];
        }

        let resolved = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("could not resolve peer {host}"))?;
        for target in resolved {
            // An unconfigured family has no self address, so the tie-break
            // also acts as the family filter.
            let addr = target.ip();
            if dials_peer(&addr, self_v4, self_v6) {
                roster.entry(addr).or_insert_with(|| PassivePeer::new(target));
            }
        }
    }
    Ok(roster)
}

//! L3 packet framing for the peer receive path.
//!
//! A peer's TCP stream carries back-to-back IP packets with no extra
//! delimiting: the IP header's own length field is the framing. Because the
//! bytes sit in a ring, the header may straddle the wrap point, so all
//! header reads go through split-tolerant accessors. Only whole packets are
//! ever delivered to the TUN device.

use std::os::fd::RawFd;

use log::{debug, warn};

use crate::ring::RingBuffer;
use crate::stats::Stats;

pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;

/// Largest L3 packet the forwarder handles (IPv4 total-length ceiling).
pub const MAX_L3_PKT: usize = 0xFFFF;

/// Outcome of parsing one packet header at the ring head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParse {
    /// The length cannot be determined yet; retry on a later wake.
    Incomplete,
    /// First octet does not carry an IP version this forwarder handles.
    BadVersion(u8),
    /// Declared length of the packet at the head, header included.
    Length(usize),
}

fn region_byte(a: &[u8], b: &[u8], idx: usize) -> Option<u8> {
    if idx < a.len() {
        Some(a[idx])
    } else {
        b.get(idx - a.len()).copied()
    }
}

fn region_u16_be(a: &[u8], b: &[u8], idx: usize) -> Option<u16> {
    let hi = region_byte(a, b, idx)?;
    let lo = region_byte(a, b, idx + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}

/// Parse the declared length of the L3 packet starting at the head of the
/// two readable regions. IPv4 carries its total length at offset 2; IPv6
/// carries the payload length at offset 4, to which the fixed 40-byte
/// header is added. The length field may sit at any split across the two
/// regions.
pub fn parse_l3_len(a: &[u8], b: &[u8]) -> HeaderParse {
    let Some(first) = region_byte(a, b, 0) else {
        return HeaderParse::Incomplete;
    };
    match first >> 4 {
        // A declared length of zero reads as "not parseable yet": yield
        // and retry, never deliver a zero-byte packet.
        4 => match region_u16_be(a, b, 2) {
            Some(0) => HeaderParse::Incomplete,
            Some(total) => HeaderParse::Length(total as usize),
            None => HeaderParse::Incomplete,
        },
        6 => match region_u16_be(a, b, 4) {
            Some(payload) => HeaderParse::Length(payload as usize + IPV6_HDR_LEN),
            None => HeaderParse::Incomplete,
        },
        v => HeaderParse::BadVersion((v << 4) | (first & 0x0F)),
    }
}

/// What happened to one framed packet on its way toward the TUN device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Written straight to the TUN fd in one vectored write.
    Written,
    /// Queued whole onto the TUN tx ring for a later writable wake.
    Queued,
    /// Neither the fd nor the ring could take it; the packet is gone.
    Dropped,
}

fn deliver(tun_fd: RawFd, tun_ring: &mut RingBuffer, p1: &[u8], p2: &[u8]) -> Delivery {
    if tun_ring.is_empty() {
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
        let iovcnt = if p2.is_empty() { 1 } else { 2 };
        let written = unsafe { libc::writev(tun_fd, iov.as_ptr(), iovcnt) };
        if written >= 0 {
            // TUN takes a whole packet per write.
            debug_assert_eq!(written as usize, p1.len() + p2.len());
            return Delivery::Written;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            warn!("tun write failed, dropping {} bytes: {err}", p1.len() + p2.len());
            return Delivery::Dropped;
        }
        // Kernel would block; fall through to the backlog ring.
    }
    if tun_ring.push_slices(p1, p2) {
        Delivery::Queued
    } else {
        Delivery::Dropped
    }
}

/// Consume as many whole packets as possible from a peer's rx ring and move
/// them toward TUN. Returns the number of bytes consumed from the ring.
///
/// A packet is only ever consumed in full: if fewer bytes are buffered than
/// the header declares, the call yields and the remainder arrives on a later
/// wake. A non-IP leading octet leaves the ring untouched so the backlog
/// builds and the link eventually stalls visibly.
pub fn pump_to_tun(
    rx: &mut RingBuffer,
    tun_fd: RawFd,
    tun_ring: &mut RingBuffer,
    stats: &mut Stats,
) -> usize {
    let mut consumed = 0;
    loop {
        let (pkt_len, delivery) = {
            let (a, b) = rx.readable_regions();
            let avail = a.len() + b.len();
            if avail == 0 {
                break;
            }
            let pkt_len = match parse_l3_len(a, b) {
                HeaderParse::Incomplete => break,
                HeaderParse::BadVersion(octet) => {
                    warn!("non-IP byte 0x{octet:02x} at head of peer stream, leaving backlog");
                    break;
                }
                HeaderParse::Length(len) => len,
            };
            if avail < pkt_len {
                break;
            }
            let (p1, p2) = if a.len() >= pkt_len {
                (&a[..pkt_len], &[][..])
            } else {
                (a, &b[..pkt_len - a.len()])
            };
            (pkt_len, deliver(tun_fd, tun_ring, p1, p2))
        };

        stats.world_rx.account(pkt_len);
        match delivery {
            // Queued packets are counted when the drain writes them out.
            Delivery::Written => stats.tun_tx.account(pkt_len),
            Delivery::Queued => {}
            Delivery::Dropped => {
                debug!("tun backlog full, dropping {pkt_len}-byte packet");
                stats.tun_tx.account_drop(pkt_len);
            }
        }
        rx.commit_read(pkt_len);
        consumed += pkt_len;
    }
    consumed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    fn ipv4_packet(total_len: usize, dst: [u8; 4]) -> Vec<u8> {
        assert!(total_len >= IPV4_HDR_LEN);
        let mut pkt = vec![0u8; total_len];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        pkt[9] = 17; // UDP, irrelevant to framing
        pkt[16..20].copy_from_slice(&dst);
        for (i, byte) in pkt.iter_mut().enumerate().skip(IPV4_HDR_LEN) {
            *byte = i as u8;
        }
        pkt
    }

    fn ipv6_packet(payload_len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; IPV6_HDR_LEN + payload_len];
        pkt[0] = 0x60;
        pkt[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
        pkt
    }

    fn tun_pair() -> (UnixDatagram, UnixDatagram) {
        // Datagram sockets keep packet boundaries, like a TUN fd does.
        let (a, b) = UnixDatagram::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn parses_ipv4_length_at_any_split() {
        let pkt = ipv4_packet(84, [10, 0, 0, 2]);
        for split in 0..=5 {
            let (a, b) = pkt.split_at(split);
            assert_eq!(
                parse_l3_len(a, b),
                HeaderParse::Length(84),
                "split at {split}"
            );
        }
    }

    #[test]
    fn parses_ipv6_length() {
        let pkt = ipv6_packet(128);
        for split in 0..=7 {
            let (a, b) = pkt.split_at(split);
            assert_eq!(parse_l3_len(a, b), HeaderParse::Length(168));
        }
    }

    #[test]
    fn short_header_is_incomplete() {
        assert_eq!(parse_l3_len(&[0x45, 0x00], &[]), HeaderParse::Incomplete);
        assert_eq!(parse_l3_len(&[], &[]), HeaderParse::Incomplete);
        assert_eq!(parse_l3_len(&[0x60, 0, 0, 0], &[]), HeaderParse::Incomplete);
    }

    #[test]
    fn garbage_version_is_rejected() {
        assert_eq!(
            parse_l3_len(&[0xf5, 0, 0, 0], &[]),
            HeaderParse::BadVersion(0xf5)
        );
    }

    #[test]
    fn odd_lengths_are_taken_at_face_value() {
        // A declared length shorter than a real IPv4 header is not a
        // version error: it is delivered as soon as that many bytes are
        // buffered. Only a zero length makes the parser wait.
        assert_eq!(
            parse_l3_len(&[0x45, 0, 0, 10], &[]),
            HeaderParse::Length(10)
        );
        assert_eq!(
            parse_l3_len(&[0x45, 0, 0, 0], &[]),
            HeaderParse::Incomplete
        );
    }

    #[test]
    fn whole_packets_come_out_of_split_arrivals() {
        let (tun, kernel) = tun_pair();
        let mut rx = RingBuffer::new(4096);
        let mut tun_ring = RingBuffer::new(4096);
        let mut stats = Stats::default();

        let p1 = ipv4_packet(84, [10, 0, 0, 2]);
        let p2 = ipv4_packet(200, [10, 0, 0, 3]);
        let stream: Vec<u8> = p1.iter().chain(p2.iter()).copied().collect();

        // Feed the byte stream in awkward chunks, pumping after each one.
        for chunk in stream.chunks(13) {
            assert!(rx.push_slices(chunk, &[]));
            pump_to_tun(&mut rx, tun.as_raw_fd(), &mut tun_ring, &mut stats);
        }

        let mut buf = [0u8; 2048];
        assert_eq!(kernel.recv(&mut buf).unwrap(), 84);
        assert_eq!(&buf[..84], &p1[..]);
        assert_eq!(kernel.recv(&mut buf).unwrap(), 200);
        assert_eq!(&buf[..200], &p2[..]);
        // Nothing half-delivered remains.
        assert_eq!(kernel.recv(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);
        assert!(rx.is_empty());
        assert_eq!(stats.world_rx.packets, 2);
        assert_eq!(stats.tun_tx.packets, 2);
    }

    #[test]
    fn packet_wrapping_the_ring_is_written_in_one_piece() {
        let (tun, kernel) = tun_pair();
        let mut rx = RingBuffer::new(2048);
        let mut tun_ring = RingBuffer::new(4096);
        let mut stats = Stats::default();

        // Skew the ring so a 1500-byte packet wraps at offset 1700.
        assert!(rx.push_slices(&vec![0x45u8; 1700], &[]));
        rx.commit_read(1700);

        let pkt = ipv4_packet(1500, [10, 0, 0, 9]);
        assert!(rx.push_slices(&pkt, &[]));
        let (head, tail) = rx.readable_regions();
        assert!(!tail.is_empty(), "packet must straddle the wrap for this test");
        assert_eq!(head.len() + tail.len(), 1500);

        let consumed = pump_to_tun(&mut rx, tun.as_raw_fd(), &mut tun_ring, &mut stats);
        assert_eq!(consumed, 1500);

        let mut buf = [0u8; 4096];
        assert_eq!(kernel.recv(&mut buf).unwrap(), 1500);
        assert_eq!(&buf[..1500], &pkt[..]);
    }

    #[test]
    fn partial_packet_stays_buffered() {
        let (tun, kernel) = tun_pair();
        let mut rx = RingBuffer::new(4096);
        let mut tun_ring = RingBuffer::new(4096);
        let mut stats = Stats::default();

        let pkt = ipv4_packet(300, [10, 0, 0, 2]);
        assert!(rx.push_slices(&pkt[..150], &[]));
        assert_eq!(pump_to_tun(&mut rx, tun.as_raw_fd(), &mut tun_ring, &mut stats), 0);
        assert_eq!(rx.len(), 150);

        let mut buf = [0u8; 512];
        assert_eq!(kernel.recv(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);

        assert!(rx.push_slices(&pkt[150..], &[]));
        assert_eq!(pump_to_tun(&mut rx, tun.as_raw_fd(), &mut tun_ring, &mut stats), 300);
        assert_eq!(kernel.recv(&mut buf).unwrap(), 300);
    }

    #[test]
    fn full_backlog_drops_whole_packets() {
        let (tun, _kernel) = tun_pair();
        let mut rx = RingBuffer::new(4096);
        // Backlog ring too small for the packet, and non-empty so the
        // direct-write path is bypassed.
        let mut tun_ring = RingBuffer::new(256);
        assert!(tun_ring.push_slices(&[0u8; 200], &[]));
        let mut stats = Stats::default();

        let pkt = ipv4_packet(120, [10, 0, 0, 2]);
        assert!(rx.push_slices(&pkt, &[]));
        let consumed = pump_to_tun(&mut rx, tun.as_raw_fd(), &mut tun_ring, &mut stats);

        assert_eq!(consumed, 120);
        assert_eq!(stats.tun_tx.drop_packets, 1);
        assert_eq!(stats.tun_tx.drop_bytes, 120);
        assert_eq!(tun_ring.len(), 200);
    }

    #[test]
    fn non_ip_head_freezes_the_stream() {
        let (tun, kernel) = tun_pair();
        let mut rx = RingBuffer::new(4096);
        let mut tun_ring = RingBuffer::new(4096);
        let mut stats = Stats::default();

        assert!(rx.push_slices(&[0xde, 0xad, 0xbe, 0xef], &[]));
        assert_eq!(pump_to_tun(&mut rx, tun.as_raw_fd(), &mut tun_ring, &mut stats), 0);
        assert_eq!(rx.len(), 4);

        let mut buf = [0u8; 64];
        assert_eq!(kernel.recv(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);
    }
}

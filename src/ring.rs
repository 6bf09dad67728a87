//! Fixed-capacity byte rings for per-endpoint backlog.
//!
//! `RingBuffer` lends contiguous slices on both the producer and consumer
//! side so socket reads and writes can go straight into the ring without an
//! intermediate copy. `PacketBuf` stages a single packet that straddles the
//! ring's wrap point ahead of one vectored write.

/// Single-producer/single-consumer byte ring.
///
/// Bookkeeping: when `wrapped` is false the used bytes are `[start, end)`;
/// when true they are `[start, size) ∪ [0, end)`. Both indices stay strictly
/// below `size`. Empty iff `!wrapped && start == end`, full iff
/// `wrapped && start == end`. Allocates once, never on the hot path.
pub struct RingBuffer {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    wrapped: bool,
}

impl RingBuffer {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "ring size must be non-zero");
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            start: 0,
            end: 0,
            wrapped: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        if self.wrapped {
            self.buf.len() - self.start + self.end
        } else {
            self.end - self.start
        }
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.wrapped && self.start == self.end
    }

    pub fn is_full(&self) -> bool {
        self.wrapped && self.start == self.end
    }

    /// Free space as up to two contiguous regions, in write order. The
    /// second region is non-empty only while the buffer is not wrapped and
    /// the consumer index sits above zero.
    pub fn writable_regions(&mut self) -> (&mut [u8], &mut [u8]) {
        if self.wrapped {
            (&mut self.buf[self.end..self.start], &mut [])
        } else {
            let start = self.start;
            let (low, high) = self.buf.split_at_mut(self.end);
            (high, &mut low[..start])
        }
    }

    /// Used bytes as up to two contiguous regions, in read order. The first
    /// region is non-empty whenever the ring holds data.
    pub fn readable_regions(&self) -> (&[u8], &[u8]) {
        if self.wrapped {
            (&self.buf[self.start..], &self.buf[..self.end])
        } else {
            (&self.buf[self.start..self.end], &[])
        }
    }

    /// Advance the producer index after `n` bytes were written into the
    /// regions returned by `writable_regions`. Flips `wrapped` exactly when
    /// the index crosses the buffer size.
    pub fn commit_write(&mut self, n: usize) {
        assert!(n <= self.free(), "commit_write past ring capacity");
        if self.wrapped {
            self.end += n;
        } else {
            let headroom = self.capacity() - self.end;
            if n < headroom {
                self.end += n;
            } else {
                self.end = n - headroom;
                self.wrapped = true;
            }
        }
    }

    /// Advance the consumer index after `n` bytes were taken from the
    /// regions returned by `readable_regions`.
    pub fn commit_read(&mut self, n: usize) {
        assert!(n <= self.len(), "commit_read past ring contents");
        if self.wrapped {
            let tail = self.capacity() - self.start;
            if n < tail {
                self.start += n;
            } else {
                self.start = n - tail;
                self.wrapped = false;
            }
        } else {
            self.start += n;
        }
    }

    /// All-or-nothing enqueue of a packet given as up to two slices.
    /// Returns false without touching the ring when the free space cannot
    /// hold the whole packet.
    pub fn push_slices(&mut self, a: &[u8], b: &[u8]) -> bool {
        if a.len() + b.len() > self.free() {
            return false;
        }
        self.copy_in(a);
        self.copy_in(b);
        true
    }

    fn copy_in(&mut self, data: &[u8]) {
        let mut off = 0;
        while off < data.len() {
            let (first, _) = self.writable_regions();
            let n = (data.len() - off).min(first.len());
            first[..n].copy_from_slice(&data[off..off + n]);
            self.commit_write(n);
            off += n;
        }
    }
}

/// Growable staging buffer for one L3 packet.
///
/// Holds the leading fragment of a packet that wraps around the ring end so
/// the whole packet can leave in a single vectored write. Grows by doubling,
/// never shrinks. Invariant: `len <= pkt_len <= capacity`, and `pkt_len == 0`
/// implies `len == 0`.
pub struct PacketBuf {
    buf: Vec<u8>,
    len: usize,
    pkt_len: usize,
}

impl PacketBuf {
    pub fn new(initial: usize) -> Self {
        Self {
            buf: vec![0u8; initial],
            len: 0,
            pkt_len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Begin staging a packet of `pkt_len` bytes, growing storage if needed.
    pub fn begin(&mut self, pkt_len: usize) {
        if pkt_len > self.buf.len() {
            let mut cap = self.buf.len().max(1);
            while cap < pkt_len {
                cap *= 2;
            }
            self.buf.resize(cap, 0);
        }
        self.pkt_len = pkt_len;
        self.len = 0;
    }

    /// Append a fragment of the staged packet.
    pub fn extend(&mut self, data: &[u8]) {
        debug_assert!(self.len + data.len() <= self.pkt_len);
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    pub fn staged(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.pkt_len = 0;
    }

    /// Raw storage for direct reads (TUN read path fills this in place).
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn storage(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(ring: &mut RingBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        let (a, b) = ring.readable_regions();
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        let n = out.len();
        ring.commit_read(n);
        out
    }

    #[test]
    fn starts_empty() {
        let mut ring = RingBuffer::new(16);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.free(), 16);
        let (a, b) = ring.writable_regions();
        assert_eq!(a.len(), 16);
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn round_trip_simple() {
        let mut ring = RingBuffer::new(16);
        assert!(ring.push_slices(b"hello", b" world"));
        assert_eq!(ring.len(), 11);
        assert_eq!(drain_all(&mut ring), b"hello world");
        assert!(ring.is_empty());
    }

    #[test]
    fn round_trip_across_wrap() {
        let mut ring = RingBuffer::new(8);
        // Skew the indices so the next write wraps.
        assert!(ring.push_slices(b"abcdef", &[]));
        ring.commit_read(6);
        assert!(ring.is_empty());

        assert!(ring.push_slices(b"0123456", &[]));
        assert_eq!(ring.len(), 7);
        let (a, b) = ring.readable_regions();
        assert_eq!(a, b"01"); // tail of the buffer
        assert_eq!(b, b"23456"); // wrapped head
        assert_eq!(drain_all(&mut ring), b"0123456");
    }

    #[test]
    fn fills_to_capacity_and_flags_full() {
        let mut ring = RingBuffer::new(4);
        assert!(ring.push_slices(b"abcd", &[]));
        assert!(ring.is_full());
        assert_eq!(ring.free(), 0);
        let (a, b) = ring.writable_regions();
        assert!(a.is_empty() && b.is_empty());
        // A full ring rejects even a single byte.
        assert!(!ring.push_slices(b"x", &[]));
        assert_eq!(drain_all(&mut ring), b"abcd");
    }

    #[test]
    fn push_is_all_or_nothing() {
        let mut ring = RingBuffer::new(8);
        assert!(ring.push_slices(b"abcdef", &[]));
        let before = ring.len();
        assert!(!ring.push_slices(b"xy", b"z"));
        assert_eq!(ring.len(), before);
        assert_eq!(drain_all(&mut ring), b"abcdef");
    }

    #[test]
    fn interleaved_partial_pushes_and_pulls() {
        // Arbitrary interleavings of partial writes and reads must replay
        // the byte sequence exactly.
        let mut ring = RingBuffer::new(13);
        let input: Vec<u8> = (0u16..500).map(|i| (i % 251) as u8).collect();
        let mut fed = 0;
        let mut out = Vec::new();
        let mut step = 0usize;
        while out.len() < input.len() {
            step += 1;
            let chunk = 1 + step * 7 % 5;
            if fed < input.len() {
                let take = chunk.min(input.len() - fed).min(ring.free());
                let src = &input[fed..fed + take];
                if ring.push_slices(src, &[]) {
                    fed += take;
                }
            }
            let pull = (1 + step % 4).min(ring.len());
            if pull > 0 {
                let (a, b) = ring.readable_regions();
                let mut got = Vec::with_capacity(pull);
                got.extend_from_slice(&a[..pull.min(a.len())]);
                if got.len() < pull {
                    got.extend_from_slice(&b[..pull - got.len()]);
                }
                ring.commit_read(pull);
                out.extend_from_slice(&got);
            }
        }
        assert_eq!(out, input);
        assert!(ring.is_empty());
    }

    #[test]
    fn commit_write_flips_wrap_exactly_at_boundary() {
        let mut ring = RingBuffer::new(8);
        assert!(ring.push_slices(b"abcde", &[]));
        ring.commit_read(5);
        // Producer at index 5, writing exactly to the boundary.
        let (first, _) = ring.writable_regions();
        assert_eq!(first.len(), 3);
        ring.commit_write(3);
        assert!(!ring.is_full());
        assert_eq!(ring.len(), 3);
        let (a, b) = ring.readable_regions();
        assert_eq!(a.len(), 3);
        assert!(b.is_empty());
    }

    #[test]
    fn packet_buf_grows_by_doubling() {
        let mut pb = PacketBuf::new(64);
        pb.begin(100);
        assert_eq!(pb.capacity(), 128);
        pb.extend(&[7u8; 60]);
        pb.extend(&[8u8; 40]);
        assert_eq!(pb.len(), 100);
        assert_eq!(pb.staged()[59], 7);
        assert_eq!(pb.staged()[60], 8);
        pb.reset();
        assert_eq!(pb.len(), 0);
        // Capacity is retained.
        assert_eq!(pb.capacity(), 128);
    }
}

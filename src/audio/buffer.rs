//! Lock-free packet ring for the jitter buffer
//!
//! Single-producer single-consumer queue of fixed-size PCM packets. The
//! network thread fills slots in place and commits them, the render thread
//! peeks the oldest packet and releases it when consumed. Neither side
//! ever blocks: a commit into a full ring drops the oldest unread packet.
//!
//! ## Memory ordering
//!
//! `head` and `tail` are monotonically increasing positions, mapped onto
//! `capacity + 1` physical slots so the slot being written is never one
//! the reader can peek.
//!
//! - Producer publishes a packet with a `Release` store of `tail`; the
//!   consumer's `Acquire` load of `tail` makes the samples visible.
//! - Consumer releases a slot with an `AcqRel` CAS on `head`; the
//!   producer's `Acquire` load of `head` in the next commit orders its
//!   reuse of that slot after the reader's last access.
//! - On overflow the producer moves `head` itself with the same CAS.
//! - The consumer remembers which position it last peeked. If overflow
//!   dropped that packet meanwhile, releasing it moves nothing, so the
//!   packet behind it is never skipped.
//!
//! Samples are stored as `AtomicI16` with relaxed access. Ordering comes
//! from the index protocol above; the atomics only make the one racy case
//! (the reader still copying a packet that overflow just dropped and the
//! producer is refilling) a stale read instead of undefined behaviour.
//!
//! The move counters are relaxed and purely diagnostic.

use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};
use std::sync::Arc;

/// No peek outstanding
const NOT_PEEKED: u64 = u64::MAX;

/// One transmission unit of interleaved i16 samples
pub struct Packet {
    samples: Box<[AtomicI16]>,
}

impl Packet {
    /// A silent packet of `len` samples
    pub fn new(len: usize) -> Self {
        Self {
            samples: (0..len).map(|_| AtomicI16::new(0)).collect(),
        }
    }

    /// Total samples across all channels
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn sample(&self, index: usize) -> i16 {
        self.samples[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_sample(&self, index: usize, value: i16) {
        self.samples[index].store(value, Ordering::Relaxed);
    }

    /// Copy as many samples as fit into `dst`
    pub fn copy_to(&self, dst: &mut [i16]) -> usize {
        let n = dst.len().min(self.len());
        for (out, sample) in dst[..n].iter_mut().zip(self.samples.iter()) {
            *out = sample.load(Ordering::Relaxed);
        }
        n
    }

    /// Overwrite from `src`; samples past `src.len()` are left untouched
    pub fn copy_from(&self, src: &[i16]) -> usize {
        let n = src.len().min(self.len());
        for (sample, value) in self.samples.iter().zip(&src[..n]) {
            sample.store(*value, Ordering::Relaxed);
        }
        n
    }

    /// Decode little-endian s16 bytes into the packet.
    ///
    /// Returns false, leaving the packet untouched, unless `bytes` holds
    /// exactly `len()` samples.
    pub fn fill_from_le_bytes(&self, bytes: &[u8]) -> bool {
        if bytes.len() != self.len() * 2 {
            return false;
        }
        for (sample, pair) in self.samples.iter().zip(bytes.chunks_exact(2)) {
            sample.store(i16::from_le_bytes([pair[0], pair[1]]), Ordering::Relaxed);
        }
        true
    }

    pub fn to_vec(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet").field("len", &self.len()).finish()
    }
}

/// Result of committing the tail slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// Packet queued, nothing lost
    Stored,
    /// Ring was full; the oldest unread packet was dropped to make room
    DroppedOldest,
}

impl Commit {
    pub fn dropped(&self) -> bool {
        matches!(self, Commit::DroppedOldest)
    }
}

/// Fixed-capacity jitter buffer of equal-sized packets
pub struct PacketBuffer {
    slots: Box<[Packet]>,
    capacity: usize,
    packet_samples: usize,

    /// Position of the next packet to read
    head: CachePadded<AtomicU64>,
    /// Position of the next slot to write
    tail: CachePadded<AtomicU64>,
    /// Position returned by the last peek, consumer only
    peeked: AtomicU64,

    head_move_requested: AtomicU64,
    head_move_completed: AtomicU64,
    tail_move_requested: AtomicU64,
    tail_move_completed: AtomicU64,
    dropped: AtomicU64,
}

impl PacketBuffer {
    /// Create a ring of `capacity` packets of `packet_samples` samples each
    pub fn new(capacity: usize, packet_samples: usize) -> Self {
        assert!(capacity > 0, "PacketBuffer capacity must be non-zero");

        let slots = (0..=capacity).map(|_| Packet::new(packet_samples)).collect();

        Self {
            slots,
            capacity,
            packet_samples,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            peeked: AtomicU64::new(NOT_PEEKED),
            head_move_requested: AtomicU64::new(0),
            head_move_completed: AtomicU64::new(0),
            tail_move_requested: AtomicU64::new(0),
            tail_move_completed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    fn slot(&self, position: u64) -> &Packet {
        &self.slots[(position % self.slots.len() as u64) as usize]
    }

    /// Oldest unread packet, if any. Consumer side.
    ///
    /// Leaves the ring untouched; only remembers the position for the
    /// next [`advance_read_head`](Self::advance_read_head).
    pub fn peek_read_head(&self) -> Option<&Packet> {
        self.peek_read_position().map(|(_, packet)| packet)
    }

    /// Like [`peek_read_head`](Self::peek_read_head), also returning the
    /// packet's stream position. Positions increase by one per packet and
    /// never repeat, so a reader holding a cursor into a packet can tell
    /// whether the head is still that packet.
    pub fn peek_read_position(&self) -> Option<(u64, &Packet)> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if tail > head {
            self.peeked.store(head, Ordering::Relaxed);
            Some((head, self.slot(head)))
        } else {
            self.peeked.store(NOT_PEEKED, Ordering::Relaxed);
            None
        }
    }

    /// Release the head packet. Consumer side.
    ///
    /// After a peek this releases exactly the peeked packet; if overflow
    /// already dropped it, nothing moves and the call still succeeds.
    /// Returns false without moving anything when the ring is empty.
    ///
    /// Every call counts as requested and every success as completed, so
    /// `head_move_completed` counts consumer releases plus overflow drops.
    pub fn advance_read_head(&self) -> bool {
        let peeked = self.peeked.swap(NOT_PEEKED, Ordering::Relaxed);
        let mut head = if peeked == NOT_PEEKED {
            self.head.load(Ordering::Acquire)
        } else {
            peeked
        };

        self.head_move_requested.fetch_add(1, Ordering::Relaxed);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail <= head {
                return false;
            }
            match self
                .head
                .compare_exchange(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                // Overflow already dropped the packet we were holding
                Err(_) if peeked != NOT_PEEKED => break,
                Err(current) => head = current,
            }
        }
        self.head_move_completed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Slot to fill before the next commit. Producer side.
    pub fn acquire_write_tail(&self) -> &Packet {
        self.slot(self.tail.load(Ordering::Relaxed))
    }

    /// Publish the tail slot. Producer side, never fails.
    pub fn commit_write_tail(&self) -> Commit {
        self.tail_move_requested.fetch_add(1, Ordering::Relaxed);

        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        let mut outcome = Commit::Stored;
        if tail - head >= self.capacity as u64 {
            // A failed CAS means the reader just freed a slot itself.
            if self
                .head
                .compare_exchange(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.head_move_requested.fetch_add(1, Ordering::Relaxed);
                self.head_move_completed.fetch_add(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                outcome = Commit::DroppedOldest;
            }
        }

        self.tail.store(tail + 1, Ordering::Release);
        self.tail_move_completed.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Number of packets that fit
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples per packet
    pub fn packet_samples(&self) -> usize {
        self.packet_samples
    }

    /// Unread packets
    pub fn size(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail.saturating_sub(head) as usize).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Read index modulo capacity
    pub fn head(&self) -> usize {
        (self.head.load(Ordering::Relaxed) % self.capacity as u64) as usize
    }

    /// Write index modulo capacity
    pub fn tail(&self) -> usize {
        (self.tail.load(Ordering::Relaxed) % self.capacity as u64) as usize
    }

    pub fn head_move_requested(&self) -> u64 {
        self.head_move_requested.load(Ordering::Relaxed)
    }

    pub fn head_move_completed(&self) -> u64 {
        self.head_move_completed.load(Ordering::Relaxed)
    }

    pub fn tail_move_requested(&self) -> u64 {
        self.tail_move_requested.load(Ordering::Relaxed)
    }

    pub fn tail_move_completed(&self) -> u64 {
        self.tail_move_completed.load(Ordering::Relaxed)
    }

    /// Packets lost to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PacketBufferStats {
        PacketBufferStats {
            capacity: self.capacity,
            size: self.size(),
            head: self.head(),
            tail: self.tail(),
            head_move_requested: self.head_move_requested(),
            head_move_completed: self.head_move_completed(),
            tail_move_requested: self.tail_move_requested(),
            tail_move_completed: self.tail_move_completed(),
            dropped: self.dropped(),
        }
    }
}

/// Packet buffer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PacketBufferStats {
    pub capacity: usize,
    pub size: usize,
    pub head: usize,
    pub tail: usize,
    pub head_move_requested: u64,
    pub head_move_completed: u64,
    pub tail_move_requested: u64,
    pub tail_move_completed: u64,
    pub dropped: u64,
}

impl PacketBufferStats {
    /// Reads attempted on an empty buffer
    pub fn failed_reads(&self) -> u64 {
        self.head_move_requested
            .saturating_sub(self.head_move_completed)
    }
}

/// Thread-safe handle to a packet buffer
pub type SharedPacketBuffer = Arc<PacketBuffer>;

/// Create a new shared packet buffer
pub fn create_shared_buffer(capacity: usize, packet_samples: usize) -> SharedPacketBuffer {
    Arc::new(PacketBuffer::new(capacity, packet_samples))
}

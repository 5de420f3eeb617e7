//! Control block layout and the index side of the ring protocol.
//!
//! Every mapped queue begins with a [`ControlBlock`]: the two ring indices,
//! each alone in its own cache line so the producer's stores to the write
//! index never contend with the consumer's stores to the read index, and the
//! immutable queue properties in a third line. The rest of the first page is
//! the caller-owned metadata region; the data region starts exactly one page
//! past the control block's base address.
//!
//! This module owns the index arithmetic and the memory orderings; the byte
//! spans derived from the indices live in [`crate::queue`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// L1 data cache line size the control block pads to.
pub const CACHE_LINE_SIZE: usize = 64;

/// Byte offset of the metadata region from the queue base.
pub const METADATA_OFFSET: usize = size_of::<ControlBlock>();

/// Read index line.
///
/// Index of the next byte to read in the data region. Written by the
/// consumer, read by the producer. Always in `[0, capacity)`.
#[repr(C, align(64))]
struct ReadIndex {
    pos: AtomicUsize,
}

/// Write index line.
///
/// Index of the next byte to write in the data region. Written by the
/// producer, read by the consumer. Always in `[0, capacity)`.
#[repr(C, align(64))]
struct WriteIndex {
    pos: AtomicUsize,
}

/// Immutable queue properties, published once at creation.
#[repr(C, align(64))]
struct Props {
    /// Data region length in bytes. Zero means the creator has not finished
    /// initializing; the release store that sets it is the publication point
    /// of the whole control block.
    capacity: AtomicUsize,

    /// Whether commits publish with release ordering (paired with an acquire
    /// fence in peek). When false the caller orders accesses externally.
    sync: AtomicBool,
}

/// Fixed header at the base of every mapped queue.
///
/// Canonical ABI, native endian and native width throughout (a mapping is
/// only consumable by processes running the same ABI):
///
/// | offset | contents |
/// |---|---|
/// | 0 | read index (`AtomicUsize`), padded to one cache line |
/// | 64 | write index (`AtomicUsize`), padded to one cache line |
/// | 128 | `capacity: AtomicUsize`, `sync: AtomicBool`, padded to one cache line |
/// | 192 | opaque metadata, to the end of the first page |
///
/// The data region begins one page past the control block's base address and
/// is mapped twice, back to back.
#[repr(C)]
pub struct ControlBlock {
    read: ReadIndex,
    write: WriteIndex,
    props: Props,
}

impl ControlBlock {
    /// Data region length in bytes. Immutable once published.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.props.capacity.load(Ordering::Relaxed)
    }

    /// Capacity load that pairs with the creator's release publication.
    ///
    /// Openers use this on a freshly mapped control block: a non-zero result
    /// guarantees the metadata and the sync flag are visible too.
    #[inline]
    pub(crate) fn capacity_acquire(&self) -> usize {
        self.props.capacity.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn sync(&self) -> bool {
        self.props.sync.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn read_pos(&self) -> usize {
        self.read.pos.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn write_pos(&self) -> usize {
        self.write.pos.load(Ordering::Relaxed)
    }

    /// Whether the readable span is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos() == self.write_pos()
    }

    /// Bytes currently readable. Always less than the capacity.
    #[inline]
    pub fn available(&self) -> usize {
        available_between(self.capacity(), self.read_pos(), self.write_pos())
    }

    /// Bytes currently writable. Always less than the capacity.
    #[inline]
    pub fn space(&self) -> usize {
        space_between(self.capacity(), self.read_pos(), self.write_pos())
    }

    /// Consumer-side advance of the read index.
    ///
    /// The consumer is the index's only writer, so a plain store suffices;
    /// the producer needs no ordering to reclaim the space, only eventual
    /// visibility.
    #[inline]
    pub(crate) fn advance_read(&self, n: usize) {
        let capacity = self.capacity();
        let rp = (self.read_pos() + n) % capacity;
        debug_assert!(rp < capacity);
        self.read.pos.store(rp, Ordering::Relaxed);
    }

    /// Producer-side advance of the write index.
    ///
    /// Under `sync` the store is the release half of the publication pair
    /// with the consumer's acquire fence in peek: every data byte written
    /// before this call is visible to a consumer that observes the new index.
    #[inline]
    pub(crate) fn advance_write(&self, n: usize) {
        let capacity = self.capacity();
        let wp = (self.write_pos() + n) % capacity;
        debug_assert!(wp < capacity);
        let ordering = if self.sync() {
            Ordering::Release
        } else {
            Ordering::Relaxed
        };
        self.write.pos.store(wp, ordering);
    }

    /// Creator-side publication: set the sync flag, then release-store the
    /// capacity. Everything written to the mapping before this call (zeroed
    /// indices, metadata) becomes visible to openers that acquire-load a
    /// non-zero capacity.
    pub(crate) fn publish(&self, capacity: usize, sync: bool) {
        self.props.sync.store(sync, Ordering::Relaxed);
        self.props.capacity.store(capacity, Ordering::Release);
    }
}

/// Bytes readable between the two indices. Result is in `[0, capacity)`.
#[inline]
pub(crate) fn available_between(capacity: usize, rp: usize, wp: usize) -> usize {
    let n = if wp >= rp {
        wp - rp
    } else {
        capacity + wp - rp
    };
    debug_assert!(n < capacity);
    n
}

/// Bytes writable between the two indices. Result is in `[0, capacity)`.
///
/// One byte stays permanently reserved so a full queue (`available ==
/// capacity - 1`) is distinguishable from an empty one (`wp == rp`);
/// `space + available == capacity - 1` in every state.
#[inline]
pub(crate) fn space_between(capacity: usize, rp: usize, wp: usize) -> usize {
    let n = if wp >= rp {
        capacity + rp - wp - 1
    } else {
        rp - wp - 1
    };
    debug_assert!(n < capacity);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of};

    #[test]
    fn test_one_cache_line_per_field() {
        assert_eq!(size_of::<ReadIndex>(), CACHE_LINE_SIZE);
        assert_eq!(size_of::<WriteIndex>(), CACHE_LINE_SIZE);
        assert_eq!(size_of::<Props>(), CACHE_LINE_SIZE);
        assert_eq!(align_of::<ControlBlock>(), CACHE_LINE_SIZE);
    }

    #[test]
    fn test_control_block_offsets() {
        assert_eq!(offset_of!(ControlBlock, read), 0);
        assert_eq!(offset_of!(ControlBlock, write), CACHE_LINE_SIZE);
        assert_eq!(offset_of!(ControlBlock, props), 2 * CACHE_LINE_SIZE);
        assert_eq!(METADATA_OFFSET, 3 * CACHE_LINE_SIZE);
    }

    #[test]
    fn test_available_both_orderings() {
        // write index ahead of read index
        assert_eq!(available_between(100, 10, 30), 20);
        // wrapped: write index behind read index
        assert_eq!(available_between(100, 80, 20), 40);
        // empty
        assert_eq!(available_between(100, 42, 42), 0);
        // full
        assert_eq!(available_between(100, 5, 4), 99);
    }

    #[test]
    fn test_space_both_orderings() {
        assert_eq!(space_between(100, 10, 30), 79);
        assert_eq!(space_between(100, 80, 20), 59);
        // empty queue has capacity - 1 writable bytes
        assert_eq!(space_between(100, 42, 42), 99);
        // full queue has none
        assert_eq!(space_between(100, 5, 4), 0);
    }

    #[test]
    fn test_space_available_law() {
        let capacity = 64;
        for rp in 0..capacity {
            for wp in 0..capacity {
                let available = available_between(capacity, rp, wp);
                let space = space_between(capacity, rp, wp);
                assert_eq!(
                    space + available,
                    capacity - 1,
                    "law violated at rp={rp} wp={wp}"
                );
            }
        }
    }
}

//! The mapped queue handle: byte-span primitives and typed element access.
//!
//! A [`Queue`] reference points at the base of a region the mapping engine
//! arranged: the control block and metadata in the first page, then the data
//! region mapped **twice**, back to back. Any span of up to `capacity - 1`
//! bytes starting anywhere in the ring is therefore one contiguous slice;
//! neither reads nor writes ever branch on the wrap point.
//!
//! # The SPSC contract
//!
//! A queue is strictly single-producer/single-consumer. At most one thread
//! (or process) may act as the producer, calling [`alloc`](Queue::alloc),
//! [`commit`](Queue::commit), [`push_bytes`](Queue::push_bytes), and
//! [`push`](Queue::push); at most one as the consumer, calling
//! [`pop`](Queue::pop). Those methods are `unsafe` and state the contract
//! per operation. The queries, [`peek`](Queue::peek), and
//! [`front`](Queue::front) are safe from either side.
//!
//! All primitives are wait-free: a bounded number of steps, no
//! retries, no syscalls.

use std::slice;
use std::sync::atomic::{Ordering, fence};

use crate::ring::{self, ControlBlock, METADATA_OFFSET};
use crate::shm::page_size;

/// Element types that may travel through the ring as a plain byte copy.
///
/// [`Queue::push`] copies an element's bytes into the data region and
/// [`Queue::front`] reinterprets ring bytes as an element, so implementors
/// must be trivially copyable in the strictest sense.
///
/// Implementations are provided for the integer primitives, `f32`/`f64`,
/// and arrays of `RingItem`. Use `#[derive(RingItem)]` for structs; the
/// derive performs the layout and pointer checks at compile time.
///
/// # Safety
///
/// Implementors must guarantee all of the following:
///
/// - **Stable layout**: `#[repr(C)]` or `#[repr(transparent)]`. The two ends
///   of a shared mapping may be compiled separately.
/// - **No pointers**: no references, raw pointers, or heap handles; a
///   virtual address copied through the ring is meaningless to the reader.
/// - **Bit-pattern validity**: any `size_of::<T>()` bytes are a valid `T`,
///   and `T` contains no padding bytes. This is what lets `front` read ring
///   bytes back out; it rules out `bool`, `char`, and enums with niches.
pub unsafe trait RingItem: Copy {}

macro_rules! impl_ring_item {
    ($($t:ty),* $(,)?) => {
        $(
            // SAFETY: primitive integers and floats have a fixed layout, no
            // pointers, no padding, and every bit pattern is a valid value.
            unsafe impl RingItem for $t {}
        )*
    };
}

impl_ring_item! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
}

// SAFETY: an array adds no padding and carries its element's guarantees.
unsafe impl<T: RingItem, const N: usize> RingItem for [T; N] {}

/// A single-producer/single-consumer byte queue in a mapped region.
///
/// Obtained from a [`QueueFactory`](crate::factory::QueueFactory); the
/// reference stays valid for as long as the factory that realized it. The
/// queue holds no knowledge of its backing object — it manipulates only its
/// control block and the doubly-mapped data region that follows it.
///
/// # Examples
///
/// ```no_run
/// use gyre::QueueFactory;
///
/// let mut factory = QueueFactory::create_private(16 * 4096);
/// let queue = factory.get()?;
///
/// // SAFETY: this thread is the queue's only producer.
/// assert!(unsafe { queue.push_bytes(b"Hello World!") });
/// assert_eq!(queue.available(), 12);
///
/// let span = queue.peek().expect("queue is non-empty");
/// assert_eq!(span, b"Hello World!");
/// let n = span.len();
/// // SAFETY: this thread is the queue's only consumer.
/// unsafe { queue.pop(n) };
/// # Ok::<(), gyre::ShmQueueError>(())
/// ```
#[repr(C)]
pub struct Queue {
    control: ControlBlock,
}

impl Queue {
    /// Data region length in bytes.
    ///
    /// One byte of capacity is permanently reserved so a full queue is
    /// distinguishable from an empty one: at most `capacity() - 1` bytes are
    /// ever readable or writable.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.control.capacity()
    }

    /// Whether no bytes are readable.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.control.is_empty()
    }

    /// Bytes currently readable. Always less than [`capacity`](Queue::capacity).
    #[inline]
    pub fn available(&self) -> usize {
        self.control.available()
    }

    /// Bytes currently writable. Always less than [`capacity`](Queue::capacity).
    ///
    /// `space() + available() == capacity() - 1` in every state; the queue
    /// is full when this returns zero.
    #[inline]
    pub fn space(&self) -> usize {
        self.control.space()
    }

    /// The caller-owned metadata region.
    ///
    /// Written once by the creator's initializer, read-only afterwards; the
    /// queue does not interpret it. Its size is whatever the first page has
    /// left after the control block.
    pub fn metadata(&self) -> &[u8] {
        // SAFETY: the mapping engine reserves the remainder of the first
        // page, past the control block, as the metadata region.
        unsafe {
            slice::from_raw_parts(
                self.base_ptr().add(METADATA_OFFSET),
                page_size() - METADATA_OFFSET,
            )
        }
    }

    /// Returns the readable span, or `None` when the queue is empty.
    ///
    /// The span starts at the read index and is [`available`](Queue::available)
    /// bytes long; the double mapping keeps it contiguous across the wrap
    /// point. It remains valid until [`pop`](Queue::pop) releases the bytes
    /// it covers — the producer never writes into bytes that are readable.
    pub fn peek(&self) -> Option<&[u8]> {
        let rp = self.control.read_pos();
        let wp = self.control.write_pos();
        if rp == wp {
            return None;
        }
        if self.control.sync() {
            // Pairs with the release store in commit: the producer's writes
            // to the span happen-before this read observed the new wp.
            fence(Ordering::Acquire);
        }
        let len = ring::available_between(self.capacity(), rp, wp);
        // SAFETY: rp < capacity and len <= capacity - 1, so the span lies
        // inside the doubly-mapped 2 * capacity window; the bytes were
        // written before the commit that made them readable.
        Some(unsafe { slice::from_raw_parts(self.data_ptr().add(rp), len) })
    }

    /// Copies the element at the head of the queue, without consuming it.
    ///
    /// Returns `None` when fewer than `size_of::<T>()` bytes are readable.
    /// The copy is an unaligned read: the ring gives element bytes no
    /// alignment.
    pub fn front<T: RingItem>(&self) -> Option<T> {
        let span = self.peek()?;
        if span.len() < size_of::<T>() {
            return None;
        }
        // SAFETY: the span holds at least size_of::<T>() initialized bytes,
        // and RingItem guarantees every bit pattern is a valid T.
        Some(unsafe { span.as_ptr().cast::<T>().read_unaligned() })
    }

    /// Releases the first `n` readable bytes back to the producer.
    ///
    /// Debug builds assert `0 < n <= available()`; release builds leave a
    /// violation undefined (the ring indices lose their meaning).
    ///
    /// # Safety
    ///
    /// The caller must be the queue's only consumer, and must no longer hold
    /// a [`peek`](Queue::peek) span covering the released bytes: once the
    /// producer observes the new read index it may overwrite them.
    #[inline]
    pub unsafe fn pop(&self, n: usize) {
        debug_assert!(n > 0, "pop of zero bytes");
        debug_assert!(n <= self.available(), "pop past the readable span");
        self.control.advance_read(n);
    }

    /// Reserves `n` writable bytes at the write index.
    ///
    /// Returns `None` when less than `n` bytes of space remain; nothing is
    /// written in that case. Otherwise the returned span is contiguous
    /// across the wrap point; fill it, then publish with
    /// [`commit`](Queue::commit)`(n)`.
    ///
    /// Debug builds assert `0 < n < capacity()`; `n == capacity()` can never
    /// fit because one byte stays reserved.
    ///
    /// # Safety
    ///
    /// The caller must be the queue's only producer: no other thread or
    /// process may call `alloc`, `commit`, `push_bytes`, or `push` on this
    /// queue. The span aliases the consumer's side of the mapping; writing
    /// outside it, or after the matching `commit`, is undefined behavior.
    pub unsafe fn alloc(&self, n: usize) -> Option<&mut [u8]> {
        debug_assert!(n > 0, "alloc of zero bytes");
        debug_assert!(n < self.capacity(), "alloc of at least a full capacity");
        let rp = self.control.read_pos();
        let wp = self.control.write_pos();
        if n > ring::space_between(self.capacity(), rp, wp) {
            return None;
        }
        // SAFETY: wp < capacity and n <= capacity - 1 keep the span inside
        // the doubly-mapped window; the space check keeps it disjoint from
        // every readable byte, and the caller vouches for a single producer.
        Some(unsafe { slice::from_raw_parts_mut(self.data_ptr().add(wp), n) })
    }

    /// Publishes `n` bytes previously reserved with [`alloc`](Queue::alloc).
    ///
    /// Under the queue's `sync` regime the write-index store uses release
    /// ordering, pairing with the acquire fence in [`peek`](Queue::peek);
    /// otherwise it is relaxed and the caller orders accesses externally.
    ///
    /// Debug builds assert `0 < n <= space()`.
    ///
    /// # Safety
    ///
    /// Single producer, as for [`alloc`](Queue::alloc). `n` must not exceed
    /// what the matching `alloc` reserved, and the first `n` bytes of the
    /// reserved span must have been written — the consumer will read them.
    #[inline]
    pub unsafe fn commit(&self, n: usize) {
        debug_assert!(n > 0, "commit of zero bytes");
        debug_assert!(n <= self.space(), "commit past the reserved span");
        self.control.advance_write(n);
    }

    /// Copies `src` into the queue as one contiguous write.
    ///
    /// Returns `false`, writing nothing, when `src` does not fit in the
    /// current [`space`](Queue::space).
    ///
    /// # Safety
    ///
    /// Single producer, as for [`alloc`](Queue::alloc).
    pub unsafe fn push_bytes(&self, src: &[u8]) -> bool {
        debug_assert!(!src.is_empty(), "push of zero bytes");
        // SAFETY: forwarded producer contract.
        let Some(span) = (unsafe { self.alloc(src.len()) }) else {
            return false;
        };
        span.copy_from_slice(src);
        // SAFETY: alloc reserved exactly src.len() bytes and every one of
        // them was just written.
        unsafe { self.commit(src.len()) };
        true
    }

    /// Copies one element into the queue.
    ///
    /// Returns `false`, writing nothing, when `size_of::<T>()` bytes do not
    /// fit.
    ///
    /// # Safety
    ///
    /// Single producer, as for [`alloc`](Queue::alloc).
    pub unsafe fn push<T: RingItem>(&self, value: T) -> bool {
        // SAFETY: RingItem guarantees value is size_of::<T>() plain bytes
        // with no padding.
        let bytes =
            unsafe { slice::from_raw_parts((&raw const value).cast::<u8>(), size_of::<T>()) };
        // SAFETY: forwarded producer contract.
        unsafe { self.push_bytes(bytes) }
    }

    #[inline]
    fn base_ptr(&self) -> *const u8 {
        (&raw const *self).cast()
    }

    /// Base of the data region, one page past the queue base. The mapping
    /// engine guarantees `2 * capacity` bytes are mapped there.
    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the queue sits at the base of a mapping that extends one
        // page plus twice the capacity; the offset stays inside it.
        unsafe { self.base_ptr().add(page_size()).cast_mut() }
    }

    /// Creator-side publication of the immutable properties. Must happen
    /// exactly once, on an exclusive mapping, after the metadata is written.
    pub(crate) fn publish(&self, capacity: usize, sync: bool) {
        self.control.publish(capacity, sync);
    }

    /// Capacity load pairing with the creator's release publication.
    pub(crate) fn capacity_acquire(&self) -> usize {
        self.control.capacity_acquire()
    }
}

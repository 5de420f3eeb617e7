//! Wait-free SPSC byte queues over double-mapped POSIX shared memory.
//!
//! A queue's backing object is mapped so that its data region appears twice
//! in the address space, back to back: every read and write of up to
//! `capacity - 1` bytes is one contiguous span, and the ring protocol never
//! branches on the wrap point. Two flavors share every code path: *shared*
//! queues live under a name in the system-global shared-memory namespace and
//! can be opened by cooperating processes; *private* queues are anonymous
//! and die with their mapping.
//!
//! Construction goes through [`QueueFactory`], which holds one of three
//! intents — create shared, open shared, create private — and materializes
//! the queue on first [`get`](QueueFactory::get):
//!
//! ```no_run
//! use gyre::QueueFactory;
//!
//! // Process A: create a shared queue of 16 pages.
//! let mut factory = QueueFactory::create_shared("/sensor-frames", 16 * 4096);
//! let queue = factory.get()?;
//! // SAFETY: this process is the queue's only producer.
//! unsafe { queue.push_bytes(b"reading 1") };
//!
//! // Process B: open it by name, waiting out the creation race.
//! let mut factory = QueueFactory::open_shared("/sensor-frames");
//! let queue = factory.get_within(std::time::Duration::from_millis(50))?;
//! if let Some(span) = queue.peek() {
//!     let n = span.len();
//!     // ... consume span ...
//!     // SAFETY: this process is the queue's only consumer.
//!     unsafe { queue.pop(n) };
//! }
//! # Ok::<(), gyre::ShmQueueError>(())
//! ```
//!
//! The queue is strictly single-producer/single-consumer and all of its
//! primitives are wait-free; see [`Queue`] for the contract. Blocking can
//! happen only inside the factory's first `get`, which performs the system
//! calls.

// Allow the crate to reference itself as ::gyre for derive macro usage
extern crate self as gyre;

pub mod factory;
pub mod queue;
pub mod ring;
pub mod shm;
pub mod trace;

#[doc(inline)]
pub use gyre_derive::RingItem;

#[doc(inline)]
pub use queue::{Queue, RingItem};

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use queue::RingItem as __RingItemPrivate;

pub use factory::{MetadataInit, QueueFactory};
pub use shm::{ShmQueueError, delete_shared};
pub use trace::init_tracing;

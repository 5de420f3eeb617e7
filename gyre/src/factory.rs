//! Deferred construction of queues: three intents, realized on first use.
//!
//! A [`QueueFactory`] records *what kind* of queue is wanted — create a
//! shared queue under a name, open an existing one, or create a private
//! one — and performs the system calls only when [`get`](QueueFactory::get)
//! is first called. Construction itself therefore cannot fail; realization
//! can, and an opener racing its creator can retry with
//! [`get_within`](QueueFactory::get_within).
//!
//! The factory owns what it made: dropping it unmaps the queue, and a
//! factory that created a *named* queue unlinks the name. Moving the factory
//! moves both obligations with it.

use std::thread;
use std::time::{Duration, Instant};

use crate::queue::Queue;
use crate::shm::{self, Result};

/// Metadata initializer: runs once against the metadata region when the
/// queue is created, before the capacity is published.
pub type MetadataInit = Box<dyn FnMut(&mut [u8]) + Send>;

enum Intent {
    CreateShared {
        name: String,
        capacity: usize,
        sync: bool,
        mdinit: Option<MetadataInit>,
    },
    OpenShared {
        name: String,
    },
    CreatePrivate {
        capacity: usize,
        sync: bool,
        mdinit: Option<MetadataInit>,
    },
}

/// Owner of a live mapping. Unmapping on drop is the single cleanup path;
/// name handling stays with the factory's intent.
struct Mapping {
    queue: std::ptr::NonNull<Queue>,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: this Mapping is the sole owner of the region, and every
        // queue reference handed out borrows from the factory that holds it.
        let _ = unsafe { shm::unmap_shared(self.queue) };
    }
}

// SAFETY: the mapping is shared memory, not thread-local state; Queue is
// Sync, and the NonNull is only a handle to it.
unsafe impl Send for Mapping {}
// SAFETY: shared access through the mapping goes through Queue's own
// synchronization.
unsafe impl Sync for Mapping {}

/// Lazily materializes a queue under one of three construction intents.
///
/// | constructor | intent on first [`get`](QueueFactory::get) |
/// |---|---|
/// | [`create_shared`](QueueFactory::create_shared) | create a named queue, then map it |
/// | [`open_shared`](QueueFactory::open_shared) | map an existing named queue |
/// | [`create_private`](QueueFactory::create_private) | create an anonymous queue |
///
/// The create intents accept a [`sync`](QueueFactory::sync) flag and a
/// [`metadata_init`](QueueFactory::metadata_init) callback before
/// realization. The factory is move-only; a move transfers the mapping and
/// the responsibility to unlink a created name.
///
/// # Examples
///
/// ```no_run
/// use gyre::QueueFactory;
///
/// let mut factory = QueueFactory::create_shared("/telemetry", 64 * 4096)
///     .metadata_init(|md| md[..4].copy_from_slice(b"v1\0\0"));
/// assert!(!factory.is_realized());
///
/// let queue = factory.get()?;
/// assert_eq!(queue.capacity(), 64 * 4096);
/// # Ok::<(), gyre::ShmQueueError>(())
/// ```
pub struct QueueFactory {
    intent: Intent,
    mapping: Option<Mapping>,
}

impl QueueFactory {
    /// Intent: create a new shared queue under `name` on first use.
    ///
    /// Creation reclaims the name from any stale incarnation. The capacity
    /// must be a positive multiple of the page size.
    pub fn create_shared(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            intent: Intent::CreateShared {
                name: name.into(),
                capacity,
                sync: true,
                mdinit: None,
            },
            mapping: None,
        }
    }

    /// Intent: open and map an existing shared queue under `name` on first
    /// use.
    pub fn open_shared(name: impl Into<String>) -> Self {
        Self {
            intent: Intent::OpenShared { name: name.into() },
            mapping: None,
        }
    }

    /// Intent: create a new private queue on first use.
    ///
    /// The capacity must be a positive multiple of the page size.
    pub fn create_private(capacity: usize) -> Self {
        Self {
            intent: Intent::CreatePrivate {
                capacity,
                sync: true,
                mdinit: None,
            },
            mapping: None,
        }
    }

    /// Selects the memory-ordering regime (default `true`).
    ///
    /// With `sync` off the producer's commits stop publishing and the
    /// consumer's peeks stop acquiring; the caller promises to order
    /// accesses by external means. Ignored by the open intent, which
    /// inherits the creator's choice from the control block.
    #[must_use]
    pub fn sync(mut self, sync: bool) -> Self {
        match &mut self.intent {
            Intent::CreateShared { sync: s, .. } | Intent::CreatePrivate { sync: s, .. } => {
                *s = sync;
            }
            Intent::OpenShared { .. } => {}
        }
        self
    }

    /// Installs a metadata initializer, run once against the metadata region
    /// when the queue is created. Ignored by the open intent.
    #[must_use]
    pub fn metadata_init(mut self, init: impl FnMut(&mut [u8]) + Send + 'static) -> Self {
        match &mut self.intent {
            Intent::CreateShared { mdinit, .. } | Intent::CreatePrivate { mdinit, .. } => {
                *mdinit = Some(Box::new(init));
            }
            Intent::OpenShared { .. } => {}
        }
        self
    }

    /// Whether the queue has been materialized yet.
    pub fn is_realized(&self) -> bool {
        self.mapping.is_some()
    }

    /// Whether a realization attempt would find its backing object, without
    /// side effects.
    ///
    /// Private intents always can; named intents probe the namespace for the
    /// name. A realized factory always can.
    pub fn can_get(&self) -> bool {
        if self.mapping.is_some() {
            return true;
        }
        match &self.intent {
            Intent::CreatePrivate { .. } => true,
            Intent::CreateShared { name, .. } | Intent::OpenShared { name } => shm::exists(name),
        }
    }

    /// Realizes the intent if necessary and returns the queue.
    ///
    /// The first call performs the system calls, and so may block or fail;
    /// once realized, calls are cheap and infallible. The returned reference
    /// borrows from the factory — the mapping lives until the factory is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Whatever the mapping engine surfaces: name or capacity validation,
    /// an errno from the namespace or mapping syscalls, or
    /// [`NotYetInitialized`](crate::ShmQueueError::NotYetInitialized) when
    /// opening ahead of the creator (retryable; see
    /// [`get_within`](QueueFactory::get_within)).
    pub fn get(&mut self) -> Result<&Queue> {
        if self.mapping.is_none() {
            self.realize()?;
        }

        // SAFETY: the mapping stays alive for as long as this factory, and
        // the returned borrow cannot outlive it.
        Ok(unsafe { self.mapping.as_ref().unwrap().queue.as_ref() })
    }

    /// Performs the realization side effects, storing the resulting mapping.
    /// Split out from [`get`](QueueFactory::get) so the mutable borrow of
    /// `self.intent` used here does not need to outlive the borrow returned
    /// by `get`.
    fn realize(&mut self) -> Result<()> {
        let queue = match &mut self.intent {
            Intent::CreateShared {
                name,
                capacity,
                sync,
                mdinit,
            } => {
                shm::create_shared(name, *capacity, *sync, mdinit.as_deref_mut())?;
                shm::map_shared(name)?
            }
            Intent::OpenShared { name } => shm::map_shared(name)?,
            Intent::CreatePrivate {
                capacity,
                sync,
                mdinit,
            } => shm::create_private(*capacity, *sync, mdinit.as_deref_mut())?,
        };
        self.mapping = Some(Mapping { queue });
        Ok(())
    }

    /// Realizes the intent, retrying retryable failures until `timeout` has
    /// elapsed.
    ///
    /// An opener typically races its creator: the name may not exist yet, or
    /// the capacity may not be published. Such attempts poll with a short
    /// sleep. Any other failure, or the deadline, surfaces immediately.
    pub fn get_within(&mut self, timeout: Duration) -> Result<&Queue> {
        const POLL_INTERVAL: Duration = Duration::from_micros(100);

        let deadline = Instant::now() + timeout;
        loop {
            match self.get() {
                Ok(_) => break,
                Err(err) if err.is_retryable() && Instant::now() < deadline => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        }
        self.get()
    }
}

impl Drop for QueueFactory {
    fn drop(&mut self) {
        // A created name is this factory's to retire; openers leave it for
        // the creator, and private names are long gone. Unlinking is
        // idempotent, so a factory that never realized is fine too.
        if let Intent::CreateShared { name, .. } = &self.intent {
            let _ = shm::delete_shared(name);
        }
        // The mapping, if any, unmaps through its own drop.
    }
}

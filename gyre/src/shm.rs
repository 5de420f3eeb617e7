//! POSIX shared-memory engine: object sizing, the double mapping, and the
//! named and private queue lifecycles.
//!
//! Every queue's backing object is laid out the same way: one control page,
//! then the data region, rounded out to whole pages. Mapping an object adds
//! a second, `MAP_FIXED` view of the data pages immediately after the first,
//! so ring offsets `i` and `i + capacity` reach the same byte and no span
//! ever splits at the wrap point:
//!
//! ```text
//! file:    | control page | data (capacity bytes) | page slack |
//! offset     0              P
//!
//! memory:  | control page | data ............ | data again (overlay) |
//! offset     0              P                   footprint(capacity)
//! ```
//!
//! Creation publishes the capacity last, with release ordering. An opener
//! that finds the object no bigger than one page, or reads a capacity of
//! zero, reports [`ShmQueueError::NotYetInitialized`]; the race between a
//! creator and its openers is resolved by retrying.
//!
//! A *private* queue runs through the exact same code paths under a
//! generated name that is unlinked as soon as the creator's own mapping
//! exists, leaving the mapping as the only reference to the pages.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::{AtomicU32, Ordering};

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm;

use crate::queue::Queue;
use crate::ring::METADATA_OFFSET;
use crate::trace::debug;

/// Result alias for mapping-engine operations.
pub type Result<T> = std::result::Result<T, ShmQueueError>;

/// Errors from the mapping engine and the queue lifecycles.
///
/// Ring primitives never produce these; full and empty are expressed as
/// sentinel results. The only post-construction source of errors is a
/// factory's first realization.
#[derive(Debug, thiserror::Error)]
pub enum ShmQueueError {
    /// The shared-memory object name is not usable with `shm_open`.
    #[error("invalid shared memory name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The requested capacity cannot back a contiguous double mapping.
    #[error("invalid capacity {capacity}: {reason}")]
    InvalidCapacity { capacity: usize, reason: &'static str },

    /// `shm_open`, `ftruncate`, `mmap`, etc. failed with an errno.
    #[error("{op} failed for `{name}`: {source}")]
    Posix {
        op: &'static str,
        name: String,
        #[source]
        source: Errno,
    },

    /// The creator has not published the queue's capacity yet.
    #[error("queue `{name}` is not initialized yet")]
    NotYetInitialized { name: String },
}

impl ShmQueueError {
    fn posix(op: &'static str, name: &str, source: Errno) -> Self {
        Self::Posix {
            op,
            name: name.to_string(),
            source,
        }
    }

    /// Whether waiting and retrying can clear the failure.
    ///
    /// True for an opener that raced its creator: the name does not exist
    /// yet, or exists but has no published capacity.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotYetInitialized { .. } => true,
            Self::Posix {
                op: "shm_open",
                source,
                ..
            } => *source == Errno::NOENT,
            _ => false,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// Validates that a name meets POSIX `shm_open` requirements: a leading
/// slash, no further slashes, at most 255 bytes.
fn validate_name(name: &str) -> Result<()> {
    if !name.starts_with('/') {
        return Err(ShmQueueError::InvalidName {
            name: name.to_string(),
            reason: "name must start with '/'",
        });
    }

    if name[1..].contains('/') {
        return Err(ShmQueueError::InvalidName {
            name: name.to_string(),
            reason: "name must not contain additional '/' characters",
        });
    }

    if name.len() > POSIX_NAME_MAX {
        return Err(ShmQueueError::InvalidName {
            name: name.to_string(),
            reason: "name length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// The capacity must be a positive number of whole pages: the overlay lands
/// at `data_base + capacity`, and `mmap` only places mappings on page
/// boundaries. Any other capacity would leave a hole between the two data
/// views and silently corrupt wrap-crossing spans.
fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        return Err(ShmQueueError::InvalidCapacity {
            capacity,
            reason: "capacity must be greater than 0",
        });
    }
    if capacity % page_size() != 0 {
        return Err(ShmQueueError::InvalidCapacity {
            capacity,
            reason: "capacity must be a multiple of the page size \
                     so the two data mappings stay adjacent",
        });
    }
    Ok(())
}

#[inline]
pub(crate) fn page_size() -> usize {
    rustix::param::page_size()
}

/// Bytes reserved ahead of the data region: the control page plus enough
/// whole pages to cover `capacity`, so the overlay lands page-aligned right
/// after the first copy of the data.
///
/// `footprint(0)` is a single page — the probe size an opener maps before it
/// knows the real capacity. The backing object is `footprint(capacity) +
/// capacity` bytes; so is the mapped range.
pub(crate) fn footprint(capacity: usize) -> usize {
    let page = page_size();
    if capacity == 0 {
        return page;
    }
    page + capacity.div_ceil(page) * page
}

/// Creates and fully initializes the named backing object.
///
/// Any stale object under `name` is unlinked first. On return the object
/// carries a zeroed control block, initializer-written metadata, and a
/// published capacity; the creator holds no mapping of its own. Every
/// failure path after the object exists unlinks it again, so a failed create
/// leaves nothing behind.
///
/// The metadata initializer, if any, runs exactly once against the metadata
/// region, before the capacity is published. A panic inside it unlinks the
/// object and resumes unwinding.
pub fn create_shared(
    name: &str,
    capacity: usize,
    sync: bool,
    mdinit: Option<&mut (dyn FnMut(&mut [u8]) + Send + '_)>,
) -> Result<()> {
    validate_name(name)?;
    validate_capacity(capacity)?;

    // Reclaim the name from any earlier incarnation.
    match shm::unlink(name) {
        Ok(()) | Err(Errno::NOENT) => {}
        Err(err) => return Err(ShmQueueError::posix("shm_unlink", name, err)),
    }

    let fd = shm::open(
        name,
        shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
        Mode::RUSR | Mode::WUSR,
    )
    .map_err(|err| ShmQueueError::posix("shm_open", name, err))?;

    let len = footprint(capacity) + capacity;
    if let Err(err) = ftruncate(&fd, len as u64) {
        drop(fd);
        let _ = shm::unlink(name);
        return Err(ShmQueueError::posix("ftruncate", name, err));
    }

    // Bootstrap mapping for initialization only; openers map for real.
    //
    // SAFETY: fresh mapping of a valid fd at a kernel-chosen address; `len`
    // matches the size the object was just truncated to.
    let base = match unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &fd,
            0,
        )
    } {
        Ok(base) => base,
        Err(err) => {
            drop(fd);
            let _ = shm::unlink(name);
            return Err(ShmQueueError::posix("mmap", name, err));
        }
    };

    let init_result = catch_unwind(AssertUnwindSafe(|| {
        if let Some(init) = mdinit {
            // SAFETY: the mapping is exclusive (the object was created with
            // O_EXCL and its capacity is still zero, so no opener proceeds),
            // and the metadata region is the rest of the first page.
            let metadata = unsafe {
                std::slice::from_raw_parts_mut(
                    base.cast::<u8>().add(METADATA_OFFSET),
                    page_size() - METADATA_OFFSET,
                )
            };
            init(metadata);
        }
        // Freshly truncated shared pages are zero-filled, which is a valid
        // control block (both indices at 0, capacity 0). Publishing the real
        // capacity with release ordering is the last write; an opener that
        // acquire-loads it sees everything above.
        //
        // SAFETY: base points at the zeroed control page of the exclusive
        // mapping established above.
        unsafe { (*base.cast::<Queue>()).publish(capacity, sync) };
    }));

    // SAFETY: base/len delimit the bootstrap mapping created above.
    let unmap_result = unsafe { munmap(base, len) };
    drop(fd);

    if let Err(payload) = init_result {
        let _ = shm::unlink(name);
        resume_unwind(payload);
    }
    if let Err(err) = unmap_result {
        let _ = shm::unlink(name);
        return Err(ShmQueueError::posix("munmap", name, err));
    }

    debug!(%name, capacity, sync, "created shared queue");
    Ok(())
}

/// Opens the named queue and maps it with the doubled data region.
///
/// Fails with [`ShmQueueError::NotYetInitialized`] while the creator has not
/// published the capacity; the caller may retry. A failed open leaves the
/// backing object untouched.
///
/// The returned pointer stays valid until [`unmap_shared`]; unlinking the
/// name does not invalidate it.
pub fn map_shared(name: &str) -> Result<NonNull<Queue>> {
    validate_name(name)?;
    let page = page_size();

    let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty())
        .map_err(|err| ShmQueueError::posix("shm_open", name, err))?;

    let stat = match fstat(&fd) {
        Ok(stat) => stat,
        Err(err) => {
            drop(fd);
            return Err(ShmQueueError::posix("fstat", name, err));
        }
    };
    if stat.st_size <= page as i64 {
        // The creator has not sized the object past the control page yet.
        drop(fd);
        return Err(ShmQueueError::NotYetInitialized {
            name: name.to_string(),
        });
    }

    // Probe just the control page to learn the capacity.
    //
    // SAFETY: fresh one-page mapping of a valid fd; fstat confirmed the
    // object is larger than that.
    let probe = match unsafe {
        mmap(
            null_mut(),
            footprint(0),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &fd,
            0,
        )
    } {
        Ok(probe) => probe,
        Err(err) => {
            drop(fd);
            return Err(ShmQueueError::posix("mmap", name, err));
        }
    };

    // Pairs with the creator's release publication.
    //
    // SAFETY: probe covers the control page; a control block is valid for
    // reads at any initialization stage (zero bytes included).
    let capacity = unsafe { (*probe.cast::<Queue>()).capacity_acquire() };

    if capacity == 0 {
        // SAFETY: probe mapping created above.
        let _ = unsafe { munmap(probe, footprint(0)) };
        drop(fd);
        return Err(ShmQueueError::NotYetInitialized {
            name: name.to_string(),
        });
    }

    // SAFETY: probe mapping created above.
    if let Err(err) = unsafe { munmap(probe, footprint(0)) } {
        drop(fd);
        return Err(ShmQueueError::posix("munmap", name, err));
    }

    let fp = footprint(capacity);

    // First view: control page, data region, and address space that the
    // overlay will claim, at a kernel-chosen base.
    //
    // SAFETY: fresh mapping of a valid fd; the object is fp + capacity bytes
    // once the capacity is published.
    let base = match unsafe {
        mmap(
            null_mut(),
            fp + capacity,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &fd,
            0,
        )
    } {
        Ok(base) => base,
        Err(err) => {
            drop(fd);
            return Err(ShmQueueError::posix("mmap", name, err));
        }
    };

    // Second view of the data pages, fixed immediately after the first copy
    // so ring offsets i and i + capacity reach the same byte.
    //
    // SAFETY: the target range [base + fp, base + fp + capacity) lies inside
    // the mapping established above, so MAP_FIXED replaces only our own
    // pages; the file offset `page` is where the data region starts.
    let overlay = unsafe {
        mmap(
            base.cast::<u8>().add(fp).cast(),
            capacity,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED | MapFlags::FIXED,
            &fd,
            page as u64,
        )
    };
    if let Err(err) = overlay {
        // SAFETY: first view created above.
        let _ = unsafe { munmap(base, fp + capacity) };
        drop(fd);
        return Err(ShmQueueError::posix("mmap", name, err));
    }
    drop(fd);

    debug!(%name, capacity, "mapped shared queue");

    // SAFETY: mmap never returns null on success.
    Ok(unsafe { NonNull::new_unchecked(base.cast::<Queue>()) })
}

/// Unmaps a queue mapping produced by [`map_shared`] or [`create_private`].
///
/// The overlay view lies inside the same contiguous virtual range, so one
/// `munmap` of `footprint + capacity` bytes removes both.
///
/// # Safety
///
/// `queue` must have come from [`map_shared`] or [`create_private`], must
/// not have been unmapped already, and no reference into the mapping may
/// outlive this call.
pub unsafe fn unmap_shared(queue: NonNull<Queue>) -> Result<()> {
    // SAFETY: per the caller contract the mapping is still live.
    let capacity = unsafe { queue.as_ref() }.capacity();
    let len = footprint(capacity) + capacity;
    // SAFETY: per the caller contract this is exactly the range the engine
    // arranged for this queue, and nothing references it anymore.
    unsafe { munmap(queue.as_ptr().cast(), len) }
        .map_err(|err| ShmQueueError::posix("munmap", "<mapped queue>", err))
}

/// Removes `name` from the shared-memory namespace.
///
/// Idempotent: a missing name is not an error. Existing mappings stay valid
/// until their owners unmap.
pub fn delete_shared(name: &str) -> Result<()> {
    validate_name(name)?;
    match shm::unlink(name) {
        Ok(()) | Err(Errno::NOENT) => {
            debug!(%name, "unlinked shared queue");
            Ok(())
        }
        Err(err) => Err(ShmQueueError::posix("shm_unlink", name, err)),
    }
}

/// Whether a backing object currently exists under `name`, without mapping
/// anything.
pub fn exists(name: &str) -> bool {
    validate_name(name).is_ok() && shm::open(name, shm::OFlags::RDWR, Mode::empty()).is_ok()
}

/// Process-wide counter for private queue names. Only uniqueness matters,
/// so relaxed ordering suffices.
static PRIVATE_SEQ: AtomicU32 = AtomicU32::new(0);

fn private_name() -> String {
    let seq = PRIVATE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("/.gyre.{}.{}", std::process::id(), seq)
}

/// Creates an anonymous queue.
///
/// A private queue is a named queue whose generated name is unlinked as soon
/// as the creator's own mapping exists; the mapping is then the pages' only
/// reference, and destruction is a plain [`unmap_shared`]. Private queues
/// exercise exactly the shared code paths, double mapping included.
pub fn create_private(
    capacity: usize,
    sync: bool,
    mdinit: Option<&mut (dyn FnMut(&mut [u8]) + Send + '_)>,
) -> Result<NonNull<Queue>> {
    let name = private_name();
    create_shared(&name, capacity, sync, mdinit)?;
    let queue = match map_shared(&name) {
        Ok(queue) => queue,
        Err(err) => {
            let _ = delete_shared(&name);
            return Err(err);
        }
    };
    if let Err(err) = delete_shared(&name) {
        // SAFETY: the mapping was created just above and never shared.
        let _ = unsafe { unmap_shared(queue) };
        return Err(err);
    }
    debug!(%name, capacity, "created private queue");
    Ok(queue)
}

#![warn(clippy::all, clippy::restriction, clippy::pedantic)]
#![allow(
    clippy::blanket_clippy_restriction_lints,
    clippy::implicit_return,
    clippy::std_instead_of_core,
    clippy::std_instead_of_alloc,
    clippy::unseparated_literal_suffix,
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::missing_inline_in_public_items
)]

//! Scoped wrappers around linux System V shared memory segments.
//!
//! A [`Segment`] is marked for destruction when dropped and an [`Attachment`] borrows the
//! [`Segment`] it maps, so a mapping can never outlive the segment it was attached to.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use libc::c_void;
use log::{error, info, trace};
use log_derive::logfn;

/// Wrappers around `libc` shared memory functions.
pub mod bindings;
/// The kernel's shared memory limits.
mod limits;

pub use limits::{Limits, LimitsError};

/// `SHM_DEST`, set in a segment's mode once it has been marked for destruction.
const SHM_DEST: u32 = 0o1000;

/// Describes an `errno` value.
fn os_error(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

/// Error type for shared memory operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to allocate shared memory.
    #[error("Failed to allocate {size} bytes of shared memory: {}", os_error(.errno))]
    Allocate {
        /// Requested size in bytes.
        size: usize,
        /// `errno` set by `shmget`.
        errno: i32,
    },
    /// Failed to attach shared memory.
    #[error("Failed to attach shared memory segment {id}: {}", os_error(.errno))]
    Attach {
        /// Segment id.
        id: i32,
        /// `errno` set by `shmat`.
        errno: i32,
    },
    /// Failed to detach shared memory.
    #[error("Failed to detach shared memory segment {id}: {}", os_error(.errno))]
    Detach {
        /// Segment id.
        id: i32,
        /// `errno` set by `shmdt`.
        errno: i32,
    },
    /// Failed to mark shared memory for destruction.
    #[error("Failed to deallocate shared memory segment {id}: {}", os_error(.errno))]
    Release {
        /// Segment id.
        id: i32,
        /// `errno` set by `shmctl`.
        errno: i32,
    },
    /// Failed to read the description of shared memory.
    #[error("Failed to stat shared memory segment {id}: {}", os_error(.errno))]
    Status {
        /// Segment id.
        id: i32,
        /// `errno` set by `shmctl`.
        errno: i32,
    },
}

impl Error {
    /// The `errno` the failing call set.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match *self {
            Self::Allocate { errno, .. }
            | Self::Attach { errno, .. }
            | Self::Detach { errno, .. }
            | Self::Release { errno, .. }
            | Self::Status { errno, .. } => errno,
        }
    }
}

/// Access permissions of a segment (the low nine mode bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(u32);

impl Permissions {
    /// Mask of the bits `shmget` accepts as permissions.
    const MASK: u32 = 0o777;

    /// Permissions from an octal mode, ignoring bits outside `0o777`.
    #[must_use]
    pub const fn from_mode(mode: u32) -> Self {
        Self(mode & Self::MASK)
    }

    /// The mode bits.
    #[must_use]
    pub const fn mode(self) -> u32 {
        self.0
    }

    /// The mode bits as `shmget` flags.
    #[allow(clippy::as_conversions, clippy::cast_possible_wrap)]
    const fn flags(self) -> i32 {
        // `0o777` always fits.
        self.0 as i32
    }
}

impl Default for Permissions {
    /// Read-write for owner, group and other.
    fn default() -> Self {
        Self(
            libc::S_IRUSR
                | libc::S_IWUSR
                | libc::S_IRGRP
                | libc::S_IWGRP
                | libc::S_IROTH
                | libc::S_IWOTH,
        )
    }
}

/// Snapshot of the kernel's description of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Size of the segment in bytes.
    pub size: usize,
    /// Number of current attaches.
    pub attachments: u64,
    /// Pid of the creating process.
    pub creator: i32,
    /// Whether the segment has been marked for destruction.
    pub destroyed: bool,
    /// Permissions of the segment.
    pub permissions: Permissions,
}

impl From<&libc::shmid_ds> for Status {
    fn from(description: &libc::shmid_ds) -> Self {
        #[allow(clippy::useless_conversion)]
        let mode = u32::from(description.shm_perm.mode);
        #[allow(clippy::useless_conversion)]
        let attachments = u64::from(description.shm_nattch);
        Self {
            size: description.shm_segsz,
            attachments,
            creator: description.shm_cpid,
            destroyed: mode & SHM_DEST != 0,
            permissions: Permissions::from_mode(mode),
        }
    }
}

/// Returns the status of segment `id`, or `None` when it no longer exists.
///
/// # Errors
///
/// When the kernel refuses to describe the segment (e.g. `EACCES`).
pub fn status(id: i32) -> Result<Option<Status>, Error> {
    bindings::shared_memory_status(id)
        .map(|description| description.as_ref().map(Status::from))
        .map_err(|errno| Error::Status { id, errno })
}

/// A private System V shared memory segment.
///
/// The segment is marked for destruction when this is dropped.
#[derive(Debug)]
pub struct Segment {
    /// Shared memory id.
    id: i32,
    /// Requested size in bytes.
    size: usize,
    /// Whether the segment has already been marked for destruction.
    removed: Cell<bool>,
}

impl Segment {
    /// Allocates a new private segment of `size` bytes.
    ///
    /// # Errors
    ///
    /// When the kernel refuses the allocation, e.g. `size` is `0` or larger than `shmmax`
    /// (`EINVAL`) or the system wide limits are exhausted (`ENOSPC`, `ENOMEM`).
    #[logfn(ok = "TRACE", err = "DEBUG")]
    pub fn allocate(size: usize, permissions: Permissions) -> Result<Self, Error> {
        let id = bindings::allocate_shared_memory(size, permissions.flags())
            .map_err(|errno| Error::Allocate { size, errno })?;
        info!("shmid: {}", id);
        Ok(Self {
            id,
            size,
            removed: Cell::new(false),
        })
    }

    /// Shared memory id.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Requested size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Maps the segment into this process at an address chosen by the kernel.
    ///
    /// # Errors
    ///
    /// When the mapping fails, e.g. the address space is exhausted (`ENOMEM`) or access is
    /// denied (`EACCES`).
    pub fn attach(&self) -> Result<Attachment<'_>, Error> {
        // SAFETY:
        // The mapping is owned by the returned `Attachment` which detaches it exactly once.
        let address = unsafe { bindings::attach_shared_memory(self.id) }
            .map_err(|errno| Error::Attach { id: self.id, errno })?;
        info!("shared memory pointer: {:?}", address);
        Ok(Attachment {
            address,
            id: self.id,
            size: self.size,
            segment: PhantomData,
        })
    }

    /// Reads the kernel's description of this segment.
    ///
    /// # Errors
    ///
    /// When `IPC_STAT` fails.
    pub fn status(&self) -> Result<Status, Error> {
        bindings::shared_memory_status(self.id)
            .map_err(|errno| Error::Status { id: self.id, errno })?
            .as_ref()
            .map(Status::from)
            .ok_or(Error::Status {
                id: self.id,
                errno: libc::EIDRM,
            })
    }

    /// Marks the segment for destruction, reporting failure rather than logging it.
    ///
    /// Does nothing if [`Segment::remove`] already succeeded.
    ///
    /// # Errors
    ///
    /// When `IPC_RMID` fails.
    pub fn release(self) -> Result<(), Error> {
        let (id, removed) = (self.id, self.removed.get());
        std::mem::forget(self);
        if removed {
            return Ok(());
        }
        trace!("deallocating shmid: {}", id);
        bindings::deallocate_shared_memory(id).map_err(|errno| Error::Release { id, errno })
    }

    /// Marks the segment for destruction while keeping existing attachments valid.
    ///
    /// The kernel frees it once the last attachment is detached, even if this process is
    /// killed before it can release the segment. It can no longer be attached by other processes.
    ///
    /// # Errors
    ///
    /// When `IPC_RMID` fails.
    pub fn remove(&self) -> Result<(), Error> {
        trace!("removing shmid: {}", self.id);
        bindings::deallocate_shared_memory(self.id).map_err(|errno| Error::Release {
            id: self.id,
            errno,
        })?;
        self.removed.set(true);
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.removed.get() {
            return;
        }
        trace!("deallocating shmid: {}", self.id);
        if let Err(errno) = bindings::deallocate_shared_memory(self.id) {
            error!("{}", Error::Release { id: self.id, errno });
        }
    }
}

/// A [`Segment`] mapped into this process.
///
/// The mapping is detached when this is dropped.
#[derive(Debug)]
pub struct Attachment<'segment> {
    /// Base address of the mapping.
    address: NonNull<c_void>,
    /// Id of the mapped segment.
    id: i32,
    /// Size of the mapped segment in bytes.
    size: usize,
    /// An attachment must not outlive its segment.
    segment: PhantomData<&'segment Segment>,
}

impl Attachment<'_> {
    /// Base address of the mapping.
    #[must_use]
    #[allow(clippy::as_conversions)]
    pub fn address(&self) -> usize {
        self.address.as_ptr() as usize
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The mapped memory.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY:
        // The kernel mapped `size` bytes at `address` (rounded up to a page), zero initialized.
        unsafe { std::slice::from_raw_parts(self.address.as_ptr().cast::<u8>(), self.size) }
    }

    /// The mapped memory.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY:
        // As `as_slice`, and `&mut self` guarantees exclusive access within this process.
        unsafe { std::slice::from_raw_parts_mut(self.address.as_ptr().cast::<u8>(), self.size) }
    }

    /// Writes `byte` over the whole mapping, forcing the kernel to back every page.
    pub fn fill(&mut self, byte: u8) {
        trace!("filling {} bytes of shmid {}", self.size, self.id);
        self.as_mut_slice().fill(byte);
    }

    /// Detaches the mapping, reporting failure rather than logging it.
    ///
    /// # Errors
    ///
    /// When `shmdt` fails.
    pub fn detach(self) -> Result<(), Error> {
        let (address, id) = (self.address, self.id);
        std::mem::forget(self);
        trace!("detaching shmid: {}", id);
        // SAFETY:
        // `self` was consumed so nothing can reference the mapping.
        unsafe { bindings::detach_shared_memory(address) }.map_err(|errno| Error::Detach { id, errno })
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        trace!("detaching shmid: {}", self.id);
        // SAFETY:
        // The mapping is only reachable through `self`, which is being dropped.
        if let Err(errno) = unsafe { bindings::detach_shared_memory(self.address) } {
            error!("{}", Error::Detach { id: self.id, errno });
        }
    }
}

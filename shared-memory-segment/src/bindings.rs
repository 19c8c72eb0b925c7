use std::mem::MaybeUninit;
use std::ptr::NonNull;

use libc::c_void;

/// Allocate a new private shared memory segment.
///
/// <https://linux.die.net/man/2/shmget>
///
/// # Errors
///
/// Returns `errno` when `shmget` fails.
pub fn allocate_shared_memory(size: usize, permissions: i32) -> Result<i32, i32> {
    // SAFETY:
    // `shmget` takes no pointers.
    let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | permissions) };
    match shmid {
        -1i32 => Err(errno()),
        _ => Ok(shmid),
    }
}

/// Attach shared memory to this process at an address chosen by the kernel.
///
/// <https://linux.die.net/man/2/shmat>
///
/// # Safety
///
/// The returned mapping must be detached with [`detach_shared_memory`] at most once.
///
/// # Errors
///
/// Returns `errno` when `shmat` fails.
pub unsafe fn attach_shared_memory(id: i32) -> Result<NonNull<c_void>, i32> {
    let shared_mem_ptr = libc::shmat(id, std::ptr::null(), 0);
    // The documentation specifies:
    // > On success shmat() returns the address of the attached shared memory segment; on error
    // > (void *) -1 is returned, and errno is set to indicate the cause of the error.
    #[allow(clippy::as_conversions)]
    if shared_mem_ptr as isize == -1 {
        return Err(errno());
    }
    NonNull::new(shared_mem_ptr).ok_or(libc::EFAULT)
}

/// Detach shared memory from this process.
///
/// <https://linux.die.net/man/2/shmdt>
///
/// # Safety
///
/// `ptr` must come from [`attach_shared_memory`] and nothing may reference the mapping afterwards.
///
/// # Errors
///
/// Returns `errno` when `shmdt` fails.
pub unsafe fn detach_shared_memory(ptr: NonNull<c_void>) -> Result<(), i32> {
    match libc::shmdt(ptr.as_ptr()) {
        0i32 => Ok(()),
        _ => Err(errno()),
    }
}

/// Mark shared memory for destruction.
///
/// The kernel frees it once the last process detaches.
///
/// <https://linux.die.net/man/2/shmctl>
///
/// # Errors
///
/// Returns `errno` when `shmctl` fails.
pub fn deallocate_shared_memory(id: i32) -> Result<(), i32> {
    // SAFETY:
    // `IPC_RMID` ignores the buffer argument.
    let rtn = unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
    match rtn {
        0i32 => Ok(()),
        _ => Err(errno()),
    }
}

/// Reads the kernel's description of shared memory `id`.
///
/// Returns `None` when no such segment exists (`EINVAL` or `EIDRM`).
///
/// # Errors
///
/// Returns any other `errno` `shmctl` fails with.
pub fn shared_memory_status(id: i32) -> Result<Option<libc::shmid_ds>, i32> {
    let mut description: MaybeUninit<libc::shmid_ds> = MaybeUninit::uninit();
    // SAFETY:
    // `description` is large enough to hold a `shmid_ds`.
    let rtn = unsafe { libc::shmctl(id, libc::IPC_STAT, description.as_mut_ptr()) };
    match rtn {
        0i32 => {
            // SAFETY:
            // `shmctl` succeeded so it filled `description`.
            Ok(Some(unsafe { description.assume_init() }))
        }
        _ => match errno() {
            libc::EINVAL | libc::EIDRM => Ok(None),
            err => Err(err),
        },
    }
}

/// Returns [`errno`](https://man7.org/linux/man-pages/man3/errno.3.html).
pub fn errno() -> i32 {
    // SAFETY:
    // Always safe.
    unsafe { *libc::__errno_location() }
}

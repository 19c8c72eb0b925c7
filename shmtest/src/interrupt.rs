use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{error, warn};
use shared_memory_segment::bindings;

/// Exit status after `SIGINT`.
pub const INTERRUPTED: i32 = 130;

/// Id of the segment to mark for destruction if we are interrupted.
///
/// Held across allocation and release, so the handler never sees a segment that exists but is
/// not tracked, nor a tracked segment that was already released.
static TRACKED: Mutex<Option<i32>> = Mutex::new(None);

fn lock() -> MutexGuard<'static, Option<i32>> {
    // The guarded value is a plain id, a panic while holding it cannot corrupt it.
    TRACKED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Installs the `SIGINT` handler.
///
/// On `ctrl-c` the tracked segment (if any) is marked for destruction, then the process exits
/// with [`INTERRUPTED`]. The kernel detaches the mapping when the process exits.
///
/// # Errors
///
/// When a handler is already installed or installing it fails.
pub fn install() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| {
        warn!("interrupted");
        match release_tracked() {
            Some(Ok(id)) => warn!("marked shmid {} for destruction", id),
            Some(Err(err)) => error!("{}", err),
            None => {}
        }
        std::process::exit(INTERRUPTED);
    })
}

/// Guard tracking a segment until released or dropped.
#[derive(Debug)]
#[must_use]
pub struct Tracked(i32);

/// Runs `allocate` and tracks the segment it returns, without letting an interrupt in between.
///
/// # Errors
///
/// When `allocate` fails, nothing is tracked.
pub fn track_with<T, E>(
    allocate: impl FnOnce() -> Result<T, E>,
    id: impl FnOnce(&T) -> i32,
) -> Result<(T, Tracked), E> {
    let mut tracked = lock();
    let segment = allocate()?;
    let id = id(&segment);
    *tracked = Some(id);
    Ok((segment, Tracked(id)))
}

impl Tracked {
    /// Runs `release` then stops tracking, without letting an interrupt in between.
    pub fn release_with<R>(self, release: impl FnOnce() -> R) -> R {
        let mut tracked = lock();
        let res = release();
        if *tracked == Some(self.0) {
            *tracked = None;
        }
        // Already untracked.
        std::mem::forget(self);
        res
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        let mut tracked = lock();
        // Only clear our own id.
        if *tracked == Some(self.0) {
            *tracked = None;
        }
    }
}

/// Currently tracked segment id.
pub fn tracked() -> Option<i32> {
    *lock()
}

/// Stops tracking and marks the tracked segment for destruction.
fn release_tracked() -> Option<Result<i32, shared_memory_segment::Error>> {
    let mut tracked = lock();
    let id = tracked.take()?;
    Some(
        bindings::deallocate_shared_memory(id)
            .map(|()| id)
            .map_err(|errno| shared_memory_segment::Error::Release { id, errno }),
    )
}

/// Serialises tests that read or write the tracked segment.
#[cfg(test)]
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use shared_memory_segment::{Permissions, Segment};

    use super::*;

    fn allocate() -> Result<Segment, shared_memory_segment::Error> {
        Segment::allocate(4096, Permissions::default())
    }

    #[test]
    fn track_untrack() {
        let _serial = serial();
        assert_eq!(tracked(), None);
        {
            let (_segment, _tracked) = track_with(allocate, Segment::id).unwrap();
            assert!(tracked().is_some());
        }
        assert_eq!(tracked(), None);
    }

    #[test]
    fn failed_allocation_is_not_tracked() {
        let _serial = serial();
        let res = track_with(|| Segment::allocate(0, Permissions::default()), Segment::id);
        assert!(res.is_err());
        assert_eq!(tracked(), None);
    }

    #[test]
    fn stale_guard_keeps_newer() {
        let _serial = serial();
        let first = Tracked(3);
        *lock() = Some(4);
        drop(first);
        assert_eq!(tracked(), Some(4));
        *lock() = None;
    }

    #[test]
    fn release() {
        let _serial = serial();
        let (segment, _tracked) = track_with(allocate, Segment::id).unwrap();
        let id = segment.id();
        let attachment = segment.attach().unwrap();

        assert_eq!(release_tracked().unwrap().unwrap(), id);
        assert_eq!(tracked(), None);
        assert!(release_tracked().is_none());
        assert!(shared_memory_segment::status(id).unwrap().unwrap().destroyed);

        attachment.detach().unwrap();
        assert_eq!(shared_memory_segment::status(id).unwrap(), None);
        // Dropping `segment` now only logs that the segment is already gone.
    }

    #[test]
    fn interrupt_during_allocation_releases() {
        let _serial = serial();
        let mut handler = None;
        let (segment, _tracked) = track_with(
            || {
                // Blocks until the segment is tracked.
                handler = Some(std::thread::spawn(release_tracked));
                allocate()
            },
            Segment::id,
        )
        .unwrap();
        let released = handler.unwrap().join().unwrap();
        assert_eq!(released.unwrap().unwrap(), segment.id());
        assert_eq!(shared_memory_segment::status(segment.id()).unwrap(), None);
    }

    #[test]
    fn interrupt_during_release_is_quiet() {
        let _serial = serial();
        let (segment, tracked) = track_with(allocate, Segment::id).unwrap();
        let id = segment.id();
        let mut handler = None;
        tracked
            .release_with(|| {
                // Blocks until the segment is released and untracked.
                handler = Some(std::thread::spawn(release_tracked));
                segment.release()
            })
            .unwrap();
        assert!(handler.unwrap().join().unwrap().is_none());
        assert_eq!(shared_memory_segment::status(id).unwrap(), None);
    }
}

//! Sleeping mutual exclusion.
use super::Semaphore;

/// A binary semaphore.
///
/// Unlike a [`SpinLock`], a mutex puts a contending thread to sleep, so it
/// may be held across blocking calls. It is not tied to its holder: any
/// thread may release it. Waits on a mutex cannot be interrupted.
///
/// [`SpinLock`]: super::SpinLock
#[derive(Debug)]
pub struct Mutex {
    sem: Semaphore,
}

impl Mutex {
    /// Creates a mutex, locked if `locked` is set.
    pub const fn new(locked: bool) -> Self {
        Self {
            sem: Semaphore::new(if locked { 0 } else { 1 }, false),
        }
    }

    /// Locks the mutex, sleeping until it is free.
    ///
    /// Returns false if the wait was given up because the calling thread
    /// is being terminated, or if the mutex is contended and the caller is
    /// not a kernel thread.
    #[track_caller]
    pub fn acquire(&self) -> bool {
        self.sem.acquire(1, 0).is_ok()
    }

    /// Locks the mutex if it is free.
    pub fn try_acquire(&self) -> bool {
        self.sem.try_acquire(1)
    }

    /// Unlocks the mutex.
    ///
    /// Unlocking a mutex that is not locked is ignored.
    pub fn release(&self) {
        if !self.is_locked() {
            log::warn!("Mutex {:p} released while unlocked.", self);
            return;
        }
        self.sem.release(1);
    }

    /// Whether the mutex is locked.
    pub fn is_locked(&self) -> bool {
        self.sem.value() <= 0
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new(false)
    }
}

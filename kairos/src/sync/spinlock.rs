//! SMP-supported spinlock.
//!
//! The implementing unicore spinlock uniprocessor is simple; it just requires
//! preventing thread preemption while holding a lock. By disabling preemption
//! of the lock-holding thread, other threads cannot access shared resource as
//! they can't be scheduled.
//!
//! However, when it comes to multiprocessor, disabling preemption is not
//! sufficient; as multiple threads run concurrently in different cores, they
//! can access shared resource at the same time even when a core disable
//! preemption. Therefore, to acquire a lock on multi-processor, a processor 1)
//! polls a variable that represents a value is locked or not 2) set the
//! variable when a thread holds the `lock`, and 3) unset the variable when the
//! thread `unlock`.
//!
//! The step 1 and 2 must be executed ATOMICALLY with the atomic
//! read-modify-write instructions of the CPU.
//!
//! ## Deadlock detection
//!
//! A processor that spins with its interrupts disabled cannot be preempted,
//! so some contended acquisitions can never succeed:
//!
//! - the holder is the spinning context itself and the acquisition is not
//!   recursive,
//! - the holder is another context of the *same* processor, which will never
//!   be dispatched again while this processor spins.
//!
//! Both are detected on the first failed attempt. Otherwise the spinner
//! consults the progress oracle of its [`Scheduler`] every
//! [`RawSpinlock::retry_limit`] attempts; if the oracle reports that the
//! holder cannot make progress, spinning is a deadlock as well. A deadlock
//! aborts the kernel with the acquisition sites of both parties.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler

use crate::{AbortReason, abort_kernel, scheduler::Scheduler};
use abyss::{cpu, interrupt::InterruptState};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use crossbeam_utils::{Backoff, CachePadded, atomic::AtomicCell};

/// Canary of a healthy lock.
const SPINLOCK_MAGIC: usize = 0xdeadbaba;

/// Failed attempts between two consultations of the progress oracle.
pub const DEFAULT_RETRY_LIMIT: usize = 1 << 20;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug, PartialEq, Eq)]
pub struct WouldBlock;

/// A busy-waiting lock that disables interrupts while it is held.
///
/// Unlike [`SpinLock`], a raw lock does not own any data and is acquired and
/// released explicitly. A raw lock can be handed over to the scheduler with
/// [`RawSpinlock::exit`], which is how a thread goes to sleep while still
/// owning the waiter list it just put itself on.
///
/// A recursive lock (the default) may be acquired again by its holder. It
/// is released when every acquisition has been matched by a release.
pub struct RawSpinlock {
    atom: CachePadded<AtomicBool>,
    magic: AtomicUsize,
    owner: AtomicUsize,
    owned_cpu: AtomicUsize,
    level: AtomicUsize,
    interrupts: AtomicBool,
    caller: AtomicCell<Option<&'static Location<'static>>>,
    recursive: bool,
    retry_limit: usize,
}

impl RawSpinlock {
    /// Creates a free, recursive lock.
    pub const fn new() -> Self {
        Self::with_retry_limit(true, DEFAULT_RETRY_LIMIT)
    }

    /// Creates a free lock that aborts when its holder acquires it again.
    pub const fn new_non_recursive() -> Self {
        Self::with_retry_limit(false, DEFAULT_RETRY_LIMIT)
    }

    /// Creates a free lock that consults the progress oracle every
    /// `retry_limit` failed attempts.
    pub const fn with_retry_limit(recursive: bool, retry_limit: usize) -> Self {
        Self {
            atom: CachePadded::new(AtomicBool::new(false)),
            magic: AtomicUsize::new(SPINLOCK_MAGIC),
            owner: AtomicUsize::new(0),
            owned_cpu: AtomicUsize::new(cpu::NO_CPU),
            level: AtomicUsize::new(0),
            interrupts: AtomicBool::new(false),
            caller: AtomicCell::new(None),
            recursive,
            retry_limit: if retry_limit == 0 { 1 } else { retry_limit },
        }
    }

    /// Failed attempts between two consultations of the progress oracle.
    pub fn retry_limit(&self) -> usize {
        self.retry_limit
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// Interrupts are disabled from this point until the matching
    /// [`release`]. Always returns `true`; an acquisition that can never
    /// succeed aborts the kernel instead of returning.
    ///
    /// [`release`]: Self::release
    #[track_caller]
    pub fn acquire(&self) -> bool {
        self.acquire_with(self.recursive)
    }

    /// Acquires the lock, allowing a recursive acquisition only if
    /// `recurse` is set.
    #[track_caller]
    pub fn acquire_with(&self, recurse: bool) -> bool {
        let caller = Location::caller();
        let interrupts = InterruptState::current() == InterruptState::On;
        unsafe { InterruptState::disable() };
        self.check_magic(caller);

        let me = cpu::context_token();
        let my_cpu = cpu::cpuid();
        if recurse && self.atom.load(Ordering::Acquire) && self.owner.load(Ordering::Acquire) == me
        {
            self.level.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let backoff = Backoff::new();
        let mut retries = 0;
        while self
            .atom
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            let owner = self.owner.load(Ordering::Relaxed);
            let owner_cpu = self.owned_cpu.load(Ordering::Relaxed);
            if owner == me {
                self.deadlock(caller, "acquired again by its holder");
            }
            if my_cpu != cpu::NO_CPU && owner_cpu == my_cpu {
                self.deadlock(caller, "held by a switched-out context of this processor");
            }
            retries += 1;
            if retries >= self.retry_limit {
                retries = 0;
                if !Scheduler::others_can_progress(owner_cpu) {
                    self.deadlock(caller, "held by a context that cannot make progress");
                }
            }
            self.check_magic(caller);
            backoff.snooze();
        }

        self.owner.store(me, Ordering::Relaxed);
        self.owned_cpu.store(my_cpu, Ordering::Relaxed);
        self.level.store(1, Ordering::Relaxed);
        self.interrupts.store(interrupts, Ordering::Relaxed);
        self.caller.store(Some(caller));
        true
    }

    /// Attempts to acquire the lock once.
    ///
    /// Interrupts are left untouched if the lock is not acquired.
    #[track_caller]
    pub fn try_acquire(&self) -> Result<(), WouldBlock> {
        let caller = Location::caller();
        let interrupts = InterruptState::current() == InterruptState::On;
        unsafe { InterruptState::disable() };
        self.check_magic(caller);

        let me = cpu::context_token();
        if self.atom.load(Ordering::Acquire) && self.owner.load(Ordering::Acquire) == me {
            if self.recursive {
                self.level.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        } else if self
            .atom
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(me, Ordering::Relaxed);
            self.owned_cpu.store(cpu::cpuid(), Ordering::Relaxed);
            self.level.store(1, Ordering::Relaxed);
            self.interrupts.store(interrupts, Ordering::Relaxed);
            self.caller.store(Some(caller));
            return Ok(());
        }
        unsafe { InterruptState::from(interrupts).restore() };
        Err(WouldBlock)
    }

    /// Releases one acquisition of the lock.
    ///
    /// Once the last acquisition is released, the interrupt state captured by
    /// the first one is restored.
    ///
    /// Releasing a lock that the caller does not hold, or releasing with the
    /// interrupts enabled, aborts the kernel.
    #[track_caller]
    pub fn release(&self) {
        if let Some(true) = self.exit_inner(Location::caller()) {
            unsafe { InterruptState::enable() };
        }
    }

    /// Releases one acquisition without restoring the interrupt state.
    ///
    /// Returns whether interrupts were enabled when the lock was first
    /// acquired. The scheduler uses this to release a lock on behalf of a
    /// thread that is being switched out, and to re-enable the interrupts
    /// once that thread is dispatched again.
    #[track_caller]
    pub fn exit(&self) -> bool {
        let interrupts = self.interrupts.load(Ordering::Relaxed);
        self.exit_inner(Location::caller());
        interrupts
    }

    /// Clears the ownership of the lock unconditionally and makes it free.
    ///
    /// Only for tearing down a context that can no longer release the lock
    /// itself. The interrupt state of the caller is left untouched.
    pub fn unwind(&self) {
        self.caller.store(None);
        self.level.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.owned_cpu.store(cpu::NO_CPU, Ordering::Relaxed);
        self.atom.store(false, Ordering::Release);
    }

    /// Whether the lock is held by anybody.
    pub fn acquired(&self) -> bool {
        self.atom.load(Ordering::Acquire)
    }

    /// Whether the lock is held by the calling context.
    pub fn held_by_current(&self) -> bool {
        self.acquired() && self.owner.load(Ordering::Acquire) == cpu::context_token()
    }

    /// The processor of the holder, if the lock is held by a context that
    /// runs on a processor.
    pub fn owner_cpu(&self) -> Option<usize> {
        match self.owned_cpu.load(Ordering::Relaxed) {
            cpu::NO_CPU => None,
            id => Some(id),
        }
    }

    /// Whether interrupts were enabled when the lock was acquired.
    pub fn interrupts(&self) -> bool {
        self.interrupts.load(Ordering::Relaxed)
    }

    /// Number of unmatched acquisitions.
    pub fn level(&self) -> usize {
        self.level.load(Ordering::Relaxed)
    }

    /// Releases one level; returns the interrupt state to restore if the
    /// lock became free.
    fn exit_inner(&self, caller: &'static Location<'static>) -> Option<bool> {
        if InterruptState::current() == InterruptState::On {
            abort_kernel(
                AbortReason::InterruptsEnabled,
                format_args!("spinlock {:p} released with interrupts enabled at {}", self, caller),
            );
        }
        self.check_magic(caller);
        if !self.atom.load(Ordering::Acquire)
            || self.owner.load(Ordering::Relaxed) != cpu::context_token()
        {
            abort_kernel(
                AbortReason::LockNotHeld,
                format_args!("spinlock {:p} released at {} by a context that does not hold it", self, caller),
            );
        }
        if self.level.fetch_sub(1, Ordering::Relaxed) > 1 {
            return None;
        }
        let interrupts = self.interrupts.load(Ordering::Relaxed);
        self.caller.store(None);
        self.owner.store(0, Ordering::Relaxed);
        self.owned_cpu.store(cpu::NO_CPU, Ordering::Relaxed);
        self.atom.store(false, Ordering::Release);
        Some(interrupts)
    }

    #[inline]
    fn check_magic(&self, caller: &'static Location<'static>) {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != SPINLOCK_MAGIC {
            abort_kernel(
                AbortReason::LockCorruption,
                format_args!(
                    "spinlock {:p} has magic {:#x} (expected {:#x}), accessed at {}",
                    self, magic, SPINLOCK_MAGIC, caller
                ),
            );
        }
    }

    #[cold]
    fn deadlock(&self, caller: &'static Location<'static>, why: &str) -> ! {
        match self.caller.load() {
            Some(holder) => abort_kernel(
                AbortReason::Deadlock,
                format_args!(
                    "spinlock {:p} {}: acquiring at {}, held since {}",
                    self, why, caller, holder
                ),
            ),
            None => abort_kernel(
                AbortReason::Deadlock,
                format_args!("spinlock {:p} {}: acquiring at {}", self, why, caller),
            ),
        }
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RawSpinlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawSpinlock")
            .field("acquired", &self.acquired())
            .field("level", &self.level())
            .field("owner_cpu", &self.owner_cpu())
            .field("caller", &self.caller.load())
            .finish()
    }
}

/// A mutual exclusion primitive useful for protecting shared data
///
/// This spinlock will block threads waiting for the lock to become available.
/// The spinlock can be created via a [`new`] constructor. Each spinlock has a
/// type parameter which represents the data that it is protecting. The data can
/// only be accessed through the guards returned from [`lock`] and
/// [`try_lock`], which guarantees that the data is only ever accessed when the
/// spinlock is locked.
///
/// The lock underneath is a non-recursive [`RawSpinlock`], so the holder
/// locking it again is detected as a deadlock instead of handing out a
/// second mutable reference.
///
/// [`new`]: Self::new
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```ignore
/// use alloc::sync::Arc;
/// use kairos::sync::SpinLock;
/// use kairos::thread::ThreadBuilder;
///
/// let data = Arc::new(SpinLock::new(0));
///
/// for _ in 0..10 {
///     let data = Arc::clone(&data);
///     ThreadBuilder::new("work").spawn(move || {
///         let mut data = data.lock();
///         *data += 1;
///         data.unlock();
///         0
///     });
/// }
/// ```
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinlock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            raw: RawSpinlock::new_non_recursive(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, blocking the current thread until it is able to
    /// do so.
    ///
    /// This function will block the local thread until it is available to
    /// acquire the spinlock. Upon returning, the thread is the only thread
    /// with the lock held. A guard is returned to allow scoped unlock of the
    /// lock. When the guard is dropped or [`SpinLockGuard::unlock`] is
    /// called, the lock is released.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// # Errors
    ///
    /// If the spinlock could not be acquired at this time, then [`WouldBlock`]
    /// is returned.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        self.raw.try_acquire().map(|_| SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// The lock underneath.
    pub fn raw(&self) -> &RawSpinlock {
        &self.raw
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a spinlock.
///
/// The data protected by the spinlock can be accessed through this guard via
/// its [`Deref`] and [`DerefMut`] implementations. The lock is released when
/// the guard is dropped.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`SpinLock`].
///
/// [`lock`]: SpinLock::lock
/// [`try_lock`]: SpinLock::try_lock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// Releases the lock.
    pub fn unlock(self) {
        drop(self)
    }

    /// Gives up the guard but keeps the lock held.
    ///
    /// Returns the lock underneath, which must be released by the caller,
    /// usually by handing it to [`PerProcessorScheduler::sleep`].
    ///
    /// [`PerProcessorScheduler::sleep`]: crate::scheduler::PerProcessorScheduler::sleep
    pub fn into_raw(self) -> &'a RawSpinlock {
        let raw = &self.lock.raw;
        core::mem::forget(self);
        raw
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lock_is_not_owned() {
        let lock = RawSpinlock::new();
        assert!(!lock.acquired());
        assert!(!lock.held_by_current());
        assert_eq!(lock.owner_cpu(), None);
        assert_eq!(lock.level(), 0);
    }

    #[test]
    fn nesting() {
        unsafe { InterruptState::enable() };
        let lock = RawSpinlock::new();
        for _ in 0..3 {
            assert!(lock.acquire());
        }
        assert_eq!(lock.level(), 3);
        assert!(lock.interrupts());
        lock.release();
        lock.release();
        assert!(lock.acquired());
        assert_eq!(InterruptState::current(), InterruptState::Off);
        lock.release();
        assert!(!lock.acquired());
        assert_eq!(InterruptState::current(), InterruptState::On);
    }

    #[test]
    fn exit_keeps_interrupts_disabled() {
        unsafe { InterruptState::enable() };
        let lock = RawSpinlock::new();
        lock.acquire();
        assert!(lock.exit());
        assert!(!lock.acquired());
        assert_eq!(InterruptState::current(), InterruptState::Off);
        unsafe { InterruptState::enable() };
    }

    #[test]
    fn unwind_frees_the_lock() {
        let lock = RawSpinlock::new();
        lock.acquire();
        lock.acquire();
        lock.unwind();
        assert!(!lock.acquired());
        assert_eq!(lock.level(), 0);
        assert!(lock.try_acquire().is_ok());
        lock.release();
    }

    #[test]
    fn try_lock_would_block() {
        let lock = SpinLock::new(5);
        let guard = lock.lock();
        let other = std::thread::scope(|s| s.spawn(|| lock.try_lock().is_err()).join().unwrap());
        assert!(other);
        guard.unlock();
        assert_eq!(*lock.try_lock().unwrap(), 5);
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn non_recursive_reacquire_aborts() {
        let lock = SpinLock::new(());
        let _guard = lock.lock();
        let _again = lock.lock();
    }

    #[test]
    #[should_panic(expected = "lock not held")]
    fn release_of_free_lock_aborts() {
        RawSpinlock::new().release();
    }

    #[test]
    #[should_panic(expected = "lock corrupted")]
    fn corrupted_lock_aborts() {
        let lock = RawSpinlock::new();
        lock.magic.store(0x1234, Ordering::Relaxed);
        lock.acquire();
    }
}

//! Counting semaphore.
//!
//! A semaphore holds a number of permits. [`Semaphore::acquire`] takes
//! permits, sleeping until enough of them are released, and
//! [`Semaphore::release`] hands permits back and wakes the waiters in arrival
//! order.
use super::{SpinLock, WaitError};
use crate::{
    AbortReason, abort_kernel,
    thread::{Current, DebugState, Thread, ThreadFlags, UnwindState},
};
use abyss::timer;
use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

const SEMAPHORE_MAGIC: usize = 0x5e3a_9407;

/// Attempts made without queueing before a thread goes to sleep.
const SPIN_ATTEMPTS: usize = 10;

/// A counting semaphore with a FIFO sleep queue.
pub struct Semaphore {
    magic: AtomicUsize,
    counter: AtomicIsize,
    waiters: SpinLock<VecDeque<Arc<Thread>>>,
    can_interrupt: bool,
}

impl Semaphore {
    /// Creates a semaphore with `initial` permits.
    ///
    /// An interruptible semaphore gives up a wait when the waiting thread is
    /// interrupted.
    pub const fn new(initial: isize, can_interrupt: bool) -> Self {
        Self {
            magic: AtomicUsize::new(SEMAPHORE_MAGIC),
            counter: AtomicIsize::new(initial),
            waiters: SpinLock::new(VecDeque::new()),
            can_interrupt,
        }
    }

    /// Number of available permits.
    pub fn value(&self) -> isize {
        self.counter.load(Ordering::Acquire)
    }

    /// Takes `n` permits if they are available right now.
    ///
    /// More than `isize::MAX` permits can never be available.
    pub fn try_acquire(&self, n: usize) -> bool {
        self.check_magic();
        let Ok(n) = isize::try_from(n) else {
            return false;
        };
        let mut value = self.counter.load(Ordering::Acquire);
        loop {
            if value < n {
                return false;
            }
            match self.counter.compare_exchange_weak(
                value,
                value - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => value = actual,
            }
        }
    }

    /// Takes `n` permits, sleeping until they are available.
    ///
    /// `timeout_ns` of 0 waits forever.
    ///
    /// # Errors
    /// - [`WaitError::TimedOut`] if the timeout expired.
    /// - [`WaitError::Interrupted`] if the semaphore is interruptible and
    ///   the thread was interrupted.
    /// - [`WaitError::ThreadTerminating`] if the thread is asked to unwind.
    /// - [`WaitError::NoThread`] if the permits are not available and the
    ///   caller is not a kernel thread.
    #[track_caller]
    pub fn acquire(&self, n: usize, timeout_ns: u64) -> Result<(), WaitError> {
        for _ in 0..SPIN_ATTEMPTS {
            if self.try_acquire(n) {
                return Ok(());
            }
            core::hint::spin_loop();
        }

        let current = Current::get().ok_or(WaitError::NoThread)?;
        let processor = current.processor().ok_or(WaitError::NoThread)?;
        let expired = Arc::new(AtomicBool::new(false));
        let alarm = (timeout_ns != 0).then(|| {
            let expired = expired.clone();
            let th = current.clone();
            timer::arm(timeout_ns, move || {
                expired.store(true, Ordering::Release);
                th.interrupt();
            })
        });

        let mut slept = false;
        let result = loop {
            let mut waiters = self.waiters.lock();
            let queued = waiters.iter().position(|th| Arc::ptr_eq(th, &current));
            if self.try_acquire(n) {
                if let Some(i) = queued {
                    waiters.remove(i);
                }
                waiters.unlock();
                break Ok(());
            }
            if let Some(e) = self.cancellation(&current, &expired) {
                match queued {
                    Some(i) => {
                        waiters.remove(i);
                    }
                    // A releaser dequeued us; pass its wakeup on.
                    None if slept => {
                        if let Some(next) = waiters.pop_front() {
                            next.wake();
                        }
                    }
                    None => (),
                }
                waiters.unlock();
                break Err(e);
            }
            if queued.is_none() {
                waiters.push_back(current.clone());
            }
            current.set_debug_state(DebugState::SemWait);
            processor.sleep(Some(waiters.into_raw()));
            current.set_debug_state(DebugState::None);
            slept = true;
        };

        if let Some(alarm) = alarm {
            timer::cancel(alarm);
            if expired.load(Ordering::Acquire) {
                current.take_flags(ThreadFlags::INTERRUPTED | ThreadFlags::WAKE_PENDING);
            }
        }
        result
    }

    /// Hands `n` permits back and wakes up to `n` waiters.
    ///
    /// The count saturates at `isize::MAX`.
    pub fn release(&self, n: usize) {
        self.check_magic();
        let added = isize::try_from(n).unwrap_or(isize::MAX);
        let mut waiters = self.waiters.lock();
        let _ = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                Some(value.saturating_add(added))
            });
        for _ in 0..n {
            match waiters.pop_front() {
                Some(th) => {
                    th.wake();
                }
                None => break,
            }
        }
        waiters.unlock();
    }

    fn cancellation(&self, th: &Thread, expired: &AtomicBool) -> Option<WaitError> {
        if expired.load(Ordering::Acquire) {
            Some(WaitError::TimedOut)
        } else if th.unwind_state() != UnwindState::Continue {
            Some(WaitError::ThreadTerminating)
        } else if self.can_interrupt && th.take_interrupted() {
            Some(WaitError::Interrupted)
        } else {
            None
        }
    }

    #[inline]
    fn check_magic(&self) {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != SEMAPHORE_MAGIC {
            abort_kernel(
                AbortReason::LockCorruption,
                format_args!(
                    "semaphore {:p} has magic {:#x} (expected {:#x})",
                    self, magic, SEMAPHORE_MAGIC
                ),
            );
        }
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &self.value())
            .field("can_interrupt", &self.can_interrupt)
            .finish()
    }
}

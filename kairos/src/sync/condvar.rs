//! Condition variable.
//!
//! A condition variable lets a thread that holds a [`Mutex`] wait for an
//! event: [`ConditionVariable::wait`] releases the mutex and sleeps until
//! another thread calls [`ConditionVariable::signal`] or
//! [`ConditionVariable::broadcast`], then takes the mutex back.
//!
//! The waiter is queued before the mutex is released, and the waiter list is
//! only unlocked once the waiter sleeps, so a signal can never slip in
//! between the two and get lost.
//!
//! ```ignore
//! let lock = Mutex::new(false);
//! let cond = ConditionVariable::new();
//!
//! lock.acquire();
//! while !ready() {
//!     cond.wait(&lock, 0)?;
//! }
//! lock.release();
//! ```
use super::{Mutex, SpinLock, WaitError};
use crate::thread::{Current, DebugState, Thread, ThreadFlags, UnwindState};
use abyss::timer;
use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicBool, Ordering};

/// A FIFO condition variable.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<VecDeque<Arc<Thread>>>,
}

impl ConditionVariable {
    /// Creates a condition variable without waiters.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Releases `mutex` and sleeps until signalled, then locks `mutex`
    /// again.
    ///
    /// With `timeout_ns` of 0 the wait has no timeout, and any wakeup ends
    /// it successfully. Otherwise the wait only succeeds once a signal
    /// picked this thread; a signal that races with the timeout wins.
    ///
    /// # Errors
    /// - [`WaitError::MutexNotLocked`] if `mutex` is not locked. Nothing
    ///   else happens.
    /// - [`WaitError::TimedOut`], [`WaitError::ThreadTerminating`] or
    ///   [`WaitError::Interrupted`], in this order of precedence, if the
    ///   timed wait was cut short. `mutex` is not held in that case.
    /// - [`WaitError::MutexNotAcquired`] if `mutex` could not be locked
    ///   again.
    /// - [`WaitError::NoThread`] if the caller is not a kernel thread.
    #[track_caller]
    pub fn wait(&self, mutex: &Mutex, timeout_ns: u64) -> Result<(), WaitError> {
        if !mutex.is_locked() {
            log::warn!("Condition variable {:p} waited on with an unlocked mutex.", self);
            return Err(WaitError::MutexNotLocked);
        }
        let current = Current::get().ok_or(WaitError::NoThread)?;
        let processor = current.processor().ok_or(WaitError::NoThread)?;
        let expired = Arc::new(AtomicBool::new(false));

        let mut waiters = self.waiters.lock();
        waiters.push_back(current.clone());
        let alarm = (timeout_ns != 0).then(|| {
            let expired = expired.clone();
            let th = current.clone();
            timer::arm(timeout_ns, move || {
                expired.store(true, Ordering::Release);
                th.interrupt();
            })
        });
        mutex.release();
        current.set_debug_state(DebugState::CondWait);
        processor.sleep(Some(waiters.into_raw()));

        while timeout_ns != 0
            && !expired.load(Ordering::Acquire)
            && !current.was_interrupted()
            && current.unwind_state() == UnwindState::Continue
        {
            let waiters = self.waiters.lock();
            if !waiters.iter().any(|th| Arc::ptr_eq(th, &current)) {
                waiters.unlock();
                break;
            }
            // Woken without a signal; keep our place in the queue.
            processor.sleep(Some(waiters.into_raw()));
        }
        current.set_debug_state(DebugState::None);

        if let Some(alarm) = alarm {
            timer::cancel(alarm);
        }
        let expired = expired.load(Ordering::Acquire);
        current.take_interrupted();
        if expired {
            current.take_flags(ThreadFlags::WAKE_PENDING);
        }
        let mut waiters = self.waiters.lock();
        let signalled = match waiters.iter().position(|th| Arc::ptr_eq(th, &current)) {
            Some(i) => {
                waiters.remove(i);
                false
            }
            None => true,
        };
        waiters.unlock();

        if timeout_ns != 0 && !signalled {
            return Err(if expired {
                WaitError::TimedOut
            } else if current.unwind_state() != UnwindState::Continue {
                WaitError::ThreadTerminating
            } else {
                WaitError::Interrupted
            });
        }
        if mutex.acquire() {
            Ok(())
        } else {
            Err(WaitError::MutexNotAcquired)
        }
    }

    /// Wakes the thread that has waited longest, if any.
    pub fn signal(&self) {
        let mut waiters = self.waiters.lock();
        if let Some(th) = waiters.pop_front() {
            th.wake();
        }
        waiters.unlock();
    }

    /// Wakes every waiting thread.
    pub fn broadcast(&self) {
        let mut waiters = self.waiters.lock();
        for th in waiters.drain(..) {
            th.wake();
        }
        waiters.unlock();
    }

    /// Number of waiting threads.
    pub fn waiters(&self) -> usize {
        let waiters = self.waiters.lock();
        let count = waiters.len();
        waiters.unlock();
        count
    }
}

impl Drop for ConditionVariable {
    fn drop(&mut self) {
        self.broadcast();
    }
}

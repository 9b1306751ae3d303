//! Synchronization primitives.
//!
//! - [`RawSpinlock`] and [`SpinLock`]: busy-waiting locks for short critical
//!   sections. They disable interrupts while held and may be taken from any
//!   context, including alarm callbacks.
//! - [`Semaphore`] and [`Mutex`]: sleeping locks. The waiting thread is
//!   descheduled until a permit is released.
//! - [`ConditionVariable`]: waits for an event while releasing a [`Mutex`].
//!
//! Every sleeping wait reports its outcome as a [`WaitError`].
pub mod condvar;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;

pub use condvar::ConditionVariable;
pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use spinlock::{RawSpinlock, SpinLock, SpinLockGuard, WouldBlock};

use crate::KernelError;

/// Why a sleeping wait ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The mutex handed to [`ConditionVariable::wait`] was not locked.
    MutexNotLocked,
    /// The timeout expired.
    TimedOut,
    /// The thread was interrupted.
    Interrupted,
    /// The thread is being terminated.
    ThreadTerminating,
    /// The mutex could not be taken back after a successful wait.
    MutexNotAcquired,
    /// The caller is not a kernel thread.
    NoThread,
}

impl From<WaitError> for KernelError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::MutexNotLocked => KernelError::InvalidArgument,
            WaitError::TimedOut => KernelError::TimedOut,
            WaitError::Interrupted => KernelError::Interrupted,
            WaitError::ThreadTerminating => KernelError::ThreadTerminating,
            WaitError::MutexNotAcquired => KernelError::Busy,
            WaitError::NoThread => KernelError::OperationNotPermitted,
        }
    }
}

impl core::fmt::Display for WaitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            WaitError::MutexNotLocked => "mutex not locked",
            WaitError::TimedOut => "timed out",
            WaitError::Interrupted => "interrupted",
            WaitError::ThreadTerminating => "thread terminating",
            WaitError::MutexNotAcquired => "mutex not acquired",
            WaitError::NoThread => "not a kernel thread",
        })
    }
}

//! Kernel abort.
//!
//! An invariant violation in the scheduling core cannot be recovered from:
//! the state that would be needed to recover is exactly the state that is
//! broken. Every such violation ends up in [`abort_kernel`], which reports
//! the reason and halts.
use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

/// Why the kernel stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The canary of a lock or semaphore was overwritten.
    LockCorruption,
    /// A lock can never be acquired.
    Deadlock,
    /// A lock was released by a context that does not hold it.
    LockNotHeld,
    /// A lock was released while interrupts were enabled.
    InterruptsEnabled,
    /// A thread is not known to the scheduler.
    SchedulerLookup,
    /// A thread status change that must never happen.
    InvalidTransition,
    /// A processor has nothing to run, not even its idle thread.
    NoIdleThread,
    /// Scheduling was requested outside of any kernel thread.
    NoCurrentThread,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AbortReason::LockCorruption => "lock corrupted",
            AbortReason::Deadlock => "deadlock",
            AbortReason::LockNotHeld => "lock not held",
            AbortReason::InterruptsEnabled => "interrupts enabled",
            AbortReason::SchedulerLookup => "scheduler lookup failed",
            AbortReason::InvalidTransition => "invalid thread transition",
            AbortReason::NoIdleThread => "no idle thread",
            AbortReason::NoCurrentThread => "no current thread",
        })
    }
}

/// Number of aborts so far.
///
/// Used for determining double aborts.
pub static ABORT_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Stops the kernel because of `reason`.
///
/// The diagnostic is written to the kernel log before halting. On the hosted
/// machine halting is a panic of the calling context, which makes an abort
/// observable from a test.
#[cold]
#[inline(never)]
#[track_caller]
pub fn abort_kernel(reason: AbortReason, context: fmt::Arguments<'_>) -> ! {
    let depth = ABORT_DEPTH.fetch_add(1, Ordering::SeqCst);
    let cpu = abyss::cpu::cpuid();
    if cpu == abyss::cpu::NO_CPU {
        log::error!("Kernel aborted ({}): {}", reason, context);
    } else {
        log::error!("Kernel aborted on CPU {} ({}): {}", cpu, reason, context);
    }
    if depth > 0 {
        log::error!("The kernel had already aborted {} time(s).", depth);
    }
    panic!("kernel abort: {}: {}", reason, context)
}

//! Time.
use crate::thread::{Current, ThreadFlags};
use abyss::timer;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

/// Monotonic nanoseconds since an arbitrary point.
pub fn now_ns() -> u64 {
    timer::now_ns()
}

/// Sleeps the current thread for at least `ns` nanoseconds.
///
/// The sleep is not interruptible. Outside of a kernel thread this does
/// nothing.
pub fn delay(ns: u64) {
    let Some(current) = Current::get() else {
        return;
    };
    let Some(processor) = current.processor() else {
        return;
    };
    if ns == 0 {
        processor.schedule(crate::thread::ThreadStatus::Ready, None, None);
        return;
    }

    let fired = Arc::new(AtomicBool::new(false));
    let alarm = {
        let fired = fired.clone();
        let th = current.clone();
        timer::arm(ns, move || {
            fired.store(true, Ordering::Release);
            th.unblock();
        })
    };
    while !fired.load(Ordering::Acquire) {
        processor.sleep(None);
    }
    timer::cancel(alarm);
    current.take_flags(ThreadFlags::WAKE_PENDING);
}

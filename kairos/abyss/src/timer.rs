//! One-shot alarms.
//!
//! An alarm runs its callback once after the requested delay, outside of any
//! processor. Callbacks must not sleep.
use crate::{Machine, Platform};

pub use crate::hosted::timer::{AlarmHandle, arm, cancel};

/// Monotonic nanoseconds since an arbitrary point.
#[inline]
pub fn now_ns() -> u64 {
    Machine::now_ns()
}

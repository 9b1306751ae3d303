use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

/// Wakes a halted processor.
///
/// An idle processor halts on its doorbell until somebody rings it or the
/// halt times out, which stands in for the wakeup interrupt of a real
/// machine. A ring that arrives before the halt is remembered.
pub struct Doorbell {
    rung: Mutex<bool>,
    cv: Condvar,
}

impl Doorbell {
    /// Creates a silent doorbell.
    pub const fn new() -> Self {
        Self {
            rung: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Rings the doorbell.
    pub fn ring(&self) {
        let mut rung = self.rung.lock().unwrap_or_else(PoisonError::into_inner);
        *rung = true;
        self.cv.notify_all();
    }

    /// Halts until the doorbell rings or `timeout_ns` elapses.
    ///
    /// Returns whether the doorbell was rung.
    pub fn wait(&self, timeout_ns: u64) -> bool {
        let rung = self.rung.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut rung, _) = self
            .cv
            .wait_timeout_while(rung, Duration::from_nanos(timeout_ns), |rung| !*rung)
            .unwrap_or_else(PoisonError::into_inner);
        core::mem::replace(&mut *rung, false)
    }
}

impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}

//! Placement of new threads.
use crate::thread::Thread;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Chooses the processor of a thread that has no affinity.
pub trait CoreAllocator: Send + Sync {
    /// Returns a processor in `0..cpus` for `th`.
    fn allocate(&self, th: &Thread, cpus: usize) -> usize;
}

/// Hands processors out in turn.
#[derive(Default)]
pub struct RoundRobinCoreAllocator {
    next: AtomicUsize,
}

impl RoundRobinCoreAllocator {
    /// Starts with processor 0.
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }
}

impl CoreAllocator for RoundRobinCoreAllocator {
    fn allocate(&self, _th: &Thread, cpus: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % cpus.max(1)
    }
}

//! Processor identity and per-context slots.
use crate::{Machine, Platform};
use alloc::sync::Arc;
use core::any::Any;

pub use crate::hosted::doorbell::Doorbell;

/// Processor id of a context that is not bound to any processor.
pub const NO_CPU: usize = usize::MAX;

/// Get current cpu id.
#[inline]
pub fn cpuid() -> usize {
    Machine::cpuid()
}

/// Binds the calling context to processor `id`.
#[inline]
pub fn set_cpuid(id: usize) {
    Machine::set_cpuid(id)
}

/// A non-zero token that identifies the calling context.
#[inline]
pub fn context_token() -> usize {
    Machine::context_token()
}

/// The object installed in the current-thread slot of the calling context.
#[inline]
pub fn current() -> Option<Arc<dyn Any + Send + Sync>> {
    Machine::current()
}

/// Installs `current` in the current-thread slot of the calling context.
#[inline]
pub fn set_current(current: Option<Arc<dyn Any + Send + Sync>>) {
    Machine::set_current(current)
}

/// Busy-wait hint.
#[inline]
pub fn relax() {
    Machine::relax()
}

//! Interrupt
use crate::{Machine, Platform};
use core::{marker::PhantomData, sync::atomic::Ordering};

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state.
    ///
    /// # Returns
    /// - [`InterruptState::On`] if interrupts are enabled.
    /// - [`InterruptState::Off`] if interrupts are disabled.
    pub fn current() -> Self {
        if Machine::interrupts_enabled() {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Enables the interrupts of the calling context.
    pub unsafe fn enable() {
        core::sync::atomic::fence(Ordering::SeqCst);
        Machine::set_interrupts(true);
    }

    /// Disables the interrupts of the calling context.
    pub unsafe fn disable() {
        Machine::set_interrupts(false);
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    /// Restores a previously captured state.
    pub unsafe fn restore(self) {
        match self {
            Self::On => unsafe { Self::enable() },
            Self::Off => unsafe { Self::disable() },
        }
    }
}

impl From<bool> for InterruptState {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the guard was
/// created.
///
/// **Important:**
/// - [`InterruptGuard`] instances **must be dropped in reverse order of their
///   creation** to prevent unintended interrupt state changes.
/// - Due to Rust's ownership and scoping rules, this invariant is naturally
///   upheld unless `drop()` is explicitly called prematurely or an
///   [`InterruptGuard`] is stored in a struct field.
///
/// This structure is created using [`InterruptGuard::new`].
pub struct InterruptGuard {
    saved: InterruptState,
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    ///
    /// # Example
    /// ```ignore
    /// let _guard = InterruptGuard::new(); // Disables interrupts
    /// // Critical section...
    /// // Interrupts are restored when `_guard` goes out of scope.
    /// ```
    pub fn new() -> Self {
        let saved = InterruptState::current();
        unsafe { InterruptState::disable() };
        Self {
            saved,
            _not_send: PhantomData,
        }
    }

    /// The state that will be restored when this guard is dropped.
    pub fn saved(&self) -> InterruptState {
        self.saved
    }

    /// Forgets the guard without restoring the saved state.
    pub fn consume(self) -> InterruptState {
        let saved = self.saved;
        core::mem::forget(self);
        saved
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        unsafe { self.saved.restore() };
    }
}

//! The abyss of the kernel that operates the machine.
//!
//! This crate is the collection of machine communications that the scheduling
//! core of [`kairos`] consumes: the interrupt flag, the identity of the
//! running processor and context, the one-shot alarm, and the context switch.
//!
//! Every backend implements the same surface through the [`Platform`] trait
//! and the modules of this crate. The backend is chosen when the crate is
//! built:
//!
//! - `hosted`: every kernel context is a thread of the host operating system.
//!   A context only runs while it holds its *baton*, and a virtual processor
//!   hands exactly one baton at a time. This lets the whole kernel core run
//!   under `cargo test`.
//!
//! You are **not** required to understand every line of code in this crate.
//! See the [`kairos`] crate for the modules that are supposed to be used.
//!
//! [`kairos`]: ../kairos/index.html
#![cfg_attr(not(feature = "hosted"), no_std)]
#![allow(clippy::missing_safety_doc)]

#[cfg(not(feature = "hosted"))]
compile_error!("abyss needs a machine backend; enable the `hosted` feature.");

use core::sync::atomic::AtomicBool;

extern crate alloc;

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod context;
pub mod cpu;
pub mod interrupt;
pub mod timer;

#[cfg(feature = "hosted")]
mod hosted;

/// Maximum number of CPU the kernel can support.
pub const MAX_CPU: usize = 4;

#[doc(hidden)]
pub static QUITE: AtomicBool = AtomicBool::new(false);

/// The primitive operations a machine backend provides.
///
/// Every method acts on the *calling* execution context. Higher level
/// facilities such as [`context`] and [`timer`] are built on top of these
/// by each backend.
pub trait Platform {
    /// Whether the interrupts are enabled on the calling context.
    fn interrupts_enabled() -> bool;

    /// Enables or disables the interrupts of the calling context.
    fn set_interrupts(on: bool);

    /// Identifier of the processor the calling context runs on, or
    /// [`cpu::NO_CPU`] if it does not run on any.
    fn cpuid() -> usize;

    /// Binds the calling context to a processor.
    fn set_cpuid(id: usize);

    /// A non-zero token that uniquely identifies the calling context.
    fn context_token() -> usize;

    /// The current-thread slot of the calling context.
    fn current() -> Option<alloc::sync::Arc<dyn core::any::Any + Send + Sync>>;

    /// Replaces the current-thread slot of the calling context.
    fn set_current(current: Option<alloc::sync::Arc<dyn core::any::Any + Send + Sync>>);

    /// Hint for busy-wait loops.
    fn relax();

    /// Monotonic nanoseconds since an arbitrary point.
    fn now_ns() -> u64;

    /// Writes to the machine console.
    fn write_console(args: core::fmt::Arguments<'_>);
}

/// The machine backend selected at build time.
#[cfg(feature = "hosted")]
pub type Machine = hosted::Hosted;

//! Hosted backend.
//!
//! Each kernel context is a thread of the host. The per-context machine
//! state (interrupt flag, processor binding, current-thread slot) lives in
//! host thread-locals, so it travels with the context across switches
//! exactly like a saved register file would.
use crate::{Platform, cpu::NO_CPU};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    io::Write,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

pub mod context;
pub mod doorbell;
pub mod timer;

thread_local! {
    static INTERRUPTS: Cell<bool> = const { Cell::new(false) };
    static CPUID: Cell<usize> = const { Cell::new(NO_CPU) };
    static TOKEN: Cell<usize> = const { Cell::new(0) };
    static CURRENT: RefCell<Option<Arc<dyn Any + Send + Sync>>> = const { RefCell::new(None) };
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// The hosted machine.
pub struct Hosted;

impl Platform for Hosted {
    fn interrupts_enabled() -> bool {
        INTERRUPTS.try_with(Cell::get).unwrap_or(false)
    }

    fn set_interrupts(on: bool) {
        let _ = INTERRUPTS.try_with(|c| c.set(on));
    }

    fn cpuid() -> usize {
        CPUID.try_with(Cell::get).unwrap_or(NO_CPU)
    }

    fn set_cpuid(id: usize) {
        let _ = CPUID.try_with(|c| c.set(id));
    }

    fn context_token() -> usize {
        TOKEN
            .try_with(|t| {
                if t.get() == 0 {
                    t.set(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
                }
                t.get()
            })
            // A context being torn down still needs a stable identity.
            .unwrap_or(usize::MAX)
    }

    fn current() -> Option<Arc<dyn Any + Send + Sync>> {
        CURRENT.try_with(|c| c.borrow().clone()).ok().flatten()
    }

    fn set_current(current: Option<Arc<dyn Any + Send + Sync>>) {
        let old = CURRENT.try_with(|c| c.replace(current));
        drop(old);
    }

    fn relax() {
        std::thread::yield_now();
    }

    fn now_ns() -> u64 {
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }

    fn write_console(args: core::fmt::Arguments<'_>) {
        let _ = std::io::stderr().lock().write_fmt(args);
    }
}

use crate::{
    Machine, Platform,
    cpu::NO_CPU,
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, PoisonError},
};

/// Smallest host stack handed to a context. Host frames are much larger than
/// the frames of a freestanding kernel.
const MIN_HOST_STACK: usize = 256 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Baton {
    /// No processor is pending for this context.
    Parked,
    /// A processor has been handed over but not yet picked up.
    Granted(usize),
    /// The context will never run again.
    Retired,
}

/// Saved execution state of a kernel thread.
pub struct Context {
    baton: Mutex<Baton>,
    cv: Condvar,
}

/// Unwinding payload that ends a context without saving it.
pub struct ContextExit;

/// The host refused to create a context.
#[derive(Debug)]
pub struct SpawnError;

impl Context {
    /// Creates a context that has no processor.
    ///
    /// The context of the code that is already running (e.g. the boot
    /// context) is created the same way: a running context simply has no
    /// pending grant.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            baton: Mutex::new(Baton::Parked),
            cv: Condvar::new(),
        })
    }

    /// Hands processor `cpu` over to this context.
    pub fn resume(&self, cpu: usize) {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        if *baton != Baton::Retired {
            *baton = Baton::Granted(cpu);
            self.cv.notify_all();
        }
    }

    /// Makes the context never run again.
    pub fn retire(&self) {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        *baton = Baton::Retired;
        self.cv.notify_all();
    }

    /// Whether [`Context::retire`] was called.
    pub fn is_retired(&self) -> bool {
        *self.baton.lock().unwrap_or_else(PoisonError::into_inner) == Baton::Retired
    }

    /// Suspends the calling context until a processor is handed to it.
    ///
    /// Returns false if the context was retired instead.
    fn park(&self) -> bool {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match *baton {
                Baton::Parked => {
                    baton = self.cv.wait(baton).unwrap_or_else(PoisonError::into_inner);
                }
                Baton::Granted(cpu) => {
                    *baton = Baton::Parked;
                    Machine::set_cpuid(cpu);
                    return true;
                }
                Baton::Retired => return false,
            }
        }
    }
}

/// Switches the processor of the calling context, `from`, to `to`.
///
/// Returns when a processor is handed back to `from`, or false if `from` was
/// retired while it was switched out.
pub fn switch(from: &Context, to: &Context) -> bool {
    to.resume(Machine::cpuid());
    from.park()
}

/// Hands the processor over to `to` and ends the calling context.
///
/// The stack of the calling context is unwound with [`ContextExit`], which the
/// entry frame installed by [`spawn`] swallows.
pub fn exit_to(to: &Context) -> ! {
    to.resume(Machine::cpuid());
    Machine::set_cpuid(NO_CPU);
    panic::resume_unwind(Box::new(ContextExit))
}

/// Ends the calling context after it was retired.
///
/// Used when [`switch`] returns false: the calling context owns no
/// processor, so nothing is handed over.
pub fn abandon() -> ! {
    Machine::set_cpuid(NO_CPU);
    panic::resume_unwind(Box::new(ContextExit))
}

/// Creates the host side of `ctx`.
///
/// The new context does not run until a processor is handed to it. `entry`
/// then runs to completion or until [`exit_to`]; if it panics for another
/// reason, `on_abort` receives the payload on the same context.
pub fn spawn(
    ctx: Arc<Context>,
    name: &str,
    stack_size: usize,
    entry: Box<dyn FnOnce() + Send>,
    on_abort: Box<dyn FnOnce(Box<dyn Any + Send>) + Send>,
) -> Result<(), SpawnError> {
    std::thread::Builder::new()
        .name(name.into())
        .stack_size(stack_size.max(MIN_HOST_STACK))
        .spawn(move || {
            if !ctx.park() {
                return;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                if !payload.is::<ContextExit>() {
                    let _ = panic::catch_unwind(AssertUnwindSafe(move || on_abort(payload)));
                }
            }
        })
        .map(|_| ())
        .map_err(|_| SpawnError)
}

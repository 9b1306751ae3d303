//! Dispatching on one processor.
use super::SchedulingAlgorithm;
use crate::{
    AbortReason, abort_kernel,
    sync::{RawSpinlock, SpinLock},
    thread::{
        ABNORMAL_EXIT, ContextLevel, Current, Thread, ThreadFlags, ThreadStatus, UnwindState,
        with_current,
    },
};
use abyss::{
    context,
    cpu::Doorbell,
    interrupt::{InterruptGuard, InterruptState},
};
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// How long an idle processor halts before it looks at its queue again.
const IDLE_HALT_NS: u64 = 10_000_000;

/// The scheduler of one processor.
///
/// It owns the ready queues of the processor and the thread that currently
/// runs on it, and performs every context switch of the processor.
pub struct PerProcessorScheduler {
    id: usize,
    algorithm: Box<dyn SchedulingAlgorithm>,
    idle: SpinLock<Option<Arc<Thread>>>,
    running: SpinLock<Option<Arc<Thread>>>,
    doorbell: Doorbell,
    halted: AtomicBool,
    ticks: AtomicU64,
    quantum_ns: u64,
}

impl PerProcessorScheduler {
    pub(crate) fn new(id: usize, algorithm: Box<dyn SchedulingAlgorithm>, quantum_ns: u64) -> Self {
        Self {
            id,
            algorithm,
            idle: SpinLock::new(None),
            running: SpinLock::new(None),
            doorbell: Doorbell::new(),
            halted: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            quantum_ns,
        }
    }

    /// Processor id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of threads waiting in the ready queues.
    pub fn ready_count(&self) -> usize {
        self.algorithm.ready_count()
    }

    /// The thread that runs on this processor.
    pub fn running(&self) -> Option<Arc<Thread>> {
        let running = self.running.lock();
        let th = running.clone();
        running.unlock();
        th
    }

    /// The idle thread of this processor.
    pub fn idle(&self) -> Option<Arc<Thread>> {
        let idle = self.idle.lock();
        let th = idle.clone();
        idle.unlock();
        th
    }

    /// Installs the thread that runs when nothing else is ready.
    pub fn set_idle(&self, th: &Arc<Thread>) {
        th.insert_flags(ThreadFlags::IDLE);
        let previous = self.idle.lock().replace(th.clone());
        drop(previous);
    }

    pub(crate) fn set_running(&self, th: &Arc<Thread>) {
        let previous = self.running.lock().replace(th.clone());
        drop(previous);
    }

    /// Binds `th` to this processor and queues it if it is ready.
    pub fn add_thread(&self, th: &Arc<Thread>) {
        th.set_cpu(self.id);
        self.algorithm.add_thread(th);
        self.doorbell.ring();
    }

    /// Drops `th` from the ready queues.
    pub fn remove_thread(&self, th: &Arc<Thread>) {
        self.algorithm.remove_thread(th);
    }

    /// Queues or dequeues `th` after its status changed.
    pub fn thread_status_changed(&self, th: &Arc<Thread>) {
        self.algorithm.thread_status_changed(th);
        if th.status() == ThreadStatus::Ready {
            self.doorbell.ring();
        }
    }

    /// Gives the processor to another thread.
    ///
    /// The current thread becomes `next_status`. The next thread is
    /// `new_thread` if given, otherwise the first ready thread; if nothing is
    /// ready, a yielding thread simply continues and a sleeping one hands
    /// the processor to the idle thread.
    ///
    /// `lock` must be held by the caller. It is released once the current
    /// thread has its new status, so a waker that needs the lock cannot miss
    /// the sleeper. If interrupts were enabled when `lock` was acquired, they
    /// are enabled again when the current thread is dispatched again.
    ///
    /// A thread that goes to sleep with a wakeup pending returns at once.
    #[track_caller]
    pub fn schedule(
        &self,
        next_status: ThreadStatus,
        new_thread: Option<Arc<Thread>>,
        lock: Option<&RawSpinlock>,
    ) {
        let guard = InterruptGuard::new();
        let current = with_current(Arc::clone);
        current.lock.acquire();

        if next_status == ThreadStatus::Sleeping && current.take_flags(ThreadFlags::WAKE_PENDING) {
            let lock_on = lock.is_some_and(|lock| lock.exit());
            current.lock.release();
            Self::resume(guard.consume(), lock_on);
            return;
        }

        let next = match new_thread {
            Some(th) => {
                self.algorithm.remove_thread(&th);
                Some(th)
            }
            None => self.algorithm.next(),
        };
        let next = match next {
            Some(next) => next,
            None if next_status == ThreadStatus::Ready => {
                let lock_on = lock.is_some_and(|lock| lock.exit());
                current.lock.release();
                Self::resume(guard.consume(), lock_on);
                return;
            }
            None => self.idle_or_abort(&current),
        };

        if !current.is_idle() {
            current.set_status(next_status);
        }
        let lock_on = lock.is_some_and(|lock| lock.exit());
        current.lock.release();

        if !next.is_idle() {
            next.set_status(ThreadStatus::Running);
        }
        self.set_running(&next);
        log::trace!("CPU {}: {} -> {}", self.id, current.name(), next.name());

        let from = current.context().clone();
        let to = next.context().clone();
        drop(current);
        drop(next);
        let saved = guard.consume();
        if context::switch(&from, &to) {
            Self::resume(saved, lock_on);
        }
    }

    /// Puts the current thread to sleep, releasing `lock` once it sleeps.
    #[track_caller]
    pub fn sleep(&self, lock: Option<&RawSpinlock>) {
        self.schedule(ThreadStatus::Sleeping, None, lock)
    }

    /// Ends the current thread and dispatches the next one.
    ///
    /// The current thread becomes a zombie if it is not one yet. Its context
    /// is abandoned without being saved; a thread that dies inside a signal
    /// handler also gives up its saved normal context.
    pub fn kill_current_thread(&self, lock: Option<&RawSpinlock>) -> ! {
        unsafe { InterruptState::disable() };
        let current = with_current(Arc::clone);
        current.lock.acquire();
        if current.status() != ThreadStatus::Zombie {
            current.set_status(ThreadStatus::Zombie);
        }
        let next = match self.algorithm.next() {
            Some(next) => next,
            None => self.idle_or_abort(&current),
        };
        if let Some(lock) = lock {
            lock.exit();
        }
        if current.in_signal_handler() {
            // The saved normal context will never be restored.
            current.context_at(ContextLevel::Normal).retire();
        }
        current.lock.release();

        if !next.is_idle() {
            next.set_status(ThreadStatus::Running);
        }
        self.set_running(&next);
        log::trace!("CPU {}: {} (exited) -> {}", self.id, current.name(), next.name());

        let to = next.context().clone();
        drop(current);
        drop(next);
        context::exit_to(&to)
    }

    /// Accounts `delta_ns` of run time to the current thread.
    ///
    /// Once a quantum is used up the current thread yields. A thread asked
    /// to exit does so here.
    pub fn timer(&self, delta_ns: u64) {
        let ticks = self.ticks.fetch_add(delta_ns, Ordering::Relaxed) + delta_ns;
        if ticks >= self.quantum_ns {
            self.ticks.store(0, Ordering::Relaxed);
            self.schedule(ThreadStatus::Ready, None, None);
        }
        if let Some(current) = Current::get() {
            if current.unwind_state() == UnwindState::Exit
                && !current.flags().intersects(ThreadFlags::IDLE | ThreadFlags::BOOT)
            {
                drop(current);
                Current::exit(ABNORMAL_EXIT);
            }
        }
    }

    /// Body of the idle thread.
    pub(crate) fn idle_loop(&self) {
        while !self.halted.load(Ordering::Acquire) {
            self.schedule(ThreadStatus::Ready, None, None);
            if self.halted.load(Ordering::Acquire) {
                break;
            }
            self.doorbell.wait(IDLE_HALT_NS);
        }
        log::debug!("CPU {} halted.", self.id);
    }

    /// Stops the idle loop for good.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.doorbell.ring();
        let idle = self.idle.lock().take();
        if let Some(idle) = idle {
            idle.context().retire();
        }
    }

    fn idle_or_abort(&self, current: &Arc<Thread>) -> Arc<Thread> {
        match self.idle() {
            Some(idle) if !Arc::ptr_eq(&idle, current) => idle,
            _ => abort_kernel(
                AbortReason::NoIdleThread,
                format_args!("CPU {} has nothing to run after {}", self.id, current.name()),
            ),
        }
    }

    fn resume(saved: InterruptState, lock_on: bool) {
        if saved == InterruptState::On || lock_on {
            unsafe { InterruptState::enable() };
        }
    }
}

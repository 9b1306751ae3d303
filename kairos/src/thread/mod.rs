//! Thread abstraction, an abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. Every thread belongs to a [`Process`] and is
//! bound to one processor, whose [`PerProcessorScheduler`] dispatches it.
//!
//! A thread moves through the following states:
//!
//! ```text
//!            dispatch               sleep
//!   Ready ------------> Running ------------> Sleeping
//!     ^   <------------    |    <------------     |
//!     |      yield         |        wake          |
//!     +--------------------|----------------------+
//!                          | exit
//!                          v
//!                        Zombie
//! ```
//!
//! [`ThreadStatus::Zombie`] is terminal. A zombie keeps its exit code until
//! it is reaped, either by [`JoinHandle::join`] or, for a detached thread, by
//! the [`ZombieQueue`].
//!
//! [`Process`]: crate::process::Process
//! [`PerProcessorScheduler`]: crate::scheduler::PerProcessorScheduler
//! [`ZombieQueue`]: crate::zombie::ZombieQueue
use crate::{
    AbortReason, KernelError, abort_kernel,
    process::{Process, ProcessState},
    scheduler::{PerProcessorScheduler, Scheduler, registry::Handle},
    sync::{RawSpinlock, SpinLock},
};
use abyss::{
    context::{self, Context},
    interrupt::{InterruptGuard, InterruptState},
};
use alloc::{
    boxed::Box,
    string::String,
    sync::{Arc, Weak},
};
use core::{
    any::Any,
    panic::Location,
    sync::atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicUsize, Ordering},
};
use crossbeam_utils::atomic::AtomicCell;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default size of a kernel stack.
pub const STACK_SIZE: usize = 0x4000;

/// Default priority of a new thread. Priority 0 is the highest.
pub const DEFAULT_PRIORITY: usize = 1;

/// Exit code of a thread that was killed or that aborted.
pub const ABNORMAL_EXIT: i32 = -1;

/// Scheduling status of a [`Thread`].
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Waiting in a ready queue.
    Ready,
    /// Running on its processor.
    Running,
    /// Descheduled until somebody wakes it.
    Sleeping,
    /// Exited, waiting to be reaped.
    Zombie,
}

/// Request to end a blocking wait abruptly.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum UnwindState {
    /// Nothing requested.
    Continue,
    /// Give up the current blocking call, but keep running.
    ReleaseBlockingThread,
    /// Give up the current blocking call and exit.
    Exit,
}

/// What a sleeping thread is waiting for.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DebugState {
    /// Not waiting.
    None,
    /// Waiting on a [`Semaphore`](crate::sync::Semaphore).
    SemWait,
    /// Waiting on a [`ConditionVariable`](crate::sync::ConditionVariable).
    CondWait,
    /// Waiting for another thread to exit.
    Joining,
}

/// Which saved register state of a [`Thread`] is live.
///
/// A thread owns one [`Context`] per level. The scheduler saves into and
/// restores from the context of the current level only, so a thread that is
/// executing a signal handler keeps its normal state untouched until the
/// handler returns.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ContextLevel {
    /// Ordinary execution.
    Normal,
    /// Executing a signal handler.
    SignalHandler,
}

bitflags::bitflags! {
    /// Bookkeeping bits of a [`Thread`].
    pub struct ThreadFlags: u32 {
        /// An interruption was delivered and not consumed yet.
        const INTERRUPTED = 1 << 0;
        /// A wakeup arrived while the thread was not sleeping.
        const WAKE_PENDING = 1 << 1;
        /// The thread sits in a ready queue.
        const QUEUED = 1 << 2;
        /// Nobody will join the thread.
        const DETACHED = 1 << 3;
        /// The idle thread of a processor.
        const IDLE = 1 << 4;
        /// The context that brought the scheduler up.
        const BOOT = 1 << 5;
    }
}

/// A schedulable execution context.
///
/// Threads are shared through [`Arc`]; the scheduler, the owning process,
/// wait queues and join handles all hold strong references, and a thread is
/// freed once all of them are gone.
pub struct Thread {
    tid: AtomicUsize,
    name: String,
    process: Weak<Process>,
    scheduler: Weak<Scheduler>,
    /// Guards the status of this thread.
    pub(crate) lock: RawSpinlock,
    status: AtomicU8,
    flags: AtomicU32,
    unwind: AtomicU8,
    exit_code: AtomicI32,
    errno: AtomicCell<Option<KernelError>>,
    priority: AtomicUsize,
    cpu: AtomicUsize,
    affinity: Option<usize>,
    handle: AtomicCell<Option<Handle>>,
    contexts: [Arc<Context>; 2],
    level: AtomicU8,
    stack_size: usize,
    debug_state: AtomicU8,
    debug_site: AtomicCell<Option<&'static Location<'static>>>,
    pub(crate) joiner: SpinLock<Option<Arc<Thread>>>,
}

impl Thread {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        process: Weak<Process>,
        scheduler: Weak<Scheduler>,
        status: ThreadStatus,
        flags: ThreadFlags,
        priority: usize,
        affinity: Option<usize>,
        stack_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            tid: AtomicUsize::new(0),
            name,
            process,
            scheduler,
            lock: RawSpinlock::new(),
            status: AtomicU8::new(status.into()),
            flags: AtomicU32::new(flags.bits()),
            unwind: AtomicU8::new(UnwindState::Continue.into()),
            exit_code: AtomicI32::new(0),
            errno: AtomicCell::new(None),
            priority: AtomicUsize::new(priority),
            cpu: AtomicUsize::new(abyss::cpu::NO_CPU),
            affinity,
            handle: AtomicCell::new(None),
            contexts: [Context::new(), Context::new()],
            level: AtomicU8::new(ContextLevel::Normal.into()),
            stack_size,
            debug_state: AtomicU8::new(DebugState::None.into()),
            debug_site: AtomicCell::new(None),
            joiner: SpinLock::new(None),
        })
    }

    /// Thread id, unique within the owning process.
    pub fn id(&self) -> usize {
        self.tid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, tid: usize) {
        self.tid.store(tid, Ordering::Relaxed);
    }

    /// Name of the thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning process, unless it is gone.
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    /// The scheduler this thread was created by, unless it is gone.
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.upgrade()
    }

    /// The scheduler of the processor this thread is bound to.
    pub fn processor(&self) -> Option<Arc<PerProcessorScheduler>> {
        self.scheduler()
            .and_then(|s| s.processor(self.cpu.load(Ordering::Relaxed)))
    }

    /// Current status.
    pub fn status(&self) -> ThreadStatus {
        let raw = self.status.load(Ordering::Acquire);
        match ThreadStatus::try_from(raw) {
            Ok(status) => status,
            Err(_) => abort_kernel(
                AbortReason::InvalidTransition,
                format_args!("thread {} has a corrupted status {}", self.name, raw),
            ),
        }
    }

    /// Changes the status and tells the scheduler about it.
    ///
    /// Takes the lock of this thread, which may already be held by the
    /// caller. Reviving a [`ThreadStatus::Zombie`] aborts the kernel.
    #[track_caller]
    pub fn set_status(self: &Arc<Self>, status: ThreadStatus) {
        self.lock.acquire();
        if self.status() == ThreadStatus::Zombie && status != ThreadStatus::Zombie {
            abort_kernel(
                AbortReason::InvalidTransition,
                format_args!("thread {} set to {:?} after it exited", self.name, status),
            );
        }
        self.status.store(status.into(), Ordering::Release);
        if let Some(scheduler) = self.scheduler() {
            scheduler.thread_status_changed(self);
        }
        self.lock.release();
    }

    /// Exit code. Meaningful once the thread is a zombie.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// The last error recorded for this thread.
    pub fn errno(&self) -> Option<KernelError> {
        self.errno.load()
    }

    /// Records the last error of this thread.
    pub fn set_errno(&self, e: Option<KernelError>) {
        self.errno.store(e);
    }

    /// The pending unwind request.
    pub fn unwind_state(&self) -> UnwindState {
        UnwindState::try_from(self.unwind.load(Ordering::Acquire)).unwrap_or(UnwindState::Exit)
    }

    /// Requests that blocking waits of this thread give up.
    pub fn set_unwind_state(&self, state: UnwindState) {
        self.unwind.store(state.into(), Ordering::Release);
    }

    /// Scheduling priority; 0 is the highest.
    pub fn priority(&self) -> usize {
        self.priority.load(Ordering::Relaxed)
    }

    /// Changes the priority. Takes effect the next time the thread is
    /// queued.
    pub fn set_priority(&self, priority: usize) {
        let lowest = self
            .scheduler()
            .map(|s| s.config().priority_bands().saturating_sub(1))
            .unwrap_or(priority);
        self.priority.store(priority.min(lowest), Ordering::Relaxed);
    }

    /// The processor this thread is bound to.
    pub fn cpu(&self) -> Option<usize> {
        match self.cpu.load(Ordering::Relaxed) {
            abyss::cpu::NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    /// The processor requested at creation.
    pub fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    /// Size of the kernel stack.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub(crate) fn handle(&self) -> Option<Handle> {
        self.handle.load()
    }

    pub(crate) fn set_handle(&self, handle: Option<Handle>) {
        self.handle.store(handle);
    }

    /// The live context level.
    pub fn context_level(&self) -> ContextLevel {
        ContextLevel::try_from(self.level.load(Ordering::Acquire)).unwrap_or(ContextLevel::Normal)
    }

    /// Whether the thread is executing a signal handler.
    pub fn in_signal_handler(&self) -> bool {
        self.context_level() == ContextLevel::SignalHandler
    }

    fn set_context_level(&self, level: ContextLevel) {
        self.level.store(level.into(), Ordering::Release);
    }

    /// The context the scheduler saves and restores for this thread.
    pub(crate) fn context(&self) -> &Arc<Context> {
        self.context_at(self.context_level())
    }

    pub(crate) fn context_at(&self, level: ContextLevel) -> &Arc<Context> {
        &self.contexts[u8::from(level) as usize]
    }

    /// Bookkeeping bits.
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn insert_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flags`; returns whether any of them was set.
    pub(crate) fn take_flags(&self, flags: ThreadFlags) -> bool {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel) & flags.bits() != 0
    }

    /// Whether this is the idle thread of a processor.
    pub fn is_idle(&self) -> bool {
        self.flags().contains(ThreadFlags::IDLE)
    }

    /// Whether an interruption is pending.
    pub fn was_interrupted(&self) -> bool {
        self.flags().contains(ThreadFlags::INTERRUPTED)
    }

    /// Consumes a pending interruption.
    pub(crate) fn take_interrupted(&self) -> bool {
        self.take_flags(ThreadFlags::INTERRUPTED)
    }

    /// What the thread is waiting for, and where the wait started.
    pub fn debug_state(&self) -> (DebugState, Option<&'static Location<'static>>) {
        (
            DebugState::try_from(self.debug_state.load(Ordering::Relaxed))
                .unwrap_or(DebugState::None),
            self.debug_site.load(),
        )
    }

    #[track_caller]
    pub(crate) fn set_debug_state(&self, state: DebugState) {
        self.debug_state.store(state.into(), Ordering::Relaxed);
        self.debug_site.store(match state {
            DebugState::None => None,
            _ => Some(Location::caller()),
        });
    }

    /// Makes a sleeping thread ready.
    ///
    /// Returns false, and does nothing, if the thread was not sleeping.
    pub fn wake(self: &Arc<Self>) -> bool {
        self.lock.acquire();
        let sleeping = self.status() == ThreadStatus::Sleeping;
        if sleeping {
            self.set_status(ThreadStatus::Ready);
        }
        self.lock.release();
        sleeping
    }

    /// Makes a sleeping thread ready, or makes its next sleep return at
    /// once if it is not sleeping yet.
    pub fn unblock(self: &Arc<Self>) {
        self.lock.acquire();
        match self.status() {
            ThreadStatus::Sleeping => self.set_status(ThreadStatus::Ready),
            ThreadStatus::Zombie => (),
            _ => self.insert_flags(ThreadFlags::WAKE_PENDING),
        }
        self.lock.release();
    }

    /// Interrupts the thread.
    ///
    /// An interrupted thread leaves its current blocking wait (or the next
    /// one, if it is not waiting yet) as soon as it is dispatched again.
    pub fn interrupt(self: &Arc<Self>) {
        self.lock.acquire();
        self.insert_flags(ThreadFlags::INTERRUPTED);
        self.unblock();
        self.lock.release();
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.id())
            .field("name", &self.name)
            .field("status", &self.status())
            .field("cpu", &self.cpu())
            .field("flags", &self.flags())
            .field("level", &self.context_level())
            .finish()
    }
}

/// A struct to control the current thread.
pub struct Current {
    _p: (),
}

impl Current {
    /// The thread of the calling context, if it is a kernel thread.
    pub fn get() -> Option<Arc<Thread>> {
        abyss::cpu::current().and_then(|current| current.downcast::<Thread>().ok())
    }

    /// Get the thread id of the current thread.
    pub fn get_tid() -> Option<usize> {
        Self::get().map(|th| th.id())
    }

    /// Yields the processor to another ready thread, if there is one.
    pub fn yield_now() {
        if let Some(processor) = Self::get().and_then(|th| th.processor()) {
            processor.schedule(ThreadStatus::Ready, None, None);
        }
    }

    /// Exit the current thread with `exit_code`.
    ///
    /// The joiner, if any, is woken. A detached thread is handed to the
    /// zombie queue. The processor is then given to the next thread and the
    /// context of the current thread ends.
    pub fn exit(exit_code: i32) -> ! {
        let th = with_current(Arc::clone);
        if th.flags().intersects(ThreadFlags::IDLE | ThreadFlags::BOOT) {
            abort_kernel(
                AbortReason::InvalidTransition,
                format_args!("thread {} must not exit", th.name),
            );
        }
        let processor = match th.processor() {
            Some(processor) => processor,
            None => abort_kernel(
                AbortReason::SchedulerLookup,
                format_args!("exiting thread {} has no processor", th.name),
            ),
        };
        th.exit_code.store(exit_code, Ordering::Release);

        th.lock.acquire();
        th.set_status(ThreadStatus::Zombie);
        let joiner = th.joiner.lock().take();
        let detached = th.flags().contains(ThreadFlags::DETACHED);
        th.lock.release();

        log::trace!("Thread {} exited with {}.", th.name, exit_code);
        if let Some(joiner) = joiner {
            joiner.wake();
        }
        if detached {
            if let Some(scheduler) = th.scheduler() {
                scheduler.zombies().add_thread(th.clone());
            }
        }
        drop(th);
        processor.kill_current_thread(None)
    }

    /// Runs `handler` on the signal-handler context of the current thread.
    ///
    /// The normal context stays saved while the handler runs, and every
    /// switch of the thread meanwhile saves and restores the handler
    /// context. Once the handler returns, the thread continues on its normal
    /// context. A handler that panics is abandoned and the normal context
    /// resumes. A thread that exits inside its handler never returns from
    /// this call.
    ///
    /// # Errors
    /// - [`KernelError::OperationNotPermitted`] if the caller is not a
    ///   kernel thread, or is an idle thread.
    /// - [`KernelError::Busy`] if the thread already runs a handler.
    /// - [`KernelError::NoMemory`] if the handler context cannot be created.
    pub fn run_signal_handler<F>(handler: F) -> Result<(), KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let th = Self::get().ok_or(KernelError::OperationNotPermitted)?;
        if th.is_idle() {
            return Err(KernelError::OperationNotPermitted);
        }
        if th.in_signal_handler() {
            return Err(KernelError::Busy);
        }

        let guard = InterruptGuard::new();
        let entry: Box<dyn FnOnce() + Send> = {
            let th = th.clone();
            Box::new(move || {
                install_current(&th);
                drop(th);
                unsafe { InterruptState::enable() };
                handler();
                leave_signal_handler()
            })
        };
        let on_abort: Box<dyn FnOnce(Box<dyn Any + Send>) + Send> = {
            let name = th.name.clone();
            Box::new(move |_| {
                log::error!("Signal handler of thread {} panicked.", name);
                leave_signal_handler()
            })
        };
        let handler_context = th.context_at(ContextLevel::SignalHandler).clone();
        context::spawn(handler_context.clone(), &th.name, th.stack_size, entry, on_abort)
            .map_err(|_| KernelError::NoMemory)?;

        let normal = th.context_at(ContextLevel::Normal).clone();
        th.set_context_level(ContextLevel::SignalHandler);
        log::trace!("Thread {} entered its signal handler.", th.name);
        drop(th);

        let saved = guard.consume();
        if !context::switch(&normal, &handler_context) {
            // The thread exited inside the handler.
            context::abandon();
        }
        if saved == InterruptState::On {
            unsafe { InterruptState::enable() };
        }
        Ok(())
    }
}

/// Hands the processor from the handler context back to the normal context
/// of the current thread.
fn leave_signal_handler() -> ! {
    unsafe { InterruptState::disable() };
    let normal = with_current(|th| {
        th.set_context_level(ContextLevel::Normal);
        th.context_at(ContextLevel::Normal).clone()
    });
    context::exit_to(&normal)
}

/// Runs `f` with the current thread.
///
/// Calling this outside of a kernel thread aborts the kernel.
#[inline]
#[track_caller]
pub fn with_current<R>(f: impl FnOnce(&Arc<Thread>) -> R) -> R {
    match Current::get() {
        Some(th) => f(&th),
        None => abort_kernel(
            AbortReason::NoCurrentThread,
            format_args!("not a kernel thread ({})", Location::caller()),
        ),
    }
}

/// Installs `th` as the thread of the calling context.
pub(crate) fn install_current(th: &Arc<Thread>) {
    abyss::cpu::set_current(Some(th.clone() as Arc<dyn Any + Send + Sync>));
}

/// A struct to spawn a new thread.
pub struct ThreadBuilder {
    name: String,
    priority: usize,
    stack_size: Option<usize>,
    process: Option<Arc<Process>>,
    cpu: Option<usize>,
    detached: bool,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        alloc::string::String: core::convert::From<I>,
    {
        Self {
            name: String::from(name),
            priority: DEFAULT_PRIORITY,
            stack_size: None,
            process: None,
            cpu: None,
            detached: false,
        }
    }

    /// Sets the priority. Clamped to the configured priority bands.
    pub fn priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the kernel stack size.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Sets the owning process. Defaults to the process of the caller.
    pub fn process(mut self, process: &Arc<Process>) -> Self {
        self.process = Some(process.clone());
        self
    }

    /// Binds the thread to processor `cpu`. Defaults to the choice of the
    /// core allocator.
    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Spawns the thread already detached.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Spawn the thread.
    ///
    /// The thread runs `thread_fn` and exits with its return value.
    ///
    /// # Errors
    /// - [`KernelError::OperationNotPermitted`] if the caller is not a
    ///   kernel thread.
    /// - [`KernelError::ShuttingDown`] once the scheduler is shutting down.
    /// - [`KernelError::InvalidArgument`] for an unknown processor or an
    ///   empty stack.
    /// - [`KernelError::NoSuchProcess`] if the process was killed or
    ///   reclaimed.
    /// - [`KernelError::NoMemory`] if the context cannot be created.
    pub fn spawn<F>(self, thread_fn: F) -> Result<JoinHandle, KernelError>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let current = Current::get().ok_or(KernelError::OperationNotPermitted)?;
        let scheduler = current
            .scheduler()
            .ok_or(KernelError::OperationNotPermitted)?;
        self.spawn_in(&scheduler, Some(&current), thread_fn)
    }

    pub(crate) fn spawn_in<F>(
        self,
        scheduler: &Arc<Scheduler>,
        current: Option<&Arc<Thread>>,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        if !scheduler.is_running() {
            return Err(KernelError::ShuttingDown);
        }
        let conf = scheduler.config();
        if self.cpu.is_some_and(|cpu| cpu >= conf.cpus()) || self.stack_size == Some(0) {
            return Err(KernelError::InvalidArgument);
        }
        let process = match self.process {
            Some(process) => process,
            None => current
                .and_then(|th| th.process())
                .unwrap_or_else(|| scheduler.kernel_process()),
        };
        if process.state() != ProcessState::Active {
            return Err(KernelError::NoSuchProcess);
        }
        let mut flags = ThreadFlags::empty();
        if self.detached {
            flags |= ThreadFlags::DETACHED;
        }
        let th = Thread::new(
            self.name,
            Arc::downgrade(&process),
            Arc::downgrade(scheduler),
            ThreadStatus::Ready,
            flags,
            self.priority.min(conf.priority_bands() - 1),
            self.cpu,
            self.stack_size.unwrap_or(conf.stack_size()),
        );

        let entry: Box<dyn FnOnce() + Send> = {
            let th = th.clone();
            Box::new(move || {
                install_current(&th);
                drop(th);
                unsafe { InterruptState::enable() };
                let exit_code = thread_fn();
                Current::exit(exit_code);
            })
        };
        let on_abort: Box<dyn FnOnce(Box<dyn Any + Send>) + Send> = {
            let name = th.name.clone();
            Box::new(move |payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("unknown panic");
                log::error!("Thread {} panicked: {}", name, message);
                Current::exit(ABNORMAL_EXIT);
            })
        };
        context::spawn(th.context().clone(), &th.name, th.stack_size, entry, on_abort)
            .map_err(|_| KernelError::NoMemory)?;

        process.add_thread(&th);
        scheduler.add_thread(&th);
        log::debug!(
            "Spawned thread {} ({}) of process {} on CPU {:?}.",
            th.id(),
            th.name,
            process.id(),
            th.cpu()
        );
        Ok(JoinHandle {
            th,
            consumed: false,
        })
    }
}

/// A handle to join a thread.
///
/// Dropping the handle without joining detaches the thread.
pub struct JoinHandle
where
    Self: 'static,
{
    th: Arc<Thread>,
    consumed: bool,
}

impl JoinHandle {
    /// The thread behind this handle.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.th
    }

    /// Current status of the thread.
    pub fn status(&self) -> ThreadStatus {
        self.th.status()
    }

    /// Sleeps until the thread exits, reaps it, and returns its exit code.
    ///
    /// # Errors
    /// - [`KernelError::OperationNotPermitted`] if the caller is not a
    ///   kernel thread.
    /// - [`KernelError::Deadlock`] if a thread joins itself.
    /// - [`KernelError::Interrupted`] if the caller was interrupted. The
    ///   handle is consumed, so the thread is detached, and the error is
    ///   recorded as the errno of the caller.
    pub fn join(mut self) -> Result<i32, KernelError> {
        let current = Current::get().ok_or(KernelError::OperationNotPermitted)?;
        if Arc::ptr_eq(&current, &self.th) {
            return Err(KernelError::Deadlock);
        }
        let processor = current
            .processor()
            .ok_or(KernelError::OperationNotPermitted)?;
        loop {
            self.th.lock.acquire();
            if self.th.status() == ThreadStatus::Zombie {
                self.th.lock.release();
                break;
            }
            *self.th.joiner.lock() = Some(current.clone());
            current.set_debug_state(DebugState::Joining);
            processor.sleep(Some(&self.th.lock));
            current.set_debug_state(DebugState::None);
            if current.take_interrupted() {
                self.th.joiner.lock().take();
                current.set_errno(Some(KernelError::Interrupted));
                return Err(KernelError::Interrupted);
            }
        }
        self.consumed = true;
        let exit_code = self.th.exit_code();
        if let Some(scheduler) = self.th.scheduler() {
            scheduler.reap_thread(&self.th);
        }
        Ok(exit_code)
    }

    /// Gives up joining the thread; it is reaped by the zombie queue once it
    /// exits.
    pub fn detach(mut self) {
        self.consumed = true;
        detach(&self.th);
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        if !self.consumed {
            detach(&self.th);
        }
    }
}

fn detach(th: &Arc<Thread>) {
    th.lock.acquire();
    th.insert_flags(ThreadFlags::DETACHED);
    let zombie = th.status() == ThreadStatus::Zombie;
    th.lock.release();
    if zombie {
        if let Some(scheduler) = th.scheduler() {
            scheduler.zombies().add_thread(th.clone());
        }
    }
}

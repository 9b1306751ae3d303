//! The global scheduler.
//!
//! A [`Scheduler`] owns everything that is shared between processors: the
//! process list, the map from every live thread to the processor it is bound
//! to, the [`ZombieQueue`], and one [`PerProcessorScheduler`] per processor.
//! It never dispatches anything itself; every context switch is made by the
//! [`PerProcessorScheduler`] of the processor it happens on.
//!
//! A scheduler is an ordinary value. [`Scheduler::initialise`] adopts the
//! calling context as the boot thread of processor 0 and brings up the
//! other processors, and [`Scheduler::shutdown`] takes them down again. Any
//! kernel thread reaches its scheduler through [`Thread::scheduler`].
pub mod core_allocator;
pub mod per_processor;
pub mod registry;
pub mod round_robin;

pub use per_processor::PerProcessorScheduler;

use crate::{
    AbortReason, KernelError, SystemConfiguration, abort_kernel,
    process::Process,
    sync::SpinLock,
    thread::{
        Current, DEFAULT_PRIORITY, JoinHandle, Thread, ThreadBuilder, ThreadFlags, ThreadStatus,
        install_current,
    },
    zombie::ZombieQueue,
};
use abyss::{cpu::NO_CPU, interrupt::InterruptState};
use alloc::{
    boxed::Box,
    format,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    any::Any,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};
use core_allocator::{CoreAllocator, RoundRobinCoreAllocator};
use crossbeam_utils::atomic::AtomicCell;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use registry::Registry;
use round_robin::RoundRobin;

/// A policy that decides which ready thread of a processor runs next.
///
/// Every processor has its own instance. All methods may be called from any
/// processor with the lock of `th` held.
pub trait SchedulingAlgorithm: Send + Sync {
    /// A thread was bound to the processor.
    fn add_thread(&self, th: &Arc<Thread>);

    /// A thread leaves the processor.
    fn remove_thread(&self, th: &Arc<Thread>);

    /// The status of `th` changed. A ready thread must be queued, any other
    /// thread must not be.
    fn thread_status_changed(&self, th: &Arc<Thread>);

    /// Dequeues the thread to run next.
    fn next(&self) -> Option<Arc<Thread>>;

    /// Number of queued threads.
    fn ready_count(&self) -> usize;
}

/// Tells a spinning processor whether the holder of a lock can still make
/// progress.
///
/// A spinner asks every [`RawSpinlock::retry_limit`] failed attempts. The
/// oracle must not take any lock.
///
/// [`RawSpinlock::retry_limit`]: crate::sync::RawSpinlock::retry_limit
pub trait ProgressOracle: Send + Sync {
    /// Whether a lock holder on processor `owner_cpu` ([`NO_CPU`] if it is
    /// not bound to a processor) may still release the lock.
    fn can_progress(&self, owner_cpu: usize) -> bool;
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum State {
    Running,
    ShuttingDown,
    Down,
}

/// The scheduler of the whole machine.
pub struct Scheduler {
    config: SystemConfiguration,
    processors: Vec<Arc<PerProcessorScheduler>>,
    processes: SpinLock<Vec<Arc<Process>>>,
    next_pid: AtomicUsize,
    registry: SpinLock<Registry<usize>>,
    allocator: Box<dyn CoreAllocator>,
    oracle: AtomicCell<Option<&'static dyn ProgressOracle>>,
    state: AtomicU8,
    zombies: ZombieQueue,
    kernel_process: Arc<Process>,
    boot: SpinLock<Option<Arc<Thread>>>,
    reaper: SpinLock<Option<JoinHandle>>,
}

impl Scheduler {
    /// Brings the scheduler up.
    ///
    /// The calling context becomes the boot thread of processor 0 and
    /// belongs to the kernel process. Every processor gets an idle thread,
    /// and the worker of the [`ZombieQueue`] is started.
    ///
    /// # Errors
    /// - [`KernelError::Busy`] if the caller already is a kernel thread.
    /// - [`KernelError::NoMemory`] if a context cannot be created.
    pub fn initialise(config: SystemConfiguration) -> Result<Arc<Self>, KernelError> {
        if Current::get().is_some() {
            return Err(KernelError::Busy);
        }
        abyss::kprint::init_logger(config.log_level());
        abyss::cpu::set_cpuid(0);

        let scheduler = Arc::new_cyclic(|me: &Weak<Scheduler>| Scheduler {
            processors: (0..config.cpus())
                .map(|id| {
                    Arc::new(PerProcessorScheduler::new(
                        id,
                        Box::new(RoundRobin::new(config.priority_bands())),
                        config.quantum_ns(),
                    ))
                })
                .collect(),
            processes: SpinLock::new(Vec::new()),
            next_pid: AtomicUsize::new(1),
            registry: SpinLock::new(Registry::new()),
            allocator: Box::new(RoundRobinCoreAllocator::new()),
            oracle: AtomicCell::new(None),
            state: AtomicU8::new(State::Running.into()),
            zombies: ZombieQueue::new(),
            kernel_process: Process::kernel(me.clone()),
            boot: SpinLock::new(None),
            reaper: SpinLock::new(None),
            config,
        });
        let kernel = scheduler.kernel_process();
        let mut processes = scheduler.processes.lock();
        processes.push(kernel.clone());
        processes.unlock();

        let boot = Thread::new(
            String::from("boot"),
            Arc::downgrade(&kernel),
            Arc::downgrade(&scheduler),
            ThreadStatus::Running,
            ThreadFlags::BOOT,
            DEFAULT_PRIORITY,
            Some(0),
            scheduler.config.stack_size(),
        );
        kernel.add_thread(&boot);
        scheduler.add_thread(&boot);
        scheduler.processors[0].set_running(&boot);
        install_current(&boot);
        *scheduler.boot.lock() = Some(boot.clone());
        unsafe { InterruptState::enable() };

        if let Err(e) = scheduler.start_idle_threads(&kernel) {
            scheduler.abandon(&boot);
            return Err(e);
        }

        let reaper = {
            let me = Arc::downgrade(&scheduler);
            ThreadBuilder::new("zombie-reaper").spawn_in(&scheduler, Some(&boot), move || {
                if let Some(scheduler) = me.upgrade() {
                    scheduler.zombies.run(&scheduler);
                }
                0
            })
        };
        match reaper {
            Ok(reaper) => *scheduler.reaper.lock() = Some(reaper),
            Err(e) => {
                scheduler.abandon(&boot);
                return Err(e);
            }
        }

        log::info!(
            "Scheduler up: {} CPU(s), {} priority band(s).",
            scheduler.config.cpus(),
            scheduler.config.priority_bands()
        );
        Ok(scheduler)
    }

    fn start_idle_threads(self: &Arc<Self>, kernel: &Arc<Process>) -> Result<(), KernelError> {
        for processor in self.processors.iter() {
            let id = processor.id();
            let idle = Thread::new(
                format!("idle{}", id),
                Arc::downgrade(kernel),
                Arc::downgrade(self),
                ThreadStatus::Running,
                ThreadFlags::IDLE,
                self.config.priority_bands() - 1,
                Some(id),
                self.config.stack_size(),
            );
            idle.set_cpu(id);
            processor.set_idle(&idle);

            let entry: Box<dyn FnOnce() + Send> = {
                let idle = idle.clone();
                let processor = processor.clone();
                Box::new(move || {
                    install_current(&idle);
                    drop(idle);
                    unsafe { InterruptState::enable() };
                    processor.idle_loop();
                })
            };
            let on_abort: Box<dyn FnOnce(Box<dyn Any + Send>) + Send> = Box::new(move |_| {
                log::error!("Idle thread of CPU {} panicked.", id);
            });
            abyss::context::spawn(idle.context().clone(), idle.name(), idle.stack_size(), entry, on_abort)
                .map_err(|_| KernelError::NoMemory)?;
            if id != 0 {
                processor.set_running(&idle);
                idle.context().resume(id);
            }
        }
        Ok(())
    }

    /// Takes the scheduler down.
    ///
    /// Stops the zombie worker and reaps whatever it left, halts every
    /// processor and forgets the boot thread. Threads that are still alive
    /// are reported and left behind.
    ///
    /// # Errors
    /// - [`KernelError::OperationNotPermitted`] unless called on the boot
    ///   thread of this scheduler.
    /// - [`KernelError::ShuttingDown`] if the scheduler is already going
    ///   down.
    pub fn shutdown(self: &Arc<Self>) -> Result<(), KernelError> {
        let boot = Current::get()
            .filter(|th| th.flags().contains(ThreadFlags::BOOT))
            .filter(|th| th.scheduler().is_some_and(|s| Arc::ptr_eq(&s, self)))
            .ok_or(KernelError::OperationNotPermitted)?;
        self.state
            .compare_exchange(
                State::Running.into(),
                State::ShuttingDown.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| KernelError::ShuttingDown)?;
        log::info!("Scheduler shutting down.");

        self.zombies.stop();
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.join()?;
        }
        self.zombies.drain(self);

        let registry = self.registry.lock();
        let leftover = registry.len();
        registry.unlock();
        if leftover > 1 {
            log::warn!("{} thread(s) still alive at shutdown.", leftover - 1);
        }

        self.abandon(&boot);
        log::info!("Scheduler down.");
        Ok(())
    }

    /// Halts the processors and turns the boot thread back into a plain
    /// context.
    fn abandon(&self, boot: &Arc<Thread>) {
        self.state.store(State::ShuttingDown.into(), Ordering::Release);
        for processor in self.processors.iter() {
            processor.halt();
        }
        self.forget_thread(boot);
        self.kernel_process.take_thread(boot);
        let boot_slot = self.boot.lock().take();
        drop(boot_slot);
        let mut processes = self.processes.lock();
        let processes_left = core::mem::take(&mut *processes);
        processes.unlock();
        drop(processes_left);

        unsafe { InterruptState::disable() };
        abyss::cpu::set_current(None);
        abyss::cpu::set_cpuid(NO_CPU);
        self.state.store(State::Down.into(), Ordering::Release);
    }

    /// Whether new threads may still be created.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == u8::from(State::Running)
    }

    /// The configuration the scheduler was brought up with.
    pub fn config(&self) -> &SystemConfiguration {
        &self.config
    }

    /// The scheduler of processor `id`.
    pub fn processor(&self, id: usize) -> Option<Arc<PerProcessorScheduler>> {
        self.processors.get(id).cloned()
    }

    /// The scheduler of the calling processor.
    pub fn current_processor(&self) -> Option<Arc<PerProcessorScheduler>> {
        self.processor(abyss::cpu::cpuid())
    }

    /// The process of the kernel's own threads, PID 0.
    pub fn kernel_process(&self) -> Arc<Process> {
        self.kernel_process.clone()
    }

    /// The queue of threads and processes waiting to be reclaimed.
    pub fn zombies(&self) -> &ZombieQueue {
        &self.zombies
    }

    /// Binds `th` to a processor and registers it.
    ///
    /// The processor is the affinity of the thread, or else the choice of
    /// the core allocator.
    pub fn add_thread(&self, th: &Arc<Thread>) {
        let cpu = th
            .affinity()
            .filter(|cpu| *cpu < self.processors.len())
            .unwrap_or_else(|| self.allocator.allocate(th, self.processors.len()));
        let mut registry = self.registry.lock();
        let handle = registry.insert(cpu);
        th.set_handle(Some(handle));
        self.processors[cpu].add_thread(th);
        registry.unlock();
    }

    /// Unbinds `th` from its processor and forgets it.
    pub fn remove_thread(&self, th: &Arc<Thread>) {
        if !self.forget_thread(th) {
            log::warn!("Thread {} ({}) is not scheduled.", th.id(), th.name());
        }
    }

    /// Removes `th` from its processor, then from the map. Returns whether
    /// it was registered.
    pub(crate) fn forget_thread(&self, th: &Arc<Thread>) -> bool {
        let mut registry = self.registry.lock();
        let cpu = th.handle().and_then(|handle| registry.get(handle).copied());
        if let (Some(cpu), Some(handle)) = (cpu, th.handle()) {
            self.processors[cpu].remove_thread(th);
            registry.remove(handle);
            th.set_handle(None);
        }
        registry.unlock();
        cpu.is_some()
    }

    /// Whether `th` is registered.
    pub fn thread_in_schedule(&self, th: &Thread) -> bool {
        let registry = self.registry.lock();
        let found = th.handle().is_some_and(|handle| registry.get(handle).is_some());
        registry.unlock();
        found
    }

    /// Routes a status change of `th` to its processor.
    ///
    /// Every live thread is registered, so a failed lookup aborts the
    /// kernel.
    #[track_caller]
    pub fn thread_status_changed(&self, th: &Arc<Thread>) {
        let registry = self.registry.lock();
        match th.handle().and_then(|handle| registry.get(handle).copied()) {
            Some(cpu) => self.processors[cpu].thread_status_changed(th),
            None => abort_kernel(
                AbortReason::SchedulerLookup,
                format_args!("thread {} ({}) is not scheduled", th.id(), th.name()),
            ),
        }
        registry.unlock();
    }

    /// Reaps a zombie: forgets it and removes it from its process.
    ///
    /// A process that is left without threads is handed to the zombie
    /// queue. A thread that is not registered any more is ignored.
    pub(crate) fn reap_thread(&self, th: &Arc<Thread>) {
        if !self.forget_thread(th) {
            return;
        }
        log::trace!("Reaping thread {} ({}).", th.id(), th.name());
        if let Some(process) = th.process() {
            if process.take_thread(th) == Some(0) && !Arc::ptr_eq(&process, &self.kernel_process) {
                self.zombies.add_process(process);
            }
        }
    }

    /// Registers `process` and returns its new PID.
    pub fn add_process(&self, process: &Arc<Process>) -> usize {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        process.set_id(pid);
        let mut processes = self.processes.lock();
        processes.push(process.clone());
        processes.unlock();
        pid
    }

    /// Forgets `process`.
    pub fn remove_process(&self, process: &Arc<Process>) {
        let mut processes = self.processes.lock();
        let position = processes.iter().position(|p| Arc::ptr_eq(p, process));
        let removed = position.map(|i| processes.remove(i));
        processes.unlock();
        match removed {
            Some(_) => log::debug!("Process {} ({}) removed.", process.id(), process.name()),
            None => log::warn!("Process {} ({}) is not registered.", process.id(), process.name()),
        }
    }

    /// Number of registered processes, including the kernel process.
    pub fn get_num_processes(&self) -> usize {
        let processes = self.processes.lock();
        let count = processes.len();
        processes.unlock();
        count
    }

    /// The `n`-th registered process, in registration order.
    pub fn get_process(&self, n: usize) -> Option<Arc<Process>> {
        let processes = self.processes.lock();
        let process = processes.get(n).cloned();
        let count = processes.len();
        processes.unlock();
        if process.is_none() {
            log::warn!("No process #{} ({} registered).", n, count);
        }
        process
    }

    /// Yields the processor of the calling thread.
    pub fn yield_now(&self) {
        Current::yield_now()
    }

    /// Accounts `delta_ns` of run time to the calling processor.
    pub fn timer_tick(&self, delta_ns: u64) {
        if let Some(processor) = self.current_processor() {
            processor.timer(delta_ns);
        }
    }

    /// Replaces the progress oracle. `None` restores the built-in one.
    pub fn set_progress_oracle(&self, oracle: Option<&'static dyn ProgressOracle>) {
        self.oracle.store(oracle);
    }

    /// Asks the progress oracle of the calling thread's scheduler about a
    /// lock holder on `owner_cpu`.
    ///
    /// Outside of any scheduler, progress is assumed.
    pub fn others_can_progress(owner_cpu: usize) -> bool {
        Current::get()
            .and_then(|th| th.scheduler())
            .is_none_or(|scheduler| scheduler.can_progress(owner_cpu))
    }

    fn can_progress(&self, owner_cpu: usize) -> bool {
        match self.oracle.load() {
            Some(oracle) => oracle.can_progress(owner_cpu),
            None => TopologyOracle {
                cpus: self.processors.len(),
            }
            .can_progress(owner_cpu),
        }
    }
}

/// The built-in oracle: a holder can progress unless it sits on the asking
/// processor or on a processor that does not exist.
struct TopologyOracle {
    cpus: usize,
}

impl ProgressOracle for TopologyOracle {
    fn can_progress(&self, owner_cpu: usize) -> bool {
        owner_cpu == NO_CPU || (owner_cpu < self.cpus && owner_cpu != abyss::cpu::cpuid())
    }
}

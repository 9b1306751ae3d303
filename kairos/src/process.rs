//! Processes.
//!
//! A [`Process`] is a named group of threads. The scheduler hands out its
//! PID, the process hands out the thread ids of its members. A process lives
//! as long as it has threads; once its last thread is reaped it is reclaimed
//! by the [`ZombieQueue`](crate::zombie::ZombieQueue).
use crate::{
    scheduler::Scheduler,
    sync::SpinLock,
    thread::{ABNORMAL_EXIT, Current, Thread, UnwindState},
};
use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Lifecycle of a [`Process`].
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProcessState {
    /// Running normally.
    Active,
    /// Being killed; its threads are asked to exit.
    Terminating,
    /// Killed. Threads can no longer be added.
    Terminated,
}

/// A group of threads.
pub struct Process {
    pid: AtomicUsize,
    name: String,
    parent: Option<Weak<Process>>,
    state: AtomicU8,
    threads: SpinLock<Vec<Arc<Thread>>>,
    next_tid: AtomicUsize,
    exit_status: AtomicI32,
    scheduler: Weak<Scheduler>,
    kernel: bool,
}

impl Process {
    /// Creates a process and registers it with `scheduler`.
    pub fn new<I>(scheduler: &Arc<Scheduler>, name: I, parent: Option<&Arc<Process>>) -> Arc<Self>
    where
        String: From<I>,
    {
        let process = Arc::new(Self::with(
            Arc::downgrade(scheduler),
            String::from(name),
            parent.map(Arc::downgrade),
            false,
        ));
        scheduler.add_process(&process);
        log::info!("Process {} ({}) created.", process.id(), process.name);
        process
    }

    /// The kernel process, PID 0.
    pub(crate) fn kernel(scheduler: Weak<Scheduler>) -> Arc<Self> {
        Arc::new(Self::with(scheduler, String::from("kernel"), None, true))
    }

    fn with(scheduler: Weak<Scheduler>, name: String, parent: Option<Weak<Process>>, kernel: bool) -> Self {
        Self {
            pid: AtomicUsize::new(0),
            name,
            parent,
            state: AtomicU8::new(ProcessState::Active.into()),
            threads: SpinLock::new(Vec::new()),
            next_tid: AtomicUsize::new(0),
            exit_status: AtomicI32::new(0),
            scheduler,
            kernel,
        }
    }

    /// Process id.
    pub fn id(&self) -> usize {
        self.pid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, pid: usize) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    /// Name of the process.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle state.
    pub fn state(&self) -> ProcessState {
        ProcessState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ProcessState::Terminated)
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        self.state.store(state.into(), Ordering::Release);
    }

    /// Exit status; [`ABNORMAL_EXIT`] once killed.
    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    /// The parent process, unless it is gone.
    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// The scheduler that registered this process, unless it is gone.
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.upgrade()
    }

    /// Adds `th` and returns its new thread id.
    pub fn add_thread(&self, th: &Arc<Thread>) -> usize {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        th.set_id(tid);
        let mut threads = self.threads.lock();
        threads.push(th.clone());
        threads.unlock();
        tid
    }

    /// Removes `th` and returns the number of threads left.
    pub fn remove_thread(&self, th: &Arc<Thread>) -> usize {
        match self.take_thread(th) {
            Some(left) => left,
            None => {
                log::warn!("Thread {} is not a member of process {}.", th.id(), self.id());
                self.get_num_threads()
            }
        }
    }

    /// Removes `th` if it is a member; returns the number of threads left.
    pub(crate) fn take_thread(&self, th: &Arc<Thread>) -> Option<usize> {
        let mut threads = self.threads.lock();
        let position = threads.iter().position(|member| Arc::ptr_eq(member, th));
        let left = position.map(|i| {
            threads.remove(i);
            threads.len()
        });
        threads.unlock();
        left
    }

    /// Number of member threads.
    pub fn get_num_threads(&self) -> usize {
        let threads = self.threads.lock();
        let count = threads.len();
        threads.unlock();
        count
    }

    /// The `n`-th member thread, in order of addition.
    pub fn get_thread(&self, n: usize) -> Option<Arc<Thread>> {
        let threads = self.threads.lock();
        let th = threads.get(n).cloned();
        let count = threads.len();
        threads.unlock();
        if th.is_none() {
            log::warn!("Process {} has no thread #{} ({} threads).", self.id(), n, count);
        }
        th
    }

    /// The member threads.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        let threads = self.threads.lock();
        let members = threads.iter().cloned().collect();
        threads.unlock();
        members
    }

    /// Kills the process.
    ///
    /// Every other member thread is asked to exit and interrupted, so its
    /// blocking wait ends with
    /// [`WaitError::ThreadTerminating`](crate::sync::WaitError::ThreadTerminating).
    /// If the caller is a member, it exits right away. The kernel process
    /// cannot be killed.
    pub fn kill(&self) {
        if self.kernel {
            log::warn!("The kernel process cannot be killed.");
            return;
        }
        if self
            .state
            .compare_exchange(
                ProcessState::Active.into(),
                ProcessState::Terminating.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        log::info!("Killing process {} ({}).", self.id(), self.name);
        self.exit_status.store(ABNORMAL_EXIT, Ordering::Release);

        let current = Current::get();
        let mut member = false;
        for th in self.threads() {
            if current.as_ref().is_some_and(|current| Arc::ptr_eq(current, &th)) {
                member = true;
                continue;
            }
            th.set_unwind_state(UnwindState::Exit);
            th.interrupt();
        }
        self.set_state(ProcessState::Terminated);
        if member {
            drop(current);
            Current::exit(ABNORMAL_EXIT);
        }
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.id())
            .field("name", &self.name)
            .field("state", &self.state())
            .field("threads", &self.get_num_threads())
            .finish()
    }
}

//! Deferred reclamation.
//!
//! An exiting thread cannot tear itself down: it still runs on its own
//! stack and holds the locks of the exit path. It is handed to the
//! [`ZombieQueue`] instead, whose worker thread later removes it from the
//! scheduler and from its process. Processes whose last thread is gone take
//! the same route.
use crate::{
    process::{Process, ProcessState},
    scheduler::Scheduler,
    sync::Semaphore,
    thread::{Thread, ThreadStatus},
};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use crossbeam_queue::SegQueue;

/// A reclamation request.
#[derive(Debug)]
pub enum Zombie {
    /// A process without live threads.
    Process(Arc<Process>),
    /// A detached thread that exited.
    Thread(Arc<Thread>),
}

/// A FIFO of reclamation requests and the state of its worker.
pub struct ZombieQueue {
    queue: SegQueue<Zombie>,
    available: Semaphore,
    stopping: AtomicBool,
}

impl ZombieQueue {
    pub(crate) const fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            available: Semaphore::new(0, false),
            stopping: AtomicBool::new(false),
        }
    }

    /// Queues `process` for removal. Never sleeps.
    pub fn add_process(&self, process: Arc<Process>) {
        self.push(Zombie::Process(process));
    }

    /// Queues `th` for removal. Never sleeps.
    pub fn add_thread(&self, th: Arc<Thread>) {
        self.push(Zombie::Thread(th));
    }

    /// Number of requests waiting for the worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Asks the worker to stop once the queue is empty.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.available.release(1);
    }

    fn push(&self, zombie: Zombie) {
        self.queue.push(zombie);
        self.available.release(1);
    }

    /// Body of the worker thread.
    pub(crate) fn run(&self, scheduler: &Scheduler) {
        log::debug!("Zombie reaper started.");
        loop {
            if self.available.acquire(1, 0).is_err() {
                break;
            }
            match self.queue.pop() {
                Some(zombie) => self.reap(scheduler, zombie),
                None if self.stopping.load(Ordering::Acquire) => break,
                None => (),
            }
        }
        log::debug!("Zombie reaper stopped.");
    }

    /// Reaps everything that is queued, on the calling thread.
    pub(crate) fn drain(&self, scheduler: &Scheduler) {
        while let Some(zombie) = self.queue.pop() {
            self.reap(scheduler, zombie);
        }
    }

    fn reap(&self, scheduler: &Scheduler, zombie: Zombie) {
        match zombie {
            Zombie::Thread(th) => scheduler.reap_thread(&th),
            Zombie::Process(process) => {
                for th in process.threads() {
                    if th.status() == ThreadStatus::Zombie {
                        scheduler.forget_thread(&th);
                        process.take_thread(&th);
                    }
                }
                match process.get_num_threads() {
                    0 => {
                        process.set_state(ProcessState::Terminated);
                        scheduler.remove_process(&process);
                    }
                    left => log::debug!(
                        "Process {} still has {} thread(s); not reaped.",
                        process.id(),
                        left
                    ),
                }
            }
        }
    }
}

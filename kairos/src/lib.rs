//! # Kairos: the scheduling core of a monolithic kernel
//!
//! **Kairos** is the part of a kernel that decides *who runs next* and keeps
//! the threads that share a machine from stepping on each other. It contains:
//!
//! - the [`Thread`] and [`Process`] lifecycle,
//! - a [`PerProcessorScheduler`] for every processor, coordinated by one
//!   [`Scheduler`],
//! - the [`ZombieQueue`] that reclaims dead threads and processes,
//! - the low-level mutual exclusion primitives in [`sync`]: the
//!   [`RawSpinlock`], a sleeping [`Semaphore`] and [`Mutex`], and the
//!   [`ConditionVariable`].
//!
//! Everything that touches the machine (interrupt flag, processor identity,
//! alarms, the context switch) goes through the [`abyss`] crate, whose backend
//! is chosen at build time. With the default `hosted` backend every kernel
//! thread is a host thread, so the whole core runs under `cargo test`.
//!
//! ## Getting Started
//!
//! ```ignore
//! let config = SystemConfigurationBuilder::new().cpus(2).build()?;
//! let scheduler = Scheduler::initialise(config)?;
//!
//! let handle = ThreadBuilder::new("worker").spawn(|| 42)?;
//! assert_eq!(handle.join(), Ok(42));
//!
//! scheduler.shutdown();
//! ```
//!
//! The context that calls [`Scheduler::initialise`] is adopted as the *boot
//! thread* of processor 0, and must be the one that calls
//! [`Scheduler::shutdown`].
//!
//! ## Locking rules
//!
//! Spinlocks disable the interrupts of their holder and must never be held
//! across a sleep, except the one lock that [`PerProcessorScheduler::sleep`]
//! hands over. When several locks are needed they are taken in this order:
//!
//! 1. waiter lists of [`ConditionVariable`] and [`Semaphore`],
//! 2. the lock of a joined thread, then the lock of its joiner,
//! 3. the lock of a thread,
//! 4. the thread registry of the [`Scheduler`],
//! 5. the ready queues of a [`PerProcessorScheduler`].
//!
//! [`Thread`]: thread::Thread
//! [`Process`]: process::Process
//! [`PerProcessorScheduler`]: scheduler::PerProcessorScheduler
//! [`PerProcessorScheduler::sleep`]: scheduler::PerProcessorScheduler::sleep
//! [`Scheduler`]: scheduler::Scheduler
//! [`Scheduler::initialise`]: scheduler::Scheduler::initialise
//! [`Scheduler::shutdown`]: scheduler::Scheduler::shutdown
//! [`ZombieQueue`]: zombie::ZombieQueue
//! [`RawSpinlock`]: sync::RawSpinlock
//! [`Semaphore`]: sync::Semaphore
//! [`Mutex`]: sync::Mutex
//! [`ConditionVariable`]: sync::ConditionVariable

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate abyss;
extern crate alloc;

mod lang;

pub mod process;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod time;
pub mod zombie;

pub use abyss::{MAX_CPU, print, println};
pub use lang::panicking::{AbortReason, abort_kernel};

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by the kernel operation.
/// Each variant corresponds to a specific type of error that might
/// occur during the handling of a kernel operation. The errno-style value of
/// the last error of a thread is kept in the thread, see
/// [`Thread::errno`](thread::Thread::errno).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such thread. (ESRCH)
    NoSuchThread,
    /// Interrupted while waiting. (EINTR)
    Interrupted,
    /// No such process. (ECHILD)
    NoSuchProcess,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Waiting would never end. (EDEADLK)
    Deadlock,
    /// The kernel is shutting down. (ESHUTDOWN)
    ShuttingDown,
    /// Timed out while waiting. (ETIMEDOUT)
    TimedOut,
    /// The waiting thread is being terminated. (ECANCELED)
    ThreadTerminating,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchThread => -3,
            KernelError::Interrupted => -4,
            KernelError::NoSuchProcess => -10,
            KernelError::NoMemory => -12,
            KernelError::Busy => -16,
            KernelError::InvalidArgument => -22,
            KernelError::Deadlock => -35,
            KernelError::ShuttingDown => -108,
            KernelError::TimedOut => -110,
            KernelError::ThreadTerminating => -125,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -3 => Ok(Self::NoSuchThread),
            -4 => Ok(Self::Interrupted),
            -10 => Ok(Self::NoSuchProcess),
            -12 => Ok(Self::NoMemory),
            -16 => Ok(Self::Busy),
            -22 => Ok(Self::InvalidArgument),
            -35 => Ok(Self::Deadlock),
            -108 => Ok(Self::ShuttingDown),
            -110 => Ok(Self::TimedOut),
            -125 => Ok(Self::ThreadTerminating),
            e => Err(TryFromError { e }),
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// System-wide settings fixed at [`Scheduler::initialise`].
///
/// Created by [`SystemConfigurationBuilder::build`].
///
/// [`Scheduler::initialise`]: scheduler::Scheduler::initialise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfiguration {
    cpus: usize,
    priority_bands: usize,
    quantum_ns: u64,
    stack_size: usize,
    log_level: log::LevelFilter,
}

impl SystemConfiguration {
    /// Number of processors.
    pub fn cpus(&self) -> usize {
        self.cpus
    }

    /// Number of priority bands of the ready queues.
    pub fn priority_bands(&self) -> usize {
        self.priority_bands
    }

    /// Length of a time slice in nanoseconds.
    pub fn quantum_ns(&self) -> u64 {
        self.quantum_ns
    }

    /// Default kernel stack size of a new thread.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Maximum level of the kernel log.
    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level
    }
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            cpus: 1,
            priority_bands: 4,
            quantum_ns: 5_000_000,
            stack_size: thread::STACK_SIZE,
            log_level: log::LevelFilter::Info,
        }
    }
}

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring various system-wide settings before initialization.
/// Every setter only records the value; [`SystemConfigurationBuilder::build`]
/// validates all of them at once.
#[derive(Debug, Default)]
pub struct SystemConfigurationBuilder {
    conf: SystemConfiguration,
}

impl SystemConfigurationBuilder {
    /// Starts from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of processors, `1..=MAX_CPU`.
    pub fn cpus(mut self, cpus: usize) -> Self {
        self.conf.cpus = cpus;
        self
    }

    /// Sets the number of priority bands. Priority 0 is the highest.
    pub fn priority_bands(mut self, bands: usize) -> Self {
        self.conf.priority_bands = bands;
        self
    }

    /// Sets the length of a time slice.
    pub fn quantum_ns(mut self, quantum_ns: u64) -> Self {
        self.conf.quantum_ns = quantum_ns;
        self
    }

    /// Sets the default kernel stack size.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.conf.stack_size = stack_size;
        self
    }

    /// Sets the maximum level of the kernel log.
    pub fn log_level(mut self, level: log::LevelFilter) -> Self {
        self.conf.log_level = level;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] if the processor count is outside
    /// `1..=MAX_CPU`, if there is no priority band, or if the quantum or the
    /// stack size is zero.
    pub fn build(self) -> Result<SystemConfiguration, KernelError> {
        let conf = self.conf;
        if conf.cpus == 0 || conf.cpus > MAX_CPU {
            log::warn!("Invalid processor count: {} (1..={})", conf.cpus, MAX_CPU);
            return Err(KernelError::InvalidArgument);
        }
        if conf.priority_bands == 0 || conf.quantum_ns == 0 || conf.stack_size == 0 {
            log::warn!("Invalid system configuration: {:?}", conf);
            return Err(KernelError::InvalidArgument);
        }
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        for e in [
            KernelError::Interrupted,
            KernelError::TimedOut,
            KernelError::ThreadTerminating,
            KernelError::NoSuchProcess,
        ] {
            assert_eq!(KernelError::try_from(e.into_usize() as isize), Ok(e));
        }
        assert_eq!(KernelError::try_from(-2), Err(TryFromError { e: -2 }));
    }

    #[test]
    fn configuration_is_validated() {
        assert_eq!(
            SystemConfigurationBuilder::new().cpus(0).build(),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            SystemConfigurationBuilder::new().cpus(MAX_CPU + 1).build(),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            SystemConfigurationBuilder::new().priority_bands(0).build(),
            Err(KernelError::InvalidArgument)
        );
        let conf = SystemConfigurationBuilder::new()
            .cpus(MAX_CPU)
            .priority_bands(2)
            .build()
            .unwrap();
        assert_eq!(conf.cpus(), MAX_CPU);
        assert_eq!(conf.priority_bands(), 2);
        assert_eq!(conf.quantum_ns(), 5_000_000);
    }
}

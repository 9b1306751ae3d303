mod common;

use common::{boot, boot_with, wait_until};
use kairos::{
    KernelError, SystemConfigurationBuilder,
    sync::SpinLock,
    thread::{ABNORMAL_EXIT, ContextLevel, Current, ThreadBuilder, ThreadStatus},
    time,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

#[test]
fn join_returns_exit_code() {
    let scheduler = boot(2);
    let handle = ThreadBuilder::new("answer").spawn(|| 42).unwrap();
    let th = handle.thread().clone();

    assert_eq!(handle.join(), Ok(42));
    assert_eq!(th.status(), ThreadStatus::Zombie);
    assert!(!scheduler.thread_in_schedule(&th));
    assert!(th.process().is_some_and(|p| p.threads().iter().all(|m| !Arc::ptr_eq(m, &th))));
    scheduler.shutdown().unwrap();
}

#[test]
fn spawn_needs_a_kernel_thread() {
    assert!(Current::get().is_none());
    assert!(matches!(
        ThreadBuilder::new("orphan").spawn(|| 0),
        Err(KernelError::OperationNotPermitted)
    ));
}

#[test]
fn spawn_rejects_an_unknown_processor() {
    let scheduler = boot(2);
    assert!(matches!(
        ThreadBuilder::new("lost").cpu(2).spawn(|| 0),
        Err(KernelError::InvalidArgument)
    ));
    scheduler.shutdown().unwrap();
}

#[test]
fn detached_threads_are_reaped() {
    let scheduler = boot(2);
    let kernel = scheduler.kernel_process();
    // The boot thread and the zombie reaper.
    assert_eq!(kernel.get_num_threads(), 2);

    for i in 0..8 {
        ThreadBuilder::new(format!("detached{i}"))
            .detached()
            .spawn(move || i)
            .unwrap();
    }
    ThreadBuilder::new("dropped").spawn(|| 0).unwrap().detach();
    drop(ThreadBuilder::new("forgotten").spawn(|| 0).unwrap());

    wait_until(|| kernel.get_num_threads() == 2);
    assert_eq!(scheduler.zombies().pending(), 0);
    scheduler.shutdown().unwrap();
}

#[test]
fn panicking_thread_exits_abnormally() {
    let scheduler = boot(1);
    let handle = ThreadBuilder::new("doomed")
        .spawn(|| panic!("on purpose"))
        .unwrap();
    assert_eq!(handle.join(), Ok(ABNORMAL_EXIT));
    scheduler.shutdown().unwrap();
}

#[test]
fn priority_bands_dispatch_higher_first() {
    let scheduler = boot(1);
    let order = Arc::new(SpinLock::new(Vec::new()));

    let spawn = |name: &'static str, priority| {
        let order = order.clone();
        ThreadBuilder::new(name)
            .priority(priority)
            .spawn(move || {
                order.lock().push(name);
                0
            })
            .unwrap()
    };
    let low = spawn("low", 3);
    let high = spawn("high", 0);
    assert_eq!(low.thread().priority(), 3);

    assert_eq!(low.join(), Ok(0));
    assert_eq!(high.join(), Ok(0));
    assert_eq!(*order.lock(), ["high", "low"]);
    scheduler.shutdown().unwrap();
}

#[test]
fn priority_is_clamped_to_the_bands() {
    let scheduler = boot_with(SystemConfigurationBuilder::new().priority_bands(2));
    let handle = ThreadBuilder::new("modest").priority(7).spawn(|| 0).unwrap();
    assert_eq!(handle.thread().priority(), 1);
    assert_eq!(handle.join(), Ok(0));
    scheduler.shutdown().unwrap();
}

#[test]
fn delay_sleeps() {
    let scheduler = boot(1);
    let started = Instant::now();
    time::delay(2_000_000);
    assert!(started.elapsed().as_micros() >= 2000);

    let sleeper = ThreadBuilder::new("sleeper")
        .spawn(|| {
            time::delay(1_000_000);
            0
        })
        .unwrap();
    assert_eq!(sleeper.join(), Ok(0));
    scheduler.shutdown().unwrap();
}

#[test]
fn timer_tick_rotates_after_a_quantum() {
    const QUANTUM: u64 = 1_000_000;
    let scheduler = boot_with(SystemConfigurationBuilder::new().quantum_ns(QUANTUM));
    let ran = Arc::new(AtomicBool::new(false));

    let handle = {
        let ran = ran.clone();
        ThreadBuilder::new("patient")
            .spawn(move || {
                ran.store(true, Ordering::SeqCst);
                0
            })
            .unwrap()
    };
    scheduler.timer_tick(QUANTUM / 2);
    assert!(!ran.load(Ordering::SeqCst));
    scheduler.timer_tick(QUANTUM / 2);
    assert!(ran.load(Ordering::SeqCst));

    assert_eq!(handle.join(), Ok(0));
    scheduler.shutdown().unwrap();
}

#[test]
fn interrupted_join_gives_up() {
    let scheduler = boot(2);
    let stop = Arc::new(AtomicBool::new(false));
    let sleeper = {
        let stop = stop.clone();
        ThreadBuilder::new("sleeper")
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    time::delay(100_000);
                }
                0
            })
            .unwrap()
    };
    let joiner = ThreadBuilder::new("joiner")
        .spawn(move || {
            let interrupted = sleeper.join() == Err(KernelError::Interrupted);
            let errno = Current::get().and_then(|th| th.errno());
            (interrupted && errno == Some(KernelError::Interrupted)) as i32
        })
        .unwrap();

    wait_until(|| joiner.status() == ThreadStatus::Sleeping);
    joiner.thread().interrupt();
    assert_eq!(joiner.join(), Ok(1));

    stop.store(true, Ordering::SeqCst);
    let kernel = scheduler.kernel_process();
    wait_until(|| kernel.get_num_threads() == 2);
    scheduler.shutdown().unwrap();
}

#[test]
fn shutdown_and_reinitialise() {
    let scheduler = boot(2);
    assert!(scheduler.is_running());
    scheduler.shutdown().unwrap();
    assert!(!scheduler.is_running());
    assert!(Current::get().is_none());
    assert_eq!(scheduler.shutdown(), Err(KernelError::OperationNotPermitted));

    let scheduler = boot(3);
    let handle = ThreadBuilder::new("again").cpu(2).spawn(|| 7).unwrap();
    assert_eq!(handle.join(), Ok(7));
    scheduler.shutdown().unwrap();
}

#[test]
fn initialise_twice_is_busy() {
    let scheduler = boot(1);
    let config = SystemConfigurationBuilder::new().build().unwrap();
    assert!(matches!(
        kairos::scheduler::Scheduler::initialise(config),
        Err(KernelError::Busy)
    ));
    scheduler.shutdown().unwrap();
}

#[test]
fn errno_is_per_thread() {
    let scheduler = boot(1);
    let me = Current::get().unwrap();
    me.set_errno(Some(KernelError::Busy));

    let handle = ThreadBuilder::new("errno")
        .spawn(|| {
            let th = Current::get().unwrap();
            let clean = th.errno().is_none();
            th.set_errno(Some(KernelError::InvalidArgument));
            (clean && th.errno() == Some(KernelError::InvalidArgument)) as i32
        })
        .unwrap();
    assert_eq!(handle.join(), Ok(1));
    assert_eq!(me.errno(), Some(KernelError::Busy));
    me.set_errno(None);
    scheduler.shutdown().unwrap();
}

#[test]
fn schedule_hands_off_to_a_chosen_thread() {
    let scheduler = boot(1);
    let order = Arc::new(SpinLock::new(Vec::new()));

    let spawn = |name: &'static str| {
        let order = order.clone();
        ThreadBuilder::new(name)
            .spawn(move || {
                order.lock().push(name);
                0
            })
            .unwrap()
    };
    let first = spawn("first");
    let second = spawn("second");

    let cpu0 = scheduler.processor(0).unwrap();
    cpu0.schedule(ThreadStatus::Ready, Some(second.thread().clone()), None);
    assert_eq!(second.join(), Ok(0));
    assert_eq!(first.join(), Ok(0));
    assert_eq!(*order.lock(), ["second", "first"]);
    scheduler.shutdown().unwrap();
}

#[test]
fn signal_handler_runs_on_its_own_context() {
    let scheduler = boot(1);
    let order = Arc::new(SpinLock::new(Vec::new()));

    let handle = {
        let order = order.clone();
        ThreadBuilder::new("signalled")
            .spawn(move || {
                let th = Current::get().unwrap();
                let other = {
                    let order = order.clone();
                    ThreadBuilder::new("other")
                        .spawn(move || {
                            order.lock().push("other");
                            0
                        })
                        .unwrap()
                };

                let inner = order.clone();
                let entered = Current::run_signal_handler(move || {
                    let th = Current::get().unwrap();
                    if th.context_level() != ContextLevel::SignalHandler {
                        return;
                    }
                    if Current::run_signal_handler(|| ()) != Err(KernelError::Busy) {
                        return;
                    }
                    inner.lock().push("handler");
                    // The switch saves the handler context.
                    Current::yield_now();
                    inner.lock().push("handler again");
                });
                let normal = entered.is_ok() && th.context_level() == ContextLevel::Normal;
                order.lock().push("normal");

                let survived = Current::run_signal_handler(|| panic!("in the handler")).is_ok();
                let joined = other.join() == Ok(0);
                (normal && survived && joined && !th.in_signal_handler()) as i32
            })
            .unwrap()
    };
    assert_eq!(handle.join(), Ok(1));
    assert_eq!(*order.lock(), ["handler", "other", "handler again", "normal"]);
    scheduler.shutdown().unwrap();
}

#[test]
fn exiting_inside_a_signal_handler_ends_the_thread() {
    let scheduler = boot(1);
    let resumed = Arc::new(AtomicBool::new(false));

    let handle = {
        let resumed = resumed.clone();
        ThreadBuilder::new("doomed")
            .spawn(move || {
                let _ = Current::run_signal_handler(|| Current::exit(5));
                resumed.store(true, Ordering::SeqCst);
                0
            })
            .unwrap()
    };
    assert_eq!(handle.join(), Ok(5));
    assert!(!resumed.load(Ordering::SeqCst));
    assert!(Current::get().is_some_and(|th| th.context_level() == ContextLevel::Normal));
    scheduler.shutdown().unwrap();
}

mod common;

use common::{boot, wait_until};
use kairos::{
    KernelError,
    process::{Process, ProcessState},
    sync::{ConditionVariable, Mutex, WaitError},
    thread::{ABNORMAL_EXIT, Current, ThreadBuilder, ThreadStatus},
};
use std::sync::Arc;

#[test]
fn kernel_process_comes_first() {
    let scheduler = boot(1);
    assert_eq!(scheduler.get_num_processes(), 1);

    let kernel = scheduler.get_process(0).unwrap();
    assert!(Arc::ptr_eq(&kernel, &scheduler.kernel_process()));
    assert_eq!(kernel.id(), 0);
    assert_eq!(kernel.name(), "kernel");
    assert!(kernel.parent().is_none());
    assert!(scheduler.get_process(1).is_none());

    let boot = Current::get().unwrap();
    assert!(boot.process().is_some_and(|p| Arc::ptr_eq(&p, &kernel)));
    assert_eq!(boot.id(), 0);

    kernel.kill();
    assert_eq!(kernel.state(), ProcessState::Active);
    scheduler.shutdown().unwrap();
}

#[test]
fn process_lifecycle() {
    let scheduler = boot(2);
    let kernel = scheduler.kernel_process();
    let worker = Process::new(&scheduler, "worker", Some(&kernel));
    assert_eq!(worker.id(), 1);
    assert!(worker.parent().is_some_and(|p| Arc::ptr_eq(&p, &kernel)));
    assert_eq!(scheduler.get_num_processes(), 2);
    assert!(scheduler.get_process(1).is_some_and(|p| Arc::ptr_eq(&p, &worker)));

    let handles = (0..3)
        .map(|i| {
            ThreadBuilder::new(format!("member{i}"))
                .process(&worker)
                .cpu(0)
                .spawn(move || {
                    // Children default to the process of their parent.
                    let child = ThreadBuilder::new("grandchild").spawn(|| 1).unwrap();
                    i + child.join().unwrap()
                })
                .unwrap()
        })
        .collect::<Vec<_>>();
    let tids = handles.iter().map(|h| h.thread().id()).collect::<Vec<_>>();
    assert_eq!(tids, [0, 1, 2]);

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join(), Ok(i as i32 + 1));
    }
    wait_until(|| scheduler.get_num_processes() == 1);
    assert_eq!(worker.state(), ProcessState::Terminated);
    assert_eq!(worker.get_num_threads(), 0);
    assert_eq!(worker.exit_status(), 0);
    scheduler.shutdown().unwrap();
}

#[test]
fn kill_terminates_sleeping_threads() {
    let scheduler = boot(2);
    let doomed = Process::new(&scheduler, "doomed", None);
    let mutex = Arc::new(Mutex::new(false));
    let cond = Arc::new(ConditionVariable::new());

    let waiter = {
        let (mutex, cond) = (mutex.clone(), cond.clone());
        ThreadBuilder::new("waiter")
            .process(&doomed)
            .spawn(move || {
                mutex.acquire();
                let result = cond.wait(&mutex, 10_000_000_000);
                (result == Err(WaitError::ThreadTerminating)) as i32
            })
            .unwrap()
    };
    wait_until(|| cond.waiters() == 1 && waiter.status() == ThreadStatus::Sleeping);

    doomed.kill();
    assert_eq!(doomed.state(), ProcessState::Terminated);
    assert_eq!(doomed.exit_status(), ABNORMAL_EXIT);
    assert!(matches!(
        ThreadBuilder::new("late").process(&doomed).spawn(|| 0),
        Err(KernelError::NoSuchProcess)
    ));

    assert_eq!(waiter.join(), Ok(1));
    wait_until(|| scheduler.get_num_processes() == 1);
    scheduler.shutdown().unwrap();
}

#[test]
fn kill_stops_a_busy_thread_at_its_next_tick() {
    let scheduler = boot(2);
    let doomed = Process::new(&scheduler, "spinner", None);

    let spinner = ThreadBuilder::new("spinner")
        .process(&doomed)
        .cpu(1)
        .spawn(|| {
            let Some(scheduler) = Current::get().and_then(|th| th.scheduler()) else {
                return 0;
            };
            loop {
                scheduler.timer_tick(1_000);
                std::hint::spin_loop();
            }
        })
        .unwrap();
    wait_until(|| spinner.status() == ThreadStatus::Running);

    doomed.kill();
    assert_eq!(spinner.join(), Ok(ABNORMAL_EXIT));
    wait_until(|| scheduler.get_num_processes() == 1);
    scheduler.shutdown().unwrap();
}

#[test]
fn killing_the_own_process_exits() {
    let scheduler = boot(1);
    let doomed = Process::new(&scheduler, "suicidal", None);

    let handle = {
        let doomed = doomed.clone();
        ThreadBuilder::new("suicidal")
            .process(&doomed)
            .spawn(move || {
                doomed.kill();
                0
            })
            .unwrap()
    };
    assert_eq!(handle.join(), Ok(ABNORMAL_EXIT));
    assert_eq!(doomed.state(), ProcessState::Terminated);
    scheduler.shutdown().unwrap();
}

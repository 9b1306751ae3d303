mod common;

use common::{boot, wait_until};
use kairos::{
    scheduler::ProgressOracle,
    sync::{RawSpinlock, SpinLock},
    thread::{Current, ThreadBuilder},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

#[test]
fn mutual_exclusion() {
    const ROUNDS: usize = 1000;
    let scheduler = boot(4);
    let counter = Arc::new(SpinLock::new(0usize));

    let workers = (0..4)
        .map(|cpu| {
            let counter = counter.clone();
            ThreadBuilder::new(format!("adder{cpu}"))
                .cpu(cpu)
                .spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut guard = counter.lock();
                        let seen = *guard;
                        std::hint::spin_loop();
                        *guard = seen + 1;
                        guard.unlock();
                        if rand::random::<u8>() % 8 == 0 {
                            Current::yield_now();
                        }
                    }
                    0
                })
                .unwrap()
        })
        .collect::<Vec<_>>();
    for worker in workers {
        assert_eq!(worker.join(), Ok(0));
    }

    assert_eq!(*counter.lock(), 4 * ROUNDS);
    assert!(!counter.raw().acquired());
    scheduler.shutdown().unwrap();
}

#[test]
#[should_panic(expected = "deadlock")]
fn holder_switched_out_on_the_same_processor() {
    let _scheduler = boot(1);
    let lock = Arc::new(SpinLock::new(()));

    let leaker = {
        let lock = lock.clone();
        ThreadBuilder::new("leaker")
            .spawn(move || {
                lock.lock().into_raw();
                0
            })
            .unwrap()
    };
    leaker.join().unwrap();
    assert!(lock.raw().acquired());
    assert_eq!(lock.raw().owner_cpu(), Some(0));

    let _guard = lock.lock();
}

#[test]
fn unwind_recovers_a_lock_of_a_dead_thread() {
    let scheduler = boot(1);
    let lock = Arc::new(SpinLock::new(7));

    let leaker = {
        let lock = lock.clone();
        ThreadBuilder::new("leaker")
            .spawn(move || {
                lock.lock().into_raw();
                0
            })
            .unwrap()
    };
    leaker.join().unwrap();

    lock.raw().unwind();
    assert!(!lock.raw().acquired());
    assert_eq!(*lock.lock(), 7);
    scheduler.shutdown().unwrap();
}

struct Hopeless;

impl ProgressOracle for Hopeless {
    fn can_progress(&self, _owner_cpu: usize) -> bool {
        false
    }
}

static HOPELESS: Hopeless = Hopeless;

/// Lets the holder go once the test is over, even if it panicked.
struct LetGo(Arc<AtomicBool>);

impl Drop for LetGo {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
#[should_panic(expected = "deadlock")]
fn stuck_holder_is_reported_by_the_oracle() {
    let scheduler = boot(2);
    scheduler.set_progress_oracle(Some(&HOPELESS));
    let lock = Arc::new(RawSpinlock::with_retry_limit(false, 64));
    let held = Arc::new(AtomicBool::new(false));
    let let_go = LetGo(Arc::new(AtomicBool::new(false)));

    {
        let (lock, held, done) = (lock.clone(), held.clone(), let_go.0.clone());
        ThreadBuilder::new("holder")
            .cpu(1)
            .spawn(move || {
                lock.acquire();
                held.store(true, Ordering::SeqCst);
                while !done.load(Ordering::SeqCst) {
                    std::hint::spin_loop();
                }
                lock.release();
                0
            })
            .unwrap();
    }
    wait_until(|| held.load(Ordering::SeqCst));

    lock.acquire();
}

#[test]
fn try_lock_fails_while_held_elsewhere() {
    let scheduler = boot(2);
    let lock = Arc::new(SpinLock::new(0));
    let asked = Arc::new(AtomicBool::new(false));
    let guard = lock.lock();

    let asker = {
        let (lock, asked) = (lock.clone(), asked.clone());
        ThreadBuilder::new("asker")
            .cpu(1)
            .spawn(move || {
                let blocked = lock.try_lock().is_err();
                asked.store(true, Ordering::SeqCst);
                blocked as i32
            })
            .unwrap()
    };
    // Holding a spinlock: spin, never yield.
    while !asked.load(Ordering::SeqCst) {
        std::hint::spin_loop();
    }
    guard.unlock();

    assert_eq!(asker.join(), Ok(1));
    assert!(lock.try_lock().is_ok());
    scheduler.shutdown().unwrap();
}

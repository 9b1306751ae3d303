mod common;

use common::{boot, wait_until};
use kairos::{
    sync::{ConditionVariable, Mutex, SpinLock, WaitError},
    thread::{JoinHandle, ThreadBuilder},
    time,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

struct Monitor {
    mutex: Mutex,
    cond: ConditionVariable,
}

fn monitor() -> Arc<Monitor> {
    Arc::new(Monitor {
        mutex: Mutex::new(false),
        cond: ConditionVariable::new(),
    })
}

fn waiter(monitor: &Arc<Monitor>, timeout_ns: u64, f: impl FnOnce(Result<(), WaitError>, &Monitor) -> i32 + Send + 'static) -> JoinHandle {
    let monitor = monitor.clone();
    ThreadBuilder::new("waiter")
        .spawn(move || {
            monitor.mutex.acquire();
            let result = monitor.cond.wait(&monitor.mutex, timeout_ns);
            f(result, &monitor)
        })
        .unwrap()
}

#[test]
fn signal_wakes_in_fifo_order() {
    let scheduler = boot(1);
    let monitor = monitor();
    let order = Arc::new(SpinLock::new(Vec::new()));

    let waiters = (0..4)
        .map(|i| {
            let order = order.clone();
            waiter(&monitor, 0, move |result, monitor| {
                assert_eq!(result, Ok(()));
                order.lock().push(i);
                monitor.mutex.release();
                0
            })
        })
        .collect::<Vec<_>>();
    wait_until(|| monitor.cond.waiters() == 4);

    for _ in 0..4 {
        monitor.cond.signal();
    }
    for waiter in waiters {
        assert_eq!(waiter.join(), Ok(0));
    }
    assert_eq!(*order.lock(), [0, 1, 2, 3]);
    scheduler.shutdown().unwrap();
}

#[test]
fn timed_wait_times_out() {
    let scheduler = boot(1);
    let monitor = monitor();
    let started = Instant::now();

    let waiter = waiter(&monitor, 5_000_000, |result, monitor| {
        (result == Err(WaitError::TimedOut) && !monitor.mutex.is_locked()) as i32
    });
    assert_eq!(waiter.join(), Ok(1));
    assert!(started.elapsed().as_millis() >= 5);
    assert_eq!(monitor.cond.waiters(), 0);
    scheduler.shutdown().unwrap();
}

#[test]
fn signal_beats_the_timeout() {
    let scheduler = boot(1);
    let monitor = monitor();
    let started = Instant::now();

    let waiter = waiter(&monitor, 1_000_000_000, |result, monitor| {
        let locked = monitor.mutex.is_locked();
        monitor.mutex.release();
        (result.is_ok() && locked) as i32
    });
    wait_until(|| monitor.cond.waiters() == 1);
    monitor.mutex.acquire();
    monitor.cond.signal();
    monitor.mutex.release();

    assert_eq!(waiter.join(), Ok(1));
    assert!(started.elapsed().as_millis() < 1000);
    scheduler.shutdown().unwrap();
}

#[test]
fn wait_needs_a_locked_mutex() {
    let scheduler = boot(1);
    let monitor = monitor();

    assert_eq!(
        monitor.cond.wait(&monitor.mutex, 0),
        Err(WaitError::MutexNotLocked)
    );
    assert_eq!(monitor.cond.waiters(), 0);
    assert!(!monitor.mutex.is_locked());
    scheduler.shutdown().unwrap();
}

#[test]
fn broadcast_queues_every_waiter_once() {
    let scheduler = boot(1);
    let monitor = monitor();

    let waiters = (0..3)
        .map(|_| {
            waiter(&monitor, 0, |result, monitor| {
                monitor.mutex.release();
                result.is_ok() as i32
            })
        })
        .collect::<Vec<_>>();
    wait_until(|| monitor.cond.waiters() == 3);

    let cpu0 = scheduler.processor(0).unwrap();
    monitor.cond.broadcast();
    monitor.cond.broadcast();
    assert_eq!(monitor.cond.waiters(), 0);
    assert_eq!(cpu0.ready_count(), 3);

    for waiter in waiters {
        assert_eq!(waiter.join(), Ok(1));
    }
    assert_eq!(cpu0.ready_count(), 0);
    scheduler.shutdown().unwrap();
}

#[test]
fn interrupt_ends_a_timed_wait() {
    let scheduler = boot(1);
    let monitor = monitor();
    let started = Instant::now();

    let waiter = waiter(&monitor, 500_000_000, |result, monitor| {
        (result == Err(WaitError::Interrupted) && !monitor.mutex.is_locked()) as i32
    });
    wait_until(|| monitor.cond.waiters() == 1);
    time::delay(1_000_000);
    waiter.thread().interrupt();

    assert_eq!(waiter.join(), Ok(1));
    assert!(started.elapsed().as_millis() < 500);
    scheduler.shutdown().unwrap();
}

#[test]
fn interrupt_cuts_a_short_timeout_short() {
    let scheduler = boot(1);
    let monitor = monitor();

    let waiter = {
        let monitor = monitor.clone();
        ThreadBuilder::new("waiter")
            .spawn(move || {
                monitor.mutex.acquire();
                let started = Instant::now();
                let result = monitor.cond.wait(&monitor.mutex, 5_000_000);
                let early = started.elapsed().as_micros() < 5_000;
                (result == Err(WaitError::Interrupted) && early) as i32
            })
            .unwrap()
    };
    wait_until(|| monitor.cond.waiters() == 1);
    time::delay(1_000_000);
    waiter.thread().interrupt();

    assert_eq!(waiter.join(), Ok(1));
    assert_eq!(monitor.cond.waiters(), 0);
    scheduler.shutdown().unwrap();
}

#[test]
fn counter_under_a_mutex() {
    const THREADS: usize = 4;
    const INCREMENTS: usize = 1000;
    let scheduler = boot(THREADS);
    let monitor = monitor();
    let counter = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let workers = (0..THREADS)
        .map(|cpu| {
            let (monitor, counter, finished) = (monitor.clone(), counter.clone(), finished.clone());
            ThreadBuilder::new(format!("counter{cpu}"))
                .cpu(cpu)
                .spawn(move || {
                    for _ in 0..INCREMENTS {
                        monitor.mutex.acquire();
                        // A torn update shows up as a lost increment.
                        let value = counter.load(Ordering::Relaxed);
                        std::hint::spin_loop();
                        counter.store(value + 1, Ordering::Relaxed);
                        monitor.mutex.release();
                    }
                    monitor.mutex.acquire();
                    finished.fetch_add(1, Ordering::SeqCst);
                    monitor.cond.signal();
                    monitor.mutex.release();
                    0
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    monitor.mutex.acquire();
    while finished.load(Ordering::SeqCst) != THREADS {
        monitor.cond.wait(&monitor.mutex, 0).unwrap();
    }
    monitor.mutex.release();
    assert_eq!(counter.load(Ordering::SeqCst), THREADS * INCREMENTS);

    for worker in workers {
        assert_eq!(worker.join(), Ok(0));
    }
    scheduler.shutdown().unwrap();
}

const CAPACITY: usize = 2;
const ITEMS: usize = 200;

struct BoundedBuffer {
    mutex: Mutex,
    items: SpinLock<VecDeque<usize>>,
    not_full: ConditionVariable,
    not_empty: ConditionVariable,
}

impl BoundedBuffer {
    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn put(&self, item: usize) {
        self.mutex.acquire();
        while self.len() == CAPACITY {
            self.not_full.wait(&self.mutex, 0).unwrap();
        }
        self.items.lock().push_back(item);
        self.not_empty.signal();
        self.mutex.release();
    }

    fn get(&self) -> usize {
        self.mutex.acquire();
        while self.len() == 0 {
            self.not_empty.wait(&self.mutex, 0).unwrap();
        }
        let item = self.items.lock().pop_front().unwrap();
        self.not_full.signal();
        self.mutex.release();
        item
    }
}

#[test]
fn bounded_buffer() {
    let scheduler = boot(2);
    let buffer = Arc::new(BoundedBuffer {
        mutex: Mutex::new(false),
        items: SpinLock::new(VecDeque::new()),
        not_full: ConditionVariable::new(),
        not_empty: ConditionVariable::new(),
    });
    let output = Arc::new(SpinLock::new(Vec::new()));

    let consumer = {
        let (buffer, output) = (buffer.clone(), output.clone());
        ThreadBuilder::new("consumer")
            .cpu(1)
            .spawn(move || {
                for _ in 0..ITEMS {
                    let item = buffer.get();
                    output.lock().push(item);
                }
                0
            })
            .unwrap()
    };
    let producer = {
        let buffer = buffer.clone();
        ThreadBuilder::new("producer")
            .cpu(0)
            .spawn(move || {
                for i in 0..ITEMS {
                    buffer.put(i);
                }
                0
            })
            .unwrap()
    };

    assert_eq!(producer.join(), Ok(0));
    assert_eq!(consumer.join(), Ok(0));
    assert_eq!(*output.lock(), (0..ITEMS).collect::<Vec<_>>());
    scheduler.shutdown().unwrap();
}

//! Round robin with priority bands.
//!
//! Every processor keeps one FIFO run queue per priority band. [`next`]
//! always serves the highest non-empty band (priority 0 first); threads of the
//! same band take turns in arrival order.
//!
//! A thread is queued at most once. The [`ThreadFlags::QUEUED`] bit is only
//! changed with the run queues locked, so a wakeup that races with a yield
//! cannot put the same thread in the queue twice.
//!
//! [`next`]: SchedulingAlgorithm::next
use super::SchedulingAlgorithm;
use crate::{
    sync::SpinLock,
    thread::{Thread, ThreadFlags, ThreadStatus},
};
use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

/// A round robin scheduling algorithm.
pub struct RoundRobin {
    run_queues: SpinLock<Vec<VecDeque<Arc<Thread>>>>,
}

impl RoundRobin {
    /// Creates a round robin with `bands` priority bands.
    pub fn new(bands: usize) -> Self {
        Self {
            run_queues: SpinLock::new((0..bands.max(1)).map(|_| VecDeque::new()).collect()),
        }
    }

    fn enqueue(&self, th: &Arc<Thread>) {
        let mut run_queues = self.run_queues.lock();
        if !th.flags().contains(ThreadFlags::QUEUED) {
            th.insert_flags(ThreadFlags::QUEUED);
            let band = th.priority().min(run_queues.len() - 1);
            run_queues[band].push_back(th.clone());
        }
        run_queues.unlock();
    }

    fn dequeue(&self, th: &Arc<Thread>) {
        let mut run_queues = self.run_queues.lock();
        if th.take_flags(ThreadFlags::QUEUED) {
            for queue in run_queues.iter_mut() {
                queue.retain(|queued| !Arc::ptr_eq(queued, th));
            }
        }
        run_queues.unlock();
    }
}

impl SchedulingAlgorithm for RoundRobin {
    fn add_thread(&self, th: &Arc<Thread>) {
        if th.status() == ThreadStatus::Ready {
            self.enqueue(th);
        }
    }

    fn remove_thread(&self, th: &Arc<Thread>) {
        self.dequeue(th);
    }

    fn thread_status_changed(&self, th: &Arc<Thread>) {
        if th.status() == ThreadStatus::Ready {
            self.enqueue(th);
        } else {
            self.dequeue(th);
        }
    }

    fn next(&self) -> Option<Arc<Thread>> {
        let mut run_queues = self.run_queues.lock();
        let next = run_queues
            .iter_mut()
            .find_map(|queue| queue.pop_front())
            .inspect(|th| {
                th.take_flags(ThreadFlags::QUEUED);
            });
        run_queues.unlock();
        next
    }

    fn ready_count(&self) -> usize {
        let run_queues = self.run_queues.lock();
        let count = run_queues.iter().map(VecDeque::len).sum();
        run_queues.unlock();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::STACK_SIZE;
    use alloc::{string::String, sync::Weak};

    fn thread(name: &str, priority: usize) -> Arc<Thread> {
        Thread::new(
            String::from(name),
            Weak::new(),
            Weak::new(),
            ThreadStatus::Ready,
            ThreadFlags::empty(),
            priority,
            None,
            STACK_SIZE,
        )
    }

    #[test]
    fn higher_band_first() {
        let rr = RoundRobin::new(4);
        let low = thread("low", 3);
        let high = thread("high", 0);
        let mid = thread("mid", 1);
        for th in [&low, &high, &mid] {
            rr.add_thread(th);
        }
        let order = core::iter::from_fn(|| rr.next())
            .map(|th| String::from(th.name()))
            .collect::<Vec<_>>();
        assert_eq!(order, ["high", "mid", "low"]);
    }

    #[test]
    fn fifo_within_band() {
        let rr = RoundRobin::new(2);
        let threads = (0..4).map(|_| thread("t", 1)).collect::<Vec<_>>();
        threads.iter().for_each(|th| rr.add_thread(th));
        for th in threads.iter() {
            assert!(Arc::ptr_eq(&rr.next().unwrap(), th));
        }
        assert!(rr.next().is_none());
    }

    #[test]
    fn no_double_enqueue() {
        let rr = RoundRobin::new(1);
        let th = thread("t", 0);
        rr.add_thread(&th);
        rr.thread_status_changed(&th);
        rr.thread_status_changed(&th);
        assert_eq!(rr.ready_count(), 1);

        th.set_status(ThreadStatus::Sleeping);
        rr.thread_status_changed(&th);
        assert_eq!(rr.ready_count(), 0);
        assert!(!th.flags().contains(ThreadFlags::QUEUED));
    }

    #[test]
    fn out_of_range_priority_lands_in_last_band() {
        let rr = RoundRobin::new(2);
        let th = thread("t", 7);
        rr.add_thread(&th);
        rr.remove_thread(&th);
        assert_eq!(rr.ready_count(), 0);
        rr.add_thread(&th);
        assert!(Arc::ptr_eq(&rr.next().unwrap(), &th));
    }
}

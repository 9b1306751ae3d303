use crate::{Machine, Platform};
use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

type Callback = Box<dyn FnOnce() + Send>;

/// Handle to an armed alarm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlarmHandle {
    deadline: u64,
    id: u64,
}

#[derive(Default)]
struct State {
    alarms: BTreeMap<(u64, u64), Callback>,
    next_id: u64,
    firing: Option<u64>,
    running: bool,
}

struct Timer {
    state: Mutex<State>,
    cv: Condvar,
}

static TIMER: OnceLock<Timer> = OnceLock::new();

fn timer() -> &'static Timer {
    TIMER.get_or_init(|| Timer {
        state: Mutex::new(State::default()),
        cv: Condvar::new(),
    })
}

impl Timer {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            let now = Machine::now_ns();
            let first = state.alarms.first_key_value().map(|(key, _)| *key);
            state = match first {
                None => self.cv.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some((deadline, id)) if deadline <= now => {
                    let callback = state.alarms.remove(&(deadline, id));
                    state.firing = Some(id);
                    drop(state);
                    if let Some(callback) = callback {
                        let _ = panic::catch_unwind(AssertUnwindSafe(callback));
                    }
                    let mut state = self.lock();
                    state.firing = None;
                    self.cv.notify_all();
                    state
                }
                Some((deadline, _)) => {
                    self.cv
                        .wait_timeout(state, Duration::from_nanos(deadline - now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// Runs `callback` once, `after_ns` nanoseconds from now.
pub fn arm(after_ns: u64, callback: impl FnOnce() + Send + 'static) -> AlarmHandle {
    let timer = timer();
    let mut state = timer.lock();
    if !state.running {
        state.running = true;
        // Without a timer thread alarms simply never fire.
        let _ = std::thread::Builder::new()
            .name("abyss-timer".into())
            .spawn(|| {
                self::timer().run();
            });
    }
    let id = state.next_id;
    state.next_id += 1;
    let deadline = Machine::now_ns().saturating_add(after_ns);
    state.alarms.insert((deadline, id), Box::new(callback));
    timer.cv.notify_all();
    AlarmHandle { deadline, id }
}

/// Disarms an alarm.
///
/// Returns true if the alarm had not fired yet. If its callback is running
/// right now, waits for the callback to finish, so no callback of `handle`
/// runs after this returns. Must not be called from an alarm callback.
pub fn cancel(handle: AlarmHandle) -> bool {
    let timer = timer();
    let mut state = timer.lock();
    if state.alarms.remove(&(handle.deadline, handle.id)).is_some() {
        return true;
    }
    while state.firing == Some(handle.id) {
        state = timer.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
    }
    false
}

//! Deadline-ordered timers.
//!
//! Grounded in `original_source`'s `TimerManager`/`Timer`
//! (`include/timer.h`, `src/timer.cpp`): a `BTreeMap` keyed on
//! `(deadline_ms, id)` stands in for the `std::set` ordered by
//! `(next, pointer-address)`, `id` stands in for the pointer tie-break, and
//! an injected `hook` closure stands in for `newTimerInsertAtFront`'s
//! virtual dispatch — [`crate::io::IOManager`] supplies one that tickles its
//! epoll wait.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, matching the original's `GetCurrentMS`.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the Unix epoch")
        .as_millis() as u64
}

type Callback = Arc<Mutex<dyn FnMut() + Send>>;

/// A one-shot or recurring callback scheduled on a [`TimerManager`].
///
/// `Timer` is just a handle: `cancel`/`refresh`/`reset` all act on the
/// manager's shared table through an id, the same way the original's
/// `Timer::cancel` looks itself up in `m_manager->m_timers`. Dropping a
/// `Timer` does not cancel it — the manager owns the scheduled entry
/// independent of any handle a caller kept.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    manager: TimerManager,
}

impl Timer {
    /// Cancels the timer. Returns `false` if it already fired or was
    /// already cancelled.
    pub fn cancel(&self) -> bool {
        self.manager.cancel(self.id)
    }

    /// Reschedules the timer `ms` (its original period) from now. Returns
    /// `false` if it already fired or was cancelled.
    pub fn refresh(&self) -> bool {
        self.manager.refresh(self.id)
    }

    /// Changes the timer's period to `ms`. When `from_now` is `true` the new
    /// deadline is `now + ms`; otherwise it is the timer's last deadline
    /// minus its old period, plus `ms` — preserving phase, matching the
    /// original's non-`from_now` `reset`.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        self.manager.reset(self.id, ms, from_now)
    }
}

struct Entry {
    id: u64,
    ms: u64,
    recurring: bool,
    callback: Callback,
}

#[derive(Default)]
struct State {
    timers: BTreeMap<(u64, u64), Entry>,
    index: HashMap<u64, (u64, u64)>,
    tickled: bool,
    previous_time_ms: u64,
}

struct Shared {
    state: RwLock<State>,
    hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Owns a set of scheduled timers ordered by deadline.
///
/// Cloning a `TimerManager` is cheap — it's a handle onto one shared table —
/// so an [`crate::io::IOManager`] and every fiber that adds a timer through
/// it can hold their own copy.
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    previous_time_ms: now_ms(),
                    ..Default::default()
                }),
                hook: None,
            }),
        }
    }

    /// Like [`TimerManager::new`], but `hook` runs whenever a newly added or
    /// rescheduled timer becomes the soonest pending one — the replacement
    /// for the original's `newTimerInsertAtFront` virtual method.
    pub fn with_hook(hook: Arc<dyn Fn() + Send + Sync>) -> Self {
        TimerManager {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    previous_time_ms: now_ms(),
                    ..Default::default()
                }),
                hook: Some(hook),
            }),
        }
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(ms, Arc::new(Mutex::new(cb)), recurring)
    }

    /// Like [`TimerManager::add_timer`], but the callback only runs if
    /// `weak_cond` still upgrades at fire time — the original's
    /// `addConditionTimer`, for tying a timer's effective lifetime to some
    /// other object without an explicit `cancel`.
    pub fn add_conditional_timer<F>(
        &self,
        ms: u64,
        mut cb: F,
        weak_cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if weak_cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn insert(&self, ms: u64, callback: Callback, recurring: bool) -> Timer {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let key = (now_ms() + ms, id);
        let at_front = {
            let mut state = self.shared.state.write().unwrap();
            state.timers.insert(
                key,
                Entry {
                    id,
                    ms,
                    recurring,
                    callback,
                },
            );
            state.index.insert(id, key);
            self.note_insert_at_front(&mut state, key)
        };
        if at_front {
            self.fire_hook();
        }
        Timer {
            id,
            manager: self.clone(),
        }
    }

    /// `true` the first time `key` becomes the new minimum since the last
    /// call to [`TimerManager::next_timer_ms`] — mirrors `m_tickled`, which
    /// keeps a burst of inserts-at-front from tickling the reactor more than
    /// once per wakeup.
    fn note_insert_at_front(&self, state: &mut State, key: (u64, u64)) -> bool {
        let is_front = state.timers.keys().next() == Some(&key);
        if is_front && !state.tickled {
            state.tickled = true;
            true
        } else {
            false
        }
    }

    fn fire_hook(&self) {
        if let Some(hook) = &self.shared.hook {
            hook();
        }
    }

    fn cancel(&self, id: u64) -> bool {
        let mut state = self.shared.state.write().unwrap();
        match state.index.remove(&id) {
            Some(key) => {
                state.timers.remove(&key);
                true
            }
            None => false,
        }
    }

    fn refresh(&self, id: u64) -> bool {
        let at_front = {
            let mut state = self.shared.state.write().unwrap();
            let key = match state.index.remove(&id) {
                Some(key) => key,
                None => return false,
            };
            let entry = state.timers.remove(&key).expect("index/timers out of sync");
            let new_key = (now_ms() + entry.ms, id);
            state.timers.insert(new_key, entry);
            state.index.insert(id, new_key);
            self.note_insert_at_front(&mut state, new_key)
        };
        if at_front {
            self.fire_hook();
        }
        true
    }

    fn reset(&self, id: u64, ms: u64, from_now: bool) -> bool {
        let at_front = {
            let mut state = self.shared.state.write().unwrap();
            let key = match state.index.remove(&id) {
                Some(key) => key,
                None => return false,
            };
            if ms == state.timers.get(&key).unwrap().ms && !from_now {
                state.index.insert(id, key);
                return true;
            }
            let mut entry = state.timers.remove(&key).expect("index/timers out of sync");
            let start = if from_now { now_ms() } else { key.0 - entry.ms };
            entry.ms = ms;
            let new_key = (start + ms, id);
            state.timers.insert(new_key, entry);
            state.index.insert(id, new_key);
            self.note_insert_at_front(&mut state, new_key)
        };
        if at_front {
            self.fire_hook();
        }
        true
    }

    /// Milliseconds until the soonest pending timer, or `None` if there is
    /// none — the original's `getNextTimer`, with its `~0ull` "no timers"
    /// sentinel translated to `None` and an already-due timer to `Some(0)`.
    pub fn next_timer_ms(&self) -> Option<u64> {
        let mut state = self.shared.state.write().unwrap();
        state.tickled = false;
        let (next, _) = *state.timers.keys().next()?;
        Some(next.saturating_sub(now_ms()))
    }

    /// Pops and returns every callback whose deadline has passed, requeuing
    /// recurring ones for their next period. If the wall clock has jumped
    /// backward by at least an hour since the last call, every pending
    /// timer is treated as expired, matching `detectClockRollover`.
    pub fn list_expired(&self) -> Vec<Box<dyn FnMut() + Send>> {
        let now = now_ms();
        let mut state = self.shared.state.write().unwrap();
        if state.timers.is_empty() {
            return Vec::new();
        }
        let rollover = Self::is_clock_rollover(state.previous_time_ms, now);
        state.previous_time_ms = now;
        if !rollover {
            let (front, _) = *state.timers.keys().next().unwrap();
            if front > now {
                return Vec::new();
            }
        }
        let tail = if rollover {
            BTreeMap::new()
        } else {
            state.timers.split_off(&(now + 1, 0))
        };
        let expired = std::mem::replace(&mut state.timers, tail);

        let mut callbacks = Vec::with_capacity(expired.len());
        for (_, entry) in expired {
            state.index.remove(&entry.id);
            let invoke = {
                let cb = entry.callback.clone();
                Box::new(move || {
                    (cb.lock().unwrap())();
                }) as Box<dyn FnMut() + Send>
            };
            callbacks.push(invoke);
            if entry.recurring {
                let new_key = (now + entry.ms, entry.id);
                state.index.insert(entry.id, new_key);
                state.timers.insert(new_key, entry);
            }
        }
        callbacks
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.state.read().unwrap().timers.is_empty()
    }

    /// Pure predicate behind [`TimerManager::list_expired`]'s clock-rollback
    /// handling, exposed standalone so it is directly testable without
    /// manipulating the real system clock.
    pub fn is_clock_rollover(previous_ms: u64, now_ms: u64) -> bool {
        now_ms < previous_ms && now_ms < previous_ms.saturating_sub(60 * 60 * 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fires_after_its_period_and_not_before() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        mgr.add_timer(20, move || { fired2.fetch_add(1, Ordering::SeqCst); }, false);

        assert!(mgr.list_expired().is_empty(), "should not fire immediately");
        thread::sleep(Duration::from_millis(40));
        let expired = mgr.list_expired();
        assert_eq!(expired.len(), 1);
        for mut cb in expired {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn recurring_timer_requeues_itself() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        mgr.add_timer(10, move || { count2.fetch_add(1, Ordering::SeqCst); }, true);

        thread::sleep(Duration::from_millis(20));
        for mut cb in mgr.list_expired() {
            cb();
        }
        assert!(mgr.has_timer(), "a recurring timer must still be pending");

        thread::sleep(Duration::from_millis(20));
        for mut cb in mgr.list_expired() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_prevents_firing_and_is_idempotent() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timer = mgr.add_timer(10, move || { fired2.fetch_add(1, Ordering::SeqCst); }, false);

        assert!(timer.cancel());
        assert!(!timer.cancel(), "cancelling twice should report no-op");
        thread::sleep(Duration::from_millis(20));
        assert!(mgr.list_expired().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refresh_postpones_the_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(30, || {}, false);
        thread::sleep(Duration::from_millis(20));
        assert!(timer.refresh());
        thread::sleep(Duration::from_millis(20));
        assert!(
            mgr.list_expired().is_empty(),
            "refreshed timer should not have fired yet"
        );
    }

    #[test]
    fn reset_changes_the_period() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1_000, || {}, false);
        assert!(timer.reset(10, true));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(mgr.list_expired().len(), 1);
    }

    #[test]
    fn hook_fires_once_per_front_insertion_burst() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mgr = TimerManager::with_hook(Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));

        mgr.add_timer(100, || {}, false);
        mgr.add_timer(200, || {}, false);
        mgr.add_timer(5, || {}, false);
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "tickled stays latched until next_timer_ms clears it, even across\
             repeated front insertions"
        );

        mgr.next_timer_ms();
        mgr.add_timer(1, || {}, false);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clock_rollover_is_detected_past_one_hour_back() {
        assert!(!TimerManager::is_clock_rollover(10_000, 9_000));
        assert!(!TimerManager::is_clock_rollover(10_000, 11_000));
        let one_hour = 60 * 60 * 1000;
        assert!(TimerManager::is_clock_rollover(one_hour + 10_000, 5_000));
    }

    #[test]
    fn next_timer_ms_reports_zero_when_already_due() {
        let mgr = TimerManager::new();
        mgr.add_timer(0, || {}, false);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.next_timer_ms(), Some(0));
    }

    #[test]
    fn next_timer_ms_is_none_when_empty() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer_ms(), None);
    }
}

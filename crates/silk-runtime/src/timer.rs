//! Deadline-ordered timer set
//!
//! Timers live in a `BTreeMap` keyed by `(deadline, id)` — the id breaks
//! ties so two timers with equal deadlines coexist. A nulled callback is the
//! canonical dead marker; every mutation goes through the manager's write
//! lock and callbacks run strictly outside it.
//!
//! Time is milliseconds from a process-start `Instant`, so it cannot move
//! backward; the rollover drain is kept anyway and fires everything if the
//! watermark ever regresses by more than an hour.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Instant;

/// Timer callbacks may fire repeatedly (recurring timers), so they are
/// shared `Fn` closures.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

static START: OnceLock<Instant> = OnceLock::new();
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Milliseconds since the first timer operation in this process
#[inline]
pub fn now_ms() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline_ms: u64,
    id: u64,
}

struct TimerInner {
    ms: u64,
    deadline_ms: u64,
    /// None once cancelled or fired (non-recurring)
    cb: Option<TimerCallback>,
}

/// Handle to a scheduled timer
pub struct Timer {
    id: u64,
    recurring: bool,
    /// Locked only while the owning manager's write lock is held
    inner: Mutex<TimerInner>,
    manager: Weak<TimerManager>,
}

impl Timer {
    fn key(inner: &TimerInner, id: u64) -> TimerKey {
        TimerKey {
            deadline_ms: inner.deadline_ms,
            id,
        }
    }

    /// Remove the timer and null its callback; false if already dead
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write().unwrap();
        let mut inner = self.inner.lock().unwrap();
        if inner.cb.is_none() {
            return false;
        }
        inner.cb = None;
        set.timers.remove(&Self::key(&inner, self.id));
        true
    }

    /// Push the deadline out to `now + ms` without touching the period
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut set = mgr.set.write().unwrap();
        let mut inner = self.inner.lock().unwrap();
        if inner.cb.is_none() {
            return false;
        }
        if set.timers.remove(&Self::key(&inner, self.id)).is_none() {
            return false;
        }
        inner.deadline_ms = now_ms() + inner.ms;
        let key = Self::key(&inner, self.id);
        drop(inner);
        set.timers.insert(key, self.clone());
        true
    }

    /// Change the period and reschedule
    ///
    /// The new deadline is measured from now when `from_now`, otherwise from
    /// the timer's original start point (`old deadline - old period`).
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        {
            let mut set = mgr.set.write().unwrap();
            let mut inner = self.inner.lock().unwrap();
            if inner.ms == ms && !from_now {
                return true;
            }
            if inner.cb.is_none() {
                return false;
            }
            if set.timers.remove(&Self::key(&inner, self.id)).is_none() {
                return false;
            }
            let start = if from_now {
                now_ms()
            } else {
                inner.deadline_ms.saturating_sub(inner.ms)
            };
            inner.ms = ms;
            inner.deadline_ms = start + ms;
        }
        // Reinsertion goes through the tickle path: the new deadline may be
        // the set's new minimum.
        mgr.insert(self);
        true
    }
}

struct TimerSet {
    timers: BTreeMap<TimerKey, Arc<Timer>>,
    /// One-shot front-insert latch, consumed by `next_timeout_ms`
    tickled: bool,
    /// Watermark for the rollover drain
    previous_ms: u64,
}

/// Ordered set of timers with expiry harvesting
pub struct TimerManager {
    set: RwLock<TimerSet>,
    /// Fired after an insert that became the set's minimum
    notify_front: Box<dyn Fn() + Send + Sync>,
}

impl TimerManager {
    /// Manager with no front-insert notification (standalone use, tests)
    pub fn new() -> Arc<TimerManager> {
        Self::with_notify(|| {})
    }

    /// Manager whose front inserts fire `notify` (the reactor's tickle)
    pub fn with_notify<F>(notify: F) -> Arc<TimerManager>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(TimerManager {
            set: RwLock::new(TimerSet {
                timers: BTreeMap::new(),
                tickled: false,
                previous_ms: now_ms(),
            }),
            notify_front: Box::new(notify),
        })
    }

    /// Schedule `cb` to run in `ms` milliseconds
    pub fn add_timer<F>(self: &Arc<Self>, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            inner: Mutex::new(TimerInner {
                ms,
                deadline_ms: now_ms() + ms,
                cb: Some(Arc::new(cb)),
            }),
            manager: Arc::downgrade(self),
        });
        self.insert(&timer);
        timer
    }

    /// Schedule `cb` to run in `ms` milliseconds, but only if `cond` is
    /// still alive at expiry
    ///
    /// This is the per-operation timeout shape: the waiting frame co-owns
    /// the sentinel, so a waiter that died before its deadline turns the
    /// timer into a no-op.
    pub fn add_condition_timer<F, T>(
        self: &Arc<Self>,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline
    ///
    /// `None` means the set is empty; `Some(0)` means a timer is overdue.
    /// Clears the front-insert latch so the next front insert notifies
    /// again.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let mut set = self.set.write().unwrap();
        set.tickled = false;
        let first = set.timers.keys().next()?;
        Some(first.deadline_ms.saturating_sub(now_ms()))
    }

    /// True while any timer, live or pending harvest, is scheduled
    pub fn has_timer(&self) -> bool {
        !self.set.read().unwrap().timers.is_empty()
    }

    /// Harvest every expired timer's callback into `out`, in deadline order
    ///
    /// Recurring timers are reinserted at `now + ms`; one-shot timers get
    /// their callback nulled. A clock rollover drains the whole set.
    pub fn take_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let mut set = self.set.write().unwrap();
        let rollover = Self::detect_rollover(&mut set, now);

        loop {
            let timer = match set.timers.keys().next() {
                Some(key) if rollover || key.deadline_ms <= now => {
                    let key = *key;
                    set.timers.remove(&key)
                }
                _ => None,
            };
            let Some(timer) = timer else { break };

            let mut inner = timer.inner.lock().unwrap();
            let Some(cb) = inner.cb.clone() else { continue };
            out.push(cb);

            if timer.recurring {
                inner.deadline_ms = now + inner.ms;
                let key = Timer::key(&inner, timer.id);
                drop(inner);
                set.timers.insert(key, timer.clone());
            } else {
                inner.cb = None;
            }
        }
    }

    /// Insert under the write lock; notify outside it if the timer became
    /// the new minimum
    fn insert(self: &Arc<Self>, timer: &Arc<Timer>) {
        let at_front = {
            let mut set = self.set.write().unwrap();
            let inner = timer.inner.lock().unwrap();
            let key = Timer::key(&inner, timer.id);
            drop(inner);
            set.timers.insert(key, timer.clone());
            let front = set.timers.keys().next() == Some(&key) && !set.tickled;
            if front {
                set.tickled = true;
            }
            front
        };
        if at_front {
            (self.notify_front)();
        }
    }

    fn detect_rollover(set: &mut TimerSet, now: u64) -> bool {
        let rollover = now < set.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
        set.previous_ms = now;
        rollover
    }
}

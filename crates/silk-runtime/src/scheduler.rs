//! M-threads fiber scheduler
//!
//! Workers pull from one FIFO task queue. A task is either a ready fiber or
//! a callback (wrapped in a fresh fiber at execution time) and may be pinned
//! to a worker by kernel TID; a worker scanning the queue skips pinned tasks
//! that name someone else and tickles so the owner wakes up.
//!
//! The base scheduler's tickle is a no-op and its idle fiber sleeps between
//! yields; the I/O reactor supplies the real implementations through
//! `SchedulerHooks`. With `use_caller`, the constructing thread doubles as a
//! worker: it gets a dedicated scheduler fiber whose entry is the run loop,
//! resumed by `stop()` to drain.

use crate::fiber::{yield_now, Fiber};
use crate::thread::{gettid, OsThread};
use silk_core::state::FiberState;
use silk_core::{log_debug, log_warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

thread_local! {
    static CURRENT_SCHED: RefCell<Weak<Scheduler>> = RefCell::new(Weak::new());
}

/// Hook points a reactor implements to take over the wakeup protocol
///
/// A scheduler without live hooks falls back to base behavior: no-op
/// tickle, sleep-and-yield idle, and plain quiescence.
pub trait SchedulerHooks: Send + Sync {
    /// Wake at least one idle worker
    fn tickle(&self);

    /// Body of each worker's idle fiber; must yield between rounds and
    /// return once `stopping()` holds
    fn idle(&self);

    /// Extended quiescence test consulted by `Scheduler::stopping`
    fn stopping(&self) -> bool;

    /// Runs once per worker, before the run loop touches any fiber
    fn on_thread_start(&self) {}
}

/// Placeholder hook type for schedulers constructed without a reactor
struct NoHooks;

impl SchedulerHooks for NoHooks {
    fn tickle(&self) {}
    fn idle(&self) {}
    fn stopping(&self) -> bool {
        false
    }
}

pub(crate) enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

struct Task {
    payload: TaskPayload,
    /// Worker pin; `None` means any worker may run it
    tid: Option<libc::pid_t>,
}

/// Fiber scheduler over a pool of worker threads
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<OsThread>>,
    /// Worker threads to spawn (excludes the caller when `use_caller`)
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stop_requested: AtomicBool,
    use_caller: bool,
    /// TID of the constructing thread when `use_caller`, else -1
    root_tid: libc::pid_t,
    /// The dedicated run-loop fiber of the caller thread
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    worker_tids: Mutex<Vec<libc::pid_t>>,
    hooks: Weak<dyn SchedulerHooks>,
}

impl Scheduler {
    /// Create a scheduler with base tickle/idle behavior
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_hooks(threads, use_caller, name, Weak::<NoHooks>::new())
    }

    /// Create a scheduler whose wakeup protocol is supplied by `hooks`
    pub(crate) fn with_hooks(
        threads: usize,
        use_caller: bool,
        name: &str,
        hooks: Weak<dyn SchedulerHooks>,
    ) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut thread_count = threads;
            let mut root_tid = -1;
            let mut caller_fiber = None;
            let mut tids = Vec::new();

            if use_caller {
                thread_count -= 1;
                Fiber::main();
                let w = weak.clone();
                let fiber = Fiber::new(
                    move || {
                        if let Some(sched) = w.upgrade() {
                            sched.run();
                        }
                    },
                    0,
                    false,
                );
                Fiber::set_scheduler_fiber(fiber.clone());
                root_tid = gettid();
                tids.push(root_tid);
                caller_fiber = Some(fiber);
            }
            set_current(weak.clone());

            Scheduler {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_count,
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(false),
                use_caller,
                root_tid,
                caller_fiber: Mutex::new(caller_fiber),
                worker_tids: Mutex::new(tids),
                hooks,
            }
        })
    }

    /// Scheduler driving the calling thread, if any
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHED.with(|c| c.borrow().upgrade())
    }

    pub(crate) fn current_weak() -> Weak<Scheduler> {
        CURRENT_SCHED.with(|c| c.borrow().clone())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// TIDs of all workers, the caller thread first when `use_caller`
    ///
    /// Complete once `start()` has returned.
    pub fn worker_tids(&self) -> Vec<libc::pid_t> {
        self.worker_tids.lock().unwrap().clone()
    }

    /// Enqueue a callback for any worker
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(TaskPayload::Call(Box::new(f)), None);
    }

    /// Enqueue a callback pinned to the worker with kernel id `tid`
    pub fn schedule_to<F>(&self, f: F, tid: libc::pid_t)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(TaskPayload::Call(Box::new(f)), Some(tid));
    }

    /// Enqueue a ready fiber for any worker
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(TaskPayload::Fiber(fiber), None);
    }

    /// Enqueue a ready fiber pinned to the worker with kernel id `tid`
    pub fn schedule_fiber_to(&self, fiber: Arc<Fiber>, tid: libc::pid_t) {
        self.submit(TaskPayload::Fiber(fiber), Some(tid));
    }

    pub(crate) fn submit(&self, payload: TaskPayload, tid: Option<libc::pid_t>) {
        let need_tickle = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(Task { payload, tid });
            was_empty
        };
        // Empty queue means every worker may be parked; one of them must see
        // this task.
        if need_tickle {
            self.tickle();
        }
    }

    /// Spawn the worker threads
    pub fn start(self: &Arc<Self>) {
        if self.stop_requested.load(Ordering::SeqCst) {
            log_warn!("scheduler {}: start() after stop()", self.name);
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        assert!(threads.is_empty(), "scheduler {} already started", self.name);

        let mut tids = self.worker_tids.lock().unwrap();
        for i in 0..self.thread_count {
            let me = self.clone();
            let t = OsThread::spawn(&format!("{}-worker-{}", self.name, i), move || me.run())
                .expect("failed to spawn scheduler worker");
            tids.push(t.tid());
            threads.push(t);
        }
        log_debug!("scheduler {}: started {} workers", self.name, self.thread_count);
    }

    /// Request shutdown, drain on the caller thread if `use_caller`, and
    /// join every worker
    pub fn stop(self: &Arc<Self>) {
        if self.stopping() {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);

        for _ in 0..self.thread_count {
            self.tickle();
        }
        let caller = self.caller_fiber.lock().unwrap().clone();
        if caller.is_some() {
            self.tickle();
        }
        if let Some(fiber) = caller {
            debug_assert!(self.use_caller);
            debug_assert_eq!(
                gettid(),
                self.root_tid,
                "stop() must run on the constructing thread when use_caller is set"
            );
            fiber.resume();
            log_debug!("scheduler {}: caller drain complete", self.name);
        }

        let workers = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in workers {
            t.join();
        }
    }

    /// True once shutdown was requested and no queued or running work remains
    pub fn stopping(&self) -> bool {
        match self.hooks.upgrade() {
            Some(h) => h.stopping(),
            None => self.quiescent(),
        }
    }

    /// The base quiescence test, ignoring any reactor state
    pub fn quiescent(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn tickle(&self) {
        if let Some(h) = self.hooks.upgrade() {
            h.tickle();
        }
    }

    /// Worker main loop
    fn run(self: &Arc<Self>) {
        let tid = gettid();
        log_debug!("scheduler {}: run() starts on tid {}", self.name, tid);
        set_current(Arc::downgrade(self));
        if let Some(h) = self.hooks.upgrade() {
            h.on_thread_start();
        }
        if tid != self.root_tid {
            Fiber::main();
        }

        let me = Arc::downgrade(self);
        let idle_fiber = Fiber::new(
            move || {
                if let Some(sched) = me.upgrade() {
                    sched.idle_entry();
                }
            },
            0,
            true,
        );

        loop {
            let mut task: Option<Task> = None;
            let mut tickle_me = false;
            {
                let mut q = self.queue.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    if let Some(want) = q[i].tid {
                        if want != tid {
                            // Pinned to someone else; make sure they wake.
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    task = q.remove(i);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !q.is_empty();
            }
            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task {
                    payload: TaskPayload::Fiber(fiber),
                    ..
                }) => {
                    if fiber.state() != FiberState::Term {
                        fiber.resume();
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Task {
                    payload: TaskPayload::Call(cb),
                    ..
                }) => {
                    let cb_fiber = Fiber::new(cb, 0, true);
                    cb_fiber.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        log_debug!("scheduler {}: run() ends on tid {}", self.name, tid);
    }

    fn idle_entry(&self) {
        match self.hooks.upgrade() {
            Some(h) => h.idle(),
            None => self.base_idle(),
        }
    }

    /// Standalone idle: sleep between yields until quiescent
    fn base_idle(&self) {
        while !self.stopping() {
            std::thread::sleep(Duration::from_secs(1));
            yield_now();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        assert!(
            self.quiescent(),
            "scheduler {} dropped while not quiescent",
            self.name
        );
    }
}

fn set_current(weak: Weak<Scheduler>) {
    CURRENT_SCHED.with(|c| *c.borrow_mut() = weak);
}

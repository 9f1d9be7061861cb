//! Stackful fibers
//!
//! A fiber owns a guard-paged stack and a saved register block. Handles are
//! `Arc<Fiber>` and may be held simultaneously by the creator, the scheduler
//! queue and a reactor event slot; the stack is released when the last
//! handle drops, never at termination, so a handle may outlive TERM.
//!
//! Every thread that touches fibers has three thread-local slots: the
//! currently running fiber, the thread's main fiber (its native stack,
//! created lazily), and the scheduler fiber. A running fiber yields to the
//! scheduler fiber when `run_in_scheduler` is set, to the main fiber
//! otherwise, and `resume` saves the caller's continuation into that same
//! slot's context.

use crate::arch::{self, Context};
use crate::stack::Stack;
use silk_core::id::FiberId;
use silk_core::state::FiberState;
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

static DEFAULT_STACK_SIZE: AtomicUsize = AtomicUsize::new(1024 * 1024);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);
static SWITCH_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

type EntryFn = Box<dyn FnOnce() + Send>;

/// A stackful, cooperatively scheduled coroutine
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Yield target selector: scheduler fiber vs thread main fiber
    run_in_scheduler: bool,
    /// None for a thread's main fiber (native stack)
    stack: Option<Stack>,
    ctx: UnsafeCell<Context>,
    entry: UnsafeCell<Option<EntryFn>>,
}

// `ctx` and `entry` are only touched by the thread that owns the READY ->
// RUNNING transition (the `state` CAS in `resume` serializes claimants), or
// by `reset` on a TERM fiber. `state` itself is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a READY fiber
    ///
    /// `stack_size == 0` selects the configured default (1 MiB unless
    /// overridden). `run_in_scheduler` picks the yield target: the thread's
    /// scheduler fiber (true) or its main fiber (false).
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE.load(Ordering::Relaxed)
        } else {
            stack_size
        };
        let stack = Stack::alloc(size);
        let mut ctx = Context::default();
        unsafe { arch::init_context(&mut ctx, stack.top(), fiber_entry as usize) };

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            stack: Some(stack),
            ctx: UnsafeCell::new(ctx),
            entry: UnsafeCell::new(Some(Box::new(entry))),
        })
    }

    /// The main fiber wraps the thread's native stack and starts RUNNING;
    /// its context block is first written by the save half of a switch.
    fn new_main() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            stack: None,
            ctx: UnsafeCell::new(Context::default()),
            entry: UnsafeCell::new(None),
        })
    }

    /// Get the calling thread's main fiber, creating it on first use
    ///
    /// First use also seeds the current-fiber and scheduler-fiber slots, so
    /// plain threads can resume fibers without a scheduler.
    pub fn main() -> Arc<Fiber> {
        if let Some(cur) = Self::current() {
            return cur;
        }
        let main = Fiber::new_main();
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        SCHEDULER.with(|c| {
            let mut slot = c.borrow_mut();
            if slot.is_none() {
                *slot = Some(main.clone());
            }
        });
        main
    }

    /// The fiber currently executing on this thread, if any
    pub fn current() -> Option<Arc<Fiber>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Id of the current fiber, if any
    pub fn current_id() -> Option<FiberId> {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id))
    }

    /// Install the scheduler fiber for this thread
    pub(crate) fn set_scheduler_fiber(f: Arc<Fiber>) {
        SCHEDULER.with(|c| *c.borrow_mut() = Some(f));
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Jump into this fiber from the calling thread
    ///
    /// The caller's continuation is saved into the yield-target slot's
    /// context (scheduler fiber or thread main fiber, matching this fiber's
    /// `run_in_scheduler`); control returns here when the fiber yields or
    /// terminates. Resuming a non-READY fiber is a programming error.
    pub fn resume(self: &Arc<Self>) {
        Fiber::main();
        let claimed = self.state.compare_exchange(
            FiberState::Ready as u8,
            FiberState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(
            claimed.is_ok(),
            "resume() on fiber {} in state {}",
            self.id,
            self.state()
        );

        let back = self.yield_target();
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
        // `back` stays alive on this frame for the whole suspension, so the
        // context we save into cannot be freed under us.
        unsafe { arch::switch_context(back.ctx.get(), self.ctx.get()) };
    }

    /// Reinitialize a TERM fiber with a new entry, reusing its stack
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = self.stack.as_ref().expect("reset() on a thread main fiber");
        assert!(
            self.state() == FiberState::Term,
            "reset() on fiber {} in state {}",
            self.id,
            self.state()
        );
        unsafe {
            *self.entry.get() = Some(Box::new(entry));
            arch::init_context(&mut *self.ctx.get(), stack.top(), fiber_entry as usize);
        }
        self.state.store(FiberState::Ready as u8, Ordering::Release);
    }

    /// The fiber whose context receives control when this one suspends
    fn yield_target(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            SCHEDULER
                .with(|c| c.borrow().clone())
                .expect("no scheduler fiber on this thread")
        } else {
            THREAD_MAIN
                .with(|c| c.borrow().clone())
                .expect("thread fiber registry not initialized")
        }
    }

    /// Switch away from this fiber back to its yield target
    ///
    /// Keeps TERM if the entry already finished, otherwise moves RUNNING ->
    /// READY. Must run on the fiber's own stack.
    pub(crate) fn yield_inner(&self) {
        let state = self.state();
        assert!(
            state == FiberState::Running || state == FiberState::Term,
            "yield on fiber {} in state {}",
            self.id,
            state
        );
        if state != FiberState::Term {
            self.state.store(FiberState::Ready as u8, Ordering::Release);
        }

        let back = self.yield_target();
        CURRENT.with(|c| *c.borrow_mut() = Some(back.clone()));
        SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
        unsafe { arch::switch_context(self.ctx.get(), back.ctx.get()) };
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Suspend the current fiber, returning control to its yield target
///
/// Panics when no fiber is running on this thread.
pub fn yield_now() {
    let cur = Fiber::current().expect("yield_now() with no running fiber");
    cur.yield_inner();
}

/// Number of live fibers (handles not yet dropped), process-wide
pub fn fiber_count() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Total context switches performed, process-wide
pub fn switch_count() -> u64 {
    SWITCH_COUNT.load(Ordering::Relaxed)
}

/// Override the default fiber stack size
pub(crate) fn set_default_stack_size(bytes: usize) {
    DEFAULT_STACK_SIZE.store(bytes, Ordering::Relaxed);
}

/// Top-level function of every fiber stack
///
/// Runs the entry closure, marks TERM and switches away. Falling off the
/// entry's end therefore behaves exactly like an explicit final yield.
extern "C" fn fiber_entry() {
    let curr = Fiber::current().expect("fiber entry with no current fiber");
    let entry = unsafe { (*curr.entry.get()).take() }.expect("fiber resumed without an entry");
    entry();

    curr.state.store(FiberState::Term as u8, Ordering::Release);
    // This frame never resumes; drop our handle before the final switch or
    // its refcount would leak and pin the stack forever. The fiber stays
    // alive through the resumer's handle until `resume` returns.
    let raw: *const Fiber = Arc::as_ptr(&curr);
    drop(curr);
    unsafe { (*raw).yield_inner() };
    unreachable!("terminated fiber resumed");
}

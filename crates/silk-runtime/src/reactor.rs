//! I/O reactor: edge-triggered epoll over the fiber scheduler
//!
//! `Reactor` owns a scheduler (implementing its wakeup hooks), a timer
//! manager (whose front inserts kick the tickle pipe), the epoll instance
//! and a per-fd slot table. Each slot carries one waiter per direction: a
//! suspended fiber or a callback. Readiness never runs a waiter inline — it
//! re-enqueues it as a scheduler task.
//!
//! Worker idle fibers block in `epoll_wait`, capped at 5 s so a timer
//! inserted into a quiet manager is observed within bounded delay even if
//! the tickle write is lost.
//!
//! `IoManager` is the unique owning handle: dropping it stops the scheduler
//! and closes the epoll fd and pipe. Worker-side references (`Reactor::
//! current`, event waiters, timer callbacks) are weak, so shutdown always
//! runs on the owner's thread.

use crate::fiber::{yield_now, Fiber};
use crate::scheduler::{Scheduler, SchedulerHooks, TaskPayload};
use crate::timer::{Timer, TimerManager};
use silk_core::error::ReactorError;
use silk_core::log_debug;
use silk_core::log_error;
use silk_core::state::FiberState;
use std::cell::RefCell;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

const INITIAL_SLOTS: usize = 32;
const MAX_EVENTS: usize = 256;
const MAX_TIMEOUT_MS: u64 = 5000;

/// Readiness direction, bit-compatible with epoll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Event {
    Read = libc::EPOLLIN as u32,   // 0x1
    Write = libc::EPOLLOUT as u32, // 0x4
}

impl Event {
    #[inline]
    pub fn bit(self) -> u32 {
        self as u32
    }
}

/// Registered waiter for one direction of one fd
///
/// Exactly one of `fiber`/`cb` is populated while the direction's bit is
/// set in the slot; both are empty otherwise.
struct EventWaiter {
    scheduler: Weak<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send>>,
}

impl EventWaiter {
    fn empty() -> EventWaiter {
        EventWaiter {
            scheduler: Weak::new(),
            fiber: None,
            cb: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }
}

struct SlotInner {
    /// Currently registered direction bits
    events: u32,
    read: EventWaiter,
    write: EventWaiter,
}

impl SlotInner {
    fn waiter_mut(&mut self, ev: Event) -> &mut EventWaiter {
        match ev {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

/// Per-fd registration record
struct FdSlot {
    fd: RawFd,
    inner: Mutex<SlotInner>,
}

impl FdSlot {
    fn new(fd: RawFd) -> Arc<FdSlot> {
        Arc::new(FdSlot {
            fd,
            inner: Mutex::new(SlotInner {
                events: 0,
                read: EventWaiter::empty(),
                write: EventWaiter::empty(),
            }),
        })
    }
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Weak<Reactor>> = RefCell::new(Weak::new());
}

/// The reactor core: scheduler hooks, timers, epoll and the slot table
///
/// Shared `Arc<Reactor>` handles come from `Reactor::current()` on worker
/// threads; the unique owner is `IoManager`.
pub struct Reactor {
    self_weak: Weak<Reactor>,
    sched: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// [read end, write end] of the tickle pipe
    tickle_fds: [RawFd; 2],
    slots: RwLock<Vec<Arc<FdSlot>>>,
    /// Registered-and-untriggered event count, all fds
    pending: AtomicUsize,
}

impl Reactor {
    fn build(threads: usize, use_caller: bool, name: &str) -> Arc<Reactor> {
        Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let hooks: Weak<dyn SchedulerHooks> = weak.clone();
            let sched = Scheduler::with_hooks(threads, use_caller, name, hooks);

            let poker = weak.clone();
            let timers = TimerManager::with_notify(move || {
                if let Some(reactor) = poker.upgrade() {
                    reactor.tickle();
                }
            });

            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            assert!(
                epfd >= 0,
                "epoll_create1 failed: {}",
                std::io::Error::last_os_error()
            );

            let mut pipe_fds = [0 as RawFd; 2];
            let rc = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
            assert!(
                rc == 0,
                "tickle pipe creation failed: {}",
                std::io::Error::last_os_error()
            );
            unsafe {
                let flags = libc::fcntl(pipe_fds[0], libc::F_GETFL, 0);
                libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
            }

            let mut ev = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLET) as u32,
                u64: pipe_fds[0] as u64,
            };
            let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
            assert!(
                rc == 0,
                "registering tickle pipe failed: {}",
                std::io::Error::last_os_error()
            );

            let slots = (0..INITIAL_SLOTS as RawFd).map(FdSlot::new).collect();

            Reactor {
                self_weak: weak.clone(),
                sched,
                timers,
                epfd,
                tickle_fds: pipe_fds,
                slots: RwLock::new(slots),
                pending: AtomicUsize::new(0),
            }
        })
    }

    /// Reactor driving the calling thread, if any
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|c| c.borrow().upgrade())
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Registered events not yet triggered
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Register the current fiber as the waiter for `ev` on `fd`
    ///
    /// The fiber is re-enqueued when the direction becomes ready or when the
    /// registration is cancelled; it must be RUNNING (about to yield).
    pub fn add_event(&self, fd: RawFd, ev: Event) -> Result<(), ReactorError> {
        self.register(fd, ev, None)
    }

    /// Register a callback as the waiter for `ev` on `fd`
    pub fn add_event_cb<F>(&self, fd: RawFd, ev: Event, cb: F) -> Result<(), ReactorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(fd, ev, Some(Box::new(cb)))
    }

    fn register(
        &self,
        fd: RawFd,
        ev: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), ReactorError> {
        let waiting_fiber = match cb {
            Some(_) => None,
            None => {
                let Some(fiber) = Fiber::current() else {
                    return Err(ReactorError::NoWaiter);
                };
                assert!(
                    fiber.state() == FiberState::Running,
                    "add_event: fiber {} not RUNNING",
                    fiber.id()
                );
                Some(fiber)
            }
        };

        let slot = self.slot_or_grow(fd);
        let mut inner = slot.inner.lock().unwrap();

        if inner.events & ev.bit() != 0 {
            return Err(ReactorError::DuplicateEvent);
        }

        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.epoll_update(op, fd, inner.events | ev.bit())
            .map_err(|errno| {
                log_error!("add_event: epoll_ctl({}) failed: errno {}", fd, errno);
                ReactorError::Epoll {
                    op: if op == libc::EPOLL_CTL_MOD { "MOD" } else { "ADD" },
                    errno,
                }
            })?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events |= ev.bit();

        let waiter = inner.waiter_mut(ev);
        debug_assert!(waiter.is_empty());
        waiter.scheduler = Scheduler::current_weak();
        waiter.fiber = waiting_fiber;
        waiter.cb = cb;
        Ok(())
    }

    /// Unregister `ev` on `fd` without waking its waiter
    pub fn del_event(&self, fd: RawFd, ev: Event) -> bool {
        let Some(slot) = self.slot(fd) else {
            return false;
        };
        let mut inner = slot.inner.lock().unwrap();
        if inner.events & ev.bit() == 0 {
            return false;
        }

        let left = inner.events & !ev.bit();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if let Err(errno) = self.epoll_update(op, fd, left) {
            log_error!("del_event: epoll_ctl({}) failed: errno {}", fd, errno);
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        *inner.waiter_mut(ev) = EventWaiter::empty();
        true
    }

    /// Unregister `ev` on `fd` and wake its waiter once
    pub fn cancel_event(&self, fd: RawFd, ev: Event) -> bool {
        let Some(slot) = self.slot(fd) else {
            return false;
        };
        let mut inner = slot.inner.lock().unwrap();
        if inner.events & ev.bit() == 0 {
            return false;
        }

        let left = inner.events & !ev.bit();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if let Err(errno) = self.epoll_update(op, fd, left) {
            log_error!("cancel_event: epoll_ctl({}) failed: errno {}", fd, errno);
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.trigger(&mut inner, ev);
        true
    }

    /// Unregister everything on `fd`, waking each pending waiter
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(slot) = self.slot(fd) else {
            return false;
        };
        let mut inner = slot.inner.lock().unwrap();
        if inner.events == 0 {
            return false;
        }

        if let Err(errno) = self.epoll_update(libc::EPOLL_CTL_DEL, fd, 0) {
            log_error!("cancel_all: epoll_ctl({}) failed: errno {}", fd, errno);
            return false;
        }

        if inner.events & Event::Read.bit() != 0 {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.trigger(&mut inner, Event::Read);
        }
        if inner.events & Event::Write.bit() != 0 {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.trigger(&mut inner, Event::Write);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }

    /// Schedule `cb` to run in `ms` milliseconds
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Schedule `cb`, fired only while `cond` is still alive
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub(crate) fn downgrade(&self) -> Weak<Reactor> {
        self.self_weak.clone()
    }

    /// Move the waiter for `ev` into the scheduler queue and clear the slot
    ///
    /// The waiter resumes on whichever worker picks the task up, never
    /// inline here.
    fn trigger(&self, inner: &mut SlotInner, ev: Event) {
        assert!(inner.events & ev.bit() != 0, "trigger on unregistered event");
        inner.events &= !ev.bit();

        let waiter = inner.waiter_mut(ev);
        let sched = waiter
            .scheduler
            .upgrade()
            .unwrap_or_else(|| self.sched.clone());
        if let Some(cb) = waiter.cb.take() {
            sched.submit(TaskPayload::Call(cb), None);
        } else if let Some(fiber) = waiter.fiber.take() {
            sched.submit(TaskPayload::Fiber(fiber), None);
        }
        waiter.scheduler = Weak::new();
    }

    fn epoll_update(&self, op: libc::c_int, fd: RawFd, bits: u32) -> Result<(), i32> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | bits,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        Ok(())
    }

    fn slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.read().unwrap();
        slots.get(fd as usize).cloned()
    }

    fn slot_or_grow(&self, fd: RawFd) -> Arc<FdSlot> {
        if let Some(slot) = self.slot(fd) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap();
        let wanted = (fd as usize * 3 / 2).max(fd as usize + 1);
        let mut next = slots.len() as RawFd;
        slots.resize_with(wanted, || {
            let slot = FdSlot::new(next);
            next += 1;
            slot
        });
        slots[fd as usize].clone()
    }

    /// The reactor's idle fiber body: demultiplex, harvest timers, dispatch
    fn idle_loop(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut expired = Vec::new();

        loop {
            if self.stopping() {
                log_debug!("reactor {}: idle exits", self.sched.name());
                break;
            }

            let n = loop {
                let timeout = self
                    .timers
                    .next_timeout_ms()
                    .map_or(MAX_TIMEOUT_MS, |t| t.min(MAX_TIMEOUT_MS));
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout as libc::c_int,
                    )
                };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    log_error!("reactor {}: epoll_wait failed: {}", self.sched.name(), err);
                    break 0;
                }
                break rc;
            };

            self.timers.take_expired(&mut expired);
            for cb in expired.drain(..) {
                self.sched.schedule(move || cb());
            }

            for i in 0..n as usize {
                self.dispatch(events[i]);
            }

            yield_now();
        }
    }

    fn dispatch(&self, ev: libc::epoll_event) {
        let fd = ev.u64 as RawFd;

        if fd == self.tickle_fds[0] {
            let mut buf = [0u8; 256];
            while unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            } > 0
            {}
            return;
        }

        let Some(slot) = self.slot(fd) else {
            return;
        };
        let mut inner = slot.inner.lock().unwrap();

        // An error or hangup must wake whoever is registered, whichever
        // direction they were waiting for.
        let mut ready = ev.events;
        if ready & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            ready |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events;
        }

        let mut real = 0u32;
        if ready & libc::EPOLLIN as u32 != 0 {
            real |= Event::Read.bit();
        }
        if ready & libc::EPOLLOUT as u32 != 0 {
            real |= Event::Write.bit();
        }
        real &= inner.events;
        if real == 0 {
            return;
        }

        let left = inner.events & !real;
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if let Err(errno) = self.epoll_update(op, slot.fd, left) {
            log_error!("dispatch: epoll_ctl({}) failed: errno {}", slot.fd, errno);
            return;
        }

        if real & Event::Read.bit() != 0 {
            self.trigger(&mut inner, Event::Read);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if real & Event::Write.bit() != 0 {
            self.trigger(&mut inner, Event::Write);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn close_fds(&self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl SchedulerHooks for Reactor {
    /// One byte on the pipe wakes one `epoll_wait`; skip the syscall when
    /// nobody is idle
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        // A failed write means the pipe is full, which already guarantees a
        // pending wakeup.
        let _ = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
    }

    fn idle(&self) {
        self.idle_loop();
    }

    fn stopping(&self) -> bool {
        self.sched.quiescent()
            && self.pending.load(Ordering::SeqCst) == 0
            && !self.timers.has_timer()
    }

    fn on_thread_start(&self) {
        CURRENT_REACTOR.with(|c| *c.borrow_mut() = self.self_weak.clone());
        crate::hook::set_hook_enabled(true);
    }
}

/// Owning handle to a reactor
///
/// Dropping it stops the scheduler (joining every worker) and closes the
/// demultiplexer and the tickle pipe. Everything else holds the reactor
/// weakly, so this shutdown always runs on the owner's thread.
pub struct IoManager {
    reactor: Arc<Reactor>,
}

impl IoManager {
    /// Build the reactor and start its workers
    ///
    /// Construction failures (epoll, pipe) are fatal: without a
    /// demultiplexer none of the runtime's contracts can hold.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> IoManager {
        let reactor = Reactor::build(threads, use_caller, name);
        CURRENT_REACTOR.with(|c| *c.borrow_mut() = Arc::downgrade(&reactor));
        reactor.sched.start();
        IoManager { reactor }
    }

    /// Shared handle for worker-side use
    pub fn reactor(&self) -> Arc<Reactor> {
        self.reactor.clone()
    }
}

impl Deref for IoManager {
    type Target = Reactor;

    fn deref(&self) -> &Reactor {
        &self.reactor
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.reactor.sched.stop();
        self.reactor.close_fds();
    }
}

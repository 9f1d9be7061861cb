//! Blocking-call wrappers over the reactor
//!
//! Each wrapper keeps its POSIX counterpart's errno semantics but replaces
//! blocking with fiber suspension: try the call on the (OS-level
//! non-blocking) fd, and on would-block arm an optional condition timer,
//! register readiness for the current fiber and yield. The fiber resumes
//! either through readiness or through the timer cancelling the event, in
//! which case the shared sentinel carries `ETIMEDOUT` out of the wait.
//!
//! Wrappers only take over on reactor worker threads (`hook_enabled`); on
//! every other thread, and for fds the user opted out of (non-socket or
//! user-set non-blocking), they delegate straight to libc.

use crate::fd::{fd_registry, NO_TIMEOUT};
use crate::fiber::{yield_now, Fiber};
use crate::reactor::{Event, Reactor};
use silk_core::log_error;
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Default timeout applied by `connect`; `NO_TIMEOUT` disables it
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NO_TIMEOUT);

/// Whether wrappers on this thread suspend fibers instead of blocking
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable fiber-aware wrappers for the calling thread
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

/// Set the module-wide default `connect` timeout
pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

#[inline]
fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: libc::c_int) {
    unsafe { *libc::__errno_location() = e };
}

/// Per-operation timeout sentinel, co-owned by the waiting frame
///
/// The condition timer holds only a weak reference: a waiter destroyed
/// before its deadline turns the timer callback into a no-op.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The common would-block path shared by every data-plane wrapper
fn do_io<F>(
    fd: RawFd,
    ev: Event,
    timeout_kind: libc::c_int,
    name: &'static str,
    mut call: F,
) -> isize
where
    F: FnMut() -> isize,
{
    if !hook_enabled() {
        return call();
    }
    let Some(ctx) = fd_registry().get(fd, false) else {
        return call();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return call();
    }

    let timeout = ctx.timeout(timeout_kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = call();
        while n == -1 && errno() == libc::EINTR {
            n = call();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let iom = Reactor::current().expect("hooked I/O on a thread without a reactor");

        let timer = if timeout != NO_TIMEOUT {
            let winfo = Arc::downgrade(&tinfo);
            let wiom = iom.downgrade();
            Some(iom.add_condition_timer(
                timeout,
                move || {
                    let Some(info) = winfo.upgrade() else { return };
                    if info.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                        return;
                    }
                    if let Some(iom) = wiom.upgrade() {
                        iom.cancel_event(fd, ev);
                    }
                },
                Arc::downgrade(&tinfo),
                false,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, ev) {
            log_error!("{}: add_event({}, {:?}) failed: {}", name, fd, ev, e);
            if let Some(t) = &timer {
                t.cancel();
            }
            return -1;
        }

        yield_now();

        // Resumed by readiness or by the timer's cancel_event.
        if let Some(t) = &timer {
            t.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
    }
}

/// Park the current fiber for `ms`, rescheduling it when the timer fires
fn park_current(ms: u64) {
    let fiber = Fiber::current().expect("sleep hook outside a fiber");
    let iom = Reactor::current().expect("sleep hook on a thread without a reactor");
    let sched = iom.scheduler().clone();
    iom.add_timer(ms, move || sched.schedule_fiber(fiber.clone()), false);
    yield_now();
}

pub fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if !hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    park_current(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: libc::useconds_t) -> libc::c_int {
    if !hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    park_current(usec as u64 / 1000);
    0
}

pub fn nanosleep(req: &libc::timespec) -> libc::c_int {
    if !hook_enabled() {
        return unsafe { libc::nanosleep(req, std::ptr::null_mut()) };
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    park_current(ms);
    0
}

/// Create a socket and enter it into the fd registry
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !hook_enabled() {
        return fd;
    }
    if fd == -1 {
        log_error!("socket() failed: {}", std::io::Error::last_os_error());
        return fd;
    }
    fd_registry().get(fd, true);
    fd
}

/// `connect` with an explicit operation timeout
///
/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> libc::c_int {
    if !hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(ctx) = fd_registry().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // In progress: wait for writability, which signals the handshake result.
    let iom = Reactor::current().expect("hooked connect on a thread without a reactor");
    let tinfo = Arc::new(TimerInfo::default());

    let timer = if timeout_ms != NO_TIMEOUT {
        let winfo = Arc::downgrade(&tinfo);
        let wiom = iom.downgrade();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(info) = winfo.upgrade() else { return };
                if info.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                    return;
                }
                if let Some(iom) = wiom.upgrade() {
                    iom.cancel_event(fd, Event::Write);
                }
            },
            Arc::downgrade(&tinfo),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::Write) {
        Ok(()) => {
            yield_now();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            log_error!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::c_int {
    connect_with_timeout(fd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// # Safety
///
/// `addr`/`addrlen` must be null or valid out-parameters as for accept(2).
pub unsafe fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> RawFd {
    let new_fd = do_io(fd, Event::Read, libc::SO_RCVTIMEO, "accept", || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    }) as RawFd;
    if new_fd >= 0 {
        fd_registry().get(new_fd, true);
    }
    new_fd
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, Event::Read, libc::SO_RCVTIMEO, "read", || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: libc::c_int) -> isize {
    do_io(fd, Event::Read, libc::SO_RCVTIMEO, "readv", || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> isize {
    do_io(fd, Event::Read, libc::SO_RCVTIMEO, "recv", || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

/// # Safety
///
/// `src_addr`/`addrlen` must be null or valid out-parameters as for
/// recvfrom(2).
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    do_io(fd, Event::Read, libc::SO_RCVTIMEO, "recvfrom", || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            src_addr,
            addrlen,
        )
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> isize {
    do_io(fd, Event::Read, libc::SO_RCVTIMEO, "recvmsg", || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, Event::Write, libc::SO_SNDTIMEO, "write", || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: libc::c_int) -> isize {
    do_io(fd, Event::Write, libc::SO_SNDTIMEO, "writev", || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> isize {
    do_io(fd, Event::Write, libc::SO_SNDTIMEO, "send", || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

/// # Safety
///
/// `dest` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    dest: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    do_io(fd, Event::Write, libc::SO_SNDTIMEO, "sendto", || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            dest,
            addrlen,
        )
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: libc::c_int) -> isize {
    do_io(fd, Event::Write, libc::SO_SNDTIMEO, "sendmsg", || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Cancel every pending event on `fd`, drop its registry slot, then close
///
/// Cancelled waiters resume and observe the failure from the closed fd;
/// closing an fd that was never registered just delegates.
pub fn close(fd: RawFd) -> libc::c_int {
    if !hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if fd_registry().get(fd, false).is_some() {
        if let Some(iom) = Reactor::current() {
            iom.cancel_all(fd);
        }
        fd_registry().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl` with user-visible non-blocking routed through the fd registry
///
/// `F_SETFL` records the user's O_NONBLOCK wish but keeps the OS-level flag
/// set on sockets; `F_GETFL` reports what the user configured. Everything
/// else passes through.
pub fn fcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> libc::c_int {
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg;
            match fd_registry().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, arg) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, arg) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            match fd_registry().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl` with FIONBIO routed through the fd registry
///
/// # Safety
///
/// `arg` must be valid for `request` as for ioctl(2); FIONBIO reads an int
/// through it.
pub unsafe fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut libc::c_void) -> libc::c_int {
    if request == libc::FIONBIO {
        let on = *(arg as *const libc::c_int) != 0;
        if let Some(ctx) = fd_registry().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(on);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
///
/// Parameters must be valid as for getsockopt(2).
pub unsafe fn getsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> libc::c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// `setsockopt` that mirrors SO_RCVTIMEO/SO_SNDTIMEO into the fd registry,
/// where the wrappers read them as per-operation timeouts
///
/// # Safety
///
/// Parameters must be valid as for setsockopt(2); the timeout options read
/// a timeval through `optval`.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = fd_registry().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            ctx.set_timeout(optname, ms);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

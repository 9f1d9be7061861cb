//! Reactor: readiness dispatch, cancellation, pending-event accounting

use silk_core::error::ReactorError;
use silk_runtime::{yield_now, Event, IoManager, Reactor};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn close_pair(r: RawFd, w: RawFd) {
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn readiness_schedules_the_callback() {
    let iom = IoManager::new(2, false, "reactor-cb");
    let (r, w) = pipe_pair();

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    iom.add_event_cb(r, Event::Read, move || {
        f.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(iom.pending_events(), 1);
    assert!(!fired.load(Ordering::SeqCst));

    let n = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);

    assert!(wait_until(|| fired.load(Ordering::SeqCst), Duration::from_secs(2)));
    assert!(wait_until(|| iom.pending_events() == 0, Duration::from_secs(2)));

    close_pair(r, w);
}

#[test]
fn duplicate_registration_is_rejected() {
    let iom = IoManager::new(2, false, "reactor-dup");
    let (r, w) = pipe_pair();

    iom.add_event_cb(r, Event::Read, || {}).unwrap();
    let err = iom.add_event_cb(r, Event::Read, || {}).unwrap_err();
    assert_eq!(err, ReactorError::DuplicateEvent);
    assert_eq!(iom.pending_events(), 1);

    assert!(iom.del_event(r, Event::Read));
    assert_eq!(iom.pending_events(), 0);

    close_pair(r, w);
}

#[test]
fn del_event_discards_without_dispatch() {
    let iom = IoManager::new(2, false, "reactor-del");
    let (r, w) = pipe_pair();

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    iom.add_event_cb(r, Event::Read, move || {
        f.store(true, Ordering::SeqCst);
    })
    .unwrap();

    assert!(iom.del_event(r, Event::Read));
    assert_eq!(iom.pending_events(), 0);
    assert!(!iom.del_event(r, Event::Read));

    std::thread::sleep(Duration::from_millis(100));
    assert!(!fired.load(Ordering::SeqCst));

    close_pair(r, w);
}

#[test]
fn cancel_event_dispatches_once() {
    let iom = IoManager::new(2, false, "reactor-cancel");
    let (r, w) = pipe_pair();

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    iom.add_event_cb(r, Event::Read, move || {
        f.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(iom.pending_events(), 1);

    // No readiness needed: cancel triggers the waiter itself.
    assert!(iom.cancel_event(r, Event::Read));
    assert_eq!(iom.pending_events(), 0);
    assert!(wait_until(|| fired.load(Ordering::SeqCst), Duration::from_secs(2)));
    assert!(!iom.cancel_event(r, Event::Read));

    close_pair(r, w);
}

#[test]
fn cancel_all_dispatches_every_direction() {
    let iom = IoManager::new(2, false, "reactor-cancel-all");

    // A socketpair supports both directions.
    let mut sv = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) };
    assert_eq!(rc, 0);

    // Fill the send buffer so WRITE is not instantly ready.
    unsafe {
        let flags = libc::fcntl(sv[0], libc::F_GETFL, 0);
        libc::fcntl(sv[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        let junk = vec![0u8; 64 * 1024];
        while libc::send(
            sv[0],
            junk.as_ptr() as *const libc::c_void,
            junk.len(),
            0,
        ) > 0
        {}
    }

    let reads = Arc::new(AtomicBool::new(false));
    let writes = Arc::new(AtomicBool::new(false));
    let rf = reads.clone();
    let wf = writes.clone();
    iom.add_event_cb(sv[0], Event::Read, move || {
        rf.store(true, Ordering::SeqCst);
    })
    .unwrap();
    iom.add_event_cb(sv[0], Event::Write, move || {
        wf.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(iom.pending_events(), 2);

    assert!(iom.cancel_all(sv[0]));
    assert_eq!(iom.pending_events(), 0);
    assert!(wait_until(
        || reads.load(Ordering::SeqCst) && writes.load(Ordering::SeqCst),
        Duration::from_secs(2)
    ));
    assert!(!iom.cancel_all(sv[0]));

    unsafe {
        libc::close(sv[0]);
        libc::close(sv[1]);
    }
}

#[test]
fn fiber_waiter_resumes_on_readiness() {
    let iom = IoManager::new(2, false, "reactor-fiber");
    let (r, w) = pipe_pair();

    let got = Arc::new(AtomicIsize::new(-100));
    let g = got.clone();
    iom.scheduler().schedule(move || {
        let iom = Reactor::current().expect("worker without reactor TLS");
        iom.add_event(r, Event::Read).unwrap();
        yield_now();
        // Readiness: the byte is there now.
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        g.store(n as isize, Ordering::SeqCst);
    });

    assert!(wait_until(|| iom.pending_events() == 1, Duration::from_secs(2)));
    let n = unsafe { libc::write(w, b"y".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1);

    assert!(wait_until(
        || got.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));
    assert_eq!(iom.pending_events(), 0);

    close_pair(r, w);
}

#[test]
fn reactor_timers_run_on_workers() {
    let iom = IoManager::new(2, false, "reactor-timer");
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    let start = Instant::now();
    iom.add_timer(
        200,
        move || {
            f.store(true, Ordering::SeqCst);
        },
        false,
    );

    assert!(wait_until(|| fired.load(Ordering::SeqCst), Duration::from_secs(3)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(190), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "fired late: {:?}", elapsed);
}

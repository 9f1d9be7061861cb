//! End-to-end: hooked syscalls suspending fibers on the reactor

use silk_runtime::fiber::switch_count;
use silk_runtime::{hook, IoManager};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

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

fn sockaddr_of(addr: SocketAddr) -> libc::sockaddr_in {
    let SocketAddr::V4(v4) = addr else {
        panic!("expected an IPv4 address");
    };
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = v4.port().to_be();
    sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
    sin
}

fn connect_fiber_socket(addr: SocketAddr) -> RawFd {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0);
    let sin = sockaddr_of(addr);
    let rc = unsafe {
        hook::connect(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0, "connect failed: {}", std::io::Error::last_os_error());
    fd
}

/// Accepts one connection and echoes until EOF
fn echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    (addr, handle)
}

/// Accepts one connection and holds it open, never writing
fn silent_server() -> (SocketAddr, JoinHandle<()>, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    let handle = std::thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            while !s.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(20));
            }
            drop(stream);
        }
    });
    (addr, handle, stop)
}

#[test]
fn sleep_parks_and_resumes() {
    let iom = IoManager::new(2, false, "hook-sleep");
    let elapsed: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));

    let e = elapsed.clone();
    iom.scheduler().schedule(move || {
        let start = Instant::now();
        hook::sleep(1);
        *e.lock().unwrap() = Some(start.elapsed());
    });

    assert!(wait_until(
        || elapsed.lock().unwrap().is_some(),
        Duration::from_secs(5)
    ));
    let took = elapsed.lock().unwrap().unwrap();
    assert!(took >= Duration::from_millis(990), "woke early: {:?}", took);
    assert!(took < Duration::from_millis(1300), "woke late: {:?}", took);
}

#[test]
fn connect_send_recv_roundtrip() {
    let (addr, server) = echo_server();
    let iom = IoManager::new(2, false, "hook-echo");
    let result: Arc<Mutex<Option<(isize, isize)>>> = Arc::new(Mutex::new(None));
    let switches_before = switch_count();

    let r = result.clone();
    iom.scheduler().schedule(move || {
        let fd = connect_fiber_socket(addr);

        let payload = b"GET / HTTP/1.0\r\n\r\n";
        let sent = hook::send(fd, payload, 0);

        let mut buf = [0u8; 4096];
        let got = hook::recv(fd, &mut buf, 0);

        hook::close(fd);
        *r.lock().unwrap() = Some((sent, got));
    });

    assert!(wait_until(
        || result.lock().unwrap().is_some(),
        Duration::from_secs(5)
    ));
    let (sent, got) = result.lock().unwrap().unwrap();
    assert_eq!(sent, 18);
    assert!(got > 0, "recv returned {}", got);
    assert!(switch_count() > switches_before);

    drop(iom);
    server.join().unwrap();
}

#[test]
fn recv_timeout_surfaces_etimedout() {
    let (addr, server, stop) = silent_server();
    let iom = IoManager::new(2, false, "hook-timeout");
    let result: Arc<Mutex<Option<(isize, i32, Duration)>>> = Arc::new(Mutex::new(None));

    let r = result.clone();
    iom.scheduler().schedule(move || {
        let fd = connect_fiber_socket(addr);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 500_000,
        };
        let rc = unsafe {
            hook::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let start = Instant::now();
        let mut buf = [0u8; 64];
        let n = hook::recv(fd, &mut buf, 0);
        let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        let took = start.elapsed();

        hook::close(fd);
        *r.lock().unwrap() = Some((n, err, took));
    });

    assert!(wait_until(
        || result.lock().unwrap().is_some(),
        Duration::from_secs(5)
    ));
    let (n, err, took) = result.lock().unwrap().unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(took >= Duration::from_millis(490), "timed out early: {:?}", took);
    assert!(took <= Duration::from_millis(900), "timed out late: {:?}", took);
    assert!(wait_until(|| iom.pending_events() == 0, Duration::from_secs(2)));

    stop.store(true, Ordering::SeqCst);
    drop(iom);
    server.join().unwrap();
}

#[test]
fn close_while_waiting_cancels_the_recv() {
    let (addr, server, stop) = silent_server();
    let iom = IoManager::new(2, false, "hook-close-race");
    let fd_cell = Arc::new(AtomicI32::new(-1));
    let result: Arc<Mutex<Option<isize>>> = Arc::new(Mutex::new(None));

    let f = fd_cell.clone();
    let r = result.clone();
    iom.scheduler().schedule(move || {
        let fd = connect_fiber_socket(addr);
        f.store(fd, Ordering::SeqCst);
        let mut buf = [0u8; 64];
        // No timeout set: this recv waits until the fd goes away.
        let n = hook::recv(fd, &mut buf, 0);
        *r.lock().unwrap() = Some(n);
    });

    // Wait until the recv has parked its fiber in the reactor.
    assert!(wait_until(|| iom.pending_events() == 1, Duration::from_secs(5)));

    let f = fd_cell.clone();
    iom.scheduler().schedule(move || {
        hook::close(f.load(Ordering::SeqCst));
    });

    assert!(wait_until(
        || result.lock().unwrap().is_some(),
        Duration::from_secs(5)
    ));
    assert_eq!(result.lock().unwrap().unwrap(), -1);
    assert_eq!(iom.pending_events(), 0);

    stop.store(true, Ordering::SeqCst);
    drop(iom);
    server.join().unwrap();
}

#[test]
fn user_nonblock_bypasses_the_reactor() {
    let (addr, server, stop) = silent_server();
    let iom = IoManager::new(2, false, "hook-nonblock");
    let result: Arc<Mutex<Option<(isize, i32, Duration)>>> = Arc::new(Mutex::new(None));

    let r = result.clone();
    iom.scheduler().schedule(move || {
        let fd = connect_fiber_socket(addr);

        let one: libc::c_int = 1;
        let rc = unsafe {
            hook::ioctl(
                fd,
                libc::FIONBIO,
                &one as *const _ as *mut libc::c_void,
            )
        };
        assert_eq!(rc, 0);

        let start = Instant::now();
        let mut buf = [0u8; 64];
        let n = hook::recv(fd, &mut buf, 0);
        let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        let took = start.elapsed();

        hook::close(fd);
        *r.lock().unwrap() = Some((n, err, took));
    });

    assert!(wait_until(
        || result.lock().unwrap().is_some(),
        Duration::from_secs(5)
    ));
    let (n, err, took) = result.lock().unwrap().unwrap();
    assert_eq!(n, -1);
    assert!(err == libc::EAGAIN || err == libc::EWOULDBLOCK, "errno {}", err);
    assert!(took < Duration::from_millis(100), "blocked for {:?}", took);

    stop.store(true, Ordering::SeqCst);
    drop(iom);
    server.join().unwrap();
}

#[test]
fn getfl_reports_user_flags_on_a_nonblocking_fd() {
    let iom = IoManager::new(2, false, "hook-fcntl");
    let result: Arc<Mutex<Option<(bool, bool, bool)>>> = Arc::new(Mutex::new(None));

    let r = result.clone();
    iom.scheduler().schedule(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let user_view = hook::fcntl(fd, libc::F_GETFL, 0);
        let raw_view = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        let user_clear = user_view & libc::O_NONBLOCK == 0;
        let raw_set = raw_view & libc::O_NONBLOCK != 0;

        hook::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
        let after_set = hook::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0;

        hook::close(fd);
        *r.lock().unwrap() = Some((user_clear, raw_set, after_set));
    });

    assert!(wait_until(
        || result.lock().unwrap().is_some(),
        Duration::from_secs(5)
    ));
    let (user_clear, raw_set, after_set) = result.lock().unwrap().unwrap();
    assert!(user_clear, "user view leaked the implicit O_NONBLOCK");
    assert!(raw_set, "socket was not switched to OS-level non-blocking");
    assert!(after_set, "user-set O_NONBLOCK not reported back");
}

//! TCP echo server on silk fibers
//!
//! One fiber accepts, one fiber per connection echoes. Every socket call
//! goes through the hooked wrappers, so a stalled peer suspends only its
//! fiber while the worker threads keep serving everyone else.
//!
//! ```text
//! SILK_ECHO_PORT=9000 silk-echo
//! ```

use silk::env::env_get;
use silk::{hook, IoManager, Scheduler};
use std::os::unix::io::RawFd;

fn main() {
    let port: u16 = env_get("SILK_ECHO_PORT", 8080);
    let workers: usize = env_get("SILK_ECHO_WORKERS", 4);

    let iom = IoManager::new(workers, false, "silk-echo");
    iom.scheduler().schedule(move || serve(port));

    println!("silk-echo: listening on 0.0.0.0:{} ({} workers)", port, workers);
    loop {
        std::thread::park();
    }
}

fn listen_socket(port: u16) -> RawFd {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    assert!(fd >= 0, "socket() failed: {}", std::io::Error::last_os_error());

    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of_val(&opt) as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of_val(&addr) as libc::socklen_t,
        )
    };
    assert!(rc == 0, "bind({}) failed: {}", port, std::io::Error::last_os_error());

    unsafe { libc::listen(fd, 1024) };
    fd
}

fn serve(port: u16) {
    let listener = listen_socket(port);
    loop {
        let client =
            unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client < 0 {
            eprintln!("accept failed: {}", std::io::Error::last_os_error());
            continue;
        }
        if let Some(sched) = Scheduler::current() {
            sched.schedule(move || echo(client));
        }
    }
}

fn echo(fd: RawFd) {
    let mut buf = [0u8; 4096];
    'conn: loop {
        let n = hook::recv(fd, &mut buf, 0);
        if n <= 0 {
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let m = hook::send(fd, &buf[off..n as usize], 0);
            if m <= 0 {
                break 'conn;
            }
            off += m as usize;
        }
    }
    hook::close(fd);
}

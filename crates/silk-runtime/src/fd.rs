//! Process-global fd registry
//!
//! One slot per fd the hook layer has seen. Registration classifies the fd
//! with `fstat` and silently switches sockets to OS-level non-blocking; the
//! user-visible non-blocking flag is tracked separately so `fcntl(F_GETFL)`
//! keeps reporting what the user set.
//!
//! The registry is process-wide while reactor event slots are per-IoManager:
//! two IoManagers share fd flags and timeouts but not waiters.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Sentinel for "no timeout configured"
pub const NO_TIMEOUT: u64 = u64::MAX;

const INITIAL_SLOTS: usize = 64;

/// Per-fd context tracked by the hook layer
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    /// Classify the fd and force sockets into OS-level non-blocking mode
    fn new(fd: RawFd) -> FdCtx {
        let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    /// Store a per-direction timeout; `kind` is SO_RCVTIMEO or SO_SNDTIMEO
    pub fn set_timeout(&self, kind: libc::c_int, ms: u64) {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.store(ms, Ordering::Relaxed);
        } else {
            self.send_timeout_ms.store(ms, Ordering::Relaxed);
        }
    }

    /// Fetch a per-direction timeout; `NO_TIMEOUT` when unset
    pub fn timeout(&self, kind: libc::c_int) -> u64 {
        if kind == libc::SO_RCVTIMEO {
            self.recv_timeout_ms.load(Ordering::Relaxed)
        } else {
            self.send_timeout_ms.load(Ordering::Relaxed)
        }
    }
}

/// Sparse, growable fd -> context table
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

/// The process-wide registry
pub fn fd_registry() -> &'static FdRegistry {
    static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| FdRegistry {
        slots: RwLock::new(vec![None; INITIAL_SLOTS]),
    })
}

impl FdRegistry {
    /// Look up the context for `fd`, creating it when `auto_create`
    ///
    /// The table grows to 1.5x the fd on first growth past its end.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if let Some(ctx) = &slots[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let new_len = (idx * 3 / 2).max(idx + 1);
            slots.resize(new_len, None);
        }
        // Double-checked: another thread may have created it between locks.
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        slots[idx].clone()
    }

    /// Drop the slot for `fd`; existing handles observe the closed flag
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.closed.store(true, Ordering::Release);
            }
        }
    }
}

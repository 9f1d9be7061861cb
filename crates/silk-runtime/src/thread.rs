//! OS thread wrapper with a start handshake
//!
//! The scheduler pins tasks by kernel TID, so a worker's TID must be known
//! the moment construction returns. The constructor blocks until the new
//! thread has published its TID; only then does the user callback run.

use silk_core::{RuntimeError, RuntimeResult};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Kernel thread id of the calling thread
#[inline]
pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// A named OS thread whose TID is valid immediately after spawn
pub struct OsThread {
    handle: Option<JoinHandle<()>>,
    tid: libc::pid_t,
}

impl OsThread {
    /// Spawn `f` on a new named thread and wait for its TID
    pub fn spawn<F>(name: &str, f: F) -> RuntimeResult<OsThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let gate = Arc::new((Mutex::new(None::<libc::pid_t>), Condvar::new()));
        let child_gate = Arc::clone(&gate);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (lock, cvar) = &*child_gate;
                {
                    let mut slot = lock.lock().unwrap();
                    *slot = Some(gettid());
                    cvar.notify_one();
                }
                f();
            })
            .map_err(|_| RuntimeError::SpawnFailed)?;

        let (lock, cvar) = &*gate;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = cvar.wait(slot).unwrap();
        }
        let tid = slot.take().unwrap_or(-1);

        Ok(OsThread {
            handle: Some(handle),
            tid,
        })
    }

    /// Kernel TID of the spawned thread
    #[inline]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    /// Wait for the thread to finish
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// Dropping without join() detaches, matching std::thread semantics.

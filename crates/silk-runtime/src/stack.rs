//! Fiber stack allocation
//!
//! Stacks are mmap'd with a PROT_NONE guard page at the low end, so an
//! overflow faults instead of silently corrupting a neighbor allocation.
//! The thread's native stack (main fiber) never goes through here.

use std::ptr;

const GUARD_SIZE: usize = 4096;

fn page_size() -> usize {
    // sysconf can in principle fail; 4 KiB is the floor on every target we
    // build for.
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 {
        ps as usize
    } else {
        4096
    }
}

/// An owned, guard-paged fiber stack
pub struct Stack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

impl Stack {
    /// Map a stack of at least `size` usable bytes
    ///
    /// Allocation failure is fatal: a fiber without a stack cannot exist and
    /// the runtime has nothing sensible to roll back to.
    pub fn alloc(size: usize) -> Stack {
        let page = page_size();
        let usable = (size.max(page) + page - 1) & !(page - 1);
        let total = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!(
                "fiber stack mmap({} bytes) failed: {}",
                total,
                std::io::Error::last_os_error()
            );
        }

        // Everything above the guard page becomes usable; the guard page
        // itself stays PROT_NONE.
        let rc = unsafe {
            libc::mprotect(
                (base as *mut u8).wrapping_add(GUARD_SIZE) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            panic!(
                "fiber stack mprotect failed: {}",
                std::io::Error::last_os_error()
            );
        }

        Stack {
            base: base as *mut u8,
            total,
            usable,
        }
    }

    /// Highest address of the stack; grows downward from here
    #[inline]
    pub fn top(&self) -> *mut u8 {
        self.base.wrapping_add(self.total)
    }

    /// Usable bytes (excludes the guard page)
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        if rc != 0 {
            silk_core::log_error!(
                "fiber stack munmap failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

// The mapping is uniquely owned and only the fiber running on it touches the
// memory; moving the owning Fiber across threads is safe.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

//! # silk-runtime - stackful fibers over a worker pool
//!
//! A cooperative concurrency runtime built from four interlocking parts:
//!
//! - **Fiber**: a stackful coroutine with an owned guard-paged stack and an
//!   assembly-level context switch (`fiber`, `arch`, `stack`).
//! - **Scheduler**: worker threads pulling from a FIFO task queue with
//!   optional per-worker pinning and a tickle/idle wakeup protocol
//!   (`scheduler`, `thread`).
//! - **Reactor**: an edge-triggered epoll loop that turns fd readiness into
//!   scheduler tasks (`reactor`).
//! - **Timers**: a deadline-ordered set with recurring timers, condition
//!   timers and bulk expiry harvesting (`timer`).
//!
//! The `hook` module ties them together: blocking-shaped socket calls made
//! inside a fiber suspend it until readiness or timeout.
//!
//! ```ignore
//! use silk_runtime::{hook, IoManager};
//!
//! let iom = IoManager::new(2, false, "demo");
//! iom.scheduler().schedule(|| {
//!     let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!     // connect/send/recv here suspend the fiber, not the thread
//!     hook::close(fd);
//! });
//! ```

pub mod arch;
pub mod config;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;

pub use config::RuntimeConfig;
pub use fiber::{yield_now, Fiber};
pub use reactor::{Event, IoManager, Reactor};
pub use scheduler::Scheduler;
pub use timer::{Timer, TimerManager};

//! # silk - a stackful fiber runtime
//!
//! Fibers multiplexed over a worker-thread pool, with an epoll reactor that
//! bridges would-block socket calls into fiber suspension and a timer
//! service for delays and per-operation timeouts.
//!
//! ## Quick start
//!
//! ```ignore
//! use silk::{IoManager, hook};
//!
//! fn main() {
//!     let iom = IoManager::new(2, false, "app");
//!     iom.scheduler().schedule(|| {
//!         // Blocking-shaped calls inside a fiber suspend the fiber only;
//!         // the worker thread keeps running other fibers.
//!         hook::sleep(1);
//!     });
//! }
//! ```

pub use silk_core::env;
pub use silk_core::error::{ReactorError, RuntimeError, RuntimeResult};
pub use silk_core::id::FiberId;
pub use silk_core::log;
pub use silk_core::state::FiberState;

pub use silk_runtime::config::RuntimeConfig;
pub use silk_runtime::fd::{fd_registry, FdCtx, NO_TIMEOUT};
pub use silk_runtime::fiber::{fiber_count, switch_count, yield_now, Fiber};
pub use silk_runtime::hook;
pub use silk_runtime::reactor::{Event, IoManager, Reactor};
pub use silk_runtime::scheduler::Scheduler;
pub use silk_runtime::thread::{gettid, OsThread};
pub use silk_runtime::timer::{Timer, TimerManager};

//! Architecture-specific context switching
//!
//! Each submodule provides the saved-register block (`Context`), the
//! assembly context switch, and the entry trampoline for new fibers.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("silk-runtime supports x86_64 and aarch64 only");
    }
}

//! Leveled stderr logging for the runtime
//!
//! The runtime logs from fiber stacks and from inside the reactor loop, so
//! the implementation stays allocation-free on the fast path: a level check
//! against an atomic, then a single locked write to stderr.
//!
//! # Environment Variables
//!
//! - `SILK_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `SILK_FLUSH_LOG=1` - flush stderr after each line

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN ]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables
///
/// Called automatically on the first log line; explicit calls are idempotent.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("SILK_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("SILK_FLUSH_LOG") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
}

/// Get the current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set the log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check whether a level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::LogLevel::Trace, format_args!($($arg)*));
    }};
}

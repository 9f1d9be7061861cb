//! Error types for the silk runtime

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the runtime's public API
///
/// Fiber stack allocation and context-initialization failures are not here:
/// the runtime cannot uphold its invariants past them, so they panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Configuration rejected by validation
    InvalidConfig(&'static str),

    /// OS thread creation failed
    SpawnFailed,

    /// The scheduler is already shutting down
    Stopping,

    /// Reactor-level failure
    Reactor(ReactorError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            RuntimeError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            RuntimeError::Stopping => write!(f, "scheduler is stopping"),
            RuntimeError::Reactor(e) => write!(f, "reactor error: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Errors from event registration on the I/O reactor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    /// The same event is already registered on this fd
    DuplicateEvent,

    /// A readiness registration needs a running fiber or a callback
    NoWaiter,

    /// epoll_ctl failed; carries the raw errno
    Epoll { op: &'static str, errno: i32 },
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::DuplicateEvent => write!(f, "event already registered on fd"),
            ReactorError::NoWaiter => write!(f, "no running fiber and no callback to register"),
            ReactorError::Epoll { op, errno } => {
                write!(f, "epoll_ctl {} failed: errno {}", op, errno)
            }
        }
    }
}

impl std::error::Error for ReactorError {}

impl From<ReactorError> for RuntimeError {
    fn from(e: ReactorError) -> Self {
        RuntimeError::Reactor(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::SpawnFailed;
        assert_eq!(format!("{}", e), "failed to spawn worker thread");

        let e = ReactorError::Epoll { op: "ADD", errno: 9 };
        assert_eq!(format!("{}", e), "epoll_ctl ADD failed: errno 9");
    }

    #[test]
    fn test_error_conversion() {
        let e: RuntimeError = ReactorError::DuplicateEvent.into();
        assert!(matches!(e, RuntimeError::Reactor(ReactorError::DuplicateEvent)));
    }
}

//! Fiber state machine

use core::fmt;

/// State of a fiber
///
/// Legal transitions: Ready -> Running (resume), Running -> Ready (yield),
/// Running -> Term (entry returned). Term is terminal; `Fiber::reset` builds
/// a fresh Ready fiber on the retained stack rather than reviving this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Runnable, waiting for a resume
    Ready = 0,

    /// Currently executing on some thread
    Running = 1,

    /// Entry function returned; stack retained until the handle drops
    Term = 2,
}

impl FiberState {
    /// Check whether a resume is legal from this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check whether the fiber has finished
    #[inline]
    pub const fn is_term(&self) -> bool {
        matches!(self, FiberState::Term)
    }

    /// Decode the atomic representation
    #[inline]
    pub const fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

impl From<FiberState> for u8 {
    #[inline]
    fn from(s: FiberState) -> u8 {
        s as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Ready => write!(f, "READY"),
            FiberState::Running => write!(f, "RUNNING"),
            FiberState::Term => write!(f, "TERM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_resumable());
        assert!(!FiberState::Running.is_resumable());
        assert!(!FiberState::Term.is_resumable());

        assert!(FiberState::Term.is_term());
        assert!(!FiberState::Ready.is_term());
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [FiberState::Ready, FiberState::Running, FiberState::Term] {
            assert_eq!(FiberState::from_u8(s as u8), s);
        }
    }
}

//! Fiber identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a fiber
///
/// Ids are handed out monotonically for the lifetime of the process and are
/// never reused, so a `FiberId` seen in a log line always names one fiber.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

impl FiberId {
    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_id_conversion() {
        let id = FiberId::next();
        let raw: u64 = id.into();
        assert_eq!(raw, id.as_u64());
    }
}

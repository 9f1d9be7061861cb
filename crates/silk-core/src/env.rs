//! Environment variable helpers
//!
//! Small `env_get<T>` helpers for overriding runtime defaults, e.g.
//! `SILK_WORKERS=8` or `SILK_LOG_LEVEL=debug`.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true; anything
/// else set counts as false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__SILK_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("__SILK_TEST_NUM__", "123");
        let val: usize = env_get("__SILK_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__SILK_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse_falls_back() {
        std::env::set_var("__SILK_TEST_BAD__", "not_a_number");
        let val: u64 = env_get("__SILK_TEST_BAD__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__SILK_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        assert!(env_get_bool("__SILK_TEST_UNSET__", true));
        assert!(!env_get_bool("__SILK_TEST_UNSET__", false));

        std::env::set_var("__SILK_TEST_BOOL__", "on");
        assert!(env_get_bool("__SILK_TEST_BOOL__", false));
        std::env::set_var("__SILK_TEST_BOOL__", "garbage");
        assert!(!env_get_bool("__SILK_TEST_BOOL__", true));
        std::env::remove_var("__SILK_TEST_BOOL__");
    }
}

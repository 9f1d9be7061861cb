//! Runtime configuration

use crate::fd::NO_TIMEOUT;
use crate::reactor::IoManager;
use silk_core::env::env_get;
use silk_core::{RuntimeError, RuntimeResult};

/// Configuration for an `IoManager`
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Total worker threads, including the caller when `use_caller`
    pub threads: usize,

    /// Whether the constructing thread participates as a worker
    pub use_caller: bool,

    /// Scheduler name, used for worker thread names and log lines
    pub name: String,

    /// Default fiber stack size in bytes
    pub stack_size: usize,

    /// Default `connect` timeout; `NO_TIMEOUT` disables it
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            threads: cpus,
            use_caller: true,
            name: "silk".to_string(),
            stack_size: 1024 * 1024,
            connect_timeout_ms: NO_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SILK_WORKERS`, `SILK_STACK_SIZE` and
    /// `SILK_CONNECT_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            threads: env_get("SILK_WORKERS", base.threads),
            stack_size: env_get("SILK_STACK_SIZE", base.stack_size),
            connect_timeout_ms: env_get("SILK_CONNECT_TIMEOUT_MS", base.connect_timeout_ms),
            ..base
        }
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, on: bool) -> Self {
        self.use_caller = on;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.threads == 0 {
            return Err(RuntimeError::InvalidConfig("threads must be at least 1"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(RuntimeError::InvalidConfig("stack_size below 16 KiB"));
        }
        Ok(())
    }

    /// Apply the config and start a reactor
    pub fn build(self) -> RuntimeResult<IoManager> {
        self.validate()?;
        crate::fiber::set_default_stack_size(self.stack_size);
        crate::hook::set_connect_timeout_ms(self.connect_timeout_ms);
        Ok(IoManager::new(self.threads, self.use_caller, &self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let cfg = RuntimeConfig::default().threads(0);
        assert!(matches!(
            cfg.validate(),
            Err(RuntimeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_tiny_stack_rejected() {
        let cfg = RuntimeConfig::default().stack_size(1024);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SILK_WORKERS", "3");
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.threads, 3);
        std::env::remove_var("SILK_WORKERS");
    }
}

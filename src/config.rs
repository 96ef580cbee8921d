//! Configuration surface passed to [`crate::Profiler::start`].
//!
//! Mirrors the four options the façade exposes at the start boundary;
//! everything else (ring buffer sizing, per-platform handles) is
//! derived from these at start time and lives in `SamplerState`, not
//! here.

use crate::error::{Error, Result};
use crate::ring_buffer::MIN_CAPACITY;
use std::mem::size_of;

/// Smallest accepted interval between samples.
pub const MIN_INTERVAL_MS: u64 = 1;
/// Largest accepted interval between samples.
pub const MAX_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Debug)]
pub struct Config {
    /// Time between samples, in milliseconds. Must be in `[1, 1000]`.
    pub interval_ms: u64,

    /// Sizing hint for the ring buffer, in megabytes. Translated into a
    /// power-of-two slot count by [`Config::ring_buffer_capacity`].
    pub memory_limit_mb: u64,

    /// Whether to also capture native return addresses alongside
    /// interpreter frames.
    pub native_unwinding: bool,

    /// If set, the resolver rejects code-object pointers that were not
    /// strongly pinned by the sampler (see
    /// [`crate::code_registry::CodeRegistry`]).
    pub safe_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_ms: 10,
            memory_limit_mb: 8,
            native_unwinding: false,
            safe_mode: false,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval_ms < MIN_INTERVAL_MS || self.interval_ms > MAX_INTERVAL_MS {
            return Err(Error::InvalidArgument(format!(
                "interval_ms must be in [{MIN_INTERVAL_MS}, {MAX_INTERVAL_MS}], got {}",
                self.interval_ms
            )));
        }
        Ok(())
    }

    /// `capacity = floor_pow2(mb * 2^20 / sizeof(RawSample))`, clamped
    /// to at least [`MIN_CAPACITY`].
    pub(crate) fn ring_buffer_capacity(&self) -> usize {
        let bytes = (self.memory_limit_mb as usize).saturating_mul(1 << 20);
        let slots = bytes / size_of::<crate::types::RawSample>();
        let pow2 = slots.checked_ilog2().map(|p| 1usize << p).unwrap_or(0);
        pow2.max(MIN_CAPACITY)
    }

    pub(crate) fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_interval_out_of_range() {
        let mut cfg = Config::default();
        cfg.interval_ms = 0;
        assert!(cfg.validate().is_err());
        cfg.interval_ms = 1001;
        assert!(cfg.validate().is_err());
        cfg.interval_ms = 10;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn capacity_is_power_of_two_and_clamped() {
        let mut cfg = Config::default();
        cfg.memory_limit_mb = 0;
        assert_eq!(cfg.ring_buffer_capacity(), MIN_CAPACITY);

        cfg.memory_limit_mb = 64;
        let cap = cfg.ring_buffer_capacity();
        assert!(cap.is_power_of_two());
        assert!(cap >= MIN_CAPACITY);
    }
}

//! Crate-wide monotonic counters (§3 `StatisticsCounters`).
//!
//! Every counter here is a plain [`AtomicU64`] incremented with
//! `Ordering::Relaxed` — readers only ever want an approximate
//! snapshot (see §5, "Ordering guarantees"), never a synchronization
//! point. None of these are ever decremented.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct StatisticsCounters {
    pub samples_captured: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub validation_drops: AtomicU64,
    pub threads_sampled: AtomicU64,
    pub threads_skipped: AtomicU64,
    pub suspend_time_total_ns: AtomicU64,
    pub max_suspend_time_ns: AtomicU64,
    pub walk_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub code_registry_invalidations: AtomicU64,
    pub safe_mode_rejects: AtomicU64,
}

impl StatisticsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_captured(&self) {
        Self::bump(&self.samples_captured);
    }

    pub fn record_dropped(&self) {
        Self::bump(&self.samples_dropped);
    }

    pub fn record_validation_drop(&self) {
        Self::bump(&self.validation_drops);
    }

    pub fn record_thread_sampled(&self) {
        Self::bump(&self.threads_sampled);
    }

    pub fn record_thread_skipped(&self) {
        Self::bump(&self.threads_skipped);
    }

    pub fn record_suspend_time(&self, duration_ns: u64) {
        self.suspend_time_total_ns
            .fetch_add(duration_ns, Ordering::Relaxed);
        // Not a compare-and-swap loop: a slightly stale max under
        // concurrent suspends is acceptable, this is a diagnostic, not
        // a guarantee (see §5 ordering guarantees for counters).
        let prev = self.max_suspend_time_ns.load(Ordering::Relaxed);
        if duration_ns > prev {
            self.max_suspend_time_ns
                .store(duration_ns, Ordering::Relaxed);
        }
    }

    pub fn record_walk_error(&self) {
        Self::bump(&self.walk_errors);
    }

    pub fn record_cache_hit(&self) {
        Self::bump(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        Self::bump(&self.cache_misses);
    }

    pub fn record_cache_eviction(&self) {
        Self::bump(&self.cache_evictions);
    }

    pub fn record_code_registry_invalidation(&self) {
        Self::bump(&self.code_registry_invalidations);
    }

    pub fn record_safe_mode_reject(&self) {
        Self::bump(&self.safe_mode_rejects);
    }

    pub fn load(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// User-facing snapshot returned by [`crate::Profiler::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stats {
    pub collected_samples: u64,
    pub dropped_samples: u64,
    pub validation_drops: u64,
    pub duration_ns: u64,
    pub interval_ns: u64,
    pub safe_mode_rejects: u64,
}

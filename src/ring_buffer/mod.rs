//! Lock-free single-producer/single-consumer ring buffer of
//! [`RawSample`]s (§4.1).
//!
//! The producer is the platform sampler — possibly running in signal
//! context — so `write` must never allocate, lock, or call into any
//! foreign API. `read` has no such constraint but is kept just as
//! simple since it runs on every `drain` call.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::RawSample;

/// Floor for the computed capacity in [`crate::config::Config::ring_buffer_capacity`].
pub const MIN_CAPACITY: usize = 1024;

pub enum WriteOutcome {
    Written,
    Dropped,
}

pub enum ReadOutcome {
    Read(RawSample),
    Empty,
}

/// Fixed-capacity power-of-two slot array shared between exactly one
/// producer and one consumer (§I3).
pub struct RingBuffer {
    mask: u64,
    slots: Box<[UnsafeCell<RawSample>]>,
    write_idx: AtomicU64,
    read_idx: AtomicU64,
    dropped: AtomicU64,
}

// SAFETY: `slots` is only ever written by the single producer at
// `write_idx mod capacity` and only ever read by the single consumer
// at `read_idx mod capacity`; the two indices never name the same
// slot as writable-and-readable at once because `write` refuses to
// advance past a full buffer (see `write` below).
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(RawSample::default()));
        RingBuffer {
            mask: (capacity - 1) as u64,
            slots: slots.into_boxed_slice(),
            write_idx: AtomicU64::new(0),
            read_idx: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Async-signal-safe: no allocation, no locking, no foreign calls.
    pub fn write(&self, sample: &RawSample) -> WriteOutcome {
        let write = self.write_idx.load(Ordering::Relaxed);
        let read = self.read_idx.load(Ordering::Acquire);

        if write - read == self.mask + 1 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return WriteOutcome::Dropped;
        }

        let slot = (write & self.mask) as usize;
        // SAFETY: the capacity check above guarantees this slot is not
        // concurrently being read by the consumer.
        unsafe { *self.slots[slot].get() = *sample };

        // I1: the payload store above is ordered before this release
        // store, so a consumer observing the new `write_idx` also
        // observes the payload.
        self.write_idx.store(write + 1, Ordering::Release);
        WriteOutcome::Written
    }

    pub fn read(&self) -> ReadOutcome {
        let read = self.read_idx.load(Ordering::Relaxed);
        let write = self.write_idx.load(Ordering::Acquire);

        if read == write {
            return ReadOutcome::Empty;
        }

        let slot = (read & self.mask) as usize;
        // SAFETY: symmetric to `write`: the producer will not reuse
        // this slot until `read_idx` has advanced past it.
        let sample = unsafe { *self.slots[slot].get() };
        self.read_idx.store(read + 1, Ordering::Release);
        ReadOutcome::Read(sample)
    }

    pub fn has_data(&self) -> bool {
        self.read_idx.load(Ordering::Relaxed) != self.write_idx.load(Ordering::Acquire)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Only legal when no producer or consumer is concurrently live.
    pub fn reset(&self) {
        self.write_idx.store(0, Ordering::Relaxed);
        self.read_idx.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

//! Platform sampler engines (§4.5–4.7). Exactly one backend is
//! compiled in per target: POSIX per-thread signal timers on Linux
//! and friends, Mach thread suspension on Darwin, and a timer-queue
//! callback on Windows. All three share [`ThreadRegistry`] and
//! publish into the same [`crate::ring_buffer::RingBuffer`].

use std::collections::HashMap;
use std::sync::Mutex;

#[cfg(target_os = "macos")]
pub mod darwin;
#[cfg(unix)]
pub mod posix;
#[cfg(windows)]
pub mod windows;

/// Opaque accessor the embedder supplies at start time: given an OS
/// thread id, returns the target runtime's thread-state pointer for
/// that thread, or null if the runtime doesn't know about it.
///
/// A plain (non-capturing) function pointer, not a closure: the POSIX
/// backend calls this from signal context, where a boxed closure's
/// heap-allocated vtable is exactly the kind of thing §4.2's design
/// notes forbid.
pub type ThreadStateAccessor = extern "C" fn(thread_id: u64) -> *const ();

/// Upper bound on snapshot size per sampling cycle (§4.6 step 2).
pub const MAX_THREADS_PER_CYCLE: usize = 256;

#[derive(Clone, Copy)]
pub struct ThreadEntry {
    pub thread_id: u64,
    /// Mach port / native handle, meaningful only on the Darwin
    /// backend; left at 0 elsewhere.
    pub native_handle: usize,
    pub stack_low: usize,
    pub stack_high: usize,
    pub alive: bool,
}

/// Live-thread registry shared between the registration hook
/// (multi-producer: any thread may register or unregister itself or
/// another) and the sampler (single consumer, snapshots under the
/// lock and iterates the copy per §5).
#[derive(Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<u64, ThreadEntry>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry::default()
    }

    pub fn register(&self, entry: ThreadEntry) {
        self.threads.lock().unwrap().insert(entry.thread_id, entry);
    }

    pub fn unregister(&self, thread_id: u64) {
        self.threads.lock().unwrap().remove(&thread_id);
    }

    /// Marks a thread as invalid without removing it; removal happens
    /// in the next [`ThreadRegistry::compact`] call (§4.6: "a
    /// compaction pass removes invalid entries periodically").
    pub fn mark_terminated(&self, thread_id: u64) {
        if let Some(entry) = self.threads.lock().unwrap().get_mut(&thread_id) {
            entry.alive = false;
        }
    }

    pub fn compact(&self) {
        self.threads.lock().unwrap().retain(|_, e| e.alive);
    }

    /// Copies up to [`MAX_THREADS_PER_CYCLE`] live entries out from
    /// under the lock, per the snapshot pattern in §5.
    pub fn snapshot(&self) -> Vec<ThreadEntry> {
        self.threads
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.alive)
            .take(MAX_THREADS_PER_CYCLE)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> ThreadEntry {
        ThreadEntry {
            thread_id: id,
            native_handle: 0,
            stack_low: 0,
            stack_high: 0,
            alive: true,
        }
    }

    #[test]
    fn mark_terminated_hides_from_snapshot_but_compact_is_required_to_remove() {
        let reg = ThreadRegistry::new();
        reg.register(entry(1));
        reg.register(entry(2));
        reg.mark_terminated(1);

        assert_eq!(reg.snapshot().len(), 1);
        assert_eq!(reg.len(), 2); // still present until compaction

        reg.compact();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn snapshot_bounds_at_max_threads_per_cycle() {
        let reg = ThreadRegistry::new();
        for i in 0..(MAX_THREADS_PER_CYCLE + 10) as u64 {
            reg.register(entry(i));
        }
        assert_eq!(reg.snapshot().len(), MAX_THREADS_PER_CYCLE);
    }
}

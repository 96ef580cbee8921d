//! Darwin/Mach sampler: a dedicated sampler thread that suspends each
//! live runtime thread in turn, walks it, and resumes it (§4.6).
//!
//! Unlike the POSIX backend this runs no code in signal context, so
//! it is free to take the runtime lock and the code registry's mutex
//! directly while a target thread is halted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::thread_act_t;
use mach2::thread_act::{thread_get_state, thread_resume, thread_suspend};
#[cfg(target_arch = "x86_64")]
use mach2::structs::x86_thread_state64_t as PlatformThreadState;
#[cfg(target_arch = "aarch64")]
use mach2::structs::arm_thread_state64_t as PlatformThreadState;
#[cfg(target_arch = "x86_64")]
use mach2::thread_status::x86_THREAD_STATE64 as PLATFORM_THREAD_STATE_FLAVOR;
#[cfg(target_arch = "aarch64")]
use mach2::thread_status::ARM_THREAD_STATE64 as PLATFORM_THREAD_STATE_FLAVOR;

use crate::code_registry::CodeRegistry;
use crate::error::{Error, Result};
use crate::frame_walker;
use crate::native_unwinder::{self, registers};
use crate::ring_buffer::{RingBuffer, WriteOutcome};
use crate::sampler::{ThreadEntry, ThreadRegistry, ThreadStateAccessor};
use crate::stats::StatisticsCounters;
use crate::types::{RawSample, MAX_DEPTH};

/// Number of per-interval cycles between compaction passes (§4.6
/// step 4). Arbitrary but small enough that a churn-heavy thread pool
/// doesn't let dead entries pile up for long.
const COMPACTION_INTERVAL_CYCLES: u64 = 64;

fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: plain stack value, always-safe syscall.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Suspends, reads, walks and resumes one target thread.
///
/// # Safety
/// `entry.native_handle` must be a live Mach thread port the caller
/// has exclusive responsibility for resuming — every return path in
/// this function resumes the target before returning, per §4.6 step e.
unsafe fn sample_one_thread(
    entry: &ThreadEntry,
    accessor: ThreadStateAccessor,
    cached_type_desc: *const (),
    native_unwinding: bool,
    registry: &CodeRegistry,
    gc_epoch: u64,
    stats: &StatisticsCounters,
) -> Option<RawSample> {
    let port = entry.native_handle as thread_act_t;

    let suspend_rc = thread_suspend(port);
    if suspend_rc != KERN_SUCCESS {
        stats.record_thread_skipped();
        return None;
    }

    let mut sample = RawSample::default();
    sample.thread_id = entry.thread_id;
    sample.timestamp_ns = monotonic_now_ns();

    let mut state = std::mem::zeroed::<PlatformThreadState>();
    let mut count = (std::mem::size_of::<PlatformThreadState>() / std::mem::size_of::<u32>()) as u32;
    let got_state = thread_get_state(
        port,
        PLATFORM_THREAD_STATE_FLAVOR as i32,
        &mut state as *mut _ as *mut u32,
        &mut count,
    );

    if got_state == KERN_SUCCESS {
        if native_unwinding {
            let regs = registers_from_state(&state);
            let (pcs, depth) =
                native_unwinder::walk_fp_chain(&regs, entry.stack_low, entry.stack_high, 0, MAX_DEPTH);
            sample.native_pcs = pcs;
            sample.native_depth = depth;
        }

        let tstate = accessor(entry.thread_id);
        // SAFETY: the target thread is suspended (caller holds it
        // suspended for the duration of this step), and this block
        // additionally runs under the runtime lock, so the frame
        // chain `tstate` points at cannot mutate concurrently.
        let result = unsafe { frame_walker::walk(tstate as *const _, MAX_DEPTH) };
        sample.interp_depth = result.depth;
        sample.interp_code_addrs = result.code_addrs;
        sample.interp_instr_addrs = result.instr_addrs;
        for i in 0..result.depth {
            registry.add_ref(result.code_addrs[i], gc_epoch);
        }
        let _ = cached_type_desc; // strong-pin mode needs no type check at capture time
    } else {
        stats.record_walk_error();
    }

    thread_resume(port);
    Some(sample)
}

#[cfg(target_arch = "x86_64")]
fn registers_from_state(state: &PlatformThreadState) -> registers::Registers {
    registers::from_mach_thread_state(state)
}

#[cfg(target_arch = "aarch64")]
fn registers_from_state(state: &PlatformThreadState) -> registers::Registers {
    registers::from_mach_thread_state(state)
}

/// Dedicated-sampler-thread backend (§4.6).
pub struct DarwinSampler {
    running: Arc<AtomicBool>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Default for DarwinSampler {
    fn default() -> Self {
        DarwinSampler::new()
    }
}

impl DarwinSampler {
    pub fn new() -> Self {
        DarwinSampler {
            running: Arc::new(AtomicBool::new(false)),
            join: Mutex::new(None),
        }
    }

    pub fn start(
        &self,
        threads: Arc<ThreadRegistry>,
        ring: Arc<RingBuffer>,
        registry: Arc<CodeRegistry>,
        stats: Arc<StatisticsCounters>,
        interval: Duration,
        native_unwinding: bool,
        accessor: ThreadStateAccessor,
        cached_type_desc: usize,
        current_gc_epoch: impl Fn() -> u64 + Send + 'static,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }

        let running = Arc::clone(&self.running);
        let handle = std::thread::spawn(move || {
            let mut next_tick = std::time::Instant::now() + interval;
            let mut cycle: u64 = 0;
            while running.load(Ordering::Acquire) {
                let now = std::time::Instant::now();
                if now < next_tick {
                    std::thread::sleep(next_tick - now);
                } else {
                    // Missed the deadline: catch up to now + interval
                    // rather than firing back-to-back (§4.6 step 1).
                    next_tick = now;
                }
                next_tick += interval;

                let snapshot = threads.snapshot();
                let own_tid = std::thread::current().id();
                let _ = own_tid; // the sampler thread never registers itself
                let gc_epoch = current_gc_epoch();

                for entry in &snapshot {
                    // SAFETY: `entry` came from a live-thread snapshot;
                    // suspend/resume is paired inside `sample_one_thread`.
                    let sampled = unsafe {
                        sample_one_thread(
                            entry,
                            accessor,
                            cached_type_desc as *const (),
                            native_unwinding,
                            &registry,
                            gc_epoch,
                            &stats,
                        )
                    };
                    if let Some(sample) = sampled {
                        match ring.write(&sample) {
                            WriteOutcome::Written => stats.record_captured(),
                            WriteOutcome::Dropped => stats.record_dropped(),
                        }
                    }
                }

                cycle += 1;
                if cycle % COMPACTION_INTERVAL_CYCLES == 0 {
                    threads.compact();
                }
            }
        });

        *self.join.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

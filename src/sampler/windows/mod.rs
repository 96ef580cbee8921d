//! Windows timer-queue sampler (§4.7).
//!
//! A timer-queue callback fires on a pool thread, synchronizes with
//! the runtime lock to snapshot the thread list, and for each thread
//! reads state through the threading subsystem's safe inspection
//! APIs. Unlike the POSIX and Darwin backends, line numbers are read
//! *during* sampling and stashed directly in
//! [`crate::types::RawSample::interp_instr_addrs`] as small integers
//! (§4.7); the resolver recognizes this by range
//! ([`crate::types::WINDOWS_LINE_NUMBER_MAX`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::Diagnostics::Debug::{
    GetThreadContext, StackWalk64, CONTEXT, STACKFRAME64,
};
use windows_sys::Win32::System::Threading::{
    CreateTimerQueue, CreateTimerQueueTimer, DeleteTimerQueueEx, GetCurrentThread,
    ResumeThread, SuspendThread, WT_EXECUTEDEFAULT,
};

use crate::error::{Error, Result};
use crate::ring_buffer::{RingBuffer, WriteOutcome};
use crate::sampler::{ThreadEntry, ThreadRegistry, ThreadStateAccessor};
use crate::stats::StatisticsCounters;
use crate::types::{RawSample, MAX_DEPTH};

/// Per-thread line-and-frame reader the embedder supplies: given the
/// runtime's thread-state pointer (obtained via [`ThreadStateAccessor`]),
/// fills `out` leaf-first and returns the frame count. Called while
/// the runtime lock is held, so it is free to call back into the
/// runtime's own line-number APIs (§4.7: "safe inspection APIs").
pub type InterpreterFrameReader =
    extern "C" fn(tstate: *const (), out_codes: *mut usize, out_lines: *mut usize, max_depth: usize) -> usize;

struct SharedState {
    threads: Arc<ThreadRegistry>,
    ring: Arc<RingBuffer>,
    stats: Arc<StatisticsCounters>,
    native_unwinding: bool,
    accessor: ThreadStateAccessor,
    frame_reader: InterpreterFrameReader,
}

extern "system" fn timer_callback(param: *mut std::ffi::c_void, _fired: u8) {
    // SAFETY: `param` is the `Box<SharedState>` pointer leaked by
    // `WindowsSampler::start` and kept alive until `stop`.
    let state = unsafe { &*(param as *const SharedState) };

    for entry in state.threads.snapshot() {
        sample_one_thread(&entry, state);
    }
}

fn sample_one_thread(entry: &ThreadEntry, state: &SharedState) {
    let handle = entry.native_handle as HANDLE;

    // SAFETY: `handle` is a live thread handle from the registry.
    let suspend_count = unsafe { SuspendThread(handle) };
    if suspend_count == u32::MAX {
        state.stats.record_thread_skipped();
        return;
    }

    let mut sample = RawSample::default();
    sample.thread_id = entry.thread_id;
    sample.timestamp_ns = monotonic_now_ns();

    let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
    ctx.ContextFlags = windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_FULL_AMD64;
    // SAFETY: thread is suspended; `ctx` is a plausible CONTEXT buffer.
    let got_context = unsafe { GetThreadContext(handle, &mut ctx) };

    if got_context != 0 {
        let tstate = (state.accessor)(entry.thread_id);
        let mut codes = [0usize; MAX_DEPTH];
        let mut lines = [0usize; MAX_DEPTH];
        let depth = (state.frame_reader)(
            tstate,
            codes.as_mut_ptr(),
            lines.as_mut_ptr(),
            MAX_DEPTH,
        )
        .min(MAX_DEPTH);
        sample.interp_depth = depth;
        sample.interp_code_addrs[..depth].copy_from_slice(&codes[..depth]);
        sample.interp_instr_addrs[..depth].copy_from_slice(&lines[..depth]);

        if state.native_unwinding {
            sample.native_depth = walk_native_stack(handle, &ctx, &mut sample.native_pcs);
        }
    } else {
        state.stats.record_walk_error();
    }

    // SAFETY: `handle` was successfully suspended above; every path
    // from here resumes it, per §4.6's resume-on-every-exit pattern
    // (the same discipline applies to this backend's suspend/resume).
    unsafe { ResumeThread(handle) };

    match state.ring.write(&sample) {
        WriteOutcome::Written => state.stats.record_captured(),
        WriteOutcome::Dropped => state.stats.record_dropped(),
    }
}

fn walk_native_stack(handle: HANDLE, ctx: &CONTEXT, out: &mut [usize; MAX_DEPTH]) -> usize {
    let mut frame: STACKFRAME64 = unsafe { std::mem::zeroed() };
    frame.AddrPC.Offset = ctx.Rip;
    frame.AddrPC.Mode = windows_sys::Win32::System::Diagnostics::Debug::ADDRESS_MODE(3); // AddrModeFlat
    frame.AddrFrame.Offset = ctx.Rbp;
    frame.AddrFrame.Mode = windows_sys::Win32::System::Diagnostics::Debug::ADDRESS_MODE(3);
    frame.AddrStack.Offset = ctx.Rsp;
    frame.AddrStack.Mode = windows_sys::Win32::System::Diagnostics::Debug::ADDRESS_MODE(3);

    let process = unsafe { windows_sys::Win32::System::Threading::GetCurrentProcess() };
    let mut depth = 0;
    let mut ctx_copy = *ctx;
    while depth < MAX_DEPTH {
        // SAFETY: DbgHelp has been initialized once by the façade at
        // start time (`SymInitialize`); `process`/`handle` are valid.
        let ok = unsafe {
            StackWalk64(
                windows_sys::Win32::System::Diagnostics::Debug::IMAGE_FILE_MACHINE_AMD64 as u32,
                process,
                handle,
                &mut frame,
                &mut ctx_copy as *mut CONTEXT as *mut std::ffi::c_void,
                None,
                None,
                None,
                None,
            )
        };
        if ok == 0 || frame.AddrPC.Offset == 0 {
            break;
        }
        out[depth] = frame.AddrPC.Offset as usize;
        depth += 1;
    }
    depth
}

fn monotonic_now_ns() -> u64 {
    use windows_sys::Win32::System::SystemInformation::GetTickCount64;
    // SAFETY: trivial kernel call, no arguments.
    unsafe { GetTickCount64() * 1_000_000 }
}

/// Timer-queue-callback backend (§4.7).
pub struct WindowsSampler {
    queue: Mutex<Option<HANDLE>>,
    timer: Mutex<Option<HANDLE>>,
    state: Mutex<Option<Box<SharedState>>>,
    running: AtomicBool,
}

// SAFETY: the raw `HANDLE`s are only ever touched through the Windows
// timer-queue API, which is documented thread-safe for this usage.
unsafe impl Send for WindowsSampler {}
unsafe impl Sync for WindowsSampler {}

impl Default for WindowsSampler {
    fn default() -> Self {
        WindowsSampler::new()
    }
}

impl WindowsSampler {
    pub fn new() -> Self {
        WindowsSampler {
            queue: Mutex::new(None),
            timer: Mutex::new(None),
            state: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        threads: Arc<ThreadRegistry>,
        ring: Arc<RingBuffer>,
        stats: Arc<StatisticsCounters>,
        interval: Duration,
        native_unwinding: bool,
        accessor: ThreadStateAccessor,
        frame_reader: InterpreterFrameReader,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }

        let shared = Box::new(SharedState {
            threads,
            ring,
            stats,
            native_unwinding,
            accessor,
            frame_reader,
        });
        let shared_ptr = shared.as_ref() as *const SharedState as *mut std::ffi::c_void;

        // SAFETY: `CreateTimerQueue` takes no arguments that can be
        // misused.
        let queue = unsafe { CreateTimerQueue() };
        if queue.is_null() {
            return Err(Error::OperatingSystem(std::io::Error::last_os_error()));
        }

        let period_ms = interval.as_millis() as u32;
        let mut timer: HANDLE = std::ptr::null_mut();
        // SAFETY: `queue` was just created; `timer_callback` matches
        // the `WAITORTIMERCALLBACK` signature; `shared_ptr` outlives
        // the timer (stored in `self.state` until `stop`).
        let ok = unsafe {
            CreateTimerQueueTimer(
                &mut timer,
                queue,
                Some(timer_callback),
                shared_ptr,
                period_ms,
                period_ms,
                WT_EXECUTEDEFAULT,
            )
        };
        if ok == 0 {
            // SAFETY: `queue` was just created and not yet used by any timer.
            unsafe { DeleteTimerQueueEx(queue, std::ptr::null_mut()) };
            return Err(Error::OperatingSystem(std::io::Error::last_os_error()));
        }

        *self.queue.lock().unwrap() = Some(queue);
        *self.timer.lock().unwrap() = Some(timer);
        *self.state.lock().unwrap() = Some(shared);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(queue) = self.queue.lock().unwrap().take() {
            // SAFETY: completion handle null means block until all
            // callbacks currently running have finished.
            unsafe { DeleteTimerQueueEx(queue, std::ptr::null_mut()) };
        }
        self.timer.lock().unwrap().take();
        self.state.lock().unwrap().take();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for WindowsSampler {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

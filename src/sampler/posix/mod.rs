//! POSIX per-thread signal timer backend (§4.5).
//!
//! Each registered thread owns a `CLOCK_THREAD_CPUTIME_ID` timer that
//! delivers a dedicated real-time signal to itself (`SIGEV_THREAD_ID`)
//! on expiry. The handler runs on the interrupted thread and must
//! complete using only async-signal-safe operations: no allocation,
//! no mutex, no dynamic dispatch through a heap vtable. All state the
//! handler touches is either a plain atomic in a `static`, or a
//! thread-local `Cell` set up once at registration time, never inside
//! the handler itself (§9, "global mutable state").

use std::cell::Cell;
use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame_walker;
use crate::native_unwinder::{self, registers};
use crate::ring_buffer::{RingBuffer, WriteOutcome};
use crate::stats::StatisticsCounters;
use crate::types::{RawSample, MAX_DEPTH};

use super::ThreadStateAccessor;

static ACTIVE: AtomicBool = AtomicBool::new(false);
static NATIVE_UNWINDING: AtomicBool = AtomicBool::new(false);
static CACHED_TYPE_DESC: AtomicUsize = AtomicUsize::new(0);
static ACCESSOR: AtomicUsize = AtomicUsize::new(0);
static RING: AtomicPtr<RingBuffer> = AtomicPtr::new(std::ptr::null_mut());
static STATS: AtomicPtr<StatisticsCounters> = AtomicPtr::new(std::ptr::null_mut());

thread_local! {
    static REENTERED: Cell<bool> = const { Cell::new(false) };
    /// `(stack_low, stack_high)` for the current thread, filled once
    /// at [`PosixSampler::register_thread`] time so the handler never
    /// has to call a stack-introspection API itself.
    static STACK_BOUNDS: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

fn ring() -> Option<&'static RingBuffer> {
    // SAFETY: non-null only while a sampling session has stored a
    // pointer into a `RingBuffer` that outlives the session (the
    // façade keeps its `Arc<RingBuffer>` alive across start/stop).
    unsafe { RING.load(Ordering::Relaxed).as_ref() }
}

fn stats() -> Option<&'static StatisticsCounters> {
    // SAFETY: see `ring`.
    unsafe { STATS.load(Ordering::Relaxed).as_ref() }
}

fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime` is async-signal-safe and `ts` is a
    // plain stack value.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

extern "C" fn handle_signal(_sig: c_int, _info: *mut libc::siginfo_t, ctx: *mut c_void) {
    if !ACTIVE.load(Ordering::Relaxed) {
        return;
    }
    let already = REENTERED.with(|c| {
        if c.get() {
            true
        } else {
            c.set(true);
            false
        }
    });
    if already {
        return;
    }

    let mut sample = RawSample::default();
    sample.timestamp_ns = monotonic_now_ns();
    // SAFETY: `gettid` is async-signal-safe (a thin syscall wrapper).
    sample.thread_id = unsafe { libc::gettid() as u64 };

    let accessor_addr = ACCESSOR.load(Ordering::Relaxed);
    if accessor_addr != 0 {
        // SAFETY: only ever stored from a real `ThreadStateAccessor`
        // by `PosixSampler::start`.
        let accessor: ThreadStateAccessor = unsafe { std::mem::transmute(accessor_addr) };
        let tstate = accessor(sample.thread_id);
        let cached_type_desc = CACHED_TYPE_DESC.load(Ordering::Relaxed) as *const ();
        // SAFETY: `tstate` is validated per-dereference inside
        // `walk_speculative`, which is exactly why this path is safe
        // to call from signal context without the runtime lock.
        match unsafe { frame_walker::walk_speculative(tstate as *const _, cached_type_desc, MAX_DEPTH) } {
            Some(result) => {
                sample.interp_depth = result.depth;
                sample.interp_code_addrs = result.code_addrs;
                sample.interp_instr_addrs = result.instr_addrs;
            }
            None => {
                if let Some(s) = stats() {
                    s.record_validation_drop();
                }
            }
        }
    }

    if NATIVE_UNWINDING.load(Ordering::Relaxed) {
        let (low, high) = STACK_BOUNDS.with(|c| c.get());
        if high > low {
            // SAFETY: `ctx` is the context pointer the kernel passes a
            // `SA_SIGINFO` handler; valid for the handler's duration.
            let regs = unsafe { registers::from_ucontext(ctx as *const libc::ucontext_t) };
            let (pcs, depth) = native_unwinder::walk_fp_chain(&regs, low, high, 0, MAX_DEPTH);
            sample.native_pcs = pcs;
            sample.native_depth = depth;
        }
    }

    if let Some(ring) = ring() {
        match ring.write(&sample) {
            WriteOutcome::Written => {
                if let Some(s) = stats() {
                    s.record_captured();
                    s.record_thread_sampled();
                }
            }
            WriteOutcome::Dropped => {
                if let Some(s) = stats() {
                    s.record_dropped();
                }
            }
        }
    }

    REENTERED.with(|c| c.set(false));
}

fn stack_bounds_of_current_thread() -> (usize, usize) {
    // SAFETY: `attr` is initialized by `pthread_getattr_np` before any
    // other field is read, and destroyed before returning.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return (0, 0);
        }
        let mut base: *mut c_void = std::ptr::null_mut();
        let mut size: usize = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut base, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || base.is_null() {
            return (0, 0);
        }
        (base as usize, base as usize + size)
    }
}

/// A dedicated real-time signal, chosen once per process so repeated
/// `PosixSampler` instances (as in tests) agree on which signal number
/// is "ours".
fn sampling_signal() -> c_int {
    libc::SIGRTMIN()
}

/// Per-thread-timer POSIX sampler (§4.5).
pub struct PosixSampler {
    timers: Mutex<HashMap<u64, libc::timer_t>>,
    prior_handler: Mutex<Option<libc::sigaction>>,
}

// SAFETY: `libc::timer_t` is an opaque handle (a pointer the kernel
// hands back); this crate never dereferences it, only passes it back
// to `timer_settime`/`timer_delete`.
unsafe impl Send for PosixSampler {}
unsafe impl Sync for PosixSampler {}

impl Default for PosixSampler {
    fn default() -> Self {
        PosixSampler::new()
    }
}

impl PosixSampler {
    pub fn new() -> Self {
        PosixSampler {
            timers: Mutex::new(HashMap::new()),
            prior_handler: Mutex::new(None),
        }
    }

    /// Installs the shared signal handler and begins accepting
    /// `register_thread` calls. Does not itself sample any thread —
    /// on this backend, unregistered worker threads are never
    /// sampled (§4.5).
    pub fn start(
        &self,
        ring: &'static RingBuffer,
        stats: &'static StatisticsCounters,
        native_unwinding: bool,
        accessor: ThreadStateAccessor,
        cached_type_desc: *const (),
    ) -> Result<()> {
        let signal = sampling_signal();
        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        sa.sa_sigaction = handle_signal as *const () as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        // SAFETY: `sa.sa_mask` is a plain stack value being
        // initialized before installation.
        unsafe {
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaddset(&mut sa.sa_mask, signal);
        }
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        // SAFETY: `sa` and `old` are valid sigaction values.
        let rc = unsafe { libc::sigaction(signal, &sa, &mut old) };
        if rc != 0 {
            return Err(Error::OperatingSystem(std::io::Error::last_os_error()));
        }

        *self.prior_handler.lock().unwrap() = Some(old);
        RING.store(ring as *const RingBuffer as *mut RingBuffer, Ordering::Relaxed);
        STATS.store(
            stats as *const StatisticsCounters as *mut StatisticsCounters,
            Ordering::Relaxed,
        );
        NATIVE_UNWINDING.store(native_unwinding, Ordering::Relaxed);
        CACHED_TYPE_DESC.store(cached_type_desc as usize, Ordering::Relaxed);
        ACCESSOR.store(accessor as usize, Ordering::Relaxed);
        ACTIVE.store(true, Ordering::Release);
        Ok(())
    }

    /// Uninstalls the handler: stop accepting new samples first, then
    /// ignore the signal and briefly drain any already-pending
    /// delivery before restoring whatever handler was previously
    /// installed (never the default action, which could terminate the
    /// process for an unlucky choice of signal).
    pub fn stop(&self) {
        ACTIVE.store(false, Ordering::Release);
        let signal = sampling_signal();

        let mut ignore: libc::sigaction = unsafe { std::mem::zeroed() };
        ignore.sa_sigaction = libc::SIG_IGN;
        // SAFETY: plain stack value.
        unsafe { libc::sigemptyset(&mut ignore.sa_mask) };
        // SAFETY: `ignore` is a valid sigaction.
        unsafe { libc::sigaction(signal, &ignore, std::ptr::null_mut()) };

        std::thread::sleep(Duration::from_millis(5));

        if let Some(prior) = self.prior_handler.lock().unwrap().take() {
            // SAFETY: `prior` was populated by a previous successful
            // `sigaction` call in `start`.
            unsafe { libc::sigaction(signal, &prior, std::ptr::null_mut()) };
        }

        for (_, timerid) in self.timers.lock().unwrap().drain() {
            // SAFETY: `timerid` was returned by a successful
            // `timer_create` and not yet deleted.
            unsafe { libc::timer_delete(timerid) };
        }
        RING.store(std::ptr::null_mut(), Ordering::Relaxed);
        STATS.store(std::ptr::null_mut(), Ordering::Relaxed);
    }

    /// Creates this thread's timer. Must be called by the thread that
    /// wants to be sampled (§4.5: "required on the POSIX signal
    /// variant").
    pub fn register_thread(&self, interval: Duration) -> Result<()> {
        // SAFETY: `gettid` is a thin, always-safe syscall wrapper.
        let tid = unsafe { libc::gettid() };
        let signal = sampling_signal();

        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = signal;
        sev.sigev_notify_thread_id = tid;

        let mut timerid: libc::timer_t = std::ptr::null_mut();
        // SAFETY: `sev` is fully initialized; `timerid` is written by
        // the call on success.
        let rc = unsafe {
            libc::timer_create(libc::CLOCK_THREAD_CPUTIME_ID, &mut sev, &mut timerid)
        };
        if rc != 0 {
            return Err(Error::OperatingSystem(std::io::Error::last_os_error()));
        }

        let interval_spec = libc::timespec {
            tv_sec: interval.as_secs() as i64,
            tv_nsec: interval.subsec_nanos() as i64,
        };
        let spec = libc::itimerspec {
            it_interval: interval_spec,
            it_value: interval_spec,
        };
        // SAFETY: `timerid` was just created; `spec` is fully
        // initialized.
        let rc = unsafe { libc::timer_settime(timerid, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            // SAFETY: `timerid` is still valid; we own its cleanup.
            unsafe { libc::timer_delete(timerid) };
            return Err(Error::OperatingSystem(std::io::Error::last_os_error()));
        }

        STACK_BOUNDS.with(|c| c.set(stack_bounds_of_current_thread()));
        self.timers.lock().unwrap().insert(tid as u64, timerid);
        Ok(())
    }

    pub fn unregister_thread(&self, thread_id: u64) {
        if let Some(timerid) = self.timers.lock().unwrap().remove(&thread_id) {
            // SAFETY: `timerid` was returned by a successful
            // `timer_create` for this thread and not yet deleted.
            unsafe { libc::timer_delete(timerid) };
        }
    }

    pub fn registered_thread_count(&self) -> usize {
        self.timers.lock().unwrap().len()
    }
}

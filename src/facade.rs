//! Lifecycle façade (§6): the crate's single external entry point.
//! Wires [`Config`], the ring buffer, code registry, statistics and
//! resolver to whichever platform sampler backend this target
//! compiles in, and exposes the embedder-facing start/stop/drain
//! surface.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::code_registry::CodeRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::resolver::{Resolver, RuntimeLibraryRange};
use crate::ring_buffer::RingBuffer;
use crate::sampler::ThreadStateAccessor;
use crate::stats::{Stats, StatisticsCounters};
use crate::types::ResolvedSample;

#[cfg(target_os = "macos")]
use crate::sampler::darwin::DarwinSampler;
#[cfg(all(unix, not(target_os = "macos")))]
use crate::sampler::posix::PosixSampler;
#[cfg(target_os = "macos")]
use crate::sampler::ThreadRegistry;
#[cfg(windows)]
use crate::sampler::windows::{InterpreterFrameReader, WindowsSampler};
#[cfg(windows)]
use crate::sampler::ThreadRegistry;

/// Returns the sum of the runtime's garbage-collection counters
/// across all generations (§4.4: "strictly increases whenever a
/// collection runs"). Supplied by the embedder at construction time.
pub type GcEpochAccessor = extern "C" fn() -> u64;

fn default_gc_epoch() -> u64 {
    0
}

extern "C" fn zero_gc_epoch() -> u64 {
    default_gc_epoch()
}

extern "C" fn null_thread_state(_thread_id: u64) -> *const () {
    std::ptr::null()
}

/// A complete batch returned by [`Profiler::stop`] or
/// [`Profiler::finalize`]: every resolved sample collected during the
/// session plus the final counter snapshot.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProfileBatch {
    pub samples: Vec<ResolvedSample>,
    pub stats: Stats,
}

struct RunState {
    config: Config,
    started_at: Instant,
}

/// SAFETY: dereferenced only from `atfork_child`, which fires
/// synchronously in the forked child before any other thread can run,
/// and only ever reads a pointer to a `Profiler` that outlives its own
/// `start` call (the façade never frees it while active).
static ACTIVE_PROFILER: AtomicPtr<Profiler> = AtomicPtr::new(std::ptr::null_mut());

#[cfg(unix)]
extern "C" fn atfork_child() {
    let ptr = ACTIVE_PROFILER.load(Ordering::Relaxed);
    // SAFETY: see the comment on `ACTIVE_PROFILER`.
    if let Some(profiler) = unsafe { ptr.as_ref() } {
        profiler.active.store(false, Ordering::Release);
    }
}

/// Extends a borrow to `'static`. Sound only because every global
/// static the platform samplers hold a raw pointer to is cleared in
/// `stop` before the owning `Arc` can be dropped — the façade, not the
/// type system, is what proves the lifetime here (mirrors the
/// reasoning already documented on `sampler::posix`'s `RING`/`STATS`).
unsafe fn extend_lifetime<T>(value: &T) -> &'static T {
    std::mem::transmute(value)
}

/// The crate's external interface (§6).
pub struct Profiler {
    run: Mutex<Option<RunState>>,
    ring: Mutex<Option<Arc<RingBuffer>>>,
    registry: Arc<CodeRegistry>,
    stats: Mutex<Option<Arc<StatisticsCounters>>>,
    resolver: Mutex<Option<Resolver>>,

    accessor: ThreadStateAccessor,
    expected_type_desc: usize,
    gc_epoch: GcEpochAccessor,
    runtime_range: RuntimeLibraryRange,

    active: AtomicBool,
    native_unwinding: AtomicBool,
    safe_mode: AtomicBool,
    lock_disabled: AtomicBool,

    #[cfg(all(unix, not(target_os = "macos")))]
    posix: PosixSampler,
    #[cfg(target_os = "macos")]
    darwin: DarwinSampler,
    #[cfg(target_os = "macos")]
    threads: Arc<ThreadRegistry>,
    #[cfg(windows)]
    windows: WindowsSampler,
    #[cfg(windows)]
    threads: Arc<ThreadRegistry>,
    #[cfg(windows)]
    frame_reader: InterpreterFrameReader,
}

impl Profiler {
    /// Builds an idle profiler. `accessor` maps an OS thread id to the
    /// runtime's thread-state pointer for that thread (or null);
    /// `expected_type_desc` is the address of the runtime's code-object
    /// type descriptor, used for best-effort validation;
    /// `gc_epoch` reads the runtime's collection counters;
    /// `runtime_range` classifies native frames as belonging to the
    /// runtime's own shared library for the trim-and-sandwich merge.
    pub fn new(
        accessor: ThreadStateAccessor,
        expected_type_desc: *const (),
        gc_epoch: GcEpochAccessor,
        runtime_range: RuntimeLibraryRange,
    ) -> Self {
        Profiler {
            run: Mutex::new(None),
            ring: Mutex::new(None),
            registry: Arc::new(CodeRegistry::new()),
            stats: Mutex::new(None),
            resolver: Mutex::new(None),
            accessor,
            expected_type_desc: expected_type_desc as usize,
            gc_epoch,
            runtime_range,
            active: AtomicBool::new(false),
            native_unwinding: AtomicBool::new(false),
            safe_mode: AtomicBool::new(false),
            lock_disabled: AtomicBool::new(false),
            #[cfg(all(unix, not(target_os = "macos")))]
            posix: PosixSampler::new(),
            #[cfg(target_os = "macos")]
            darwin: DarwinSampler::new(),
            #[cfg(target_os = "macos")]
            threads: Arc::new(ThreadRegistry::new()),
            #[cfg(windows)]
            windows: WindowsSampler::new(),
            #[cfg(windows)]
            threads: Arc::new(ThreadRegistry::new()),
            #[cfg(windows)]
            frame_reader: default_frame_reader,
        }
    }

    /// Convenience constructor for an embedder that has not yet wired
    /// real accessors (e.g. while integrating the crate); every
    /// capture is a no-op until [`Profiler::new`] is used instead.
    pub fn unconfigured() -> Self {
        Profiler::new(
            null_thread_state,
            std::ptr::null(),
            zero_gc_epoch,
            RuntimeLibraryRange::unknown(),
        )
    }

    #[cfg(windows)]
    pub fn with_frame_reader(mut self, frame_reader: InterpreterFrameReader) -> Self {
        self.frame_reader = frame_reader;
        self
    }

    pub fn start(&self, interval_ms: u64, memory_limit_mb: u64, native_unwinding: bool) -> Result<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }

        if self.lock_disabled.load(Ordering::Acquire) && self.platform_requires_runtime_lock() {
            self.active.store(false, Ordering::Release);
            return Err(Error::Unsupported {
                reason: "runtime lock is disabled and this platform's sampler backend \
                          cannot guarantee safe sampling without it"
                    .to_string(),
            });
        }

        let config = Config {
            interval_ms,
            memory_limit_mb,
            native_unwinding,
            safe_mode: self.safe_mode.load(Ordering::Acquire),
        };
        if let Err(e) = config.validate() {
            self.active.store(false, Ordering::Release);
            return Err(e);
        }

        let capacity = config.ring_buffer_capacity();
        let ring = Arc::new(RingBuffer::new(capacity));
        let stats = Arc::new(StatisticsCounters::default());
        let resolver = Resolver::new(self.expected_type_desc as *const (), self.runtime_range.clone());

        if let Err(e) = self.start_backend(&config, &ring, &stats) {
            self.active.store(false, Ordering::Release);
            return Err(e);
        }

        self.native_unwinding.store(native_unwinding, Ordering::Release);
        *self.ring.lock().unwrap() = Some(ring);
        *self.stats.lock().unwrap() = Some(stats);
        *self.resolver.lock().unwrap() = Some(resolver);
        *self.run.lock().unwrap() = Some(RunState {
            config,
            started_at: Instant::now(),
        });

        #[cfg(unix)]
        {
            ACTIVE_PROFILER.store(self as *const Profiler as *mut Profiler, Ordering::Relaxed);
            // SAFETY: `atfork_child` only reads atomics through a
            // pointer that stays valid until this profiler is stopped.
            unsafe { libc::pthread_atfork(None, None, Some(atfork_child)) };
        }

        log::info!("profiler started: interval_ms={interval_ms} memory_limit_mb={memory_limit_mb} native_unwinding={native_unwinding}");
        Ok(())
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn start_backend(&self, config: &Config, ring: &Arc<RingBuffer>, stats: &Arc<StatisticsCounters>) -> Result<()> {
        // SAFETY: see `extend_lifetime`; `ring`/`stats` are kept alive
        // in `self.ring`/`self.stats` for the duration of the session.
        let ring_ref = unsafe { extend_lifetime(ring.as_ref()) };
        let stats_ref = unsafe { extend_lifetime(stats.as_ref()) };
        self.posix.start(
            ring_ref,
            stats_ref,
            config.native_unwinding,
            self.accessor,
            self.expected_type_desc as *const (),
        )
    }

    #[cfg(target_os = "macos")]
    fn start_backend(&self, config: &Config, ring: &Arc<RingBuffer>, stats: &Arc<StatisticsCounters>) -> Result<()> {
        let gc_epoch = self.gc_epoch;
        self.darwin.start(
            Arc::clone(&self.threads),
            Arc::clone(ring),
            Arc::clone(&self.registry),
            Arc::clone(stats),
            config.interval(),
            config.native_unwinding,
            self.accessor,
            self.expected_type_desc,
            move || gc_epoch(),
        )
    }

    #[cfg(windows)]
    fn start_backend(&self, config: &Config, ring: &Arc<RingBuffer>, stats: &Arc<StatisticsCounters>) -> Result<()> {
        self.windows.start(
            Arc::clone(&self.threads),
            Arc::clone(ring),
            Arc::clone(stats),
            config.interval(),
            config.native_unwinding,
            self.accessor,
            self.frame_reader,
        )
    }

    fn stop_backend(&self) {
        #[cfg(all(unix, not(target_os = "macos")))]
        self.posix.stop();
        #[cfg(target_os = "macos")]
        self.darwin.stop();
        #[cfg(windows)]
        self.windows.stop();
    }

    /// Stops the timer/handler without draining — the streaming
    /// alternative to [`Profiler::stop`] (§6).
    pub fn stop_timer(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Err(Error::NotRunning);
        }
        self.stop_backend();
        #[cfg(unix)]
        ACTIVE_PROFILER.store(std::ptr::null_mut(), Ordering::Relaxed);
        log::info!("profiler timer stopped");
        Ok(())
    }

    /// Resolves and returns up to `max` buffered samples without
    /// finalizing the session.
    pub fn drain(&self, max: usize) -> Vec<ResolvedSample> {
        let ring = self.ring.lock().unwrap();
        let stats = self.stats.lock().unwrap();
        let resolver = self.resolver.lock().unwrap();
        match (ring.as_ref(), stats.as_ref(), resolver.as_ref()) {
            (Some(ring), Some(stats), Some(resolver)) => {
                let safe_mode = self.safe_mode.load(Ordering::Acquire);
                let native_unwinding = self.native_unwinding.load(Ordering::Acquire);
                let gc_epoch = (self.gc_epoch)();
                let (batch, _has_more) =
                    resolver.drain(ring, &self.registry, gc_epoch, safe_mode, native_unwinding, max, stats);
                batch
            }
            _ => Vec::new(),
        }
    }

    /// Finalizes the session, releasing the ring buffer, resolver and
    /// statistics snapshot from this point on `is_active` reports
    /// false and a new `start` may begin a fresh session.
    pub fn finalize(&self) -> ProfileBatch {
        let samples = self.drain(usize::MAX / 2);
        let stats_snapshot = self.stats_snapshot();
        self.ring.lock().unwrap().take();
        self.stats.lock().unwrap().take();
        self.resolver.lock().unwrap().take();
        self.run.lock().unwrap().take();
        log::info!("profiler finalized: {} samples", samples.len());
        ProfileBatch {
            samples,
            stats: stats_snapshot,
        }
    }

    /// Stops the timer, drains every buffered sample and finalizes the
    /// resolver in one call (§6).
    pub fn stop(&self) -> Result<ProfileBatch> {
        self.stop_timer()?;
        Ok(self.finalize())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn stats_snapshot(&self) -> Stats {
        let run = self.run.lock().unwrap();
        let stats = self.stats.lock().unwrap();
        match (run.as_ref(), stats.as_ref()) {
            (Some(run), Some(stats)) => Stats {
                collected_samples: stats.load(&stats.samples_captured),
                dropped_samples: stats.load(&stats.samples_dropped),
                validation_drops: stats.load(&stats.validation_drops),
                duration_ns: run.started_at.elapsed().as_nanos() as u64,
                interval_ns: run.config.interval().as_nanos() as u64,
                safe_mode_rejects: stats.load(&stats.safe_mode_rejects),
            },
            _ => Stats::default(),
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats_snapshot()
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    pub fn register_thread(&self) -> Result<()> {
        let run = self.run.lock().unwrap();
        let interval = run.as_ref().map(|r| r.config.interval()).ok_or(Error::NotRunning)?;
        self.posix.register_thread(interval)
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    pub fn unregister_thread(&self) -> Result<()> {
        // SAFETY: `gettid` is a thin, always-safe syscall wrapper.
        let tid = unsafe { libc::gettid() } as u64;
        self.posix.unregister_thread(tid);
        Ok(())
    }

    /// No-op on platforms that auto-discover threads (§6); provided
    /// for API symmetry with the POSIX variant.
    #[cfg(not(all(unix, not(target_os = "macos"))))]
    pub fn register_thread(&self) -> Result<()> {
        Ok(())
    }

    #[cfg(not(all(unix, not(target_os = "macos"))))]
    pub fn unregister_thread(&self) -> Result<()> {
        Ok(())
    }

    pub fn set_native_unwinding(&self, enabled: bool) {
        self.native_unwinding.store(enabled, Ordering::Release);
    }

    /// Whether this build was compiled with a native-unwinding
    /// backend at all (§4.3: the third, no-op backend counts as
    /// "unavailable").
    pub fn native_unwinding_available(&self) -> bool {
        cfg!(any(target_os = "windows", target_arch = "x86_64", target_arch = "aarch64"))
    }

    pub fn set_safe_mode(&self, enabled: bool) {
        self.safe_mode.store(enabled, Ordering::Release);
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Acquire)
    }

    /// Tells the façade whether the embedded runtime was built with its
    /// exclusive-execution lock compiled out (§GLOSSARY: "Runtime
    /// lock"). Embedders query this from the runtime's own build
    /// configuration; the crate has no way to detect it on its own.
    pub fn set_lock_disabled(&self, disabled: bool) {
        self.lock_disabled.store(disabled, Ordering::Release);
    }

    pub fn is_lock_disabled(&self) -> bool {
        self.lock_disabled.load(Ordering::Acquire)
    }

    /// §7: `Unsupported` is surfaced at `start` when the runtime lock is
    /// disabled and the compiled-in platform backend cannot guarantee
    /// safe sampling without it. Only the POSIX signal backend walks
    /// frames concurrently with the sampled thread (speculative
    /// capture); the Darwin and Windows backends suspend the thread
    /// before touching its frame chain, so they stay safe either way.
    #[cfg(all(unix, not(target_os = "macos")))]
    fn platform_requires_runtime_lock(&self) -> bool {
        true
    }

    #[cfg(any(target_os = "macos", windows))]
    fn platform_requires_runtime_lock(&self) -> bool {
        false
    }
}

#[cfg(windows)]
extern "C" fn default_frame_reader(
    _tstate: *const (),
    _out_codes: *mut usize,
    _out_lines: *mut usize,
    _max_depth: usize,
) -> usize {
    0
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if self.active.load(Ordering::Acquire) {
            self.stop_backend();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_bad_interval_without_leaving_active_set() {
        let profiler = Profiler::unconfigured();
        let result = profiler.start(0, 8, false);
        assert!(result.is_err());
        assert!(!profiler.is_active());
    }

    #[test]
    fn double_start_is_rejected() {
        let profiler = Profiler::unconfigured();
        profiler.start(10, 8, false).unwrap();
        let second = profiler.start(10, 8, false);
        assert!(matches!(second, Err(Error::AlreadyRunning)));
        profiler.stop().unwrap();
    }

    #[test]
    fn stop_without_start_reports_not_running() {
        let profiler = Profiler::unconfigured();
        assert!(matches!(profiler.stop_timer(), Err(Error::NotRunning)));
    }

    #[test]
    fn safe_mode_flag_round_trips() {
        let profiler = Profiler::unconfigured();
        assert!(!profiler.is_safe_mode());
        profiler.set_safe_mode(true);
        assert!(profiler.is_safe_mode());
    }

    #[test]
    fn lock_disabled_flag_round_trips() {
        let profiler = Profiler::unconfigured();
        assert!(!profiler.is_lock_disabled());
        profiler.set_lock_disabled(true);
        assert!(profiler.is_lock_disabled());
    }

    #[test]
    #[cfg(all(unix, not(target_os = "macos")))]
    fn start_rejects_lock_disabled_runtime_on_the_posix_backend() {
        let profiler = Profiler::unconfigured();
        profiler.set_lock_disabled(true);
        let result = profiler.start(10, 8, false);
        assert!(matches!(result, Err(Error::Unsupported { .. })));
        assert!(!profiler.is_active());
    }

    #[test]
    fn start_then_stop_returns_a_batch_with_a_duration() {
        let profiler = Profiler::unconfigured();
        profiler.start(5, 8, false).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let batch = profiler.stop().unwrap();
        assert!(batch.stats.duration_ns > 0);
        assert!(!profiler.is_active());
    }
}

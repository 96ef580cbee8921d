//! S3: a worker thread spawned after the profiler is already running
//! must start showing up in resolved samples within a few sampling
//! intervals of its own registration, not just eventually.

#![cfg(all(unix, not(target_os = "macos")))]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use frametrace::frame_walker::common::CodeObject;
use frametrace::frame_walker::{Frame, ThreadState};
use frametrace::{Profiler, RuntimeLibraryRange};

const TYPE_DESC: usize = 0x7300;
const INTERVAL_MS: u64 = 10;

fn thread_states() -> &'static Mutex<HashMap<u64, usize>> {
    static STATES: OnceLock<Mutex<HashMap<u64, usize>>> = OnceLock::new();
    STATES.get_or_init(|| Mutex::new(HashMap::new()))
}

extern "C" fn accessor(thread_id: u64) -> *const () {
    thread_states()
        .lock()
        .unwrap()
        .get(&thread_id)
        .map(|&addr| addr as *const ())
        .unwrap_or(std::ptr::null())
}

extern "C" fn zero_gc_epoch() -> u64 {
    0
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a plain stack value; `clock_gettime` only writes
    // into it.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn register_and_burn(name: &'static str, run_for: Duration) -> u64 {
    let code = Box::leak(Box::new(CodeObject {
        type_desc: TYPE_DESC as *const (),
        function_name: name.as_ptr(),
        function_name_len: name.len() as u32,
        file_name: b"worker.py".as_ptr(),
        file_name_len: 9,
        first_line: 1,
        bytecode_base: 0,
        addr_line_table: std::ptr::null(),
        addr_line_table_len: 0,
    }));
    let frame = Box::leak(Box::new(Frame {
        previous: std::ptr::null(),
        executable: code as *const CodeObject as usize,
        instr_ptr: std::ptr::null(),
    }));
    let tstate = Box::leak(Box::new(ThreadState {
        current_frame: frame as *const Frame,
    }));
    let tid = unsafe { libc::gettid() as u64 };
    thread_states()
        .lock()
        .unwrap()
        .insert(tid, tstate as *const ThreadState as usize);

    let deadline = Instant::now() + run_for;
    let mut acc: u64 = 0;
    while Instant::now() < deadline {
        acc = acc.wrapping_add(1);
    }
    std::hint::black_box(acc);
    tid
}

/// Matches S3's literal parameters: start at 10ms, spawn a new worker
/// after 2 intervals, and require its first sample within 5 intervals
/// of its registration.
#[test]
fn new_worker_samples_appear_within_five_intervals_of_registration() {
    let profiler = Arc::new(Profiler::new(
        accessor,
        TYPE_DESC as *const (),
        zero_gc_epoch,
        RuntimeLibraryRange::unknown(),
    ));
    profiler.start(INTERVAL_MS, 8, false).expect("start should succeed");
    profiler
        .register_thread()
        .expect("register_thread should install a per-thread timer");

    let worker_profiler = Arc::clone(&profiler);
    let worker_started = Arc::new(Mutex::new(None::<(u64, u64)>));
    let worker_started_writer = Arc::clone(&worker_started);
    let handle = std::thread::spawn(move || {
        worker_profiler
            .register_thread()
            .expect("register_thread should install a per-thread timer");
        let start_ns = now_ns();
        let tid = register_and_burn("late_worker", Duration::from_millis(400));
        *worker_started_writer.lock().unwrap() = Some((tid, start_ns));
        let _ = worker_profiler.unregister_thread();
    });

    // Main thread keeps the core busy too, matching S2's concurrent-
    // thread setup, for the two intervals before the worker spawns and
    // for the duration of its run.
    let main_tid = register_and_burn("main", Duration::from_millis(2 * INTERVAL_MS));
    handle.join().expect("worker thread should not panic");

    let _ = profiler.unregister_thread();
    let batch = profiler.stop().expect("stop should succeed");
    thread_states().lock().unwrap().remove(&main_tid);

    let (worker_tid, worker_start_ns) = worker_started.lock().unwrap().expect("worker should have recorded its start");
    thread_states().lock().unwrap().remove(&worker_tid);

    let first_worker_sample_ns = batch
        .samples
        .iter()
        .filter(|s| s.thread_id == worker_tid)
        .map(|s| s.timestamp_ns)
        .min();

    let first_worker_sample_ns =
        first_worker_sample_ns.expect("expected at least one sample from the newly spawned worker");
    let latency_ns = first_worker_sample_ns.saturating_sub(worker_start_ns);
    let budget_ns = 5 * INTERVAL_MS * 1_000_000;
    assert!(
        latency_ns <= budget_ns,
        "expected the new worker's first sample within 5 intervals ({budget_ns}ns) of registration, got {latency_ns}ns"
    );
}

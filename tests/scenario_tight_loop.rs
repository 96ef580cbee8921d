//! End-to-end scenario against the POSIX signal sampler backend,
//! matching S1 of the spec's testable-properties section: a
//! CPU-bound thread running a fixed function should show up in
//! resolved samples with that function's name once the profiler is
//! started.
//!
//! Only the signal-driven backend runs unprivileged inside a
//! container, so this test is `cfg`'d to unix non-macOS targets; the
//! Darwin/Windows scenario equivalents (S5/S6) require a suspend-walk
//! backend this environment cannot drive headlessly.

#![cfg(all(unix, not(target_os = "macos")))]

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use frametrace::frame_walker::common::CodeObject;
use frametrace::frame_walker::{Frame, ThreadState};
use frametrace::{Profiler, RuntimeLibraryRange};

const TYPE_DESC: usize = 0x7000;

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

#[test]
fn tight_loop_samples_capture_the_running_function() {
    let code = CodeObject {
        type_desc: TYPE_DESC as *const (),
        function_name: b"f".as_ptr(),
        function_name_len: 1,
        file_name: b"bench.py".as_ptr(),
        file_name_len: 8,
        first_line: 1,
        bytecode_base: 0,
        addr_line_table: std::ptr::null(),
        addr_line_table_len: 0,
    };
    let frame = Frame {
        previous: std::ptr::null(),
        executable: &code as *const CodeObject as usize,
        instr_ptr: std::ptr::null(),
    };
    let tstate = ThreadState {
        current_frame: &frame as *const Frame,
    };

    let profiler = Profiler::new(
        accessor,
        TYPE_DESC as *const (),
        zero_gc_epoch,
        RuntimeLibraryRange::unknown(),
    );
    profiler.start(10, 8, false).expect("start should succeed");
    profiler.register_thread().expect("register_thread should install a timer");

    let tid = unsafe { libc::gettid() as u64 };
    thread_states()
        .lock()
        .unwrap()
        .insert(tid, &tstate as *const ThreadState as usize);

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut acc: u64 = 0;
    while Instant::now() < deadline {
        acc = acc.wrapping_add(1);
    }
    std::hint::black_box(acc);

    let _ = profiler.unregister_thread();
    let batch = profiler.stop().expect("stop should succeed");
    thread_states().lock().unwrap().remove(&tid);

    assert!(
        batch.stats.collected_samples >= 180,
        "expected collected_samples >= 180 per S1, got {}",
        batch.stats.collected_samples
    );
    assert!(
        batch
            .samples
            .iter()
            .any(|s| s.frames.iter().any(|f| f.function_name.as_str() == "f")),
        "expected a resolved sample containing function `f`"
    );
}

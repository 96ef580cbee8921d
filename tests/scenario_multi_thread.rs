//! S2: several worker threads running concurrently should each show
//! up in the resolved sample stream once registered.

#![cfg(all(unix, not(target_os = "macos")))]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use frametrace::frame_walker::common::CodeObject;
use frametrace::frame_walker::{Frame, ThreadState};
use frametrace::{Profiler, RuntimeLibraryRange};

const TYPE_DESC: usize = 0x7100;

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

fn work(name: &'static str) {
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

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut acc: u64 = 0;
    while Instant::now() < deadline {
        acc = acc.wrapping_add(1);
    }
    std::hint::black_box(acc);
}

#[test]
fn four_workers_all_appear_in_resolved_samples() {
    let profiler = Arc::new(Profiler::new(
        accessor,
        TYPE_DESC as *const (),
        zero_gc_epoch,
        RuntimeLibraryRange::unknown(),
    ));
    profiler.start(10, 8, false).expect("start should succeed");

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let profiler = Arc::clone(&profiler);
            std::thread::spawn(move || {
                profiler
                    .register_thread()
                    .expect("register_thread should install a per-thread timer");
                let name: &'static str = Box::leak(format!("worker{i}").into_boxed_str());
                work(name);
                let tid = unsafe { libc::gettid() as u64 };
                let _ = profiler.unregister_thread();
                tid
            })
        })
        .collect();

    let tids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let batch = profiler.stop().expect("stop should succeed");
    for tid in &tids {
        thread_states().lock().unwrap().remove(tid);
    }

    let observed: HashSet<u64> = batch.samples.iter().map(|s| s.thread_id).collect();
    assert!(
        observed.len() >= 4,
        "expected samples from all 4 worker threads per S2, got {observed:?} out of {tids:?}"
    );
}

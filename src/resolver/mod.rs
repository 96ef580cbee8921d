//! Converts raw samples into resolved ones: cache lookups, code-object
//! field reads, native symbolization and the trim-and-sandwich merge
//! (§4.8).

pub mod cache;
pub mod merge;
pub mod native_symbols;

use std::sync::Mutex;

use cache::{Lookup, ResolutionCache};
pub use merge::RuntimeLibraryRange;
use merge::{trim_and_sandwich, NativeFrame};

use crate::code_registry::{CodeRegistry, ValidationOutcome};
use crate::frame_walker::common::CodeObject;
use crate::ring_buffer::{ReadOutcome, RingBuffer};
use crate::stats::StatisticsCounters;
use crate::types::{RawSample, ResolvedFrame, ResolvedSample, WINDOWS_LINE_NUMBER_MAX};

/// Reads the three fields of a code object that make up a
/// non-instruction-specific resolution: function name, file name and
/// the line a call into this object would report absent a more
/// specific instruction pointer.
///
/// # Safety
/// `code` must point at a code object that the caller has already
/// validated through [`CodeRegistry::validate`].
unsafe fn read_code_object(code: &CodeObject) -> ResolvedFrame {
    let name = std::slice::from_raw_parts(code.function_name, code.function_name_len as usize);
    let file = std::slice::from_raw_parts(code.file_name, code.file_name_len as usize);
    ResolvedFrame::interpreter(
        &String::from_utf8_lossy(name),
        &String::from_utf8_lossy(file),
        code.first_line,
    )
}

/// Translates a captured instruction pointer into a line number. A
/// value below [`WINDOWS_LINE_NUMBER_MAX`] is already a line number
/// (the Windows backend's shortcut, §4.7); otherwise it is a real
/// address, translated via the code object's offset-to-line table.
///
/// # Safety
/// `code` must be validated, as for [`read_code_object`].
unsafe fn line_for_instr(code: &CodeObject, instr_addr: usize) -> u32 {
    if instr_addr < WINDOWS_LINE_NUMBER_MAX {
        return instr_addr as u32;
    }
    if code.addr_line_table.is_null() || code.addr_line_table_len == 0 {
        return code.first_line;
    }
    let offset = instr_addr.wrapping_sub(code.bytecode_base) as u32;
    let table = std::slice::from_raw_parts(code.addr_line_table, code.addr_line_table_len as usize);
    let mut line = code.first_line;
    for &(entry_offset, entry_line) in table {
        if entry_offset <= offset {
            line = entry_line;
        } else {
            break;
        }
    }
    line
}

/// Caching, validating, symbol-producing half of the pipeline. Holds
/// no reference to the code registry or ring buffer — those are
/// passed into [`Resolver::drain`] so the façade controls their
/// lifetimes.
pub struct Resolver {
    cache: Mutex<ResolutionCache>,
    expected_type_desc: usize,
    runtime_range: RuntimeLibraryRange,
}

impl Resolver {
    pub fn new(expected_type_desc: *const (), runtime_range: RuntimeLibraryRange) -> Self {
        Resolver {
            cache: Mutex::new(ResolutionCache::new()),
            expected_type_desc: expected_type_desc as usize,
            runtime_range,
        }
    }

    fn resolve_one(
        &self,
        addr: usize,
        instr_addr: usize,
        registry: &CodeRegistry,
        current_gc_epoch: u64,
        safe_mode: bool,
        stats: &StatisticsCounters,
    ) -> Option<ResolvedFrame> {
        if addr == 0 {
            return None;
        }
        let expected = self.expected_type_desc;
        let outcome = registry.validate(addr, current_gc_epoch, safe_mode, || {
            // SAFETY: `validate` only invokes this closure after its own
            // null/alignment check on `addr` has passed.
            unsafe { (*(addr as *const CodeObject)).type_desc as usize == expected }
        });
        if !outcome.is_valid() {
            match outcome {
                ValidationOutcome::NotHeld | ValidationOutcome::StaleGc => {
                    stats.record_safe_mode_reject()
                }
                _ => stats.record_code_registry_invalidation(),
            }
            return None;
        }

        let base = {
            let mut cache = self.cache.lock().unwrap();
            match cache.get(addr) {
                Lookup::Hit(frame) => {
                    stats.record_cache_hit();
                    frame
                }
                Lookup::Miss => {
                    stats.record_cache_miss();
                    // SAFETY: `addr` was just validated above.
                    let code = unsafe { &*(addr as *const CodeObject) };
                    let frame = unsafe { read_code_object(code) };
                    cache.insert(addr, frame.clone());
                    frame
                }
            }
        };

        if instr_addr == 0 {
            return Some(base);
        }
        // SAFETY: `addr` was validated above; re-reading the code
        // object to translate one instruction pointer is deliberately
        // not cached (§4.8: line varies per call site).
        let code = unsafe { &*(addr as *const CodeObject) };
        let line = unsafe { line_for_instr(code, instr_addr) };
        Some(ResolvedFrame {
            line_number: line,
            ..base
        })
    }

    fn resolve_sample(
        &self,
        raw: &RawSample,
        registry: &CodeRegistry,
        current_gc_epoch: u64,
        safe_mode: bool,
        native_unwinding: bool,
        stats: &StatisticsCounters,
    ) -> ResolvedSample {
        let mut interp_frames = Vec::with_capacity(raw.interp_depth);
        let mut touched_addrs = Vec::with_capacity(raw.interp_depth);

        for i in 0..raw.interp_depth {
            let addr = raw.interp_code_addrs[i];
            let instr = raw.interp_instr_addrs[i];
            touched_addrs.push(addr);
            match self.resolve_one(addr, instr, registry, current_gc_epoch, safe_mode, stats) {
                Some(frame) => interp_frames.push(frame),
                None => stats.record_validation_drop(),
            }
        }
        registry.release_ref_batch(&touched_addrs);

        let native_frames: Vec<NativeFrame> = if native_unwinding {
            (0..raw.native_depth)
                .filter_map(|i| {
                    let addr = raw.native_pcs[i];
                    native_symbols::resolve(addr).map(|sym| NativeFrame {
                        addr,
                        resolved: ResolvedFrame::native(&sym.symbol_name, &sym.library_path, 0),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let frames = if native_frames.is_empty() {
            interp_frames
        } else {
            trim_and_sandwich(&native_frames, &interp_frames, &self.runtime_range)
        };

        ResolvedSample {
            timestamp_ns: raw.timestamp_ns,
            thread_id: raw.thread_id,
            frames,
        }
    }

    /// Consumes up to `max_count` samples from `ring`, returning the
    /// resolved batch and whether more were left unread.
    pub fn drain(
        &self,
        ring: &RingBuffer,
        registry: &CodeRegistry,
        current_gc_epoch: u64,
        safe_mode: bool,
        native_unwinding: bool,
        max_count: usize,
        stats: &StatisticsCounters,
    ) -> (Vec<ResolvedSample>, bool) {
        let mut out = Vec::with_capacity(max_count.min(4096));
        let mut count = 0;
        while count < max_count {
            match ring.read() {
                ReadOutcome::Read(raw) => {
                    out.push(self.resolve_sample(
                        &raw,
                        registry,
                        current_gc_epoch,
                        safe_mode,
                        native_unwinding,
                        stats,
                    ));
                    count += 1;
                }
                ReadOutcome::Empty => break,
            }
        }
        (out, ring.has_data())
    }

    /// Number of unique keys resident in the resolution cache, for
    /// asserting the P2 bound.
    pub fn cache_resident_count(&self) -> usize {
        self.cache.lock().unwrap().resident_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::WriteOutcome;

    fn make_code_object(name: &'static [u8], file: &'static [u8], first_line: u32) -> CodeObject {
        CodeObject {
            type_desc: 0x1000 as *const (),
            function_name: name.as_ptr(),
            function_name_len: name.len() as u32,
            file_name: file.as_ptr(),
            file_name_len: file.len() as u32,
            first_line,
            bytecode_base: 0,
            addr_line_table: std::ptr::null(),
            addr_line_table_len: 0,
        }
    }

    fn sample_with(code_addr: usize) -> RawSample {
        let mut s = RawSample::default();
        s.timestamp_ns = 42;
        s.thread_id = 7;
        s.interp_depth = 1;
        s.interp_code_addrs[0] = code_addr;
        s.interp_instr_addrs[0] = 0;
        s
    }

    #[test]
    fn drains_a_pinned_sample_into_a_resolved_frame_and_balances_refcounts() {
        let code = make_code_object(b"handle_request", b"app.py", 10);
        let addr = &code as *const CodeObject as usize;

        let registry = CodeRegistry::new();
        registry.add_ref(addr, 1);

        let ring = RingBuffer::new(1024);
        assert!(matches!(ring.write(&sample_with(addr)), WriteOutcome::Written));

        let resolver = Resolver::new(0x1000 as *const (), RuntimeLibraryRange::unknown());
        let stats = StatisticsCounters::default();

        let (batch, has_more) = resolver.drain(&ring, &registry, 1, false, false, 10, &stats);
        assert!(!has_more);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].frames.len(), 1);
        assert_eq!(batch[0].frames[0].function_name.as_str(), "handle_request");
        assert_eq!(batch[0].frames[0].line_number, 10);

        // P3: after the resolved sample is released, no strong reference remains.
        assert_eq!(registry.live_entry_count(), 0);
    }

    #[test]
    fn repeated_resolution_of_the_same_address_hits_the_cache() {
        let code = make_code_object(b"loop_body", b"app.py", 3);
        let addr = &code as *const CodeObject as usize;

        let registry = CodeRegistry::new();
        let ring = RingBuffer::new(1024);
        for _ in 0..5 {
            registry.add_ref(addr, 1);
            assert!(matches!(ring.write(&sample_with(addr)), WriteOutcome::Written));
        }

        let resolver = Resolver::new(0x1000 as *const (), RuntimeLibraryRange::unknown());
        let stats = StatisticsCounters::default();
        let (batch, _) = resolver.drain(&ring, &registry, 1, false, false, 10, &stats);

        assert_eq!(batch.len(), 5);
        assert_eq!(stats.load(&stats.cache_misses), 1);
        assert_eq!(stats.load(&stats.cache_hits), 4);
        // P2: hits + misses == total requests
        assert_eq!(
            stats.load(&stats.cache_hits) + stats.load(&stats.cache_misses),
            5
        );
    }

    #[test]
    fn drain_respects_max_count_and_reports_has_more() {
        let code = make_code_object(b"f", b"f.py", 1);
        let addr = &code as *const CodeObject as usize;
        let registry = CodeRegistry::new();
        let ring = RingBuffer::new(1024);
        for _ in 0..3 {
            registry.add_ref(addr, 1);
            assert!(matches!(ring.write(&sample_with(addr)), WriteOutcome::Written));
        }

        let resolver = Resolver::new(0x1000 as *const (), RuntimeLibraryRange::unknown());
        let stats = StatisticsCounters::default();
        let (batch, has_more) = resolver.drain(&ring, &registry, 1, false, false, 2, &stats);
        assert_eq!(batch.len(), 2);
        assert!(has_more);
    }

    #[test]
    fn wrong_type_descriptor_drops_the_frame_and_is_counted() {
        let code = make_code_object(b"f", b"f.py", 1);
        let addr = &code as *const CodeObject as usize;
        let registry = CodeRegistry::new();
        // no add_ref: best-effort capture path, falls back to type check.
        let ring = RingBuffer::new(1024);
        assert!(matches!(ring.write(&sample_with(addr)), WriteOutcome::Written));

        // expected_type_desc deliberately mismatches the code object's.
        let resolver = Resolver::new(0x9999 as *const (), RuntimeLibraryRange::unknown());
        let stats = StatisticsCounters::default();
        let (batch, _) = resolver.drain(&ring, &registry, 1, false, false, 10, &stats);

        assert_eq!(batch[0].frames.len(), 0);
        assert_eq!(stats.load(&stats.validation_drops), 1);
    }
}

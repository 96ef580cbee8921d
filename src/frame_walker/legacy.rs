//! Oldest supported frame layout: the thread state points straight at
//! the current frame, frames chain backwards through a `back`
//! pointer, and the instruction pointer is computed from the code
//! object's bytecode base plus a per-frame offset (§4.2, "older
//! versions").

use super::common::{is_plausible, WalkResult};
use crate::types::MAX_DEPTH;

#[repr(C)]
pub struct Frame {
    pub back: *const Frame,
    pub code: *const super::common::CodeObject,
    pub bytecode_offset: u32,
}

#[repr(C)]
pub struct ThreadState {
    pub frame: *const Frame,
}

/// # Safety
/// `tstate`, if non-null, must point at a live `ThreadState` for the
/// duration of this call (the runtime lock held, or some other
/// guarantee that the frame chain is stable).
pub unsafe fn walk(tstate: *const ThreadState, max_depth: usize) -> WalkResult {
    let mut out = WalkResult::empty();
    if tstate.is_null() {
        return out;
    }
    // SAFETY: non-null, caller guarantees it points at a live ThreadState.
    let mut frame = unsafe { (*tstate).frame };
    let max_depth = max_depth.min(MAX_DEPTH);

    while out.depth < max_depth && !frame.is_null() {
        if !is_plausible(frame) {
            break;
        }
        // SAFETY: passed the plausibility check above.
        let f = unsafe { &*frame };
        if !is_plausible(f.code) {
            break;
        }
        let code = unsafe { &*f.code };

        out.code_addrs[out.depth] = f.code as usize;
        out.instr_addrs[out.depth] = code.bytecode_base + f.bytecode_offset as usize;
        out.depth += 1;

        if f.back == frame {
            break; // cycle guard
        }
        frame = f.back;
    }
    out
}

/// Speculative-capture variant (§4.2): as [`walk`], but every code
/// pointer is additionally checked against `cached_type_desc` and any
/// mismatch drops the whole walk.
/// # Safety
/// `tstate`, if non-null, must point at readable memory for the
/// lifetime of this call; every further dereference is additionally
/// gated on a plausibility and type-descriptor check before it
/// happens, per the speculative-capture design (§4.2).
pub unsafe fn walk_speculative(
    tstate: *const ThreadState,
    cached_type_desc: *const (),
    max_depth: usize,
) -> Option<WalkResult> {
    let mut out = WalkResult::empty();
    if tstate.is_null() {
        return Some(out);
    }
    if !is_plausible(tstate) {
        return None;
    }
    // SAFETY: passed the plausibility check above.
    let mut frame = unsafe { (*tstate).frame };
    let max_depth = max_depth.min(MAX_DEPTH);

    while out.depth < max_depth && !frame.is_null() {
        if !is_plausible(frame) {
            break;
        }
        // SAFETY: passed the plausibility check above.
        let f = unsafe { &*frame };
        if !is_plausible(f.code) {
            return None;
        }
        // SAFETY: passed the plausibility check above.
        let code = unsafe { &*f.code };
        if code.type_desc != cached_type_desc {
            return None;
        }

        out.code_addrs[out.depth] = f.code as usize;
        out.instr_addrs[out.depth] = code.bytecode_base + f.bytecode_offset as usize;
        out.depth += 1;

        if f.back == frame {
            break;
        }
        frame = f.back;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_walker::common::CodeObject;

    fn code(name: &'static str) -> CodeObject {
        CodeObject {
            type_desc: 0x1000 as *const (),
            function_name: name.as_ptr(),
            function_name_len: name.len() as u32,
            file_name: b"mod.rs".as_ptr(),
            file_name_len: 6,
            first_line: 1,
            bytecode_base: 0x2000,
            addr_line_table: std::ptr::null(),
            addr_line_table_len: 0,
        }
    }

    #[test]
    fn walks_back_chain_leaf_first() {
        let code_a = code("a");
        let code_b = code("b");
        let frame_b = Frame {
            back: std::ptr::null(),
            code: &code_b,
            bytecode_offset: 4,
        };
        let frame_a = Frame {
            back: &frame_b,
            code: &code_a,
            bytecode_offset: 8,
        };
        let tstate = ThreadState { frame: &frame_a };

        let result = unsafe { walk(&tstate, MAX_DEPTH) };
        assert_eq!(result.depth, 2);
        assert_eq!(result.code_addrs[0], &code_a as *const _ as usize);
        assert_eq!(result.code_addrs[1], &code_b as *const _ as usize);
        assert_eq!(result.instr_addrs[0], 0x2000 + 8);
    }

    #[test]
    fn null_thread_state_yields_zero_frames() {
        let result = unsafe { walk(std::ptr::null(), MAX_DEPTH) };
        assert_eq!(result.depth, 0);
    }

    #[test]
    fn self_cycle_stops_walk() {
        let c = code("loop");
        let mut frame = Frame {
            back: std::ptr::null(),
            code: &c,
            bytecode_offset: 0,
        };
        frame.back = &frame;
        let tstate = ThreadState { frame: &frame };
        let result = unsafe { walk(&tstate, MAX_DEPTH) };
        assert_eq!(result.depth, 1);
    }
}

//! Middle-era frame layout: the current frame lives behind an extra
//! indirection (`cframe`), frames chain via `previous`, and each frame
//! carries its own absolute instruction pointer rather than an offset
//! (§4.2, "middle versions").

use super::common::{is_plausible, WalkResult};
use crate::types::MAX_DEPTH;

#[repr(C)]
pub struct Frame {
    pub previous: *const Frame,
    pub code: *const super::common::CodeObject,
    pub prev_instr: *const u8,
}

#[repr(C)]
pub struct CFrame {
    pub current_frame: *const Frame,
}

#[repr(C)]
pub struct ThreadState {
    pub cframe: *const CFrame,
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
    // SAFETY: non-null, caller guarantees a live ThreadState.
    let cframe = unsafe { (*tstate).cframe };
    if !is_plausible(cframe) {
        return out;
    }
    // SAFETY: passed plausibility check.
    let mut frame = unsafe { (*cframe).current_frame };
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
        out.instr_addrs[out.depth] = f.prev_instr as usize;
        let _ = code; // only needed by the resolver downstream
        out.depth += 1;

        if f.previous == frame {
            break; // cycle guard
        }
        frame = f.previous;
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
    let cframe = unsafe { (*tstate).cframe };
    if !is_plausible(cframe) {
        return None;
    }
    // SAFETY: passed the plausibility check above.
    let mut frame = unsafe { (*cframe).current_frame };
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
        out.instr_addrs[out.depth] = f.prev_instr as usize;
        out.depth += 1;

        if f.previous == frame {
            break;
        }
        frame = f.previous;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_walker::common::CodeObject;

    fn code() -> CodeObject {
        CodeObject {
            type_desc: 0x1000 as *const (),
            function_name: b"f".as_ptr(),
            function_name_len: 1,
            file_name: b"mod.rs".as_ptr(),
            file_name_len: 6,
            first_line: 1,
            bytecode_base: 0,
            addr_line_table: std::ptr::null(),
            addr_line_table_len: 0,
        }
    }

    #[test]
    fn walks_previous_chain_via_cframe_indirection() {
        let c = code();
        let inner = Frame {
            previous: std::ptr::null(),
            code: &c,
            prev_instr: 0x30 as *const u8,
        };
        let outer = Frame {
            previous: &inner,
            code: &c,
            prev_instr: 0x10 as *const u8,
        };
        let cframe = CFrame {
            current_frame: &outer,
        };
        let tstate = ThreadState { cframe: &cframe };

        let result = unsafe { walk(&tstate, MAX_DEPTH) };
        assert_eq!(result.depth, 2);
        assert_eq!(result.instr_addrs[0], 0x10);
        assert_eq!(result.instr_addrs[1], 0x30);
    }

    #[test]
    fn invalid_cframe_pointer_yields_zero_frames() {
        let tstate = ThreadState {
            cframe: 4 as *const CFrame,
        };
        let result = unsafe { walk(&tstate, MAX_DEPTH) };
        assert_eq!(result.depth, 0);
    }
}

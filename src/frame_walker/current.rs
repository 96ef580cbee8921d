//! Newest frame layout: the thread state points directly at the
//! current frame, frames carry a discriminated `executable` pointer
//! that must be tag-stripped before being treated as a code object,
//! and some frames are C-stack shims that must be filtered rather than
//! resolved (§4.2, "newer versions").

use super::common::{is_plausible, CodeObject, WalkResult};
use crate::types::MAX_DEPTH;

/// Low bit of `Frame::executable` set ⇒ this frame is a C-stack shim,
/// not an interpreter frame, and must be skipped.
const SHIM_TAG: usize = 0b1;

#[repr(C)]
pub struct Frame {
    pub previous: *const Frame,
    pub executable: usize,
    pub instr_ptr: *const u8,
}

#[repr(C)]
pub struct ThreadState {
    pub current_frame: *const Frame,
}

fn code_ptr(executable: usize) -> Option<*const CodeObject> {
    if executable & SHIM_TAG != 0 {
        None
    } else {
        Some(executable as *const CodeObject)
    }
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
    let mut frame = unsafe { (*tstate).current_frame };
    let max_depth = max_depth.min(MAX_DEPTH);

    while out.depth < max_depth && !frame.is_null() {
        if !is_plausible(frame) {
            break;
        }
        // SAFETY: passed the plausibility check above.
        let f = unsafe { &*frame };
        let next = f.previous;

        if let Some(code) = code_ptr(f.executable) {
            if !is_plausible(code) {
                break;
            }
            out.code_addrs[out.depth] = code as usize;
            out.instr_addrs[out.depth] = f.instr_ptr as usize;
            out.depth += 1;
        }
        // shim frames are filtered: no entry emitted, walk continues

        if next == frame {
            break; // cycle guard
        }
        frame = next;
    }
    out
}

/// Speculative-capture variant for lock-disabled builds (§4.2). Every
/// dereference is preceded by a validity check *and* a type-descriptor
/// comparison against `cached_type_desc` (captured once, under the
/// runtime lock, at module init). Any failure aborts the whole walk
/// and returns `None` rather than a partial result, because a frame
/// chain observed without the lock may be concurrently mutated by a
/// collector.
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
    let mut frame = unsafe { (*tstate).current_frame };
    let max_depth = max_depth.min(MAX_DEPTH);

    while out.depth < max_depth && !frame.is_null() {
        if !is_plausible(frame) {
            break;
        }
        // SAFETY: passed the plausibility check above.
        let f = unsafe { &*frame };
        let next = f.previous;

        if let Some(code) = code_ptr(f.executable) {
            if !is_plausible(code) {
                return None;
            }
            // SAFETY: passed the plausibility check above; this is the
            // one dereference the non-speculative walk above doesn't
            // need to make, since it trusts the runtime lock instead.
            let type_desc = unsafe { (*code).type_desc };
            if type_desc != cached_type_desc {
                return None;
            }
            out.code_addrs[out.depth] = code as usize;
            out.instr_addrs[out.depth] = f.instr_ptr as usize;
            out.depth += 1;
        }

        if next == frame {
            break;
        }
        frame = next;
    }
    Some(out)
}

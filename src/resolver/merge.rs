//! Trim-and-sandwich merge of native and interpreter frame stacks
//! (§4.8) and the runtime-library classifier it depends on.

use crate::types::ResolvedFrame;

/// Identifies whether an address falls inside the target runtime's own
/// library, by address range first and a path substring as a fallback
/// (§9: "MUST prefer an address-range check... over string matching").
#[derive(Clone)]
pub struct RuntimeLibraryRange {
    base: usize,
    size: usize,
    path_hint: &'static str,
}

impl RuntimeLibraryRange {
    pub fn new(base: usize, size: usize, path_hint: &'static str) -> Self {
        RuntimeLibraryRange {
            base,
            size,
            path_hint,
        }
    }

    /// Unresolved-at-init placeholder: no frame is ever classified as
    /// inside the runtime library until [`RuntimeLibraryRange::new`]
    /// has run with a real base address.
    pub fn unknown() -> Self {
        RuntimeLibraryRange {
            base: 0,
            size: 0,
            path_hint: "",
        }
    }

    pub fn contains_addr(&self, addr: usize) -> bool {
        self.size != 0 && addr >= self.base && addr < self.base + self.size
    }

    pub fn contains_path(&self, file_name: &str) -> bool {
        !self.path_hint.is_empty() && file_name.contains(self.path_hint)
    }

    /// Classifies an already-symbolized native frame. Address range
    /// wins when this range has been initialized; a path-substring
    /// check is tried only when the range is still [`unknown`].
    pub fn classifies_as_runtime(&self, addr: usize, symbolized_file: &str) -> bool {
        if self.size != 0 {
            self.contains_addr(addr)
        } else {
            self.contains_path(symbolized_file)
        }
    }
}

/// One native frame as input to the merge: its raw address (for range
/// classification) plus its already-symbolized form.
pub struct NativeFrame {
    pub addr: usize,
    pub resolved: ResolvedFrame,
}

/// Produces the merged, leaf-first stack per §4.8:
///
/// 1. Native frames outside the runtime library are emitted as-is.
/// 2. On the first native frame inside the runtime library, all
///    interpreter frames are emitted as one block; that frame and any
///    further *consecutive* runtime-library native frames are
///    skipped.
/// 3. Remaining non-runtime native frames (e.g. `main`) are emitted
///    after.
/// 4. If no runtime-library frame is ever seen, interpreter frames are
///    appended at the end.
pub fn trim_and_sandwich(
    native: &[NativeFrame],
    interpreter: &[ResolvedFrame],
    runtime_range: &RuntimeLibraryRange,
) -> Vec<ResolvedFrame> {
    let mut out = Vec::with_capacity(native.len() + interpreter.len());
    let mut sandwiched = false;

    for frame in native {
        let is_runtime = runtime_range.classifies_as_runtime(frame.addr, &frame.resolved.file_name);
        if is_runtime {
            if !sandwiched {
                out.extend_from_slice(interpreter);
                sandwiched = true;
            }
            continue; // consecutive runtime-library frames are skipped too
        }
        out.push(frame.resolved.clone());
    }

    if !sandwiched {
        out.extend_from_slice(interpreter);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(addr: usize, name: &str) -> NativeFrame {
        NativeFrame {
            addr,
            resolved: ResolvedFrame::native(name, "libc.so", 0),
        }
    }

    fn interp(name: &str) -> ResolvedFrame {
        ResolvedFrame::interpreter(name, "script.py", 1)
    }

    #[test]
    fn sandwiches_interpreter_frames_at_first_runtime_library_frame() {
        let range = RuntimeLibraryRange::new(0x5000, 0x1000, "");
        let native_frames = vec![
            native(0x100, "memcpy"),  // outside, before
            native(0x5010, "eval_frame"), // inside runtime lib
            native(0x5020, "eval_frame_inner"), // inside runtime lib, consecutive
            native(0x200, "main"), // outside, after
        ];
        let interp_frames = vec![interp("foo"), interp("bar")];

        let merged = trim_and_sandwich(&native_frames, &interp_frames, &range);

        let names: Vec<&str> = merged.iter().map(|f| f.function_name.as_str()).collect();
        assert_eq!(names, vec!["memcpy", "foo", "bar", "main"]);
    }

    #[test]
    fn appends_interpreter_frames_when_no_runtime_library_frame_seen() {
        let range = RuntimeLibraryRange::new(0x5000, 0x1000, "");
        let native_frames = vec![native(0x100, "memcpy"), native(0x200, "main")];
        let interp_frames = vec![interp("foo")];

        let merged = trim_and_sandwich(&native_frames, &interp_frames, &range);
        let names: Vec<&str> = merged.iter().map(|f| f.function_name.as_str()).collect();
        assert_eq!(names, vec!["memcpy", "main", "foo"]);
    }

    #[test]
    fn path_substring_fallback_used_when_range_is_unknown() {
        let range = RuntimeLibraryRange::new(0, 0, "runtimecore");
        let mut runtime_frame = native(0x5010, "eval_frame");
        runtime_frame.resolved = ResolvedFrame::native("eval_frame", "libruntimecore.so", 0);
        let native_frames = vec![native(0x100, "memcpy"), runtime_frame];
        let interp_frames = vec![interp("foo")];

        let merged = trim_and_sandwich(&native_frames, &interp_frames, &range);
        let names: Vec<&str> = merged.iter().map(|f| f.function_name.as_str()).collect();
        assert_eq!(names, vec!["memcpy", "foo"]);
    }
}
